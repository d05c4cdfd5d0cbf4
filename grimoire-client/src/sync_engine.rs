//! Stateless "apply one diff" worker. Holds no queues of its own — the
//! Scheduler decides when to call `sync_records`, this just does the remote
//! round-trips and hands the result to the Cache Module.

use grimoire_core::errors::RemoteDbError;
use grimoire_core::models::{CacheOp, CacheRecord, RecordId, RecordVersionArray, RecordVersionDiff};

use crate::cache::CacheModule;
use crate::events::{EventDispatcher, RuntimeEvent};
use crate::processor::Update;
use crate::remote_store::RemoteStore;

pub struct SyncEngine<'a> {
    remote: &'a RemoteStore,
    cache: &'a CacheModule,
    events: &'a EventDispatcher,
}

impl<'a> SyncEngine<'a> {
    pub fn new(remote: &'a RemoteStore, cache: &'a CacheModule, events: &'a EventDispatcher) -> Self {
        Self { remote, cache, events }
    }

    /// Applies `diff` (computed between a local and remote `RecordVersionArray`)
    /// against the remote store: confirmed-absent removals are deleted, and
    /// added/updated ids are fetched, filtered for staleness against
    /// `anticipated`, then written through the Cache Module in one batch.
    pub async fn sync_records(
        &self,
        diff: &RecordVersionDiff,
        anticipated: &RecordVersionArray,
    ) -> Result<Vec<Update>, RemoteDbError> {
        let mut updates = Vec::new();

        if !diff.removed.is_empty() {
            let absent = self.remote.check_absent(&diff.removed).await?;
            for id in &absent {
                let table = table_of(id);
                let deleted = self
                    .cache
                    .delete(&table, &bare_id(id), false)
                    .await
                    .map_err(|e| RemoteDbError::MalformedResponse(e.to_string()))?;
                updates.extend(deleted);
            }

            let unconfirmed: Vec<&RecordId> =
                diff.removed.iter().filter(|id| !absent.contains(id)).collect();
            if !unconfirmed.is_empty() {
                tracing::debug!(
                    count = unconfirmed.len(),
                    "remote still reports records thought removed; left untouched pending next sync"
                );
            }
        }

        let mut to_fetch: Vec<RecordId> = Vec::new();
        to_fetch.extend(diff.added.iter().cloned());
        to_fetch.extend(diff.updated.iter().cloned());

        if to_fetch.is_empty() {
            return Ok(updates);
        }

        let fetched = self.remote.fetch_records(&to_fetch).await?;
        let mut surviving = Vec::with_capacity(fetched.len());

        // `fetch_records` pairs every record with its own fully-qualified id
        // rather than trusting whatever `id` field the record body carries
        // (see protocol::RemoteResponse::Records), so the table and full id
        // come from that pairing, not from parsing the body.
        for (full_id, record) in fetched {
            let table = table_of(&full_id);

            let returned_version = record
                .get("_version")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let anticipated_version = anticipated.get(&full_id).unwrap_or(0);

            if returned_version < anticipated_version {
                tracing::debug!(
                    record_id = %full_id,
                    anticipated_version,
                    returned_version,
                    "dropped stale record from sync batch"
                );
                self.events.emit(RuntimeEvent::RecordStale {
                    record_id: full_id,
                    anticipated: anticipated_version,
                    returned: returned_version,
                });
                continue;
            }

            surviving.push(CacheRecord {
                table,
                op: CacheOp::Update,
                record,
                version: returned_version,
            });
        }

        if !surviving.is_empty() {
            let saved = self
                .cache
                .save_batch(surviving, false)
                .await
                .map_err(|e| RemoteDbError::MalformedResponse(e.to_string()))?;
            updates.extend(saved);
        }

        Ok(updates)
    }
}

fn table_of(record_id: &str) -> String {
    record_id
        .split_once(':')
        .map(|(table, _)| table.to_string())
        .unwrap_or_else(|| record_id.to_string())
}

fn bare_id(record_id: &str) -> String {
    record_id
        .split_once(':')
        .map(|(_, id)| id.to_string())
        .unwrap_or_else(|| record_id.to_string())
}
