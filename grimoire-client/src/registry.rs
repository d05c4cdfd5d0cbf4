//! The lifecycle owner: interns queries by content hash, drives the TTL
//! heartbeat and live-update loops, and fans processor updates out to
//! per-query subscribers. Exclusively owns the `Incantation` map — nothing
//! else in the crate mutates it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use grimoire_core::errors::{RemoteDbError, RuntimeError, SchemaProvisionError};
use grimoire_core::hash::QueryHash;
use grimoire_core::models::{Incantation, IncantationState, RecordVersionArray, RecordVersionDiff};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cache::CacheModule;
use crate::events::{EventDispatcher, RuntimeEvent};
use crate::remote_store::RemoteStore;
use crate::scheduler::{DownItem, DownKind, SyncScheduler};
use crate::sync_engine::SyncEngine;

const MAX_DEFERRED_LIVE_EVENTS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ResultCallback = Arc<dyn Fn(&RecordVersionArray) + Send + Sync>;

struct ResultSubscription {
    id: SubscriptionId,
    callback: ResultCallback,
}

pub struct Registry {
    client_id: Uuid,
    incantations: Mutex<HashMap<[u8; 32], Incantation>>,
    subscribers: Mutex<HashMap<[u8; 32], Vec<ResultSubscription>>>,
    next_sub_id: AtomicU64,
    scheduler: Arc<SyncScheduler>,
    cache: Arc<CacheModule>,
    remote: Arc<RemoteStore>,
    events: Arc<EventDispatcher>,
}

impl Registry {
    pub fn new(
        client_id: Uuid,
        scheduler: Arc<SyncScheduler>,
        cache: Arc<CacheModule>,
        remote: Arc<RemoteStore>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            client_id,
            incantations: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            scheduler,
            cache,
            remote,
            events,
        }
    }

    pub async fn query(
        &self,
        table: &str,
        surql: &str,
        params: Value,
        ttl: Duration,
        involved_tables: Vec<String>,
    ) -> Result<QueryHash, SchemaProvisionError> {
        let query_hash = QueryHash::derive(surql, &params, self.client_id);

        {
            let mut incantations = self.incantations.lock().await;
            if let Some(existing) = incantations.get_mut(&query_hash.0) {
                existing.touch(Utc::now());
                return Ok(query_hash);
            }
        }

        let local_array = self
            .cache
            .register_query(query_hash, surql.to_string(), involved_tables.clone())
            .await
            .map_err(|e| SchemaProvisionError(e.to_string()))?;

        let incantation = Incantation {
            id: query_hash,
            table: table.to_string(),
            surql: surql.to_string(),
            params,
            ttl,
            last_active_at: Utc::now(),
            local_array,
            remote_array: RecordVersionArray::empty(),
            involved_tables,
            state: IncantationState::Registering,
        };

        self.incantations.lock().await.insert(query_hash.0, incantation);
        self.scheduler
            .push_down(DownItem {
                kind: DownKind::Register,
                query_hash,
            })
            .await;

        self.spawn_heartbeat_loop(query_hash, ttl);

        Ok(query_hash)
    }

    pub async fn subscribe<F>(&self, query_hash: QueryHash, callback: F, immediate: bool) -> SubscriptionId
    where
        F: Fn(&RecordVersionArray) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_sub_id.fetch_add(1, Ordering::Relaxed));
        let callback: ResultCallback = Arc::new(callback);

        if immediate {
            if let Some(incantation) = self.incantations.lock().await.get(&query_hash.0) {
                callback(&incantation.local_array);
            }
        }

        self.subscribers
            .lock()
            .await
            .entry(query_hash.0)
            .or_default()
            .push(ResultSubscription { id, callback });

        id
    }

    pub async fn unsubscribe(self: &Arc<Self>, query_hash: QueryHash, id: SubscriptionId) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(list) = subscribers.get_mut(&query_hash.0) {
            list.retain(|s| s.id != id);
            let empty = list.is_empty();
            if empty {
                subscribers.remove(&query_hash.0);
                drop(subscribers);
                self.schedule_cleanup(query_hash).await;
            }
        }
    }

    pub async fn get_active_queries(&self) -> Vec<QueryHash> {
        self.incantations
            .lock()
            .await
            .values()
            .filter(|i| i.state != IncantationState::Destroyed)
            .map(|i| i.id)
            .collect()
    }

    /// Re-registers every non-destroyed Incantation after a fresh remote
    /// connection comes up, so queries the old socket never acknowledged
    /// (and any that changed on the remote while we were down) land back in
    /// the `register`/`sync` path instead of sitting stale forever.
    pub async fn resync_all(&self) {
        let hashes = self.get_active_queries().await;
        for query_hash in hashes {
            self.scheduler
                .push_down(DownItem {
                    kind: DownKind::Register,
                    query_hash,
                })
                .await;
        }
    }

    /// Applies a processor [`Update`](crate::processor::Update) by updating
    /// the owning Incantation's `local_array` and invoking every subscriber
    /// with the new sequence.
    pub async fn on_processor_update(&self, query_hash: QueryHash, result: RecordVersionArray) {
        {
            let mut incantations = self.incantations.lock().await;
            if let Some(incantation) = incantations.get_mut(&query_hash.0) {
                incantation.local_array = result.clone();
            } else {
                return;
            }
        }

        let subscribers = self.subscribers.lock().await;
        if let Some(list) = subscribers.get(&query_hash.0) {
            for sub in list {
                (sub.callback)(&result);
            }
        }
    }

    /// Consumes one `(client_id, query_id, record_id, version, action)` live
    /// change row: updates the owning Incantation's `remote_array` and
    /// enqueues a `sync` DownQueue item. Unknown `query_id`s are dropped. A
    /// `delete` action removes the id from `remote_array` instead of
    /// upserting it, so the next diff sees it as `removed` and the Sync
    /// Engine re-verifies absence before deleting locally (§8 S5); any other
    /// action is treated as an upsert.
    pub async fn on_live_change(&self, query_hash: QueryHash, record_id: String, version: u64, action: &str) {
        let known = {
            let mut incantations = self.incantations.lock().await;
            match incantations.get_mut(&query_hash.0) {
                Some(incantation) => {
                    if action == "delete" {
                        incantation.remote_array.remove(&record_id);
                    } else {
                        incantation.remote_array.upsert(record_id, version);
                    }
                    true
                }
                None => false,
            }
        };

        if !known {
            tracing::debug!(%query_hash, "live change for unknown query_id; dropped");
            return;
        }

        self.scheduler
            .push_down(DownItem {
                kind: DownKind::Sync,
                query_hash,
            })
            .await;
    }

    /// Processes one DownQueue item. Intended to be driven by the
    /// Scheduler's `drain_down` loop.
    pub async fn process_down(&self, item: DownItem) -> Result<(), RuntimeError> {
        match item.kind {
            DownKind::Register => self.handle_register(item.query_hash).await,
            DownKind::Sync => self.handle_sync(item.query_hash).await,
            DownKind::Heartbeat => self.handle_heartbeat(item.query_hash).await,
            DownKind::Cleanup => self.handle_cleanup(item.query_hash).await,
        }
    }

    async fn handle_register(&self, query_hash: QueryHash) -> Result<(), RuntimeError> {
        let (surql, params) = {
            let incantations = self.incantations.lock().await;
            let incantation = incantations
                .get(&query_hash.0)
                .ok_or_else(|| RemoteDbError::MalformedResponse("register for unknown incantation".into()))?;
            (incantation.surql.clone(), incantation.params.clone())
        };

        let remote_array = self
            .remote
            .register_query(&query_hash.to_hex(), &surql, &params)
            .await?;

        let mut incantations = self.incantations.lock().await;
        if let Some(incantation) = incantations.get_mut(&query_hash.0) {
            incantation.remote_array = RecordVersionArray(remote_array);
            incantation.state = IncantationState::Live;
            let diff = RecordVersionDiff::between(&incantation.local_array, &incantation.remote_array);
            drop(incantations);
            if !diff.is_empty() {
                self.run_sync_diff(query_hash, diff).await?;
            }
        }
        Ok(())
    }

    async fn handle_sync(&self, query_hash: QueryHash) -> Result<(), RuntimeError> {
        let diff = {
            let incantations = self.incantations.lock().await;
            match incantations.get(&query_hash.0) {
                Some(incantation) => {
                    RecordVersionDiff::between(&incantation.local_array, &incantation.remote_array)
                }
                None => return Ok(()),
            }
        };
        if diff.is_empty() {
            return Ok(());
        }
        self.run_sync_diff(query_hash, diff).await
    }

    async fn run_sync_diff(&self, query_hash: QueryHash, diff: RecordVersionDiff) -> Result<(), RuntimeError> {
        let anticipated = {
            let incantations = self.incantations.lock().await;
            incantations
                .get(&query_hash.0)
                .map(|i| i.local_array.clone())
                .unwrap_or_default()
        };

        let engine = SyncEngine::new(&self.remote, &self.cache, &self.events);
        let updates = engine.sync_records(&diff, &anticipated).await?;

        for update in updates {
            if update.query_id.0 == query_hash.0 {
                self.on_processor_update(query_hash, update.result).await;
            }
        }
        Ok(())
    }

    async fn handle_heartbeat(&self, query_hash: QueryHash) -> Result<(), RuntimeError> {
        self.remote.heartbeat(&query_hash.to_hex()).await?;
        Ok(())
    }

    async fn handle_cleanup(&self, query_hash: QueryHash) -> Result<(), RuntimeError> {
        // cleanup does not wait for server ack per the lifecycle contract: the
        // local incantation is freed regardless of the delete request outcome.
        if let Err(e) = self.remote.cleanup(&query_hash.to_hex()).await {
            tracing::warn!(%query_hash, error = %e, "cleanup delete request failed; freeing local state anyway");
        }

        self.cache.unregister_query(query_hash).await;
        let mut incantations = self.incantations.lock().await;
        if let Some(incantation) = incantations.get_mut(&query_hash.0) {
            incantation.state = IncantationState::Destroyed;
        }
        incantations.remove(&query_hash.0);
        drop(incantations);

        self.events.emit(RuntimeEvent::IncantationDestroyed { query_hash });
        Ok(())
    }

    /// Defers cleanup by `ttl/10` rather than destroying the Incantation the
    /// instant its last subscriber leaves, so a query that is unsubscribed
    /// and immediately re-subscribed (a component remount, a route
    /// transition) reuses its live registration instead of paying a fresh
    /// register round-trip. Re-checks subscriber count when the grace window
    /// elapses: if a new subscriber arrived in the meantime, the cleanup is
    /// skipped entirely and the heartbeat loop keeps running undisturbed
    /// (§8 S6).
    async fn schedule_cleanup(self: &Arc<Self>, query_hash: QueryHash) {
        let grace = {
            let incantations = self.incantations.lock().await;
            incantations
                .get(&query_hash.0)
                .map(|i| i.ttl / 10)
                .unwrap_or_else(|| Duration::from_secs(60))
        };

        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let still_unsubscribed = !registry
                .subscribers
                .lock()
                .await
                .contains_key(&query_hash.0);
            if !still_unsubscribed {
                return;
            }

            registry
                .scheduler
                .push_down(DownItem {
                    kind: DownKind::Cleanup,
                    query_hash,
                })
                .await;
        });
    }

    fn spawn_heartbeat_loop(&self, query_hash: QueryHash, ttl: Duration) {
        let interval = ttl.mul_f64(0.9);
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                scheduler
                    .push_down(DownItem {
                        kind: DownKind::Heartbeat,
                        query_hash,
                    })
                    .await;
            }
        });
    }

    /// Drains inbound live-channel events into the DownQueue. While the
    /// scheduler's UpQueue is non-empty (an up-priority drain is in
    /// progress, per `SyncScheduler::drain_down`'s own pause condition),
    /// events are buffered up to `MAX_DEFERRED_LIVE_EVENTS`,
    /// oldest-dropped-on-overflow, so a pathological event storm cannot grow
    /// memory unboundedly; once the UpQueue empties out, buffered events are
    /// applied in arrival order.
    pub async fn run_live_loop(self: Arc<Self>) {
        let mut deferred: std::collections::VecDeque<(QueryHash, String, u64, String)> =
            std::collections::VecDeque::new();
        loop {
            // `None` means the current connection's live channel closed out
            // from under us; the reconnection supervisor is (or will be)
            // redialing, so keep polling against whatever connection is live
            // rather than exiting this loop for good.
            let Some(event) = self.remote.next_live_event().await else {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            };

            let query_hash = match hex_to_query_hash(&event.query_id) {
                Some(q) => q,
                None => {
                    tracing::warn!(query_id = %event.query_id, "malformed query_id in live event; dropped");
                    continue;
                }
            };

            deferred.push_back((query_hash, event.record_id, event.version, event.action));
            if deferred.len() > MAX_DEFERRED_LIVE_EVENTS {
                deferred.pop_front();
            }

            // Up-priority drain still in progress: leave events buffered
            // rather than applying them now, so a live change never jumps
            // ahead of mutations the UpQueue is still confirming.
            if self.scheduler.up_len().await > 0 {
                continue;
            }

            while let Some((qh, record_id, version, action)) = deferred.pop_front() {
                self.on_live_change(qh, record_id, version, &action).await;
            }
        }
    }
}

fn hex_to_query_hash(hex: &str) -> Option<QueryHash> {
    if hex.len() != 64 {
        return None;
    }
    let mut bytes = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk).ok()?;
        bytes[i] = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(QueryHash(bytes))
}
