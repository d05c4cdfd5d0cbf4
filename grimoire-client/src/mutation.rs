//! Optimistic local writes backed by a durable pending-mutation log. Every
//! non-`local_only` call leaves a row in `_pending_mutations` that survives a
//! crash until the Scheduler drains and confirms it with the remote.

use std::time::Duration;

use chrono::Utc;
use grimoire_core::errors::MutationFailed;
use grimoire_core::models::{CacheOp, CacheRecord, MutationKind, PendingMutation, RecordId};
use serde_json::Value;
use uuid::Uuid;

use crate::cache::CacheModule;
use crate::processor::Update;
use crate::scheduler::{SyncScheduler, UpItem};

const RETRY_BACKOFFS_MS: [u64; 3] = [100, 200, 300];

pub struct MutationOutcome {
    pub mutation_id: Uuid,
    pub record: Value,
    pub updates: Vec<Update>,
}

pub struct MutationOptions {
    pub local_only: bool,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self { local_only: false }
    }
}

pub struct MutationPipeline<'a> {
    cache: &'a CacheModule,
    scheduler: &'a SyncScheduler,
}

impl<'a> MutationPipeline<'a> {
    pub fn new(cache: &'a CacheModule, scheduler: &'a SyncScheduler) -> Self {
        Self { cache, scheduler }
    }

    pub async fn create(
        &self,
        table: &str,
        data: Value,
        opts: MutationOptions,
    ) -> Result<MutationOutcome, MutationFailed> {
        self.run(table, MutationKind::Create, data, opts).await
    }

    pub async fn update(
        &self,
        table: &str,
        id: &str,
        partial: Value,
        opts: MutationOptions,
    ) -> Result<MutationOutcome, MutationFailed> {
        let record_id = grimoire_core::models::normalize_record_id(table, id);
        let current = self
            .cache
            .local_store()
            .get_record(&record_id)
            .await
            .map_err(|e| MutationFailed(e.to_string()))?
            .unwrap_or_else(|| serde_json::json!({}));

        let merged = merge_one_level(current, partial);
        self.run(table, MutationKind::Update, merged, opts).await
    }

    pub async fn delete(
        &self,
        table: &str,
        id: &str,
        opts: MutationOptions,
    ) -> Result<MutationOutcome, MutationFailed> {
        let record_id = grimoire_core::models::normalize_record_id(table, id);
        let mutation_id = Uuid::new_v4();

        if !opts.local_only {
            self.persist_pending(mutation_id, MutationKind::Delete, record_id.clone(), None)
                .await?;
        }

        let updates = self
            .cache
            .delete(table, id, false)
            .await
            .map_err(|e| MutationFailed(e.to_string()))?;

        if !opts.local_only {
            self.scheduler
                .push_up(UpItem {
                    kind: MutationKind::Delete,
                    mutation_id,
                    record_id,
                    data: None,
                    record: None,
                })
                .await;
        }

        Ok(MutationOutcome {
            mutation_id,
            record: Value::Null,
            updates,
        })
    }

    async fn run(
        &self,
        table: &str,
        kind: MutationKind,
        data: Value,
        opts: MutationOptions,
    ) -> Result<MutationOutcome, MutationFailed> {
        let mutation_id = Uuid::new_v4();
        let record_id = data
            .get("id")
            .and_then(|v| v.as_str())
            .map(|id| grimoire_core::models::normalize_record_id(table, id))
            .unwrap_or_else(|| grimoire_core::models::normalize_record_id(table, &mutation_id.to_string()));

        if !opts.local_only {
            self.persist_pending(mutation_id, kind, record_id.clone(), Some(data.clone()))
                .await?;
        }

        // Optimistic ingest: this pipeline owns the `current_version + 1` rule
        // (SPEC_FULL §4.4/Open Question (b)); the Cache Module never guesses a
        // version on our behalf, so the value stamped into local DB and the
        // value the Processor sees always agree.
        let current_version = self
            .cache
            .local_store()
            .get_version(&record_id)
            .await
            .map_err(|e| MutationFailed(e.to_string()))?
            .unwrap_or(0);
        let new_version = current_version + 1;
        let mut stamped = data.clone();
        if let Value::Object(ref mut map) = stamped {
            map.insert("_version".to_string(), Value::from(new_version));
        }

        let cache_op = match kind {
            MutationKind::Create => CacheOp::Create,
            MutationKind::Update => CacheOp::Update,
            MutationKind::Delete => unreachable!("delete uses MutationPipeline::delete"),
        };

        let updates = self
            .ingest_with_retry(table, cache_op, new_version, &stamped)
            .await?;

        if !opts.local_only {
            self.scheduler
                .push_up(UpItem {
                    kind,
                    mutation_id,
                    record_id,
                    data: Some(data.clone()),
                    record: Some(data.clone()),
                })
                .await;
        }

        Ok(MutationOutcome {
            mutation_id,
            record: data,
            updates,
        })
    }

    async fn ingest_with_retry(
        &self,
        table: &str,
        op: CacheOp,
        version: u64,
        data: &Value,
    ) -> Result<Vec<Update>, MutationFailed> {
        let record = CacheRecord {
            table: table.to_string(),
            op,
            record: data.clone(),
            version,
        };

        let mut attempt = 0;
        loop {
            match self.cache.save(record.clone(), false).await {
                Ok(updates) => return Ok(updates),
                Err(e) if attempt < RETRY_BACKOFFS_MS.len() && is_transient(&e) => {
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFFS_MS[attempt])).await;
                    attempt += 1;
                }
                Err(e) => return Err(MutationFailed(e.to_string())),
            }
        }
    }

    async fn persist_pending(
        &self,
        mutation_id: Uuid,
        kind: MutationKind,
        record_id: RecordId,
        data: Option<Value>,
    ) -> Result<(), MutationFailed> {
        let mutation = PendingMutation {
            id: mutation_id,
            kind,
            record_id,
            data,
            created_at: Utc::now(),
        };
        self.cache
            .local_store()
            .insert_pending_mutation(&mutation)
            .await
            .map_err(|e| MutationFailed(e.to_string()))
    }
}

/// SQLite's primary result codes for a busy or locked database (`SQLITE_BUSY`
/// / `SQLITE_LOCKED`) — the only `Database` errors worth retrying. Anything
/// else (constraint violation, malformed SQL) is permanent and should fail
/// fast instead of burning the retry budget.
fn is_transient(err: &grimoire_core::errors::LocalDbError) -> bool {
    use sqlx::error::DatabaseError;

    match err {
        grimoire_core::errors::LocalDbError::Query(sqlx::Error::Database(db_err)) => {
            matches!(db_err.code().as_deref(), Some("5") | Some("6"))
        }
        grimoire_core::errors::LocalDbError::Query(sqlx::Error::PoolTimedOut) => true,
        _ => false,
    }
}

/// One-level JSON merge-patch: object keys in `partial` overwrite the
/// corresponding key in `current`; everything else is left untouched. A
/// `null` value in `partial` removes the key, matching merge-patch semantics.
fn merge_one_level(mut current: Value, partial: Value) -> Value {
    let (Value::Object(current_map), Value::Object(partial_map)) =
        (&mut current, partial) else {
        return current;
    };
    for (key, value) in partial_map {
        if value.is_null() {
            current_map.remove(&key);
        } else {
            current_map.insert(key, value);
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fmt;

    #[test]
    fn merge_one_level_overwrites_and_removes() {
        let current = json!({"title": "a", "done": false, "tag": "x"});
        let partial = json!({"done": true, "tag": null});
        let merged = merge_one_level(current, partial);
        assert_eq!(merged, json!({"title": "a", "done": true}));
    }

    #[derive(Debug)]
    struct FakeDbError(Option<&'static str>);

    impl fmt::Display for FakeDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "fake db error")
        }
    }

    impl std::error::Error for FakeDbError {}

    impl sqlx::error::DatabaseError for FakeDbError {
        fn message(&self) -> &str {
            "fake db error"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            self.0.map(std::borrow::Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn db_error(code: Option<&'static str>) -> grimoire_core::errors::LocalDbError {
        grimoire_core::errors::LocalDbError::Query(sqlx::Error::Database(Box::new(FakeDbError(
            code,
        ))))
    }

    #[test]
    fn busy_and_locked_codes_are_transient() {
        assert!(is_transient(&db_error(Some("5"))));
        assert!(is_transient(&db_error(Some("6"))));
    }

    #[test]
    fn constraint_violation_is_not_transient() {
        assert!(!is_transient(&db_error(Some("19"))));
        assert!(!is_transient(&db_error(None)));
    }

    #[test]
    fn pool_timed_out_is_transient() {
        assert!(is_transient(&grimoire_core::errors::LocalDbError::Query(
            sqlx::Error::PoolTimedOut
        )));
    }
}
