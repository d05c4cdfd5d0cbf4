//! Single writer into the local DB and the Stream Processor. Nothing else in
//! the crate touches record content directly; even the Sync Engine and
//! Mutation Pipeline go through here so the two never drift out of lockstep.

use grimoire_core::errors::LocalDbError;
use grimoire_core::hash::QueryHash;
use grimoire_core::models::{CacheOp, CacheRecord, RecordId, RecordVersionArray};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::local_store::LocalStore;
use crate::processor::{IngestItem, RegisterConfig, StreamProcessor, Update};

pub struct CacheModule {
    local: LocalStore,
    processor: Mutex<StreamProcessor>,
}

impl CacheModule {
    pub fn new(local: LocalStore, processor: StreamProcessor) -> Self {
        Self {
            local,
            processor: Mutex::new(processor),
        }
    }

    pub async fn save(&self, record: CacheRecord, skip_db: bool) -> Result<Vec<Update>, LocalDbError> {
        self.save_batch(vec![record], skip_db).await
    }

    /// Writes every record via one transaction, then ingests the whole batch
    /// into the processor.
    pub async fn save_batch(
        &self,
        records: Vec<CacheRecord>,
        skip_db: bool,
    ) -> Result<Vec<Update>, LocalDbError> {
        if !skip_db {
            let mut tx = self.local.begin().await?;
            for record in &records {
                let body = serde_json::to_string(&record.record)
                    .map_err(|e| LocalDbError::InvariantViolated(format!("record not serializable: {e}")))?;
                sqlx::query(
                    "INSERT INTO records (record_id, table_name, content) VALUES (?1, ?2, ?3)
                     ON CONFLICT(record_id) DO UPDATE SET content = excluded.content",
                )
                .bind(record.record_id())
                .bind(&record.table)
                .bind(body)
                .execute(&mut *tx)
                .await
                .map_err(LocalDbError::Query)?;

                sqlx::query(
                    "INSERT INTO _version (record_id, version) VALUES (?1, ?2)
                     ON CONFLICT(record_id) DO UPDATE SET version = excluded.version",
                )
                .bind(record.record_id())
                .bind(record.version as i64)
                .execute(&mut *tx)
                .await
                .map_err(LocalDbError::Query)?;
            }
            tx.commit().await.map_err(LocalDbError::Query)?;
        }

        let items: Vec<IngestItem> = records
            .into_iter()
            .map(|record| {
                let id = record.record_id();
                let mut stamped = record.record;
                if let Value::Object(ref mut map) = stamped {
                    map.insert("_version".to_string(), Value::from(record.version));
                }
                IngestItem {
                    table: record.table.clone(),
                    op: record.op,
                    id,
                    record: stamped,
                    optimistic: false,
                }
            })
            .collect();

        let updates = self.processor.lock().await.ingest_batch(items);
        Ok(updates)
    }

    pub async fn delete(&self, table: &str, id: &str, skip_db: bool) -> Result<Vec<Update>, LocalDbError> {
        let record_id: RecordId = grimoire_core::models::normalize_record_id(table, id);

        if !skip_db {
            self.local.delete_record(&record_id).await?;
            self.local.delete_version(&record_id).await?;
        }

        let updates = self.processor.lock().await.ingest_batch(vec![crate::processor::IngestItem {
            table: table.to_string(),
            op: CacheOp::Delete,
            id: record_id,
            record: Value::Null,
            optimistic: false,
        }]);
        Ok(updates)
    }

    pub async fn register_query(
        &self,
        query_id: QueryHash,
        surql: String,
        involved_tables: Vec<String>,
    ) -> Result<RecordVersionArray, LocalDbError> {
        let mut processor = self.processor.lock().await;
        let update = processor
            .register(RegisterConfig {
                query_id,
                surql,
                involved_tables,
            })
            .map_err(|e| LocalDbError::InvariantViolated(e.to_string()))?;
        Ok(update.map(|u| u.result).unwrap_or_default())
    }

    pub async fn unregister_query(&self, query_id: QueryHash) {
        self.processor.lock().await.unregister(query_id);
    }

    pub async fn save_processor_snapshot(&self) -> Result<(), LocalDbError> {
        let bytes = self
            .processor
            .lock()
            .await
            .save_state()
            .map_err(|e| LocalDbError::InvariantViolated(e.to_string()))?;
        self.local.save_processor_state(&bytes).await
    }

    pub async fn load_processor_snapshot(&self) -> Result<(), LocalDbError> {
        if let Some(bytes) = self.local.load_processor_state().await? {
            self.processor
                .lock()
                .await
                .load_state(&bytes)
                .map_err(|e| LocalDbError::InvariantViolated(e.to_string()))?;
        }
        Ok(())
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_cache() -> CacheModule {
        let local = LocalStore::connect("sqlite::memory:").await.unwrap();
        local.provision("test-schema", false).await.unwrap();
        CacheModule::new(local, StreamProcessor::new())
    }

    fn qh() -> QueryHash {
        QueryHash([7u8; 32])
    }

    #[tokio::test]
    async fn save_writes_db_and_ingests_processor_in_lockstep() {
        let cache = memory_cache().await;
        cache
            .register_query(qh(), "SELECT * FROM thread".into(), vec!["thread".into()])
            .await
            .unwrap();

        let updates = cache
            .save(
                CacheRecord {
                    table: "thread".into(),
                    op: CacheOp::Create,
                    record: json!({"id": "A1", "title": "hi"}),
                    version: 1,
                },
                false,
            )
            .await
            .unwrap();

        assert_eq!(updates.len(), 1);
        let stored = cache.local_store().get_record(&"thread:A1".to_string()).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn delete_removes_from_db_and_processor() {
        let cache = memory_cache().await;
        cache
            .register_query(qh(), "SELECT * FROM thread".into(), vec!["thread".into()])
            .await
            .unwrap();
        cache
            .save(
                CacheRecord {
                    table: "thread".into(),
                    op: CacheOp::Create,
                    record: json!({"id": "A1"}),
                    version: 1,
                },
                false,
            )
            .await
            .unwrap();

        let updates = cache.delete("thread", "A1", false).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert!(cache
            .local_store()
            .get_record(&"thread:A1".to_string())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn skip_db_ingests_processor_only() {
        let cache = memory_cache().await;
        cache
            .register_query(qh(), "SELECT * FROM thread".into(), vec!["thread".into()])
            .await
            .unwrap();

        cache
            .save(
                CacheRecord {
                    table: "thread".into(),
                    op: CacheOp::Create,
                    record: json!({"id": "A1"}),
                    version: 1,
                },
                true,
            )
            .await
            .unwrap();

        assert!(cache
            .local_store()
            .get_record(&"thread:A1".to_string())
            .await
            .unwrap()
            .is_none());
    }
}
