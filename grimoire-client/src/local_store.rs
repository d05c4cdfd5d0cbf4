//! sqlx-backed SQLite adapter over the reserved local tables. This is the
//! only module that holds a `SqlitePool`; every other component reaches the
//! local DB through the typed methods here, following the teacher's
//! `ClientDatabase` adapter shape (one struct wrapping one pool, one method
//! per named query).

use chrono::{DateTime, Utc};
use grimoire_core::errors::LocalDbError;
use grimoire_core::models::{MutationKind, PendingMutation, RecordId};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::queries::Queries;

pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub async fn connect(url: &str) -> Result<Self, LocalDbError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(LocalDbError::Query)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(LocalDbError::Query)?;
        Ok(Self { pool })
    }

    pub async fn provision(&self, schema_hash: &str, force: bool) -> Result<bool, LocalDbError> {
        if force {
            sqlx::query("DROP TABLE IF EXISTS records").execute(&self.pool).await.ok();
            sqlx::query("DROP TABLE IF EXISTS _version").execute(&self.pool).await.ok();
            sqlx::query("DROP TABLE IF EXISTS _pending_mutations").execute(&self.pool).await.ok();
            sqlx::query("DROP TABLE IF EXISTS _stream_processor_state").execute(&self.pool).await.ok();
            sqlx::query("DROP TABLE IF EXISTS _schema").execute(&self.pool).await.ok();
            // sqlx's own migration ledger must go too: `migrate!().run()` below
            // skips any migration it finds already recorded there, which would
            // leave the tables just dropped never recreated.
            sqlx::query("DROP TABLE IF EXISTS _sqlx_migrations").execute(&self.pool).await.ok();
        }

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(LocalDbError::Migration)?;

        let existing: Option<String> = sqlx::query_scalar(Queries::HAS_SCHEMA_MARKER)
            .bind(schema_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;
        let already_provisioned = existing.is_some();

        sqlx::query(Queries::INSERT_SCHEMA_MARKER)
            .bind(schema_hash)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;

        Ok(!already_provisioned)
    }

    pub async fn upsert_record(&self, id: &RecordId, table: &str, content: &Value) -> Result<(), LocalDbError> {
        let body = serde_json::to_string(content)
            .map_err(|e| LocalDbError::InvariantViolated(format!("record content not serializable: {e}")))?;
        sqlx::query(Queries::UPSERT_RECORD)
            .bind(id)
            .bind(table)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;
        Ok(())
    }

    pub async fn delete_record(&self, id: &RecordId) -> Result<(), LocalDbError> {
        sqlx::query(Queries::DELETE_RECORD)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;
        Ok(())
    }

    pub async fn get_record(&self, id: &RecordId) -> Result<Option<Value>, LocalDbError> {
        let row = sqlx::query(Queries::GET_RECORD)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;
        match row {
            Some(row) => {
                let body: String = row.try_get("content").map_err(LocalDbError::Query)?;
                let value = serde_json::from_str(&body)
                    .map_err(|e| LocalDbError::InvariantViolated(format!("stored record content malformed: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set_version(&self, id: &RecordId, version: u64) -> Result<(), LocalDbError> {
        sqlx::query(Queries::UPSERT_VERSION)
            .bind(id)
            .bind(version as i64)
            .execute(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;
        Ok(())
    }

    pub async fn delete_version(&self, id: &RecordId) -> Result<(), LocalDbError> {
        sqlx::query(Queries::DELETE_VERSION)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;
        Ok(())
    }

    pub async fn get_version(&self, id: &RecordId) -> Result<Option<u64>, LocalDbError> {
        let version: Option<i64> = sqlx::query_scalar(Queries::GET_VERSION)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;
        Ok(version.map(|v| v as u64))
    }

    pub async fn insert_pending_mutation(&self, mutation: &PendingMutation) -> Result<(), LocalDbError> {
        let data = mutation
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| LocalDbError::InvariantViolated(format!("mutation data not serializable: {e}")))?;
        sqlx::query(Queries::INSERT_PENDING_MUTATION)
            .bind(mutation.id.to_string())
            .bind(mutation.kind.to_string())
            .bind(&mutation.record_id)
            .bind(data)
            .bind(mutation.created_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;
        Ok(())
    }

    pub async fn delete_pending_mutation(&self, id: Uuid) -> Result<(), LocalDbError> {
        sqlx::query(Queries::DELETE_PENDING_MUTATION)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;
        Ok(())
    }

    pub async fn list_pending_mutations(&self) -> Result<Vec<PendingMutation>, LocalDbError> {
        let rows = sqlx::query(Queries::LIST_PENDING_MUTATIONS)
            .fetch_all(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;

        let mut mutations = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(LocalDbError::Query)?;
            let kind: String = row.try_get("kind").map_err(LocalDbError::Query)?;
            let record_id: String = row.try_get("record_id").map_err(LocalDbError::Query)?;
            let data: Option<String> = row.try_get("data").map_err(LocalDbError::Query)?;
            let created_at: String = row.try_get("created_at").map_err(LocalDbError::Query)?;

            let id = Uuid::parse_str(&id)
                .map_err(|e| LocalDbError::InvariantViolated(format!("malformed pending mutation id: {e}")))?;
            let kind = parse_mutation_kind(&kind)?;
            let data = data
                .map(|d| serde_json::from_str(&d))
                .transpose()
                .map_err(|e| LocalDbError::InvariantViolated(format!("malformed pending mutation data: {e}")))?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| LocalDbError::InvariantViolated(format!("malformed pending mutation timestamp: {e}")))?;

            mutations.push(PendingMutation {
                id,
                kind,
                record_id,
                data,
                created_at,
            });
        }
        Ok(mutations)
    }

    pub async fn save_processor_state(&self, bytes: &[u8]) -> Result<(), LocalDbError> {
        sqlx::query(Queries::UPSERT_PROCESSOR_STATE)
            .bind(bytes)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;
        Ok(())
    }

    pub async fn load_processor_state(&self) -> Result<Option<Vec<u8>>, LocalDbError> {
        let bytes: Option<Vec<u8>> = sqlx::query_scalar(Queries::GET_PROCESSOR_STATE)
            .fetch_optional(&self.pool)
            .await
            .map_err(LocalDbError::Query)?;
        Ok(bytes)
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>, LocalDbError> {
        self.pool.begin().await.map_err(LocalDbError::Query)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_mutation_kind(raw: &str) -> Result<MutationKind, LocalDbError> {
    match raw {
        "create" => Ok(MutationKind::Create),
        "update" => Ok(MutationKind::Update),
        "delete" => Ok(MutationKind::Delete),
        other => Err(LocalDbError::InvariantViolated(format!(
            "unknown pending mutation kind `{other}`"
        ))),
    }
}
