//! In-memory reference fixture for the server-side contract named in the
//! external interfaces section: this is not a production sync server, just
//! enough of `query::register`/`query::heartbeat`/live-publish to exercise a
//! client end to end in integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use grimoire_core::models::RecordId;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

pub struct QueryRefChange {
    pub client_id: Uuid,
    pub query_id: String,
    pub record_id: RecordId,
    pub version: u64,
    pub action: &'static str,
}

pub struct AppState {
    pub records: DashMap<RecordId, Value>,
    pub versions: DashMap<RecordId, u64>,
    /// one live-feed sender per connected client, keyed by client_id
    pub live_feeds: DashMap<Uuid, mpsc::UnboundedSender<QueryRefChange>>,
    /// which table a registered query watches, so a mutation can fan out to
    /// every interested `(client_id, query_id)` pair without re-parsing surql
    /// on every write
    pub query_refs: Mutex<HashMap<(Uuid, String), String>>,
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: DashMap::new(),
            versions: DashMap::new(),
            live_feeds: DashMap::new(),
            query_refs: Mutex::new(HashMap::new()),
        })
    }

    pub fn publish_change(&self, client_id: Uuid, query_id: &str, record_id: &RecordId, version: u64, action: &'static str) {
        if let Some(sender) = self.live_feeds.get(&client_id) {
            let _ = sender.send(QueryRefChange {
                client_id,
                query_id: query_id.to_string(),
                record_id: record_id.clone(),
                version,
                action,
            });
        }
    }

    /// Registers `(client_id, query_id)` against the table named in `surql`
    /// and returns the current remote array for that table: every record id
    /// and version currently on file, matching `query::register`'s
    /// idempotent-on-repeat contract.
    pub async fn register_query(&self, client_id: Uuid, query_id: &str, surql: &str) -> Vec<(RecordId, u64)> {
        let table = extract_table(surql).unwrap_or_default();
        self.query_refs
            .lock()
            .await
            .insert((client_id, query_id.to_string()), table.clone());

        self.versions
            .iter()
            .filter(|entry| table_of(entry.key()) == table)
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub async fn heartbeat(&self, _client_id: Uuid, _query_id: &str) {}

    pub async fn cleanup(&self, client_id: Uuid, query_id: &str) {
        self.query_refs
            .lock()
            .await
            .remove(&(client_id, query_id.to_string()));
    }

    pub fn fetch_records(&self, ids: &[RecordId]) -> Vec<(RecordId, Value)> {
        ids.iter()
            .filter_map(|id| {
                let record = self.records.get(id)?;
                let version = self.versions.get(id).map(|v| *v).unwrap_or(0);
                let mut value = record.clone();
                if let Value::Object(ref mut map) = value {
                    map.insert("_version".to_string(), Value::from(version));
                }
                Some((id.clone(), value))
            })
            .collect()
    }

    pub fn check_absent(&self, ids: &[RecordId]) -> Vec<RecordId> {
        ids.iter()
            .filter(|id| !self.records.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Applies one `create`/`update`/`delete` against the authoritative
    /// in-memory store, bumps its version, and fans the change out to every
    /// `(client_id, query_id)` watching that table. Returns the new version
    /// (a tombstone version for deletes, so a late `check_absent` caller
    /// still observes forward progress).
    pub async fn apply_mutation(
        &self,
        client_id: Uuid,
        kind: &str,
        record_id: &RecordId,
        data: Option<Value>,
    ) -> u64 {
        let table = table_of(record_id);
        let new_version = self.versions.get(record_id).map(|v| *v).unwrap_or(0) + 1;
        self.versions.insert(record_id.clone(), new_version);

        let action: &'static str = match kind {
            "delete" => {
                self.records.remove(record_id);
                "delete"
            }
            "create" => {
                if let Some(data) = data {
                    self.records.insert(record_id.clone(), data);
                }
                "create"
            }
            _ => {
                if let Some(data) = data {
                    self.records.insert(record_id.clone(), data);
                }
                "update"
            }
        };

        let watchers: Vec<(Uuid, String)> = self
            .query_refs
            .lock()
            .await
            .iter()
            .filter(|(_, watched_table)| **watched_table == table)
            .map(|(key, _)| key.clone())
            .collect();

        for (watcher_client, query_id) in watchers {
            self.publish_change(watcher_client, &query_id, record_id, new_version, action);
        }

        new_version
    }
}

fn table_of(record_id: &str) -> String {
    record_id
        .split_once(':')
        .map(|(table, _)| table.to_string())
        .unwrap_or_else(|| record_id.to_string())
}

/// Pulls the table name out of a `SELECT ... FROM <table> ...` query. The
/// server fixture only needs enough of SurQL to know which table a query
/// watches, not the full predicate/join grammar the client's Stream
/// Processor evaluates locally.
fn extract_table(surql: &str) -> Option<String> {
    let lower = surql.to_ascii_lowercase();
    let from_pos = lower.find(" from ")?;
    let after = surql[from_pos + 6..].trim_start();
    let end = after
        .find(|c: char| c.is_whitespace() || c == ',')
        .unwrap_or(after.len());
    Some(after[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_table_reads_first_identifier_after_from() {
        assert_eq!(extract_table("SELECT * FROM thread WHERE done = true"), Some("thread".to_string()));
        assert_eq!(extract_table("select id from todo order by created_at desc"), Some("todo".to_string()));
        assert_eq!(extract_table("not a query"), None);
    }

    #[tokio::test]
    async fn register_query_returns_current_table_rows() {
        let state = AppState::new();
        state.versions.insert("thread:A1".to_string(), 3);
        state.versions.insert("note:B1".to_string(), 1);
        let client_id = Uuid::new_v4();

        let array = state.register_query(client_id, "q1", "SELECT * FROM thread").await;
        assert_eq!(array, vec![("thread:A1".to_string(), 3)]);
    }

    #[tokio::test]
    async fn apply_mutation_bumps_version_and_fans_out() {
        let state = AppState::new();
        let client_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.live_feeds.insert(client_id, tx);
        state.register_query(client_id, "q1", "SELECT * FROM thread").await;

        let version = state
            .apply_mutation(client_id, "create", &"thread:A1".to_string(), Some(json!({"id": "A1"})))
            .await;
        assert_eq!(version, 1);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.record_id, "thread:A1");
        assert_eq!(change.version, 1);
        assert_eq!(change.action, "create");
    }

    #[test]
    fn fetch_records_embeds_current_version() {
        let state = AppState::new();
        state.records.insert("thread:A1".to_string(), json!({"id": "A1", "title": "hi"}));
        state.versions.insert("thread:A1".to_string(), 5);

        let fetched = state.fetch_records(&["thread:A1".to_string()]);
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].0, "thread:A1");
        assert_eq!(fetched[0].1["_version"], 5);
    }

    #[test]
    fn check_absent_reports_only_missing_ids() {
        let state = AppState::new();
        state.records.insert("thread:A1".to_string(), json!({"id": "A1"}));
        let absent = state.check_absent(&["thread:A1".to_string(), "thread:A2".to_string()]);
        assert_eq!(absent, vec!["thread:A2".to_string()]);
    }
}
