use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::hash::QueryHash;

/// Canonical `table:id` record reference. Normalized before every comparison so
/// a typed record-id and its string form never cause a spurious join-key miss.
pub type RecordId = String;

pub fn normalize_record_id(table: &str, id: &str) -> RecordId {
    if let Some((t, _)) = id.split_once(':') {
        if t == table {
            return id.to_string();
        }
    }
    format!("{table}:{id}")
}

/// Ordered, unique-keyed `(record_id, version)` pairs. Order is semantically
/// significant — it is the sequence a subscriber observes and the sequence the
/// content hash is computed over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVersionArray(pub Vec<(RecordId, u64)>);

impl RecordVersionArray {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, id: &str) -> Option<u64> {
        self.0.iter().find(|(rid, _)| rid == id).map(|(_, v)| *v)
    }

    pub fn upsert(&mut self, id: RecordId, version: u64) {
        if let Some(entry) = self.0.iter_mut().find(|(rid, _)| *rid == id) {
            entry.1 = version;
        } else {
            self.0.push((id, version));
        }
    }

    pub fn remove(&mut self, id: &str) {
        self.0.retain(|(rid, _)| rid != id);
    }

    pub fn content_hash(&self) -> blake3::Hash {
        crate::hash::record_sequence_hash(self.0.iter().map(|(id, v)| (id.as_str(), *v)))
    }
}

/// Transient diff between a local and remote `RecordVersionArray`, computed on
/// demand — never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordVersionDiff {
    pub added: Vec<RecordId>,
    pub updated: Vec<RecordId>,
    pub removed: Vec<RecordId>,
}

impl RecordVersionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Compute `remote` relative to `local`: ids only in remote are `added`, ids
    /// in both with a different version are `updated`, ids only in local are
    /// `removed`.
    pub fn between(local: &RecordVersionArray, remote: &RecordVersionArray) -> Self {
        let mut diff = RecordVersionDiff::default();
        for (id, remote_version) in &remote.0 {
            match local.get(id) {
                None => diff.added.push(id.clone()),
                Some(local_version) if local_version != *remote_version => {
                    diff.updated.push(id.clone())
                }
                Some(_) => {}
            }
        }
        for (id, _) in &local.0 {
            if remote.get(id).is_none() {
                diff.removed.push(id.clone());
            }
        }
        diff
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheOp {
    Create,
    Update,
    Delete,
}

/// The unit the Cache Module writes atomically to the local DB and the
/// Processor. Transient — constructed per write, never persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub table: String,
    pub op: CacheOp,
    pub record: serde_json::Value,
    pub version: u64,
}

impl CacheRecord {
    pub fn record_id(&self) -> RecordId {
        let id = self
            .record
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        normalize_record_id(&self.table, id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// A durable record of a user mutation awaiting server acknowledgement,
/// persisted in the reserved `_pending_mutations` table. Deleted only once the
/// corresponding UpQueue item is confirmed by the remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: Uuid,
    pub kind: MutationKind,
    pub record_id: RecordId,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IncantationState {
    Unregistered,
    Registering,
    Live,
    Syncing,
    Cleaning,
    Destroyed,
}

/// A registered, content-hashed query with a server-side materialized view.
/// Exclusively owned by the Incantation Registry; never mutated by any other
/// component.
#[derive(Debug, Clone)]
pub struct Incantation {
    pub id: QueryHash,
    pub table: String,
    pub surql: String,
    pub params: serde_json::Value,
    pub ttl: Duration,
    pub last_active_at: DateTime<Utc>,
    pub local_array: RecordVersionArray,
    pub remote_array: RecordVersionArray,
    pub involved_tables: Vec<String>,
    pub state: IncantationState,
}

impl Incantation {
    pub fn is_converged(&self) -> bool {
        self.state == IncantationState::Live && self.local_array == self.remote_array
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_record_id_prefixes_bare_ids() {
        assert_eq!(normalize_record_id("thread", "A1"), "thread:A1");
    }

    #[test]
    fn normalize_record_id_leaves_matching_table_ref_alone() {
        assert_eq!(normalize_record_id("thread", "thread:A1"), "thread:A1");
    }

    #[test]
    fn normalize_record_id_requalifies_mismatched_table_ref() {
        // a record-id literal embedded from a different table context is re-qualified,
        // not trusted blindly
        assert_eq!(normalize_record_id("thread", "other:A1"), "thread:other:A1");
    }

    #[test]
    fn diff_between_detects_added_updated_removed() {
        let mut local = RecordVersionArray::empty();
        local.upsert("thread:A1".into(), 1);
        local.upsert("thread:A2".into(), 1);

        let mut remote = RecordVersionArray::empty();
        remote.upsert("thread:A1".into(), 2); // updated
        remote.upsert("thread:A3".into(), 1); // added
        // A2 is absent from remote -> removed

        let diff = RecordVersionDiff::between(&local, &remote);
        assert_eq!(diff.added, vec!["thread:A3".to_string()]);
        assert_eq!(diff.updated, vec!["thread:A1".to_string()]);
        assert_eq!(diff.removed, vec!["thread:A2".to_string()]);
    }

    #[test]
    fn empty_diff_between_equal_arrays() {
        let mut arr = RecordVersionArray::empty();
        arr.upsert("thread:A1".into(), 1);
        let diff = RecordVersionDiff::between(&arr, &arr.clone());
        assert!(diff.is_empty());
    }

    #[test]
    fn cache_record_derives_normalized_record_id() {
        let record = CacheRecord {
            table: "thread".into(),
            op: CacheOp::Create,
            record: json!({"id": "A1", "title": "t"}),
            version: 1,
        };
        assert_eq!(record.record_id(), "thread:A1");
    }

    #[test]
    fn incantation_converges_only_when_live_and_equal() {
        let mut inc = Incantation {
            id: QueryHash([0u8; 32]),
            table: "thread".into(),
            surql: "SELECT * FROM thread".into(),
            params: json!({}),
            ttl: Duration::from_secs(600),
            last_active_at: Utc::now(),
            local_array: RecordVersionArray::empty(),
            remote_array: RecordVersionArray::empty(),
            involved_tables: vec!["thread".into()],
            state: IncantationState::Syncing,
        };
        assert!(!inc.is_converged());
        inc.state = IncantationState::Live;
        assert!(inc.is_converged());
        inc.local_array.upsert("thread:A1".into(), 1);
        assert!(!inc.is_converged());
    }
}
