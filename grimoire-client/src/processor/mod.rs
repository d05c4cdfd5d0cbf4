//! The Stream Processor: maintains materialized views keyed by query hash
//! over a differential-dataflow-flavored operator tree, and emits updates
//! only when a view's content hash actually changes.

pub mod operators;
pub mod plan;

use std::collections::HashMap;

use grimoire_core::errors::PlanError;
use grimoire_core::hash::QueryHash;
use grimoire_core::models::{CacheOp, RecordId, RecordVersionArray, normalize_record_id};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use self::operators::{evaluate, TableSnapshot};
use self::plan::{parse_surql, LogicalPlan};

#[derive(Debug, Clone)]
pub struct RegisterConfig {
    pub query_id: QueryHash,
    pub surql: String,
    pub involved_tables: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Update {
    pub query_id: QueryHash,
    pub result: RecordVersionArray,
    pub result_hash: blake3::Hash,
}

#[derive(Debug, Clone)]
pub struct IngestItem {
    pub table: String,
    pub op: CacheOp,
    pub id: String,
    pub record: Value,
    pub optimistic: bool,
}

struct MaterializedView {
    query_id: QueryHash,
    surql: String,
    plan: LogicalPlan,
    input_tables: Vec<String>,
    result: RecordVersionArray,
    result_hash: blake3::Hash,
}

#[derive(Serialize, Deserialize)]
struct SerializedView {
    query_id: [u8; 32],
    surql: String,
    input_tables: Vec<String>,
    result: RecordVersionArray,
}

#[derive(Serialize, Deserialize)]
struct SerializedState {
    tables: HashMap<String, HashMap<RecordId, Value>>,
    versions: HashMap<RecordId, u64>,
    views: Vec<SerializedView>,
}

/// Owns every [`MaterializedView`] exclusively; nothing outside this module
/// mutates processor state directly. Its four mutating operations
/// (`register`, `unregister`, `ingest`, `ingest_batch`) are synchronous and
/// never suspend on I/O, so callers may invoke them from any await point
/// without the processor itself ever blocking.
pub struct StreamProcessor {
    views: HashMap<[u8; 32], MaterializedView>,
    tables: TableSnapshot,
    versions: HashMap<RecordId, u64>,
}

impl StreamProcessor {
    pub fn new() -> Self {
        Self {
            views: HashMap::new(),
            tables: TableSnapshot::new(),
            versions: HashMap::new(),
        }
    }

    pub fn register(&mut self, config: RegisterConfig) -> Result<Option<Update>, PlanError> {
        let plan = parse_surql(&config.surql)?;
        let input_tables = if config.involved_tables.is_empty() {
            plan.input_tables()
        } else {
            config.involved_tables.clone()
        };

        let ids = evaluate(&plan, &self.tables)?;
        let result = self.build_result_array(&ids);
        let result_hash = result.content_hash();

        self.views.insert(
            config.query_id.0,
            MaterializedView {
                query_id: config.query_id,
                surql: config.surql.clone(),
                plan,
                input_tables,
                result: result.clone(),
                result_hash,
            },
        );

        Ok(Some(Update {
            query_id: config.query_id,
            result,
            result_hash,
        }))
    }

    pub fn unregister(&mut self, query_id: QueryHash) {
        self.views.remove(&query_id.0);
    }

    pub fn ingest(
        &mut self,
        table: &str,
        op: CacheOp,
        id: &str,
        record: Option<Value>,
        optimistic: bool,
    ) -> Vec<Update> {
        self.ingest_batch(vec![IngestItem {
            table: table.to_string(),
            op,
            id: id.to_string(),
            record: record.unwrap_or(Value::Null),
            optimistic,
        }])
    }

    pub fn ingest_batch(&mut self, items: Vec<IngestItem>) -> Vec<Update> {
        let mut touched_tables = std::collections::HashSet::new();

        for item in items {
            let record_id = normalize_record_id(&item.table, &item.id);
            touched_tables.insert(item.table.clone());

            match item.op {
                CacheOp::Delete => {
                    if let Some(entry) = self.tables.get_mut(&item.table) {
                        entry.remove(&record_id);
                    }
                    self.versions.remove(&record_id);
                }
                CacheOp::Create | CacheOp::Update => {
                    let new_version = if item.optimistic {
                        self.versions.get(&record_id).copied().unwrap_or(0) + 1
                    } else {
                        item.record
                            .get("_version")
                            .and_then(|v| v.as_u64())
                            .unwrap_or_else(|| self.versions.get(&record_id).copied().unwrap_or(0) + 1)
                    };
                    self.versions.insert(record_id.clone(), new_version);
                    self.tables
                        .entry(item.table.clone())
                        .or_default()
                        .insert(record_id.clone(), item.record);
                }
            }
        }

        let mut updates = Vec::new();
        for view in self.views.values_mut() {
            let affected = view
                .input_tables
                .iter()
                .any(|t| touched_tables.contains(t));
            if !affected {
                continue;
            }

            let ids = match evaluate(&view.plan, &self.tables) {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::warn!(query_id = %view.query_id, error = %e, "ingest re-evaluation failed; view left at prior state");
                    continue;
                }
            };

            let result = RecordVersionArray(
                ids.into_iter()
                    .map(|id| {
                        let version = self.versions.get(&id).copied().unwrap_or(0);
                        (id, version)
                    })
                    .collect(),
            );
            let hash = result.content_hash();
            if hash != view.result_hash {
                view.result = result.clone();
                view.result_hash = hash;
                updates.push(Update {
                    query_id: view.query_id,
                    result,
                    result_hash: hash,
                });
            }
        }

        updates
    }

    /// Forces the stored version for a record within a view without a full
    /// re-evaluation; used by the Sync Engine during reconciliation once it
    /// has already confirmed the authoritative version out of band.
    pub fn set_record_version(&mut self, query_id: QueryHash, id: &str, version: u64) {
        self.versions.insert(id.to_string(), version);
        if let Some(view) = self.views.get_mut(&query_id.0) {
            view.result.upsert(id.to_string(), version);
            view.result_hash = view.result.content_hash();
        }
    }

    pub fn save_state(&self) -> Result<Vec<u8>, PlanError> {
        let views = self
            .views
            .values()
            .map(|v| SerializedView {
                query_id: v.query_id.0,
                surql: v.surql.clone(),
                input_tables: v.input_tables.clone(),
                result: v.result.clone(),
            })
            .collect();

        let state = SerializedState {
            tables: self.tables.clone(),
            versions: self.versions.clone(),
            views,
        };
        serde_json::to_vec(&state)
            .map_err(|e| PlanError::Malformed(format!("failed to serialize state: {e}")))
    }

    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), PlanError> {
        let state: SerializedState = serde_json::from_slice(bytes)
            .map_err(|e| PlanError::Malformed(format!("failed to deserialize state: {e}")))?;

        self.tables = state.tables;
        self.versions = state.versions;
        self.views.clear();

        for view in state.views {
            let plan = parse_surql(&view.surql)?;
            self.views.insert(
                view.query_id,
                MaterializedView {
                    query_id: QueryHash(view.query_id),
                    surql: view.surql,
                    plan,
                    input_tables: view.input_tables,
                    result_hash: view.result.content_hash(),
                    result: view.result,
                },
            );
        }
        Ok(())
    }

    fn build_result_array(&self, ids: &[RecordId]) -> RecordVersionArray {
        RecordVersionArray(
            ids.iter()
                .map(|id| (id.clone(), self.versions.get(id).copied().unwrap_or(0)))
                .collect(),
        )
    }
}

impl Default for StreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn qh(n: u8) -> QueryHash {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        QueryHash(bytes)
    }

    #[test]
    fn register_seeds_empty_result_before_any_ingest() {
        let mut proc = StreamProcessor::new();
        let update = proc
            .register(RegisterConfig {
                query_id: qh(1),
                surql: "SELECT * FROM thread".into(),
                involved_tables: vec![],
            })
            .unwrap()
            .unwrap();
        assert!(update.result.0.is_empty());
    }

    #[test]
    fn ingest_optimistic_increments_version() {
        let mut proc = StreamProcessor::new();
        proc.register(RegisterConfig {
            query_id: qh(1),
            surql: "SELECT * FROM thread".into(),
            involved_tables: vec![],
        })
        .unwrap();

        let updates = proc.ingest(
            "thread",
            CacheOp::Create,
            "A1",
            Some(json!({"id": "A1"})),
            true,
        );
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].result.get("thread:A1"), Some(1));

        let updates = proc.ingest(
            "thread",
            CacheOp::Update,
            "A1",
            Some(json!({"id": "A1"})),
            true,
        );
        assert_eq!(updates[0].result.get("thread:A1"), Some(2));
    }

    #[test]
    fn ingest_authoritative_preserves_supplied_version() {
        let mut proc = StreamProcessor::new();
        proc.register(RegisterConfig {
            query_id: qh(1),
            surql: "SELECT * FROM thread".into(),
            involved_tables: vec![],
        })
        .unwrap();

        let updates = proc.ingest(
            "thread",
            CacheOp::Create,
            "A1",
            Some(json!({"id": "A1", "_version": 7})),
            false,
        );
        assert_eq!(updates[0].result.get("thread:A1"), Some(7));
    }

    #[test]
    fn ingest_on_unaffected_table_emits_no_update() {
        let mut proc = StreamProcessor::new();
        proc.register(RegisterConfig {
            query_id: qh(1),
            surql: "SELECT * FROM thread".into(),
            involved_tables: vec!["thread".into()],
        })
        .unwrap();

        let updates = proc.ingest(
            "comment",
            CacheOp::Create,
            "C1",
            Some(json!({"id": "C1"})),
            true,
        );
        assert!(updates.is_empty());
    }

    #[test]
    fn delete_removes_record_from_view() {
        let mut proc = StreamProcessor::new();
        proc.register(RegisterConfig {
            query_id: qh(1),
            surql: "SELECT * FROM thread".into(),
            involved_tables: vec![],
        })
        .unwrap();
        proc.ingest(
            "thread",
            CacheOp::Create,
            "A1",
            Some(json!({"id": "A1"})),
            true,
        );
        let updates = proc.ingest("thread", CacheOp::Delete, "A1", None, true);
        assert_eq!(updates.len(), 1);
        assert!(updates[0].result.0.is_empty());
    }

    #[test]
    fn repeated_equal_result_emits_no_duplicate_update() {
        let mut proc = StreamProcessor::new();
        proc.register(RegisterConfig {
            query_id: qh(1),
            surql: "SELECT * FROM thread".into(),
            involved_tables: vec![],
        })
        .unwrap();
        proc.ingest(
            "thread",
            CacheOp::Create,
            "A1",
            Some(json!({"id": "A1", "_version": 1})),
            false,
        );
        // same version re-applied: hash unchanged, no update emitted
        let updates = proc.ingest(
            "thread",
            CacheOp::Update,
            "A1",
            Some(json!({"id": "A1", "_version": 1})),
            false,
        );
        assert!(updates.is_empty());
    }

    #[test]
    fn save_state_then_load_state_preserves_view_result() {
        let mut proc = StreamProcessor::new();
        proc.register(RegisterConfig {
            query_id: qh(1),
            surql: "SELECT * FROM thread".into(),
            involved_tables: vec!["thread".into()],
        })
        .unwrap();
        proc.ingest(
            "thread",
            CacheOp::Create,
            "A1",
            Some(json!({"id": "A1"})),
            true,
        );

        let bytes = proc.save_state().unwrap();
        let mut restored = StreamProcessor::new();
        restored.load_state(&bytes).unwrap();

        assert_eq!(restored.versions.get("thread:A1"), Some(&1));
        let updates = restored.ingest(
            "thread",
            CacheOp::Update,
            "A2",
            Some(json!({"id": "A2"})),
            true,
        );
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].result.0.len(), 2);
    }

    #[test]
    fn register_with_unparseable_surql_fails_with_plan_error() {
        let mut proc = StreamProcessor::new();
        let err = proc
            .register(RegisterConfig {
                query_id: qh(1),
                surql: "NOT A QUERY".into(),
                involved_tables: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, PlanError::Malformed(_)));
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut proc = StreamProcessor::new();
        proc.unregister(qh(1));
        proc.register(RegisterConfig {
            query_id: qh(1),
            surql: "SELECT * FROM thread".into(),
            involved_tables: vec![],
        })
        .unwrap();
        proc.unregister(qh(1));
        proc.unregister(qh(1));
        assert!(proc.views.is_empty());
    }

    #[test]
    fn ingest_batch_emits_at_most_one_update_per_view() {
        let mut proc = StreamProcessor::new();
        proc.register(RegisterConfig {
            query_id: qh(1),
            surql: "SELECT * FROM thread".into(),
            involved_tables: vec![],
        })
        .unwrap();

        let updates = proc.ingest_batch(vec![
            IngestItem {
                table: "thread".into(),
                op: CacheOp::Create,
                id: "A1".into(),
                record: json!({"id": "A1"}),
                optimistic: true,
            },
            IngestItem {
                table: "thread".into(),
                op: CacheOp::Create,
                id: "A2".into(),
                record: json!({"id": "A2"}),
                optimistic: true,
            },
        ]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].result.0.len(), 2);
    }

    #[test]
    fn unknown_id_generation_is_stable() {
        // sanity check that Uuid import compiles in this module's test scope
        let _ = Uuid::nil();
    }
}
