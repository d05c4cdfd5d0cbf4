//! Evaluates a [`LogicalPlan`] against the processor's in-memory table
//! snapshot. Only the ordered record-id sequence matters to a materialized
//! view's result array — full record content is read back from the local DB
//! by the caller when a subscriber needs the materialized value, so
//! evaluation here tracks `(id, value)` rows only far enough to filter, join,
//! and sort them.

use std::collections::HashMap;

use grimoire_core::errors::PlanError;
use grimoire_core::models::RecordId;
use serde_json::Value;

use super::plan::{CompareOp, Literal, LiteralOrList, LogicalPlan, Predicate, Projection};

pub type TableSnapshot = HashMap<String, HashMap<RecordId, Value>>;

#[derive(Debug, Clone)]
struct Row {
    id: RecordId,
    value: Value,
}

pub fn evaluate(plan: &LogicalPlan, tables: &TableSnapshot) -> Result<Vec<RecordId>, PlanError> {
    let rows = eval_plan(plan, tables)?;
    Ok(rows.into_iter().map(|r| r.id).collect())
}

fn eval_plan(plan: &LogicalPlan, tables: &TableSnapshot) -> Result<Vec<Row>, PlanError> {
    match plan {
        LogicalPlan::Scan { table } => {
            // A table with no ingested records yet is empty, not unknown:
            // there is no schema declaration step before a view registers,
            // so the first `register` against a freshly connected client
            // (S1's initial hydration, before any record has landed) must
            // seed to an empty result rather than fail to plan.
            let mut rows: Vec<Row> = tables
                .get(table)
                .map(|records| {
                    records
                        .iter()
                        .map(|(id, value)| Row {
                            id: id.clone(),
                            value: value.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            rows.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(rows)
        }
        LogicalPlan::Selection { input, predicate } => {
            let rows = eval_plan(input, tables)?;
            rows.into_iter()
                .filter_map(|row| match eval_predicate(predicate, &row.value) {
                    Ok(true) => Some(Ok(row)),
                    Ok(false) => None,
                    Err(e) => Some(Err(e)),
                })
                .collect()
        }
        LogicalPlan::Join {
            input,
            right_table,
            left_field,
            right_field,
        } => {
            let rows = eval_plan(input, tables)?;
            let empty = HashMap::new();
            let right = tables.get(right_table).unwrap_or(&empty);
            let mut kept = Vec::new();
            for row in rows {
                let left_value = row.value.get(left_field);
                let matched = left_value
                    .map(|lv| {
                        right
                            .values()
                            .any(|rv| rv.get(right_field).map(|x| x == lv).unwrap_or(false))
                    })
                    .unwrap_or(false);
                if matched {
                    kept.push(row);
                } else if left_value.is_none() {
                    return Err(PlanError::MissingJoinKey(
                        left_field.clone(),
                        right_field.clone(),
                    ));
                }
            }
            Ok(kept)
        }
        LogicalPlan::Projection { input, fields } => {
            let rows = eval_plan(input, tables)?;
            match fields {
                Projection::All => Ok(rows),
                Projection::Fields(names) => Ok(rows
                    .into_iter()
                    .map(|row| {
                        let mut obj = serde_json::Map::new();
                        for name in names {
                            if let Some(v) = row.value.get(name) {
                                obj.insert(name.clone(), v.clone());
                            }
                        }
                        Row {
                            id: row.id,
                            value: Value::Object(obj),
                        }
                    })
                    .collect()),
            }
        }
        LogicalPlan::Sort {
            input,
            field,
            descending,
        } => {
            let mut rows = eval_plan(input, tables)?;
            rows.sort_by(|a, b| {
                let av = a.value.get(field);
                let bv = b.value.get(field);
                let ord = compare_json(av, bv);
                if *descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
            Ok(rows)
        }
        LogicalPlan::LimitOffset {
            input,
            limit,
            offset,
        } => {
            let rows = eval_plan(input, tables)?;
            let skipped = rows.into_iter().skip(*offset);
            match limit {
                Some(n) => Ok(skipped.take(*n).collect()),
                None => Ok(skipped.collect()),
            }
        }
        LogicalPlan::NestedAttach { input, .. } => {
            // Nested subqueries enrich a row's content with a child array but
            // never change which top-level ids are members of the view, so
            // the id-level result is unaffected.
            eval_plan(input, tables)
        }
    }
}

fn compare_json(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn eval_predicate(predicate: &Predicate, value: &Value) -> Result<bool, PlanError> {
    match predicate {
        Predicate::And(terms) => {
            for term in terms {
                if !eval_predicate(term, value)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Predicate::Compare { field, op, literal } => {
            let field_value = value.get(field);
            Ok(compare(field_value, *op, literal))
        }
    }
}

fn compare(field_value: Option<&Value>, op: CompareOp, literal: &LiteralOrList) -> bool {
    match op {
        CompareOp::In => match literal {
            LiteralOrList::List(items) => items
                .iter()
                .any(|lit| matches_literal(field_value, lit, CompareOp::Eq)),
            LiteralOrList::One(lit) => matches_literal(field_value, lit, CompareOp::Eq),
        },
        _ => match literal {
            LiteralOrList::One(lit) => matches_literal(field_value, lit, op),
            LiteralOrList::List(_) => false,
        },
    }
}

fn matches_literal(field_value: Option<&Value>, literal: &Literal, op: CompareOp) -> bool {
    let Some(fv) = field_value else {
        return false;
    };
    match (fv, literal) {
        (Value::String(s), Literal::String(l)) | (Value::String(s), Literal::RecordRef(l)) => {
            match op {
                CompareOp::Eq => s == l,
                _ => false,
            }
        }
        (Value::Number(n), Literal::Number(l)) => {
            let n = n.as_f64().unwrap_or(f64::NAN);
            match op {
                CompareOp::Eq => (n - l).abs() < f64::EPSILON,
                CompareOp::Gt => n > *l,
                CompareOp::Lt => n < *l,
                CompareOp::In => false,
            }
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::plan::parse_surql;
    use serde_json::json;

    fn snapshot() -> TableSnapshot {
        let mut tables = TableSnapshot::new();
        let mut threads = HashMap::new();
        threads.insert(
            "thread:A1".to_string(),
            json!({"id": "A1", "status": "open", "created_at": 1}),
        );
        threads.insert(
            "thread:A2".to_string(),
            json!({"id": "A2", "status": "closed", "created_at": 2}),
        );
        tables.insert("thread".to_string(), threads);
        tables
    }

    #[test]
    fn scan_returns_all_ids_sorted() {
        let plan = parse_surql("SELECT * FROM thread").unwrap();
        let ids = evaluate(&plan, &snapshot()).unwrap();
        assert_eq!(ids, vec!["thread:A1".to_string(), "thread:A2".to_string()]);
    }

    #[test]
    fn selection_filters_by_predicate() {
        let plan = parse_surql("SELECT * FROM thread WHERE status = 'open'").unwrap();
        let ids = evaluate(&plan, &snapshot()).unwrap();
        assert_eq!(ids, vec!["thread:A1".to_string()]);
    }

    #[test]
    fn sort_desc_orders_by_field() {
        let plan = parse_surql("SELECT * FROM thread ORDER BY created_at DESC").unwrap();
        let ids = evaluate(&plan, &snapshot()).unwrap();
        assert_eq!(ids, vec!["thread:A2".to_string(), "thread:A1".to_string()]);
    }

    #[test]
    fn limit_offset_bounds_result() {
        let plan =
            parse_surql("SELECT * FROM thread ORDER BY created_at ASC LIMIT 1 START 1").unwrap();
        let ids = evaluate(&plan, &snapshot()).unwrap();
        assert_eq!(ids, vec!["thread:A2".to_string()]);
    }

    #[test]
    fn scan_of_a_table_with_no_rows_yet_is_empty_not_an_error() {
        let plan = parse_surql("SELECT * FROM nope").unwrap();
        let ids = evaluate(&plan, &snapshot()).unwrap();
        assert!(ids.is_empty());
    }
}
