//! S1 (initial hydration): a query registered against a remote that already
//! has matching records converges to that state without any local writes.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use grimoire_core::models::RecordVersionArray;
use serde_json::json;

#[tokio::test]
async fn query_hydrates_from_existing_remote_records() {
    let harness = common::Harness::start().await;
    harness
        .server_state
        .records
        .insert("thread:A1".to_string(), json!({"id": "A1", "title": "hi"}));
    harness.server_state.versions.insert("thread:A1".to_string(), 1);

    let query_hash = harness
        .client
        .query(
            "thread",
            "SELECT * FROM thread",
            json!({}),
            Duration::from_secs(600),
            vec!["thread".to_string()],
        )
        .await
        .unwrap();

    let observed: Arc<Mutex<Vec<RecordVersionArray>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    harness
        .client
        .subscribe(
            query_hash,
            move |array| sink.lock().unwrap().push(array.clone()),
            true,
        )
        .await;

    let converged = common::wait_until(
        || {
            observed
                .lock()
                .unwrap()
                .last()
                .map(|a| a.get("thread:A1") == Some(1))
                .unwrap_or(false)
        },
        Duration::from_secs(5),
    )
    .await;

    assert!(converged, "subscriber never observed the hydrated record");
}
