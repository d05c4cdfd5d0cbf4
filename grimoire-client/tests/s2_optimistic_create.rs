//! S2 (optimistic create): a local create is visible to subscribers and
//! durably queued before any remote round-trip completes.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use grimoire_core::models::RecordVersionArray;
use serde_json::json;

#[tokio::test]
async fn create_is_observed_before_remote_confirms_and_queue_drains_after() {
    let harness = common::Harness::start().await;

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

    harness
        .client
        .create("thread", json!({"id": "N1", "title": "t"}), false)
        .await
        .unwrap();

    // the create's processor ingest fans out synchronously: no need to poll
    let last = observed.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.get("thread:N1"), Some(1));

    let drained = common::wait_until(
        || harness.server_state.records.contains_key("thread:N1"),
        Duration::from_secs(5),
    )
    .await;
    assert!(drained, "up-queue never delivered the create to the remote");
    assert_eq!(
        harness.server_state.versions.get("thread:N1").map(|v| *v),
        Some(1)
    );
}
