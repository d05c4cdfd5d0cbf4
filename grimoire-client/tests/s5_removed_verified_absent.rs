//! S5 (removal verified absent): a record a query used to hold disappears
//! from the remote's array; the sync engine confirms absence before
//! deleting locally, and the subscriber's next array excludes the record.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use grimoire_core::models::RecordVersionArray;
use serde_json::json;

#[tokio::test]
async fn confirmed_absent_record_is_dropped_from_the_local_array() {
    let harness = common::Harness::start().await;
    let client_id = harness.client.client_id();

    harness
        .server_state
        .records
        .insert("thread:R1".to_string(), json!({"id": "R1", "title": "going away"}));
    harness.server_state.versions.insert("thread:R1".to_string(), 1);

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

    let hydrated = common::wait_until(
        || {
            observed
                .lock()
                .unwrap()
                .last()
                .map(|a| a.get("thread:R1") == Some(1))
                .unwrap_or(false)
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(hydrated, "query never hydrated the pre-existing remote record");

    // the record disappears from the remote; apply_mutation's delete path
    // removes it from `records` and fans out the removal as a live event,
    // which only carries record_id + a tombstone version, so the sync
    // engine must re-verify absence against `check_absent` rather than
    // trust the live row alone before deleting locally
    harness
        .server_state
        .apply_mutation(client_id, "delete", &"thread:R1".to_string(), None)
        .await;

    let removed = common::wait_until(
        || {
            observed
                .lock()
                .unwrap()
                .last()
                .map(|a| a.get("thread:R1").is_none())
                .unwrap_or(false)
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(removed, "subscriber's array still carries a record the remote confirmed absent");
}
