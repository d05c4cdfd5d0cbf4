//! S6 (unregister grace window): unsubscribing the last subscriber for a
//! query and resubscribing within the `ttl/10` grace window must not tear
//! the incantation down — no cleanup request reaches the remote, and the
//! heartbeat loop keeps running uninterrupted.

mod common;

use std::time::Duration;

use serde_json::json;

#[tokio::test]
async fn resubscribe_within_grace_window_cancels_pending_cleanup() {
    let harness = common::Harness::start().await;

    // a short ttl keeps the grace window (ttl/10) well under a second so
    // the test does not need to wait long for the window to expire
    let query_hash = harness
        .client
        .query(
            "thread",
            "SELECT * FROM thread",
            json!({}),
            Duration::from_millis(500),
            vec!["thread".to_string()],
        )
        .await
        .unwrap();

    let sub_id = harness
        .client
        .subscribe(query_hash, |_array| {}, true)
        .await;
    harness.client.unsubscribe(query_hash, sub_id).await;

    // immediately resubscribe, well inside the ttl/10 (= 50ms) grace window
    let _sub_id_2 = harness
        .client
        .subscribe(query_hash, |_array| {}, true)
        .await;

    // wait past the original grace window: if cleanup fired anyway, the
    // query_hash would no longer be in the active set
    tokio::time::sleep(Duration::from_millis(150)).await;

    let active = harness.client.get_active_queries().await;
    assert!(
        active.contains(&query_hash),
        "incantation was torn down despite resubscribing inside the grace window"
    );
}
