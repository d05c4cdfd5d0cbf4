//! Shared scaffolding for the cross-component scenario tests: boots the
//! reference remote fixture on an ephemeral loopback port and connects a
//! real `GrimoireClient` against it over a live WebSocket, following the
//! teacher's own client-against-in-process-server integration test shape.

use std::sync::Arc;
use std::time::Duration;

use grimoire_client::GrimoireClient;
use grimoire_core::config::{Config, ProvisionOptions, StorageStrategy, LogLevel};
use grimoire_server::{build_router, AppState};
use uuid::Uuid;

pub struct Harness {
    pub server_state: Arc<AppState>,
    pub client: GrimoireClient,
    _server_task: tokio::task::JoinHandle<()>,
}

impl Harness {
    pub async fn start() -> Self {
        let server_state = AppState::new();
        let router = build_router(server_state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_task = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        // give the accept loop a moment to come up before dialing
        tokio::time::sleep(Duration::from_millis(50)).await;

        let config = Config {
            remote_url: format!("ws://{addr}/rpc"),
            local_db_name: "unused-in-memory".to_string(),
            storage_strategy: StorageStrategy::Memory,
            namespace: "test".to_string(),
            database: "test".to_string(),
            provision: ProvisionOptions { force: true },
            log_level: LogLevel::Debug,
            remote_call_timeout_ms: 5_000,
        };

        let client_id = Uuid::new_v4();
        let client = GrimoireClient::connect(&config, client_id, "test-token")
            .await
            .expect("client connects to in-process fixture");

        Self {
            server_state,
            client,
            _server_task: server_task,
        }
    }
}

/// Polls `check` until it returns true or `timeout` elapses. Scenario
/// assertions depend on background loops (driver, live, heartbeat) making
/// progress on their own schedule, so a fixed sleep would either be too
/// short under load or needlessly slow otherwise.
pub async fn wait_until<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
