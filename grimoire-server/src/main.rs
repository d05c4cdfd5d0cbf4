use std::net::SocketAddr;

use grimoire_server::{build_router, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr: SocketAddr = std::env::var("GRIMOIRE_SERVER_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8700".to_string())
        .parse()
        .expect("GRIMOIRE_SERVER_ADDR must be a valid socket address");

    let state = AppState::new();
    let router = build_router(state);

    tracing::info!(%addr, "grimoire-server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listener");
    axum::serve(listener, router)
        .await
        .expect("server loop exited with an error");
}
