//! Reference remote fixture implementing the stored-procedure surface a
//! `GrimoireClient` speaks over WebSocket: `query::register`,
//! `query::heartbeat`, `DELETE _query_ref:$id`, record fetch/absence-check,
//! and one live `_query_ref` feed per connected client. Not a production
//! sync server — see `AppState` for the scope this stands in for.

pub mod api;
pub mod state;
pub mod websocket;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

pub use state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/rpc", get(websocket::upgrade))
        .with_state(state)
}
