//! Plain HTTP surface alongside the WebSocket endpoint: a liveness probe,
//! nothing else. The stored-procedure contract itself only ever travels over
//! the socket (see `websocket.rs`); this fixture has no REST surface to
//! authenticate.

pub async fn healthz() -> &'static str {
    "ok"
}
