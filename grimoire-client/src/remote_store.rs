//! WebSocket transport to the remote stored-procedure surface named in the
//! external interface contract: `query::register`, `query::heartbeat`,
//! `DELETE _query_ref:$id`, record fetch/absence-check, and the one live
//! subscription a Registry opens per client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use grimoire_core::errors::{RemoteAuthError, RemoteDbError, RemoteTimeout};
use grimoire_core::models::RecordId;
use grimoire_core::protocol::{Envelope, InboundFrame, QueryRefChangeWire, RemoteRequest, RemoteResponse};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Fixed polling interval between reconnect attempts, grounded in the
/// teacher's `RECONNECTION_INTERVAL` used by `start_reconnection_loop`.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

struct Connection {
    sink_tx: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<RemoteResponse>>>>,
    live_rx: mpsc::UnboundedReceiver<QueryRefChangeWire>,
    reader_task: tokio::task::JoinHandle<()>,
    writer_task: tokio::task::JoinHandle<()>,
}

/// One WebSocket connection, request/response correlated by a monotonic id.
/// A background reader task demultiplexes inbound frames: frames with a
/// matching `correlation_id` are delivered to the waiting caller via a
/// oneshot; frames tagged `live` are forwarded to the live-event channel the
/// Registry reads from. The connection itself lives behind a lock so
/// [`RemoteStore::reconnect`] can hot-swap it in place without invalidating
/// the `Arc<RemoteStore>` every other component holds.
pub struct RemoteStore {
    url: String,
    client_id: String,
    auth_token: String,
    conn: RwLock<Connection>,
    next_correlation: AtomicU64,
    connected: Arc<AtomicBool>,
    call_timeout: Duration,
}

impl RemoteStore {
    pub async fn connect(
        url: &str,
        client_id: &str,
        auth_token: &str,
        call_timeout: Duration,
    ) -> Result<Self, RemoteDbError> {
        let connected = Arc::new(AtomicBool::new(true));
        let conn = Self::dial(url, client_id, auth_token, connected.clone()).await?;
        Ok(Self {
            url: url.to_string(),
            client_id: client_id.to_string(),
            auth_token: auth_token.to_string(),
            conn: RwLock::new(conn),
            next_correlation: AtomicU64::new(1),
            connected,
            call_timeout,
        })
    }

    async fn dial(
        url: &str,
        client_id: &str,
        auth_token: &str,
        connected: Arc<AtomicBool>,
    ) -> Result<Connection, RemoteDbError> {
        let mut dial_url = Url::parse(url)
            .map_err(|e| RemoteDbError::Transport(format!("malformed remote url: {e}")))?;
        dial_url
            .query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("auth_token", auth_token);

        let (ws, _) = connect_async(dial_url.as_str())
            .await
            .map_err(|e| RemoteDbError::Transport(e.to_string()))?;

        Self::authenticate_handshake(&ws, client_id, auth_token).await?;

        let (sink, stream) = ws.split();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel::<Message>();
        let (live_tx, live_rx) = mpsc::unbounded_channel::<QueryRefChangeWire>();
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<RemoteResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let writer_task = tokio::spawn(forward_to_sink(sink, sink_rx));
        let reader_task = tokio::spawn(read_loop(stream, pending.clone(), live_tx, connected));

        Ok(Connection {
            sink_tx,
            pending,
            live_rx,
            reader_task,
            writer_task,
        })
    }

    async fn authenticate_handshake(
        _ws: &WebSocketStream<MaybeTlsStream<TcpStream>>,
        client_id: &str,
        auth_token: &str,
    ) -> Result<(), RemoteAuthError> {
        if auth_token.is_empty() {
            return Err(RemoteAuthError(format!(
                "empty auth token for client {client_id}"
            )));
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Tears down the current socket (if still alive) and dials a fresh one,
    /// replacing every in-flight caller's wait with `ConnectionClosed` (the
    /// old `pending` map's oneshot senders are dropped along with it).
    /// Grounded in the teacher's `start_reconnection_loop`, generalized from
    /// its fixed-interval poll to a lock-guarded hot-swap so callers never
    /// observe a half-torn-down connection.
    pub async fn reconnect(&self) -> Result<(), RemoteDbError> {
        let fresh = Self::dial(&self.url, &self.client_id, &self.auth_token, self.connected.clone()).await?;
        let mut guard = self.conn.write().await;
        guard.reader_task.abort();
        guard.writer_task.abort();
        *guard = fresh;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Blocks (with a fixed polling interval) until the connection is
    /// healthy again, reconnecting as many times as it takes. Intended to be
    /// driven by a supervisor loop once [`is_connected`](Self::is_connected)
    /// goes false.
    pub async fn reconnect_until_healthy(&self) {
        loop {
            match self.reconnect().await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "reconnect attempt failed; retrying");
                    tokio::time::sleep(RECONNECT_INTERVAL).await;
                }
            }
        }
    }

    async fn call(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteDbError> {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let (pending, sink_tx) = {
            let guard = self.conn.read().await;
            guard.pending.lock().await.insert(correlation_id, tx);
            (guard.pending.clone(), guard.sink_tx.clone())
        };

        let json = serde_json::to_string(&Envelope {
            correlation_id,
            payload: request,
        })
        .map_err(|e| RemoteDbError::MalformedResponse(e.to_string()))?;

        sink_tx
            .send(Message::Text(json))
            .map_err(|_| RemoteDbError::ConnectionClosed)?;

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RemoteDbError::ConnectionClosed),
            Err(_) => {
                // the reply may still arrive after this point with nothing
                // listening; drop the stale waiter so it cannot accumulate
                // across repeated timeouts against the same connection.
                pending.lock().await.remove(&correlation_id);
                Err(RemoteDbError::Timeout(RemoteTimeout(self.call_timeout)))
            }
        }
    }

    pub async fn register_query(
        &self,
        query_id: &str,
        surql: &str,
        params: &Value,
    ) -> Result<Vec<(RecordId, u64)>, RemoteDbError> {
        match self
            .call(RemoteRequest::RegisterQuery {
                query_id: query_id.to_string(),
                surql: surql.to_string(),
                params: params.clone(),
            })
            .await?
        {
            RemoteResponse::Registered { remote_array } => Ok(remote_array),
            RemoteResponse::Error { message } => Err(RemoteDbError::MalformedResponse(message)),
            other => Err(RemoteDbError::MalformedResponse(format!(
                "unexpected response to register_query: {other:?}"
            ))),
        }
    }

    pub async fn heartbeat(&self, query_id: &str) -> Result<(), RemoteDbError> {
        self.expect_ack(RemoteRequest::Heartbeat {
            query_id: query_id.to_string(),
        })
        .await
    }

    pub async fn cleanup(&self, query_id: &str) -> Result<(), RemoteDbError> {
        self.expect_ack(RemoteRequest::Cleanup {
            query_id: query_id.to_string(),
        })
        .await
    }

    pub async fn fetch_records(&self, ids: &[RecordId]) -> Result<Vec<(RecordId, Value)>, RemoteDbError> {
        match self
            .call(RemoteRequest::FetchRecords { ids: ids.to_vec() })
            .await?
        {
            RemoteResponse::Records { records } => Ok(records),
            RemoteResponse::Error { message } => Err(RemoteDbError::MalformedResponse(message)),
            other => Err(RemoteDbError::MalformedResponse(format!(
                "unexpected response to fetch_records: {other:?}"
            ))),
        }
    }

    pub async fn check_absent(&self, ids: &[RecordId]) -> Result<Vec<RecordId>, RemoteDbError> {
        match self
            .call(RemoteRequest::CheckAbsent { ids: ids.to_vec() })
            .await?
        {
            RemoteResponse::Absent { ids } => Ok(ids),
            RemoteResponse::Error { message } => Err(RemoteDbError::MalformedResponse(message)),
            other => Err(RemoteDbError::MalformedResponse(format!(
                "unexpected response to check_absent: {other:?}"
            ))),
        }
    }

    pub async fn apply_mutation(
        &self,
        kind: &str,
        record_id: &RecordId,
        data: Option<Value>,
    ) -> Result<(), RemoteDbError> {
        self.expect_ack(RemoteRequest::ApplyMutation {
            kind: kind.to_string(),
            record_id: record_id.clone(),
            data,
        })
        .await
    }

    async fn expect_ack(&self, request: RemoteRequest) -> Result<(), RemoteDbError> {
        match self.call(request).await? {
            RemoteResponse::Ack => Ok(()),
            RemoteResponse::Error { message } => Err(RemoteDbError::MalformedResponse(message)),
            other => Err(RemoteDbError::MalformedResponse(format!(
                "unexpected response, expected ack: {other:?}"
            ))),
        }
    }

    /// Blocks until the next live `_query_ref` change row arrives, or returns
    /// `None` once the connection is closed. Held behind the write lock since
    /// `recv` needs `&mut`; a concurrent [`reconnect`](Self::reconnect) simply
    /// waits its turn and this call then resolves against the fresh channel.
    pub async fn next_live_event(&self) -> Option<QueryRefChangeWire> {
        self.conn.write().await.live_rx.recv().await
    }

    pub async fn close(self) {
        let conn = self.conn.into_inner();
        conn.reader_task.abort();
        conn.writer_task.abort();
    }
}

async fn forward_to_sink(
    mut sink: futures_util::stream::SplitSink<
        WebSocketStream<MaybeTlsStream<TcpStream>>,
        Message,
    >,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<RemoteResponse>>>>,
    live_tx: mpsc::UnboundedSender<QueryRefChangeWire>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "remote websocket read error");
                break;
            }
        };

        match serde_json::from_str::<InboundFrame>(&text) {
            Ok(InboundFrame::Response(envelope)) => {
                if let Some(tx) = pending.lock().await.remove(&envelope.correlation_id) {
                    let _ = tx.send(envelope.payload);
                }
            }
            Ok(InboundFrame::LiveEvent { live }) => {
                if live_tx.send(live).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, frame = %text, "malformed inbound frame, dropped");
            }
        }
    }
    // Stream ended, either cleanly or on error: this connection is dead until
    // `RemoteStore::reconnect` hot-swaps in a fresh one.
    connected.store(false, Ordering::SeqCst);
}
