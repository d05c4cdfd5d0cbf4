//! Upgrade handler for the one socket a client opens: demultiplexes
//! correlation-id requests into typed replies and fans live `_query_ref`
//! changes out on the same connection, following the split-sender/spawned-
//! writer-task shape the teacher's own handler uses.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use grimoire_core::protocol::{Envelope, RemoteRequest, RemoteResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{AppState, QueryRefChange};

#[derive(Deserialize)]
pub struct ConnectParams {
    client_id: Uuid,
    #[serde(default)]
    auth_token: String,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OutboundFrame {
    Response(Envelope<RemoteResponse>),
    LiveEvent { live: grimoire_core::protocol::QueryRefChangeWire },
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    if params.auth_token.is_empty() {
        tracing::warn!(client_id = %params.client_id, "rejecting connection with empty auth_token");
        return;
    }
    let client_id = params.client_id;

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<OutboundFrame>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let (live_tx, mut live_rx) = tokio::sync::mpsc::unbounded_channel::<QueryRefChange>();
    state.live_feeds.insert(client_id, live_tx);

    let live_out_tx = out_tx.clone();
    let live_forward_task = tokio::spawn(async move {
        while let Some(change) = live_rx.recv().await {
            let wire = grimoire_core::protocol::QueryRefChangeWire {
                client_id: change.client_id.to_string(),
                query_id: change.query_id,
                record_id: change.record_id,
                version: change.version,
                action: change.action.to_string(),
            };
            if live_out_tx.send(OutboundFrame::LiveEvent { live: wire }).is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let Ok(Message::Text(text)) = msg else {
            continue;
        };

        let envelope: Envelope<RemoteRequest> = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "malformed request frame, dropped");
                continue;
            }
        };

        let payload = handle_request(&state, client_id, envelope.payload).await;
        let _ = out_tx.send(OutboundFrame::Response(Envelope {
            correlation_id: envelope.correlation_id,
            payload,
        }));
    }

    live_forward_task.abort();
    writer_task.abort();
    state.live_feeds.remove(&client_id);
    state
        .query_refs
        .lock()
        .await
        .retain(|(owner, _), _| *owner != client_id);
}

async fn handle_request(state: &AppState, client_id: Uuid, request: RemoteRequest) -> RemoteResponse {
    match request {
        RemoteRequest::RegisterQuery { query_id, surql, .. } => {
            let remote_array = state.register_query(client_id, &query_id, &surql).await;
            RemoteResponse::Registered { remote_array }
        }
        RemoteRequest::Heartbeat { query_id } => {
            state.heartbeat(client_id, &query_id).await;
            RemoteResponse::Ack
        }
        RemoteRequest::Cleanup { query_id } => {
            state.cleanup(client_id, &query_id).await;
            RemoteResponse::Ack
        }
        RemoteRequest::FetchRecords { ids } => RemoteResponse::Records {
            records: state.fetch_records(&ids),
        },
        RemoteRequest::CheckAbsent { ids } => RemoteResponse::Absent {
            ids: state.check_absent(&ids),
        },
        RemoteRequest::ApplyMutation { kind, record_id, data } => {
            state.apply_mutation(client_id, &kind, &record_id, data).await;
            RemoteResponse::Ack
        }
    }
}
