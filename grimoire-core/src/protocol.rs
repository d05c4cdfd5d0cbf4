//! The wire contract shared by the WebSocket transport on both ends: one
//! request/response enum pair, correlation-id envelopes for matching replies
//! to calls, and the out-of-band live-change frame a registered query's
//! `_query_ref` feed pushes outside any request/response cycle.

use serde::{Deserialize, Serialize};

use crate::models::RecordId;

/// A call a client makes against the remote stored-procedure surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteRequest {
    RegisterQuery {
        query_id: String,
        surql: String,
        params: serde_json::Value,
    },
    Heartbeat {
        query_id: String,
    },
    Cleanup {
        query_id: String,
    },
    FetchRecords {
        ids: Vec<RecordId>,
    },
    CheckAbsent {
        ids: Vec<RecordId>,
    },
    ApplyMutation {
        kind: String,
        record_id: RecordId,
        data: Option<serde_json::Value>,
    },
}

/// The reply to a [`RemoteRequest`], carried inside an [`Envelope`] matching
/// the correlation id of the call it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteResponse {
    Registered { remote_array: Vec<(RecordId, u64)> },
    Ack,
    /// Paired with the fully-qualified id rather than trusting the `id` field
    /// embedded in the record body, which callers may have stored bare
    /// (`"A1"`) rather than table-qualified (`"thread:A1"`).
    Records { records: Vec<(RecordId, serde_json::Value)> },
    Absent { ids: Vec<RecordId> },
    Error { message: String },
}

/// Wraps a request or response with the correlation id the reader-side
/// demultiplexer keys on. Live-change frames skip the envelope entirely
/// (see [`InboundFrame`]) since nothing is waiting on a matching call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub correlation_id: u64,
    pub payload: T,
}

/// One row off a client's `_query_ref` live feed, pushed unsolicited
/// whenever a record backing one of that client's registered queries
/// changes on the remote side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRefChangeWire {
    pub client_id: String,
    pub query_id: String,
    pub record_id: RecordId,
    pub version: u64,
    pub action: String,
}

/// The two shapes an inbound frame can take, disambiguated structurally:
/// a correlated reply carries `correlation_id`/`payload`, a live push
/// carries a bare `live` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundFrame {
    Response(Envelope<RemoteResponse>),
    LiveEvent { live: QueryRefChangeWire },
}
