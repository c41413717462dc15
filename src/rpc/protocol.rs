//! Wire types for the runtime protocol.
//!
//! The runtime speaks JSON-RPC 2.0, one JSON document per line. Requests
//! carry monotonic integer ids; notifications are id-less and carry a
//! `stream_id` in their params.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// An outbound request or notification. A `None` id marks a notification.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// An inbound frame: either a response to one of our requests or a
/// notification from the runtime.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RpcIncoming {
    Response(RpcResponse),
    Notification(RpcNotification),
}

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RpcNotification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// One slot of a `batch_*` response. Slots are index-aligned with the
/// requests that produced them; a failed slot never fails its neighbors.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BatchSlot {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchSlot>,
}

/// A single generated token delivered over `stream.chunk`.
///
/// Chunks may come from a reuse pool. A delivered chunk is owned by the
/// consumer; optional fields are cleared before a record returns to the
/// pool.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct StreamChunk {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u64>,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprob: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_text: Option<String>,
}

/// Terminal statistics for a stream, either reported by the runtime over
/// `stream.stats` or derived by the registry at completion.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct StreamStats {
    pub tokens_generated: u64,
    pub tokens_per_second: f64,
    /// Milliseconds from registration to the first chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token: Option<f64>,
    /// Total stream duration in milliseconds.
    pub total_time: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Completed,
    Error,
}

/// `stream.chunk` params.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChunkFrame {
    pub stream_id: String,
    pub token: String,
    #[serde(default)]
    pub token_id: Option<u64>,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub logprob: Option<f64>,
    #[serde(default)]
    pub cumulative_text: Option<String>,
}

/// `stream.stats` params.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StatsFrame {
    pub stream_id: String,
    #[serde(flatten)]
    pub stats: StreamStats,
}

/// `stream.event` params.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EventFrame {
    pub stream_id: String,
    pub event: StreamEventKind,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The stream-facing notification set, as a tagged sum.
#[derive(Clone, Debug)]
pub enum StreamNotification {
    Chunk(ChunkFrame),
    Stats(StatsFrame),
    Event(EventFrame),
}

impl StreamNotification {
    pub const CHUNK_METHOD: &'static str = "stream.chunk";
    pub const STATS_METHOD: &'static str = "stream.stats";
    pub const EVENT_METHOD: &'static str = "stream.event";

    pub const METHODS: [&'static str; 3] =
        [Self::CHUNK_METHOD, Self::STATS_METHOD, Self::EVENT_METHOD];

    /// Parses a notification into the stream sum. Returns `Ok(None)` for
    /// methods outside the stream set.
    pub fn parse(notification: &RpcNotification) -> Result<Option<Self>, serde_json::Error> {
        let params = notification.params.clone();
        match notification.method.as_str() {
            Self::CHUNK_METHOD => serde_json::from_value(params).map(Self::Chunk).map(Some),
            Self::STATS_METHOD => serde_json::from_value(params).map(Self::Stats).map(Some),
            Self::EVENT_METHOD => serde_json::from_value(params).map(Self::Event).map(Some),
            _ => Ok(None),
        }
    }

    pub fn stream_id(&self) -> &str {
        match self {
            Self::Chunk(frame) => &frame.stream_id,
            Self::Stats(frame) => &frame.stream_id,
            Self::Event(frame) => &frame.stream_id,
        }
    }
}
