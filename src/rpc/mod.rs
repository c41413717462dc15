//! Line-delimited JSON-RPC 2.0 plumbing between Kiln and the runtime
//! subprocess.

mod protocol;
mod transport;

pub use protocol::{
    BatchResponse, BatchSlot, ChunkFrame, EventFrame, RpcErrorBody, RpcNotification,
    RpcRequest, StatsFrame, StreamChunk, StreamEventKind, StreamNotification, StreamStats,
    JSONRPC_VERSION,
};
pub use transport::{RequestOptions, RpcTransport, TransportError};
