//! Test scaffolding: an in-memory runtime peer.
//!
//! `MockRuntime` speaks the line-delimited JSON-RPC protocol over a
//! `tokio::io::duplex` pair, logs every request it sees, answers from
//! per-method handlers (defaulting to an empty success), and lets tests
//! inject notifications as if the runtime produced them.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{io::duplex, sync::mpsc, task::JoinHandle};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::{
    config::TransportConfig,
    rpc::{JSONRPC_VERSION, RpcRequest, RpcTransport},
};

pub(crate) enum MockReply {
    Result(Value),
    Error(i64, String),
    /// Respond successfully after a delay, without stalling other replies.
    Delayed { delay: Duration, result: Value },
    /// Never respond; the caller is on its own timeout.
    Ignore,
}

type Handler = Box<dyn FnMut(&Value) -> MockReply + Send>;

/// Cloneable handle for pushing notifications from inside handlers.
#[derive(Clone)]
pub(crate) struct NotificationInjector {
    outbound: mpsc::UnboundedSender<String>,
}

impl NotificationInjector {
    fn send(&self, method: &str, params: Value) {
        let frame = json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
            "params": params,
        });
        let _ = self.outbound.send(frame.to_string());
    }

    pub(crate) fn chunk(&self, stream_id: &str, token: &str, is_final: bool) {
        self.send(
            "stream.chunk",
            json!({ "stream_id": stream_id, "token": token, "is_final": is_final }),
        );
    }

    pub(crate) fn stats(&self, stream_id: &str, stats: Value) {
        let mut params = stats;
        params["stream_id"] = json!(stream_id);
        self.send("stream.stats", params);
    }

    pub(crate) fn event_completed(&self, stream_id: &str, finish_reason: &str) {
        self.send(
            "stream.event",
            json!({
                "stream_id": stream_id,
                "event": "completed",
                "finish_reason": finish_reason,
            }),
        );
    }

    pub(crate) fn event_error(&self, stream_id: &str, error: &str) {
        self.send(
            "stream.event",
            json!({ "stream_id": stream_id, "event": "error", "error": error }),
        );
    }
}

pub(crate) struct MockRuntime {
    outbound: mpsc::UnboundedSender<String>,
    requests: Arc<Mutex<Vec<RpcRequest>>>,
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockRuntime {
    /// Builds a connected transport and the mock peer behind it.
    pub(crate) fn start() -> (Arc<RpcTransport>, Self) {
        Self::start_with(&TransportConfig::default())
    }

    pub(crate) fn start_with(config: &TransportConfig) -> (Arc<RpcTransport>, Self) {
        let (client_io, server_io) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);

        let transport = Arc::new(RpcTransport::connect(client_read, client_write, config));

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let requests: Arc<Mutex<Vec<RpcRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let handlers: Arc<Mutex<HashMap<String, Handler>>> = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            let mut framed = FramedWrite::new(server_write, LinesCodec::new());
            while let Some(line) = outbound_rx.recv().await {
                if framed.send(line).await.is_err() {
                    break;
                }
            }
        });

        let reader = {
            let outbound = outbound.clone();
            let requests = Arc::clone(&requests);
            let handlers = Arc::clone(&handlers);
            tokio::spawn(async move {
                let mut framed = FramedRead::new(server_read, LinesCodec::new());
                while let Some(Ok(line)) = framed.next().await {
                    let Ok(request) = serde_json::from_str::<RpcRequest>(&line) else {
                        continue;
                    };
                    requests.lock().push(request.clone());
                    let Some(id) = request.id else {
                        continue;
                    };

                    let reply = match handlers.lock().get_mut(&request.method) {
                        Some(handler) => handler(&request.params),
                        None => MockReply::Result(json!({})),
                    };
                    match reply {
                        MockReply::Result(result) => {
                            let _ = outbound.send(response_frame(id, Ok(result)));
                        }
                        MockReply::Error(code, message) => {
                            let _ = outbound.send(response_frame(id, Err((code, message))));
                        }
                        MockReply::Delayed { delay, result } => {
                            let outbound = outbound.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = outbound.send(response_frame(id, Ok(result)));
                            });
                        }
                        MockReply::Ignore => {}
                    }
                }
            })
        };

        let runtime = Self {
            outbound,
            requests,
            handlers,
            tasks: vec![writer, reader],
        };
        (transport, runtime)
    }

    /// Installs the reply handler for one method.
    pub(crate) fn handle<F>(&self, method: &str, handler: F)
    where
        F: FnMut(&Value) -> MockReply + Send + 'static,
    {
        self.handlers
            .lock()
            .insert(method.to_owned(), Box::new(handler));
    }

    pub(crate) fn injector(&self) -> NotificationInjector {
        NotificationInjector {
            outbound: self.outbound.clone(),
        }
    }

    /// Pushes one notification frame to the client.
    pub(crate) fn notify(&self, method: &str, params: Value) {
        self.injector().send(method, params);
    }

    /// Pushes a raw line, valid JSON or not.
    pub(crate) fn send_raw(&self, line: &str) {
        let _ = self.outbound.send(line.to_owned());
    }

    pub(crate) fn requests(&self) -> Vec<RpcRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn requests_for(&self, method: &str) -> Vec<RpcRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.method == method)
            .cloned()
            .collect()
    }

    /// Tears the peer down; the transport observes EOF.
    pub(crate) async fn close(self) {
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
        // Give the transport's reader a chance to observe the close.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }
}

/// Installs a compact subscriber so a failing test can be rerun with
/// `RUST_LOG` for output. Safe to call from multiple tests.
#[allow(dead_code)]
pub(crate) fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn response_frame(id: u64, outcome: Result<Value, (i64, String)>) -> String {
    let frame = match outcome {
        Ok(result) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result }),
        Err((code, message)) => json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": { "code": code, "message": message },
        }),
    };
    frame.to_string()
}
