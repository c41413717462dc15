//! The runtime transport.
//!
//! One writer task serializes every outbound frame; one reader task decodes
//! inbound lines and routes them. Responses complete the pending request
//! they answer; notifications are handed to per-method subscribers without
//! blocking the reader.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::{Child, Command},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LinesCodec},
    sync::CancellationToken,
};

use super::protocol::{RpcIncoming, RpcNotification, RpcRequest};
use crate::config::TransportConfig;

#[derive(Debug, Snafu)]
pub enum TransportError {
    #[snafu(display("failed to spawn runtime process: {source}"))]
    Spawn { source: std::io::Error },
    #[snafu(display("transport closed, runtime is gone"))]
    Closed,
    #[snafu(display("request `{method}` timed out"))]
    Timeout { method: String },
    #[snafu(display("request `{method}` was cancelled"))]
    Cancelled { method: String },
    #[snafu(display("failed to encode `{method}` frame: {source}"))]
    Encode {
        method: String,
        source: serde_json::Error,
    },
    #[snafu(display("runtime rejected `{method}`: {message} (code {code})"))]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
}

/// Per-request overrides. A request with any override set is considered to
/// have custom semantics by the multiplexer and is never coalesced.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn is_custom(&self) -> bool {
        self.timeout.is_some() || self.cancel.is_some()
    }
}

struct Pending {
    method: String,
    tx: oneshot::Sender<Result<Value, TransportError>>,
}

struct Inner {
    next_id: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<u64, Pending>>,
    subscribers: Mutex<HashMap<&'static str, mpsc::UnboundedSender<RpcNotification>>>,
    closed: AtomicBool,
    default_timeout: Duration,
}

impl Inner {
    /// Flips the transport to closed and rejects everything outstanding.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound.lock().take();
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            warn!(
                message = "Transport closed with outstanding requests.",
                outstanding = drained.len(),
            );
        }
        for pending in drained {
            let _ = pending.tx.send(Err(TransportError::Closed));
        }
        // Dropping the senders ends every subscriber's stream.
        self.subscribers.lock().clear();
    }
}

/// Bidirectional JSON-RPC 2.0 endpoint over the runtime's stdio.
pub struct RpcTransport {
    inner: Arc<Inner>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl RpcTransport {
    /// Spawns the runtime subprocess and connects to its stdio.
    pub fn spawn(mut command: Command, config: &TransportConfig) -> Result<Self, TransportError> {
        command.stdin(Stdio::piped()).stdout(Stdio::piped());
        let mut child = command.spawn().context(SpawnSnafu)?;
        let stdin = child.stdin.take().expect("child stdin was piped");
        let stdout = child.stdout.take().expect("child stdout was piped");

        let mut transport = Self::connect(stdout, stdin, config);
        transport.child = tokio::sync::Mutex::new(Some(child));
        Ok(transport)
    }

    /// Connects over an arbitrary reader/writer pair. Tests use an
    /// in-memory duplex here.
    pub fn connect<R, W>(reader: R, writer: W, config: &TransportConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let inner = Arc::new(Inner {
            next_id: AtomicU64::new(0),
            outbound: Mutex::new(Some(out_tx)),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            default_timeout: config.request_timeout(),
        });

        let writer_task = tokio::spawn(async move {
            let mut framed = FramedWrite::new(writer, LinesCodec::new());
            while let Some(line) = out_rx.recv().await {
                if let Err(error) = framed.send(line).await {
                    debug!(message = "Writer task stopping.", %error);
                    break;
                }
            }
            // Flushes and drops the writer, closing the runtime's stdin.
        });

        let reader_inner = Arc::clone(&inner);
        let reader_task = tokio::spawn(async move {
            let mut framed = FramedRead::new(reader, LinesCodec::new());
            while let Some(frame) = framed.next().await {
                match frame {
                    Ok(line) => Self::route(&reader_inner, &line),
                    Err(error) => {
                        warn!(message = "Failed to decode inbound frame.", %error);
                        break;
                    }
                }
            }
            reader_inner.close();
        });

        Self {
            inner,
            child: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(vec![writer_task, reader_task]),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    fn route(inner: &Arc<Inner>, line: &str) {
        let incoming: RpcIncoming = match serde_json::from_str(line) {
            Ok(incoming) => incoming,
            Err(error) => {
                warn!(message = "Dropping malformed frame.", %error);
                return;
            }
        };

        match incoming {
            RpcIncoming::Response(response) => {
                let Some(pending) = inner.pending.lock().remove(&response.id) else {
                    debug!(
                        message = "Response for unknown request id.",
                        id = response.id,
                    );
                    return;
                };
                let result = match response.error {
                    Some(body) => Err(TransportError::Rpc {
                        method: pending.method,
                        code: body.code,
                        message: body.message,
                    }),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = pending.tx.send(result);
            }
            RpcIncoming::Notification(notification) => {
                let subscribers = inner.subscribers.lock();
                match subscribers.get(notification.method.as_str()) {
                    Some(tx) => {
                        let _ = tx.send(notification);
                    }
                    None => {
                        trace!(
                            message = "No subscriber for notification method.",
                            method = %notification.method,
                        );
                    }
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Registers the receiving end for a notification method. A second
    /// subscription to the same method replaces the first.
    pub fn subscribe(&self, method: &'static str) -> mpsc::UnboundedReceiver<RpcNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.subscribers.lock().insert(method, tx).is_some() {
            warn!(message = "Replacing existing notification subscriber.", method);
        }
        rx
    }

    /// Issues a request and waits for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        options: RequestOptions,
    ) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let line = serde_json::to_string(&RpcRequest::new(id, method, params))
            .context(EncodeSnafu { method })?;

        let (tx, mut rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            id,
            Pending {
                method: method.to_owned(),
                tx,
            },
        );

        if !self.send_line(line) {
            self.inner.pending.lock().remove(&id);
            return Err(TransportError::Closed);
        }

        let wait = options.timeout.unwrap_or(self.inner.default_timeout);
        let outcome = if let Some(cancel) = options.cancel {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.inner.pending.lock().remove(&id);
                    return Err(TransportError::Cancelled {
                        method: method.to_owned(),
                    });
                }
                outcome = timeout(wait, &mut rx) => outcome,
            }
        } else {
            timeout(wait, &mut rx).await
        };

        match outcome {
            Ok(Ok(result)) => result,
            // The sender only drops when the transport closes.
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(TransportError::Timeout {
                    method: method.to_owned(),
                })
            }
        }
    }

    /// Fire-and-forget notification to the runtime.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let line = serde_json::to_string(&RpcRequest::notification(method, params))
            .context(EncodeSnafu { method })?;
        if self.send_line(line) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn send_line(&self, line: String) -> bool {
        match self.inner.outbound.lock().as_ref() {
            Some(tx) => tx.send(line).is_ok(),
            None => false,
        }
    }

    pub async fn runtime_info(&self) -> Result<Value, TransportError> {
        self.request("runtime/info", Value::Null, RequestOptions::default())
            .await
    }

    pub async fn runtime_state(&self) -> Result<Value, TransportError> {
        self.request("runtime/state", Value::Null, RequestOptions::default())
            .await
    }

    /// Closes the runtime's stdin, waits out the grace period, and kills the
    /// subprocess if it is still around.
    pub async fn shutdown(&self) {
        // Taking the outbound sender ends the writer task, which closes the
        // runtime's stdin and lets a well-behaved runtime exit on its own.
        self.inner.outbound.lock().take();

        if let Some(mut child) = self.child.lock().await.take() {
            match timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(message = "Runtime exited.", status = %status);
                }
                Ok(Err(error)) => {
                    warn!(message = "Failed to reap runtime process.", %error);
                }
                Err(_) => {
                    warn!(message = "Runtime did not exit in time, killing it.");
                    let _ = child.kill().await;
                }
            }
        }

        self.inner.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
