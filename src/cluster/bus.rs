//! The abstract cluster bus.
//!
//! Kiln does not ship a broker. The controller talks to workers through
//! this trait, which models an at-least-once publish/subscribe fabric with
//! request/reply and streamed replies. The in-memory implementation backs
//! the test suite and single-process deployments.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Snafu)]
pub enum BusError {
    #[snafu(display("no responders on subject `{subject}`"))]
    NoResponders { subject: String },
    #[snafu(display("request on `{subject}` timed out"))]
    Timeout { subject: String },
    #[snafu(display("bus connection is closed"))]
    Closed,
}

/// One delivered message. Replies flow back through the attached channels;
/// a fire-and-forget publish carries neither.
pub struct BusMessage {
    pub subject: String,
    pub payload: Value,
    /// Present on `request`: send exactly one terminal reply.
    pub reply: Option<oneshot::Sender<Value>>,
    /// Present on `request_stream`: send any number of frames, then drop.
    pub stream_reply: Option<mpsc::UnboundedSender<Value>>,
}

#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Value) -> Result<(), BusError>;

    /// Subscribes to every message published to `subject`.
    async fn subscribe(&self, subject: &str)
    -> Result<mpsc::UnboundedReceiver<BusMessage>, BusError>;

    /// Publishes and waits for a single reply.
    async fn request(
        &self,
        subject: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BusError>;

    /// Publishes and returns the stream of reply frames. The stream ends
    /// when the responder drops its sender.
    async fn request_stream(
        &self,
        subject: &str,
        payload: Value,
    ) -> Result<mpsc::UnboundedReceiver<Value>, BusError>;
}

/// Loopback bus for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sends to one live subscriber of `subject`, pruning dead ones.
    fn deliver(&self, subject: &str, message: BusMessage) -> Result<(), BusError> {
        let Some(mut entry) = self.subscribers.get_mut(subject) else {
            return Err(BusError::NoResponders {
                subject: subject.to_owned(),
            });
        };
        entry.retain(|tx| !tx.is_closed());
        let Some(tx) = entry.first() else {
            return Err(BusError::NoResponders {
                subject: subject.to_owned(),
            });
        };
        tx.send(message).map_err(|_| BusError::NoResponders {
            subject: subject.to_owned(),
        })
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Value) -> Result<(), BusError> {
        // Publish is broadcast; losing individual subscribers is fine.
        if let Some(mut entry) = self.subscribers.get_mut(subject) {
            entry.retain(|tx| !tx.is_closed());
            for tx in entry.iter() {
                let _ = tx.send(BusMessage {
                    subject: subject.to_owned(),
                    payload: payload.clone(),
                    reply: None,
                    stream_reply: None,
                });
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
    ) -> Result<mpsc::UnboundedReceiver<BusMessage>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(subject.to_owned())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn request(
        &self,
        subject: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.deliver(
            subject,
            BusMessage {
                subject: subject.to_owned(),
                payload,
                reply: Some(reply_tx),
                stream_reply: None,
            },
        )?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(BusError::NoResponders {
                subject: subject.to_owned(),
            }),
            Err(_) => Err(BusError::Timeout {
                subject: subject.to_owned(),
            }),
        }
    }

    async fn request_stream(
        &self,
        subject: &str,
        payload: Value,
    ) -> Result<mpsc::UnboundedReceiver<Value>, BusError> {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        self.deliver(
            subject,
            BusMessage {
                subject: subject.to_owned(),
                payload,
                reply: None,
                stream_reply: Some(stream_tx),
            },
        )?;
        Ok(stream_rx)
    }
}
