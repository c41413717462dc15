//! Time- and size-bounded coalescing of small runtime calls.
//!
//! Tokenization and draft-compatibility checks are cheap individually but
//! expensive as IPC round trips. The [`BatchQueue`] holds them briefly,
//! groups them by `(method, group key)`, and issues one `batch_<method>`
//! envelope per flush. Results fan back to each originator by index, so a
//! failing entry never takes its neighbors down with it.

mod multiplexer;

pub use multiplexer::OpsMultiplexer;

use std::{
    collections::{HashMap, VecDeque},
    mem,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::Snafu;
use tokio::{sync::oneshot, time::Instant};

use crate::{
    config::BatchQueueConfig,
    internal_events::{BatchFlushed, BatchLimitAdjusted, emit},
    rpc::{BatchResponse, RequestOptions, RpcTransport, TransportError},
};

/// How often the adaptive sizing rule is allowed to move the ceiling.
const ADJUST_INTERVAL: Duration = Duration::from_secs(1);
/// Number of recent batch durations the sizing rule averages over.
const SIZING_WINDOW: usize = 10;
const MIN_BATCH_SIZE: usize = 1;
const MAX_BATCH_SIZE: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Snafu)]
pub enum BatchError {
    #[snafu(display("runtime rejected this entry: {message}"))]
    Entry { message: String },
    #[snafu(display("batch response had {got} results for {expected} requests"))]
    ResultCountMismatch { expected: usize, got: usize },
    #[snafu(display("batch queue is shutting down"))]
    Shutdown,
}

/// Issues `batch_<method>` envelopes. Production uses the transport; tests
/// substitute their own.
#[async_trait]
pub trait BatchDispatcher: Send + Sync + 'static {
    async fn dispatch(
        &self,
        method: &str,
        requests: Vec<Value>,
    ) -> Result<BatchResponse, TransportError>;
}

#[async_trait]
impl BatchDispatcher for RpcTransport {
    async fn dispatch(
        &self,
        method: &str,
        requests: Vec<Value>,
    ) -> Result<BatchResponse, TransportError> {
        let value = self
            .request(
                &format!("batch_{method}"),
                serde_json::json!({ "requests": requests }),
                RequestOptions::default(),
            )
            .await?;
        serde_json::from_value(value).map_err(|error| TransportError::Rpc {
            method: format!("batch_{method}"),
            code: -32700,
            message: format!("malformed batch response: {error}"),
        })
    }
}

struct PendingEntry {
    params: Value,
    priority: Priority,
    tx: oneshot::Sender<Result<Value, BatchError>>,
}

#[derive(Default)]
struct Group {
    pending: Vec<PendingEntry>,
    flushing: bool,
    flush_scheduled: bool,
}

struct Sizing {
    current_max: usize,
    samples: VecDeque<f64>,
    last_adjusted: Instant,
}

struct QueueInner {
    config: BatchQueueConfig,
    dispatcher: Arc<dyn BatchDispatcher>,
    groups: Mutex<HashMap<(String, String), Group>>,
    sizing: Mutex<Sizing>,
}

/// A coalescing queue over one dispatcher.
#[derive(Clone)]
pub struct BatchQueue {
    inner: Arc<QueueInner>,
}

impl BatchQueue {
    pub fn new(config: BatchQueueConfig, dispatcher: Arc<dyn BatchDispatcher>) -> Self {
        let current_max = config.max_batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
        Self {
            inner: Arc::new(QueueInner {
                config,
                dispatcher,
                groups: Mutex::new(HashMap::new()),
                sizing: Mutex::new(Sizing {
                    current_max,
                    samples: VecDeque::with_capacity(SIZING_WINDOW),
                    last_adjusted: Instant::now(),
                }),
            }),
        }
    }

    /// The adaptive batch-size ceiling as of now.
    pub fn current_max_batch_size(&self) -> usize {
        self.inner.sizing.lock().current_max
    }

    /// Enqueues one call and resolves with its individual result once a
    /// flush carries it to the runtime.
    pub async fn submit(
        &self,
        method: &str,
        group_key: &str,
        params: Value,
        priority: Priority,
    ) -> Result<Value, BatchError> {
        let (tx, rx) = oneshot::channel();
        let key = (method.to_owned(), group_key.to_owned());

        let trigger = {
            let mut groups = self.inner.groups.lock();
            let group = groups.entry(key.clone()).or_default();
            group.pending.push(PendingEntry {
                params,
                priority,
                tx,
            });

            let ceiling = self.inner.sizing.lock().current_max;
            if group.pending.len() >= ceiling {
                Some(Duration::ZERO)
            } else if priority == Priority::High {
                Some(self.inner.config.min_hold())
            } else if group.flush_scheduled {
                None
            } else {
                group.flush_scheduled = true;
                Some(self.inner.config.flush_interval())
            }
        };

        if let Some(delay) = trigger {
            let queue = self.clone();
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                queue.flush(&key).await;
            });
        }

        rx.await.unwrap_or(Err(BatchError::Shutdown))
    }

    /// Flushes one group. At most one flush runs per group; extra triggers
    /// are no-ops, and the post-flush drain re-arms if entries arrived while
    /// the envelope was in flight.
    fn flush<'a>(
        &'a self,
        key: &'a (String, String),
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let mut entries = {
            let mut groups = self.inner.groups.lock();
            let Some(group) = groups.get_mut(key) else {
                return;
            };
            group.flush_scheduled = false;
            if group.flushing || group.pending.is_empty() {
                return;
            }
            group.flushing = true;
            mem::take(&mut group.pending)
        };

        if self.inner.config.priority_queue {
            entries.sort_by_key(|entry| entry.priority);
        }

        let requests: Vec<Value> = entries.iter().map(|entry| entry.params.clone()).collect();
        let batch_size = requests.len();
        let started = Instant::now();
        let outcome = self.inner.dispatcher.dispatch(&key.0, requests).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(response) => {
                if response.results.len() == entries.len() {
                    for (entry, slot) in entries.into_iter().zip(response.results) {
                        let result = if slot.success {
                            Ok(slot.result.unwrap_or(Value::Null))
                        } else {
                            Err(BatchError::Entry {
                                message: slot
                                    .error
                                    .unwrap_or_else(|| "unspecified entry failure".to_owned()),
                            })
                        };
                        let _ = entry.tx.send(result);
                    }
                } else {
                    let (expected, got) = (entries.len(), response.results.len());
                    error!(
                        message = "Batch response length mismatch.",
                        method = %key.0,
                        expected,
                        got,
                    );
                    for entry in entries {
                        let _ = entry
                            .tx
                            .send(Err(BatchError::ResultCountMismatch { expected, got }));
                    }
                }
                emit(BatchFlushed {
                    method: &key.0,
                    size: batch_size,
                    duration: elapsed,
                });
                if self.inner.config.adaptive_sizing {
                    self.record_batch_time(elapsed);
                }
            }
            Err(error) => {
                // A dispatch-level failure takes down the whole flush; each
                // originator still gets its own error value.
                warn!(message = "Batch dispatch failed.", method = %key.0, error = %error);
                let message = error.to_string();
                for entry in entries {
                    let _ = entry.tx.send(Err(BatchError::Entry {
                        message: message.clone(),
                    }));
                }
            }
        }

        let rearm = {
            let mut groups = self.inner.groups.lock();
            let Some(group) = groups.get_mut(key) else {
                return;
            };
            group.flushing = false;
            if group.pending.is_empty() {
                groups.remove(key);
                false
            } else {
                group.flush_scheduled = true;
                true
            }
        };

        if rearm {
            let queue = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(queue.inner.config.flush_interval()).await;
                queue.flush(&key).await;
            });
        }
        })
    }

    fn record_batch_time(&self, elapsed: Duration) {
        let mut sizing = self.inner.sizing.lock();
        if sizing.samples.len() == SIZING_WINDOW {
            sizing.samples.pop_front();
        }
        sizing.samples.push_back(elapsed.as_secs_f64() * 1_000.0);

        if sizing.last_adjusted.elapsed() < ADJUST_INTERVAL || sizing.samples.is_empty() {
            return;
        }
        sizing.last_adjusted = Instant::now();

        let avg: f64 = sizing.samples.iter().sum::<f64>() / sizing.samples.len() as f64;
        let ratio = avg / self.inner.config.target_batch_time_ms;
        let current = sizing.current_max as f64;
        let next = if ratio > 1.5 {
            (current * 0.70).floor()
        } else if ratio > 1.2 {
            (current * 0.85).floor()
        } else if ratio < 0.5 {
            (current * 1.50).ceil()
        } else if ratio < 0.8 {
            (current * 1.15).ceil()
        } else {
            current
        };
        let next = (next as usize).clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);

        if next != sizing.current_max {
            let previous = sizing.current_max;
            sizing.current_max = next;
            drop(sizing);
            emit(BatchLimitAdjusted {
                previous,
                current: next,
                avg_batch_ms: avg,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::rpc::BatchSlot;

    /// Dispatcher that records envelopes and answers each slot with its
    /// index, optionally failing marked entries.
    struct RecordingDispatcher {
        calls: Mutex<Vec<(String, Vec<Value>)>>,
        delay: Duration,
    }

    impl RecordingDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            })
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                delay,
            })
        }

        fn calls(&self) -> Vec<(String, Vec<Value>)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl BatchDispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            method: &str,
            requests: Vec<Value>,
        ) -> Result<BatchResponse, TransportError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.calls.lock().push((method.to_owned(), requests.clone()));
            let results = requests
                .iter()
                .enumerate()
                .map(|(i, request)| {
                    if request["fail"].as_bool().unwrap_or(false) {
                        BatchSlot {
                            success: false,
                            result: None,
                            error: Some("bad entry".to_owned()),
                        }
                    } else {
                        BatchSlot {
                            success: true,
                            result: Some(json!({ "index": i })),
                            error: None,
                        }
                    }
                })
                .collect();
            Ok(BatchResponse { results })
        }
    }

    fn queue_with(dispatcher: Arc<dyn BatchDispatcher>, config: BatchQueueConfig) -> BatchQueue {
        BatchQueue::new(config, dispatcher)
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_within_the_flush_window() {
        let dispatcher = RecordingDispatcher::new();
        let queue = queue_with(dispatcher.clone(), BatchQueueConfig::default());

        let mut handles = Vec::new();
        for i in 0..5 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .submit(
                        "tokenize",
                        "mistral-7b",
                        json!({ "text": format!("t{i}") }),
                        Priority::Normal,
                    )
                    .await
            }));
            tokio::task::yield_now().await;
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        // Exactly one envelope with all five requests, in order.
        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "tokenize");
        assert_eq!(calls[0].1.len(), 5);
        for (i, request) in calls[0].1.iter().enumerate() {
            assert_eq!(request["text"], format!("t{i}"));
        }

        // And every caller got its own index-aligned result.
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result["index"], i as u64);
        }
    }

    #[tokio::test]
    async fn groups_are_keyed_by_method_and_model() {
        let dispatcher = RecordingDispatcher::new();
        let queue = queue_with(dispatcher.clone(), BatchQueueConfig::default());

        let a = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit("tokenize", "mistral-7b", json!({"text": "a"}), Priority::Normal)
                    .await
            })
        };
        let b = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit("tokenize", "qwen-14b", json!({"text": "b"}), Priority::Normal)
                    .await
            })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Different models flush as separate envelopes.
        assert_eq!(dispatcher.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn per_entry_errors_are_isolated() {
        let dispatcher = RecordingDispatcher::new();
        let queue = queue_with(dispatcher.clone(), BatchQueueConfig::default());

        let ok = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit("tokenize", "m", json!({"text": "fine"}), Priority::Normal)
                    .await
            })
        };
        tokio::task::yield_now().await;
        let bad = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit("tokenize", "m", json!({"fail": true}), Priority::Normal)
                    .await
            })
        };

        assert!(ok.await.unwrap().is_ok());
        let error = bad.await.unwrap().unwrap_err();
        assert!(matches!(error, BatchError::Entry { message } if message == "bad entry"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_without_waiting() {
        let dispatcher = RecordingDispatcher::new();
        let config = BatchQueueConfig {
            max_batch_size: 2,
            // Long enough that only the size trigger can explain a flush.
            flush_interval_ms: 60_000,
            ..BatchQueueConfig::default()
        };
        let queue = queue_with(dispatcher.clone(), config);

        let a = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit("tokenize", "m", json!({"text": "a"}), Priority::Normal)
                    .await
            })
        };
        tokio::task::yield_now().await;
        let b = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit("tokenize", "m", json!({"text": "b"}), Priority::Normal)
                    .await
            })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(dispatcher.calls().len(), 1);
        assert_eq!(dispatcher.calls()[0].1.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_sorts_to_the_front() {
        let dispatcher = RecordingDispatcher::new();
        let queue = queue_with(dispatcher.clone(), BatchQueueConfig::default());

        let low = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit("tokenize", "m", json!({"text": "low"}), Priority::Low)
                    .await
            })
        };
        tokio::task::yield_now().await;
        let high = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit("tokenize", "m", json!({"text": "high"}), Priority::High)
                    .await
            })
        };

        low.await.unwrap().unwrap();
        high.await.unwrap().unwrap();

        let calls = dispatcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1[0]["text"], "high");
        assert_eq!(calls[0].1[1]["text"], "low");
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_sizing_shrinks_on_slow_batches() {
        let dispatcher = RecordingDispatcher::with_delay(Duration::from_millis(200));
        let config = BatchQueueConfig {
            max_batch_size: 32,
            target_batch_time_ms: 50.0,
            ..BatchQueueConfig::default()
        };
        let queue = queue_with(dispatcher, config);
        assert_eq!(queue.current_max_batch_size(), 32);

        // Enough slow flushes to cross the adjustment interval.
        for _ in 0..8 {
            queue
                .submit("tokenize", "m", json!({"text": "x"}), Priority::Normal)
                .await
                .unwrap();
        }

        // 200 ms against a 50 ms target is ratio 4.0 → shrink by 30%.
        assert_eq!(queue.current_max_batch_size(), 22);
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_sizing_grows_on_fast_batches() {
        let dispatcher = RecordingDispatcher::new();
        let config = BatchQueueConfig {
            max_batch_size: 10,
            target_batch_time_ms: 50.0,
            ..BatchQueueConfig::default()
        };
        let queue = queue_with(dispatcher, config);

        for _ in 0..2 {
            queue
                .submit("tokenize", "m", json!({"text": "x"}), Priority::Normal)
                .await
                .unwrap();
            // Step past the adjustment interval between flushes.
            tokio::time::advance(ADJUST_INTERVAL).await;
        }

        // Near-zero durations against a 50 ms target → grow by 50%.
        assert_eq!(queue.current_max_batch_size(), 15);
    }

    #[tokio::test]
    async fn concurrent_submits_never_lose_entries() {
        let dispatcher = RecordingDispatcher::new();
        let queue = queue_with(dispatcher.clone(), BatchQueueConfig::default());
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..50 {
            let queue = queue.clone();
            let completed = Arc::clone(&completed);
            handles.push(tokio::spawn(async move {
                queue
                    .submit("tokenize", "m", json!({ "text": i }), Priority::Normal)
                    .await
                    .unwrap();
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(completed.load(Ordering::SeqCst), 50);
        let total: usize = dispatcher.calls().iter().map(|(_, r)| r.len()).sum();
        assert_eq!(total, 50);
    }
}
