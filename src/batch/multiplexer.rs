//! Transport-level batch envelope dispatch.
//!
//! The multiplexer sits directly above the transport and opportunistically
//! buckets multiplexable calls by `(method, model key)`. Unlike the
//! [`BatchQueue`](super::BatchQueue) it refuses anything with custom
//! timeout or cancellation semantics, and it tunes both its hold delay and
//! its batch ceiling to the current inflight pressure: more inflight work
//! means shorter holds and larger envelopes.

use std::{
    collections::HashMap,
    mem,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::{sync::oneshot, time::Instant};

use super::{BatchDispatcher, BatchError};
use crate::{
    config::OpsMultiplexerConfig,
    internal_events::{BatchFlushed, emit},
    rpc::RequestOptions,
};

const MULTIPLEXABLE: [&str; 2] = ["tokenize", "check_draft"];

struct BucketEntry {
    params: Value,
    tx: oneshot::Sender<Result<Value, BatchError>>,
}

#[derive(Default)]
struct Bucket {
    entries: Vec<BucketEntry>,
}

struct MuxInner {
    config: OpsMultiplexerConfig,
    dispatcher: Arc<dyn BatchDispatcher>,
    buckets: Mutex<HashMap<(String, String), Bucket>>,
    inflight: AtomicUsize,
    /// Batches dispatched with two or more entries. Solo dispatches are
    /// deliberately not counted.
    batches_dispatched: AtomicUsize,
}

#[derive(Clone)]
pub struct OpsMultiplexer {
    inner: Arc<MuxInner>,
}

impl OpsMultiplexer {
    pub fn new(config: OpsMultiplexerConfig, dispatcher: Arc<dyn BatchDispatcher>) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                config,
                dispatcher,
                buckets: Mutex::new(HashMap::new()),
                inflight: AtomicUsize::new(0),
                batches_dispatched: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of multi-entry envelopes dispatched so far.
    pub fn batches_dispatched(&self) -> usize {
        self.inner.batches_dispatched.load(Ordering::Relaxed)
    }

    /// Attempts to take over a request.
    ///
    /// Returns `None` when the method is not multiplexable or the caller
    /// passed custom timeout/cancel semantics; the caller then falls back
    /// to a direct transport request. Otherwise the request joins a bucket
    /// and resolves when its envelope does.
    pub fn try_request(
        &self,
        method: &str,
        model_key: &str,
        params: Value,
        options: &RequestOptions,
    ) -> Option<oneshot::Receiver<Result<Value, BatchError>>> {
        if !self.inner.config.enabled
            || !MULTIPLEXABLE.contains(&method)
            || options.is_custom()
        {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let key = (method.to_owned(), model_key.to_owned());
        let dispatch_now = {
            let mut buckets = self.inner.buckets.lock();
            let bucket = buckets.entry(key.clone()).or_default();
            let was_empty = bucket.entries.is_empty();
            bucket.entries.push(BucketEntry { params, tx });
            if bucket.entries.len() >= self.batch_ceiling() {
                DispatchWhen::Now
            } else if was_empty {
                DispatchWhen::After(self.hold_delay())
            } else {
                DispatchWhen::AlreadyScheduled
            }
        };

        match dispatch_now {
            DispatchWhen::Now => {
                let mux = self.clone();
                tokio::spawn(async move { mux.dispatch_bucket(&key).await });
            }
            DispatchWhen::After(delay) => {
                let mux = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    mux.dispatch_bucket(&key).await;
                });
            }
            DispatchWhen::AlreadyScheduled => {}
        }

        Some(rx)
    }

    /// Hold delay interpolated from inflight pressure: `max_hold` when
    /// quiet, `min_hold` when saturated.
    fn hold_delay(&self) -> Duration {
        let config = &self.inner.config;
        let t = self.pressure();
        let min = config.min_hold_ms as f64;
        let max = config.max_hold_ms as f64;
        Duration::from_micros(((max - t * (max - min)) * 1_000.0) as u64)
    }

    /// Batch ceiling interpolated from inflight pressure: small envelopes
    /// when quiet, up to `max_batch_size` when saturated.
    fn batch_ceiling(&self) -> usize {
        let config = &self.inner.config;
        let t = self.pressure();
        let low = config.low_pressure_batch_size as f64;
        let high = config.max_batch_size as f64;
        ((low + t * (high - low)).round() as usize).max(1)
    }

    /// Inflight count normalized to [0, 1] between the two thresholds.
    fn pressure(&self) -> f64 {
        let config = &self.inner.config;
        let inflight = self.inner.inflight.load(Ordering::Relaxed) as f64;
        let low = config.low_concurrency_threshold as f64;
        let high = config.high_concurrency_threshold as f64;
        if high <= low {
            return 1.0;
        }
        ((inflight - low) / (high - low)).clamp(0.0, 1.0)
    }

    async fn dispatch_bucket(&self, key: &(String, String)) {
        let entries = {
            let mut buckets = self.inner.buckets.lock();
            match buckets.get_mut(key) {
                Some(bucket) if !bucket.entries.is_empty() => mem::take(&mut bucket.entries),
                _ => {
                    buckets.remove(key);
                    return;
                }
            }
        };

        self.inner.inflight.fetch_add(1, Ordering::Relaxed);
        if entries.len() == 1 {
            self.dispatch_solo(&key.0, entries).await;
        } else {
            self.dispatch_batch(key, entries).await;
        }
        self.inner.inflight.fetch_sub(1, Ordering::Relaxed);

        let mut buckets = self.inner.buckets.lock();
        if buckets.get(key).is_some_and(|bucket| bucket.entries.is_empty()) {
            buckets.remove(key);
        }
    }

    /// A lone entry goes out as a plain single dispatch and stays out of
    /// the multiplexer statistics.
    async fn dispatch_solo(&self, method: &str, mut entries: Vec<BucketEntry>) {
        let entry = entries.remove(0);
        let result = match self
            .inner
            .dispatcher
            .dispatch(method, vec![entry.params.clone()])
            .await
        {
            Ok(mut response) if response.results.len() == 1 => {
                let slot = response.results.remove(0);
                if slot.success {
                    Ok(slot.result.unwrap_or(Value::Null))
                } else {
                    Err(BatchError::Entry {
                        message: slot
                            .error
                            .unwrap_or_else(|| "unspecified entry failure".to_owned()),
                    })
                }
            }
            Ok(response) => Err(BatchError::ResultCountMismatch {
                expected: 1,
                got: response.results.len(),
            }),
            Err(error) => Err(BatchError::Entry {
                message: error.to_string(),
            }),
        };
        let _ = entry.tx.send(result);
    }

    async fn dispatch_batch(&self, key: &(String, String), entries: Vec<BucketEntry>) {
        let requests: Vec<Value> = entries.iter().map(|entry| entry.params.clone()).collect();
        let size = requests.len();
        let started = Instant::now();
        match self.inner.dispatcher.dispatch(&key.0, requests).await {
            Ok(response) if response.results.len() == entries.len() => {
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
                self.inner.batches_dispatched.fetch_add(1, Ordering::Relaxed);
                emit(BatchFlushed {
                    method: &key.0,
                    size,
                    duration: started.elapsed(),
                });
            }
            Ok(response) => {
                let got = response.results.len();
                for entry in entries {
                    let _ = entry.tx.send(Err(BatchError::ResultCountMismatch {
                        expected: size,
                        got,
                    }));
                }
            }
            Err(error) => {
                let message = error.to_string();
                for entry in entries {
                    let _ = entry.tx.send(Err(BatchError::Entry {
                        message: message.clone(),
                    }));
                }
            }
        }
    }
}

enum DispatchWhen {
    Now,
    After(Duration),
    AlreadyScheduled,
}
