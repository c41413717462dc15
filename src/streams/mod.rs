//! The stream registry.
//!
//! Every in-flight generation is owned here. The registry admits new
//! streams through the concurrency limiter and an adaptive active-stream
//! limit, fans runtime notifications out to consumers, tracks consumer
//! acknowledgements for backpressure, and guarantees that every stream
//! takes exactly one terminal transition no matter which of completion,
//! error, timeout, cancellation, or shutdown gets there first.

mod admission;
mod chunk_pool;

pub use admission::AdmissionController;
pub use chunk_pool::{ChunkPool, PoolStats};

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use snafu::Snafu;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    config::StreamRegistryConfig,
    internal_events::{
        AdmissionLimitAdjusted, BackpressureEngaged, BackpressureReleased, FirstTokenObserved,
        SlowConsumerDetected, StreamCancelled, StreamCompleted, StreamFailed, StreamRegistered,
        StreamTimedOut, emit,
    },
    limiter::{AcquireError, ConcurrencyLimiter},
    rpc::{ChunkFrame, EventFrame, RpcTransport, StatsFrame, StreamChunk, StreamEventKind,
        StreamNotification, StreamStats},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Pending,
    Active,
    Draining,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

#[derive(Debug, Snafu)]
pub enum StreamError {
    #[snafu(display("runtime reported a stream error: {message}"))]
    Runtime { message: String },
    #[snafu(display("stream timed out after {after_ms} ms"))]
    TimedOut { after_ms: u64 },
    #[snafu(display("stream was cancelled by the caller"))]
    Cancelled,
    #[snafu(display("registry is shutting down"))]
    ShuttingDown,
}

#[derive(Debug, Snafu)]
#[snafu(context(suffix(Register)))]
pub enum RegisterError {
    #[snafu(display("stream `{stream_id}` is already registered"))]
    DuplicateStream { stream_id: String },
    #[snafu(display("registry is at its active-stream limit ({active}/{limit})"))]
    RegistryFull { active: usize, limit: usize },
    #[snafu(display("tenant `{tenant}` is at its stream budget ({budget})"))]
    TenantBudgetExceeded { tenant: String, budget: usize },
    #[snafu(display("concurrency admission failed: {source}"))]
    Admission { source: AcquireError },
    #[snafu(display("registry is shutting down"))]
    ShuttingDown,
}

/// Registration parameters for one stream.
#[derive(Debug, Default)]
pub struct StreamOptions {
    pub model_id: Option<String>,
    pub tenant: Option<String>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

/// The consumer's handle: a chunk sequence plus a completion that resolves
/// exactly once.
#[derive(Debug)]
pub struct RegisteredStream {
    stream_id: String,
    chunks: mpsc::UnboundedReceiver<StreamChunk>,
    done: oneshot::Receiver<Result<StreamStats, StreamError>>,
}

impl RegisteredStream {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn chunks_mut(&mut self) -> &mut mpsc::UnboundedReceiver<StreamChunk> {
        &mut self.chunks
    }

    pub fn into_parts(
        self,
    ) -> (mpsc::UnboundedReceiver<StreamChunk>, StreamCompletion) {
        (self.chunks, StreamCompletion { done: self.done })
    }

    /// The chunk sequence as a [`futures::Stream`], for `StreamExt`
    /// consumers.
    pub fn into_chunk_stream(
        self,
    ) -> (UnboundedReceiverStream<StreamChunk>, StreamCompletion) {
        (
            UnboundedReceiverStream::new(self.chunks),
            StreamCompletion { done: self.done },
        )
    }

    /// Waits for the terminal outcome, discarding any unread chunks.
    pub async fn await_completion(self) -> Result<StreamStats, StreamError> {
        StreamCompletion { done: self.done }.wait().await
    }
}

pub struct StreamCompletion {
    done: oneshot::Receiver<Result<StreamStats, StreamError>>,
}

impl StreamCompletion {
    pub async fn wait(self) -> Result<StreamStats, StreamError> {
        self.done
            .await
            .unwrap_or(Err(StreamError::ShuttingDown))
    }
}

/// Read-only view of one stream, for health surfaces and tests.
#[derive(Clone, Debug)]
pub struct StreamView {
    pub state: StreamState,
    pub chunk_count: u64,
    pub unacked_chunks: u64,
    pub blocked: bool,
}

enum FinishReason {
    Completed { finish_reason: Option<String> },
    Errored { message: String },
    TimedOut,
    Cancelled,
    Shutdown,
}

struct StreamEntry {
    state: StreamState,
    model_id: Option<String>,
    tenant: Option<String>,
    started_at: Instant,
    first_token_at: Option<Instant>,
    last_chunk_at: Option<Instant>,
    blocked_since: Option<Instant>,
    chunk_count: u64,
    unacked_chunks: u64,
    slow_flagged: bool,
    last_stats: Option<StreamStats>,
    chunk_tx: mpsc::UnboundedSender<StreamChunk>,
    done_tx: Option<oneshot::Sender<Result<StreamStats, StreamError>>>,
    timeout_task: Option<JoinHandle<()>>,
    cancel_task: Option<JoinHandle<()>>,
}

struct RegistryInner {
    config: StreamRegistryConfig,
    limiter: ConcurrencyLimiter,
    admission: AdmissionController,
    pool: ChunkPool,
    streams: Mutex<HashMap<String, StreamEntry>>,
    tenants: Mutex<HashMap<String, usize>>,
    periodic: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

impl StreamRegistry {
    pub fn new(config: StreamRegistryConfig, limiter: ConcurrencyLimiter) -> Self {
        let admission = AdmissionController::new(
            config.adaptive_limits.clone(),
            config.max_active_streams,
        );
        let pool = ChunkPool::new(&config.chunk_pooling);
        Self {
            inner: Arc::new(RegistryInner {
                config,
                limiter,
                admission,
                pool,
                streams: Mutex::new(HashMap::new()),
                tenants: Mutex::new(HashMap::new()),
                periodic: Mutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Starts the periodic adjustment and pool-cleanup tasks. Must run
    /// inside a runtime.
    pub fn start(&self) {
        let mut periodic = self.inner.periodic.lock();
        if !periodic.is_empty() {
            return;
        }

        if self.inner.config.adaptive_limits.enabled {
            let registry = self.clone();
            let interval = self.inner.config.adaptive_limits.adjustment_interval();
            periodic.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    registry.run_adjustment();
                }
            }));
        }

        if self.inner.config.chunk_pooling.enabled {
            let registry = self.clone();
            let interval = self.inner.config.chunk_pooling.cleanup_interval();
            periodic.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    registry.inner.pool.clear();
                }
            }));
        }
    }

    /// Subscribes to the transport's stream notifications and pumps them
    /// into the registry until the transport closes. Streams that are still
    /// open when the transport goes away fail rather than hang.
    pub fn attach(&self, transport: &RpcTransport) {
        let mut chunks = transport.subscribe(StreamNotification::CHUNK_METHOD);
        let mut stats = transport.subscribe(StreamNotification::STATS_METHOD);
        let mut events = transport.subscribe(StreamNotification::EVENT_METHOD);

        let registry = self.clone();
        let pump = tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    n = chunks.recv() => n,
                    n = stats.recv() => n,
                    n = events.recv() => n,
                };
                let Some(notification) = notification else {
                    break;
                };
                match StreamNotification::parse(&notification) {
                    Ok(Some(parsed)) => registry.handle_notification(parsed),
                    Ok(None) => {}
                    Err(error) => {
                        warn!(
                            message = "Dropping malformed stream notification.",
                            method = %notification.method,
                            %error,
                        );
                    }
                }
            }
            registry.fail_all("transport closed");
        });
        self.inner.periodic.lock().push(pump);
    }

    /// Registers a stream and returns the consumer handle.
    ///
    /// Admission order: duplicate check, concurrency slot (may wait in the
    /// tier queue), active-stream limit, tenant budget. A slot acquired for
    /// a registration that is then rejected is released on the way out.
    pub async fn register(
        &self,
        stream_id: &str,
        options: StreamOptions,
    ) -> Result<RegisteredStream, RegisterError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RegisterError::ShuttingDown);
        }
        if self.inner.streams.lock().contains_key(stream_id) {
            return Err(RegisterError::DuplicateStream {
                stream_id: stream_id.to_owned(),
            });
        }

        if let Some(model_id) = &options.model_id {
            self.inner
                .limiter
                .acquire(model_id, stream_id)
                .await
                .map_err(|source| RegisterError::Admission { source })?;
        }

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let over_budget = options.tenant.as_ref().and_then(|tenant| {
            let budget = *self.inner.config.tenant_budgets.get(tenant)?;
            let used = self.inner.tenants.lock().get(tenant).copied().unwrap_or(0);
            (used >= budget).then(|| (tenant.clone(), budget))
        });

        let admitted = {
            let mut streams = self.inner.streams.lock();
            let limit = self.inner.admission.effective_limit();
            if streams.contains_key(stream_id) {
                Err(RegisterError::DuplicateStream {
                    stream_id: stream_id.to_owned(),
                })
            } else if streams.len() >= limit {
                Err(RegisterError::RegistryFull {
                    active: streams.len(),
                    limit,
                })
            } else if let Some((tenant, budget)) = over_budget {
                Err(RegisterError::TenantBudgetExceeded { tenant, budget })
            } else {
                if let Some(tenant) = &options.tenant {
                    *self.inner.tenants.lock().entry(tenant.clone()).or_insert(0) += 1;
                }
                streams.insert(
                    stream_id.to_owned(),
                    StreamEntry {
                        state: StreamState::Pending,
                        model_id: options.model_id.clone(),
                        tenant: options.tenant.clone(),
                        started_at: Instant::now(),
                        first_token_at: None,
                        last_chunk_at: None,
                        blocked_since: None,
                        chunk_count: 0,
                        unacked_chunks: 0,
                        slow_flagged: false,
                        last_stats: None,
                        chunk_tx,
                        done_tx: Some(done_tx),
                        timeout_task: None,
                        cancel_task: None,
                    },
                );
                Ok(streams.len())
            }
        };

        let active = match admitted {
            Ok(active) => active,
            Err(error) => {
                if let Some(model_id) = &options.model_id {
                    self.inner.limiter.release(model_id, stream_id);
                }
                return Err(error);
            }
        };

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.default_timeout());
        let timeout_task = {
            let registry = self.clone();
            let stream_id = stream_id.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                registry.finish(&stream_id, FinishReason::TimedOut);
            })
        };
        let cancel_task = options.cancel.map(|token| {
            let registry = self.clone();
            let stream_id = stream_id.to_owned();
            tokio::spawn(async move {
                token.cancelled().await;
                registry.finish(&stream_id, FinishReason::Cancelled);
            })
        });

        {
            let mut streams = self.inner.streams.lock();
            if let Some(entry) = streams.get_mut(stream_id) {
                entry.timeout_task = Some(timeout_task);
                entry.cancel_task = cancel_task;
            } else {
                // The stream already hit a terminal transition; its timers
                // must not outlive it.
                timeout_task.abort();
                if let Some(task) = cancel_task {
                    task.abort();
                }
            }
        }

        emit(StreamRegistered {
            stream_id,
            active,
            limit: self.inner.admission.effective_limit(),
        });

        Ok(RegisteredStream {
            stream_id: stream_id.to_owned(),
            chunks: chunk_rx,
            done: done_rx,
        })
    }

    /// Entry point for parsed runtime notifications.
    pub fn handle_notification(&self, notification: StreamNotification) {
        match notification {
            StreamNotification::Chunk(frame) => self.on_chunk(frame),
            StreamNotification::Stats(frame) => self.on_stats(&frame),
            StreamNotification::Event(frame) => self.on_event(frame),
        }
    }

    fn on_chunk(&self, frame: ChunkFrame) {
        let backpressure = &self.inner.config.backpressure;

        let mut first_token = None;
        let mut engaged = None;
        let mut slow = None;
        let delivery = {
            let mut streams = self.inner.streams.lock();
            let Some(entry) = streams.get_mut(&frame.stream_id) else {
                debug!(
                    message = "Chunk for unknown stream dropped.",
                    stream_id = %frame.stream_id,
                );
                return;
            };
            if entry.state.is_terminal() {
                return;
            }

            let now = Instant::now();
            entry.chunk_count += 1;
            entry.last_chunk_at = Some(now);
            if entry.first_token_at.is_none() {
                entry.first_token_at = Some(now);
                let ttft = now - entry.started_at;
                self.inner
                    .admission
                    .record_ttft(ttft.as_secs_f64() * 1_000.0);
                first_token = Some(ttft);
                if entry.state == StreamState::Pending {
                    entry.state = StreamState::Active;
                }
            }
            if frame.is_final {
                entry.state = StreamState::Draining;
            }

            if backpressure.enabled {
                entry.unacked_chunks += 1;
                if entry.unacked_chunks >= backpressure.max_unacked_chunks
                    && entry.blocked_since.is_none()
                {
                    entry.blocked_since = Some(now);
                    engaged = Some(entry.unacked_chunks);
                }
                if let Some(since) = entry.blocked_since {
                    let blocked_for = now - since;
                    if blocked_for >= backpressure.slow_consumer_threshold()
                        && !entry.slow_flagged
                    {
                        entry.slow_flagged = true;
                        slow = Some(blocked_for);
                    }
                }
            }

            let mut chunk = self.inner.pool.acquire();
            chunk.token = frame.token;
            chunk.token_id = frame.token_id;
            chunk.is_final = frame.is_final;
            chunk.logprob = frame.logprob;
            chunk.cumulative_text = frame.cumulative_text;
            (entry.chunk_tx.clone(), chunk)
        };

        // Consumer-facing emits happen outside the registry lock.
        if let Some(ttft) = first_token {
            emit(FirstTokenObserved {
                stream_id: &frame.stream_id,
                ttft,
            });
        }
        if let Some(unacked) = engaged {
            emit(BackpressureEngaged {
                stream_id: &frame.stream_id,
                unacked,
            });
        }
        if let Some(blocked_for) = slow {
            emit(SlowConsumerDetected {
                stream_id: &frame.stream_id,
                blocked_for,
            });
        }

        let (sender, chunk) = delivery;
        if let Err(returned) = sender.send(chunk) {
            // A consumer that went away must not leak the record.
            self.inner.pool.release(returned.0);
            debug!(
                message = "Chunk could not be delivered, consumer is gone.",
                stream_id = %frame.stream_id,
            );
        }
    }

    fn on_stats(&self, frame: &StatsFrame) {
        let mut streams = self.inner.streams.lock();
        let Some(entry) = streams.get_mut(&frame.stream_id) else {
            debug!(
                message = "Stats for unknown stream dropped.",
                stream_id = %frame.stream_id,
            );
            return;
        };
        entry.last_stats = Some(frame.stats.clone());
    }

    fn on_event(&self, frame: EventFrame) {
        match frame.event {
            StreamEventKind::Completed => self.finish(
                &frame.stream_id,
                FinishReason::Completed {
                    finish_reason: frame.finish_reason,
                },
            ),
            StreamEventKind::Error => self.finish(
                &frame.stream_id,
                FinishReason::Errored {
                    message: frame
                        .error
                        .unwrap_or_else(|| "runtime reported an unspecified error".to_owned()),
                },
            ),
        }
    }

    /// Consumer acknowledgement. Clears the blocked flag once the unacked
    /// count is back under the threshold.
    pub fn acknowledge_chunk(&self, stream_id: &str, count: u64) {
        let released = {
            let mut streams = self.inner.streams.lock();
            let Some(entry) = streams.get_mut(stream_id) else {
                return;
            };
            entry.unacked_chunks = entry.unacked_chunks.saturating_sub(count);
            if entry.unacked_chunks < self.inner.config.backpressure.max_unacked_chunks {
                entry.slow_flagged = false;
                entry.blocked_since.take().map(|since| since.elapsed())
            } else {
                None
            }
        };

        if let Some(blocked_for) = released {
            emit(BackpressureReleased {
                stream_id,
                blocked_for,
            });
        }
    }

    /// All terminal paths funnel through here: one absorbing state change,
    /// timers cleared, the caller resolved exactly once, the concurrency
    /// slot released, and the entry removed.
    fn finish(&self, stream_id: &str, reason: FinishReason) {
        let mut entry = {
            let mut streams = self.inner.streams.lock();
            match streams.get(stream_id) {
                Some(entry) if !entry.state.is_terminal() => {
                    streams.remove(stream_id).expect("entry was just looked up")
                }
                _ => return,
            }
        };
        entry.state = match reason {
            FinishReason::Completed { .. } => StreamState::Completed,
            FinishReason::Errored { .. } | FinishReason::Shutdown => StreamState::Failed,
            FinishReason::TimedOut => StreamState::TimedOut,
            FinishReason::Cancelled => StreamState::Cancelled,
        };

        if let Some(tenant) = &entry.tenant {
            let mut tenants = self.inner.tenants.lock();
            if let Some(count) = tenants.get_mut(tenant) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    tenants.remove(tenant);
                }
            }
        }

        if let Some(task) = entry.timeout_task.take() {
            task.abort();
        }
        if let Some(task) = entry.cancel_task.take() {
            task.abort();
        }

        let elapsed = entry.started_at.elapsed();
        let outcome = match reason {
            FinishReason::Completed { finish_reason } => {
                let stats = entry
                    .last_stats
                    .clone()
                    .unwrap_or_else(|| derive_stats(&entry, elapsed));
                emit(StreamCompleted {
                    stream_id,
                    chunks: entry.chunk_count,
                    duration: elapsed,
                });
                if let Some(finish_reason) = finish_reason {
                    trace!(
                        message = "Stream finished.",
                        stream_id = %stream_id,
                        finish_reason = %finish_reason,
                    );
                }
                Ok(stats)
            }
            FinishReason::Errored { message } => {
                emit(StreamFailed {
                    stream_id,
                    reason: "runtime",
                });
                Err(StreamError::Runtime { message })
            }
            FinishReason::TimedOut => {
                emit(StreamTimedOut {
                    stream_id,
                    after: elapsed,
                });
                Err(StreamError::TimedOut {
                    after_ms: elapsed.as_millis() as u64,
                })
            }
            FinishReason::Cancelled => {
                emit(StreamCancelled { stream_id });
                Err(StreamError::Cancelled)
            }
            FinishReason::Shutdown => {
                emit(StreamFailed {
                    stream_id,
                    reason: "shutdown",
                });
                Err(StreamError::ShuttingDown)
            }
        };

        if let Some(done_tx) = entry.done_tx.take() {
            if done_tx.send(outcome).is_err() {
                debug!(
                    message = "Stream outcome had no listener.",
                    stream_id = %stream_id,
                );
            }
        }

        if let Some(model_id) = &entry.model_id {
            self.inner.limiter.release(model_id, stream_id);
        }
    }

    /// Fails one stream from outside the notification path, e.g. when the
    /// `generate` request itself is rejected by the runtime.
    pub fn fail(&self, stream_id: &str, message: &str) {
        self.finish(
            stream_id,
            FinishReason::Errored {
                message: message.to_owned(),
            },
        );
    }

    fn run_adjustment(&self) {
        let active = self.inner.streams.lock().len();
        if let Some((previous, current, utilization)) = self.inner.admission.adjust(active) {
            emit(AdmissionLimitAdjusted {
                previous,
                current,
                utilization,
            });
        }
    }

    fn fail_all(&self, message: &str) {
        let ids: Vec<String> = self.inner.streams.lock().keys().cloned().collect();
        for stream_id in ids {
            self.finish(
                &stream_id,
                FinishReason::Errored {
                    message: message.to_owned(),
                },
            );
        }
    }

    /// Stops the periodic tasks and rejects every non-terminal stream.
    /// Consumers keep their handles; [`reinitialize`](Self::reinitialize)
    /// brings the registry back for a runtime restart.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        for task in self.inner.periodic.lock().drain(..) {
            task.abort();
        }
        let ids: Vec<String> = self.inner.streams.lock().keys().cloned().collect();
        for stream_id in ids {
            self.finish(&stream_id, FinishReason::Shutdown);
        }
        self.inner.limiter.shutdown();
    }

    /// Restores the periodic tasks after a shutdown.
    pub fn reinitialize(&self) {
        self.inner.shutting_down.store(false, Ordering::SeqCst);
        self.start();
    }

    pub fn active_count(&self) -> usize {
        self.inner.streams.lock().len()
    }

    pub fn effective_limit(&self) -> usize {
        self.inner.admission.effective_limit()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn view(&self, stream_id: &str) -> Option<StreamView> {
        let streams = self.inner.streams.lock();
        streams.get(stream_id).map(|entry| StreamView {
            state: entry.state,
            chunk_count: entry.chunk_count,
            unacked_chunks: entry.unacked_chunks,
            blocked: entry.blocked_since.is_some(),
        })
    }
}

fn derive_stats(entry: &StreamEntry, elapsed: Duration) -> StreamStats {
    let total_ms = elapsed.as_secs_f64() * 1_000.0;
    let ttft_ms = entry
        .first_token_at
        .map(|at| (at - entry.started_at).as_secs_f64() * 1_000.0);
    let tokens_per_second = if elapsed.as_secs_f64() > 0.0 {
        entry.chunk_count as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    StreamStats {
        tokens_generated: entry.chunk_count,
        tokens_per_second,
        time_to_first_token: ttft_ms,
        total_time: total_ms,
    }
}
