//! Internal observability events.
//!
//! Every observable state change goes through one of these structs so the
//! metric names and log fields stay in one place. Call sites construct the
//! struct and hand it to [`emit`].

use std::time::Duration;

use metrics::{counter, gauge, histogram};

pub trait InternalEvent {
    fn emit(self);
}

pub fn emit(event: impl InternalEvent) {
    event.emit();
}

pub struct StreamRegistered<'a> {
    pub stream_id: &'a str,
    pub active: usize,
    pub limit: usize,
}

impl InternalEvent for StreamRegistered<'_> {
    fn emit(self) {
        debug!(
            message = "Stream registered.",
            stream_id = %self.stream_id,
            active = self.active,
            limit = self.limit,
        );
        counter!("stream_registered_total").increment(1);
        gauge!("streams_active").set(self.active as f64);
    }
}

pub struct StreamCompleted<'a> {
    pub stream_id: &'a str,
    pub chunks: u64,
    pub duration: Duration,
}

impl InternalEvent for StreamCompleted<'_> {
    fn emit(self) {
        debug!(
            message = "Stream completed.",
            stream_id = %self.stream_id,
            chunks = self.chunks,
        );
        counter!("stream_completed_total").increment(1);
        histogram!("stream_duration_seconds").record(self.duration);
    }
}

pub struct StreamFailed<'a> {
    pub stream_id: &'a str,
    pub reason: &'static str,
}

impl InternalEvent for StreamFailed<'_> {
    fn emit(self) {
        warn!(
            message = "Stream failed.",
            stream_id = %self.stream_id,
            reason = self.reason,
        );
        counter!("stream_failed_total", "reason" => self.reason).increment(1);
    }
}

pub struct StreamTimedOut<'a> {
    pub stream_id: &'a str,
    pub after: Duration,
}

impl InternalEvent for StreamTimedOut<'_> {
    fn emit(self) {
        warn!(
            message = "Stream timed out.",
            stream_id = %self.stream_id,
            after_ms = self.after.as_millis() as u64,
        );
        counter!("stream_timeout_total").increment(1);
    }
}

pub struct StreamCancelled<'a> {
    pub stream_id: &'a str,
}

impl InternalEvent for StreamCancelled<'_> {
    fn emit(self) {
        debug!(message = "Stream cancelled.", stream_id = %self.stream_id);
        counter!("stream_cancelled_total").increment(1);
    }
}

pub struct FirstTokenObserved<'a> {
    pub stream_id: &'a str,
    pub ttft: Duration,
}

impl InternalEvent for FirstTokenObserved<'_> {
    fn emit(self) {
        trace!(
            message = "First token observed.",
            stream_id = %self.stream_id,
            ttft_ms = self.ttft.as_millis() as u64,
        );
        histogram!("stream_time_to_first_token_seconds").record(self.ttft);
    }
}

pub struct BackpressureEngaged<'a> {
    pub stream_id: &'a str,
    pub unacked: u64,
}

impl InternalEvent for BackpressureEngaged<'_> {
    fn emit(self) {
        debug!(
            message = "Backpressure engaged.",
            stream_id = %self.stream_id,
            unacked = self.unacked,
        );
        counter!("stream_backpressure_total").increment(1);
    }
}

pub struct BackpressureReleased<'a> {
    pub stream_id: &'a str,
    pub blocked_for: Duration,
}

impl InternalEvent for BackpressureReleased<'_> {
    fn emit(self) {
        debug!(
            message = "Backpressure released.",
            stream_id = %self.stream_id,
            blocked_ms = self.blocked_for.as_millis() as u64,
        );
        histogram!("stream_blocked_seconds").record(self.blocked_for);
    }
}

pub struct SlowConsumerDetected<'a> {
    pub stream_id: &'a str,
    pub blocked_for: Duration,
}

impl InternalEvent for SlowConsumerDetected<'_> {
    fn emit(self) {
        warn!(
            message = "Slow consumer detected.",
            stream_id = %self.stream_id,
            blocked_ms = self.blocked_for.as_millis() as u64,
        );
        counter!("stream_slow_consumer_total").increment(1);
    }
}

pub struct AdmissionLimitAdjusted {
    pub previous: usize,
    pub current: usize,
    pub utilization: f64,
}

impl InternalEvent for AdmissionLimitAdjusted {
    fn emit(self) {
        debug!(
            message = "Adaptive admission limit adjusted.",
            previous = self.previous,
            current = self.current,
            utilization = self.utilization,
        );
        gauge!("streams_admission_limit").set(self.current as f64);
    }
}

pub struct SlotAdmitted<'a> {
    pub model_id: &'a str,
    pub tier: &'static str,
    pub active: usize,
}

impl InternalEvent for SlotAdmitted<'_> {
    fn emit(self) {
        trace!(
            message = "Concurrency slot admitted.",
            model_id = %self.model_id,
            tier = self.tier,
            active = self.active,
        );
        counter!("limiter_admitted_total", "tier" => self.tier).increment(1);
        gauge!("limiter_active", "tier" => self.tier).set(self.active as f64);
    }
}

pub struct SlotQueued<'a> {
    pub model_id: &'a str,
    pub tier: &'static str,
    pub queued: usize,
}

impl InternalEvent for SlotQueued<'_> {
    fn emit(self) {
        debug!(
            message = "Concurrency slot queued.",
            model_id = %self.model_id,
            tier = self.tier,
            queued = self.queued,
        );
        counter!("limiter_queued_total", "tier" => self.tier).increment(1);
    }
}

pub struct SlotReleased<'a> {
    pub model_id: &'a str,
    pub tier: &'static str,
    pub active: usize,
}

impl InternalEvent for SlotReleased<'_> {
    fn emit(self) {
        trace!(
            message = "Concurrency slot released.",
            model_id = %self.model_id,
            tier = self.tier,
            active = self.active,
        );
        counter!("limiter_released_total", "tier" => self.tier).increment(1);
        gauge!("limiter_active", "tier" => self.tier).set(self.active as f64);
    }
}

pub struct SlotQueueTimeout<'a> {
    pub model_id: &'a str,
    pub tier: &'static str,
    pub waited: Duration,
}

impl InternalEvent for SlotQueueTimeout<'_> {
    fn emit(self) {
        warn!(
            message = "Queued admission timed out.",
            model_id = %self.model_id,
            tier = self.tier,
            waited_ms = self.waited.as_millis() as u64,
        );
        counter!("limiter_queue_timeout_total", "tier" => self.tier).increment(1);
    }
}

pub struct SlotRejected<'a> {
    pub model_id: &'a str,
    pub tier: &'static str,
    pub active: usize,
    pub queued: usize,
}

impl InternalEvent for SlotRejected<'_> {
    fn emit(self) {
        warn!(
            message = "Admission rejected, queue full.",
            model_id = %self.model_id,
            tier = self.tier,
            active = self.active,
            queued = self.queued,
        );
        counter!("limiter_rejected_total", "tier" => self.tier).increment(1);
    }
}

pub struct BatchFlushed<'a> {
    pub method: &'a str,
    pub size: usize,
    pub duration: Duration,
}

impl InternalEvent for BatchFlushed<'_> {
    fn emit(self) {
        trace!(
            message = "Batch flushed.",
            method = %self.method,
            size = self.size,
            duration_ms = self.duration.as_millis() as u64,
        );
        counter!("batch_flushed_total", "method" => self.method.to_owned()).increment(1);
        histogram!("batch_size", "method" => self.method.to_owned()).record(self.size as f64);
        histogram!("batch_duration_seconds", "method" => self.method.to_owned())
            .record(self.duration);
    }
}

pub struct BatchLimitAdjusted {
    pub previous: usize,
    pub current: usize,
    pub avg_batch_ms: f64,
}

impl InternalEvent for BatchLimitAdjusted {
    fn emit(self) {
        debug!(
            message = "Adaptive batch size adjusted.",
            previous = self.previous,
            current = self.current,
            avg_batch_ms = self.avg_batch_ms,
        );
        gauge!("batch_max_size").set(self.current as f64);
    }
}

pub struct ModelLoaded<'a> {
    pub model_id: &'a str,
    pub duration: Duration,
    pub cold: bool,
}

impl InternalEvent for ModelLoaded<'_> {
    fn emit(self) {
        info!(
            message = "Model loaded.",
            model_id = %self.model_id,
            duration_ms = self.duration.as_millis() as u64,
            cold = self.cold,
        );
        let kind = if self.cold { "cold" } else { "warm" };
        counter!("model_loaded_total", "kind" => kind).increment(1);
        histogram!("model_load_seconds", "kind" => kind).record(self.duration);
    }
}

pub struct ModelUnloaded<'a> {
    pub model_id: &'a str,
    pub evicted: bool,
}

impl InternalEvent for ModelUnloaded<'_> {
    fn emit(self) {
        info!(
            message = "Model unloaded.",
            model_id = %self.model_id,
            evicted = self.evicted,
        );
        let reason = if self.evicted { "evicted" } else { "requested" };
        counter!("model_unloaded_total", "reason" => reason).increment(1);
    }
}

pub struct ModelPrefetchIssued<'a> {
    pub model_id: &'a str,
    pub confidence: f64,
}

impl InternalEvent for ModelPrefetchIssued<'_> {
    fn emit(self) {
        debug!(
            message = "Prefetch issued.",
            model_id = %self.model_id,
            confidence = self.confidence,
        );
        counter!("model_prefetch_issued_total").increment(1);
    }
}

pub struct ModelPrefetchHit<'a> {
    pub model_id: &'a str,
}

impl InternalEvent for ModelPrefetchHit<'_> {
    fn emit(self) {
        debug!(message = "Prefetch hit.", model_id = %self.model_id);
        counter!("model_prefetch_hit_total").increment(1);
    }
}

pub struct CircuitTransition<'a> {
    pub peer: &'a str,
    pub from: &'static str,
    pub to: &'static str,
}

impl InternalEvent for CircuitTransition<'_> {
    fn emit(self) {
        info!(
            message = "Circuit breaker transition.",
            peer = %self.peer,
            from = self.from,
            to = self.to,
        );
        counter!("circuit_transitions_total", "to" => self.to).increment(1);
    }
}

pub struct WorkerSelected<'a> {
    pub worker_id: &'a str,
    pub model_id: &'a str,
    pub candidates: usize,
}

impl InternalEvent for WorkerSelected<'_> {
    fn emit(self) {
        trace!(
            message = "Worker selected.",
            worker_id = %self.worker_id,
            model_id = %self.model_id,
            candidates = self.candidates,
        );
        counter!("balancer_selected_total").increment(1);
    }
}

pub struct WorkerMarkedOffline<'a> {
    pub worker_id: &'a str,
    pub missed: u32,
}

impl InternalEvent for WorkerMarkedOffline<'_> {
    fn emit(self) {
        warn!(
            message = "Worker marked offline after missed heartbeats.",
            worker_id = %self.worker_id,
            missed = self.missed,
        );
        counter!("worker_offline_total").increment(1);
    }
}

pub struct CanaryCacheCleared {
    pub entries: usize,
}

impl InternalEvent for CanaryCacheCleared {
    fn emit(self) {
        debug!(
            message = "Canary decision cache cleared.",
            entries = self.entries,
        );
        counter!("canary_cache_cleared_total").increment(1);
    }
}
