//! The resolved configuration schema.
//!
//! Kiln does not load configuration files itself; embedders hand it an
//! already-resolved [`KilnConfig`]. Every section deserializes with
//! defaults, so an empty document is a valid, fully-defaulted
//! configuration.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display(
        "rollout percentage for `{name}` must be within [0, 100], got {value}"
    ))]
    InvalidPercentage { name: String, value: f64 },
    #[snafu(display("`max_batch_size` must be within [1, 100], got {value}"))]
    InvalidMaxBatchSize { value: usize },
    #[snafu(display(
        "`min_streams` ({min}) must not exceed `max_streams` ({max})"
    ))]
    InvalidStreamBounds { min: usize, max: usize },
    #[snafu(display(
        "`{name}` must be within (0, 1], got {value}"
    ))]
    InvalidThreshold { name: String, value: f64 },
    #[snafu(display("`pool_size` must be greater than zero"))]
    InvalidPoolSize,
    #[snafu(display(
        "multiplexer hold window is inverted: min {min_ms} ms > max {max_ms} ms"
    ))]
    InvalidHoldWindow { min_ms: u64, max_ms: u64 },
}

/// Top-level resolved configuration.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
    pub transport: TransportConfig,
    pub stream_registry: StreamRegistryConfig,
    pub batch_queue: BatchQueueConfig,
    pub ops_multiplexer: OpsMultiplexerConfig,
    pub model_concurrency_limiter: ConcurrencyLimiterConfig,
    pub model: ModelConfig,
    #[serde(rename = "requestRouting")]
    pub request_routing: RequestRoutingConfig,
    pub feature_flags: FeatureFlagsConfig,
}

impl KilnConfig {
    /// Validates cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let adaptive = &self.stream_registry.adaptive_limits;
        if adaptive.min_streams > adaptive.max_streams {
            return Err(ConfigError::InvalidStreamBounds {
                min: adaptive.min_streams,
                max: adaptive.max_streams,
            });
        }
        for (name, value) in [
            ("scale_up_threshold", adaptive.scale_up_threshold),
            ("scale_down_threshold", adaptive.scale_down_threshold),
        ] {
            if value <= 0.0 || value > 1.0 {
                return Err(ConfigError::InvalidThreshold {
                    name: name.to_owned(),
                    value,
                });
            }
        }
        if self.stream_registry.chunk_pooling.pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize);
        }
        if !(1..=100).contains(&self.batch_queue.max_batch_size) {
            return Err(ConfigError::InvalidMaxBatchSize {
                value: self.batch_queue.max_batch_size,
            });
        }
        if self.ops_multiplexer.min_hold_ms > self.ops_multiplexer.max_hold_ms {
            return Err(ConfigError::InvalidHoldWindow {
                min_ms: self.ops_multiplexer.min_hold_ms,
                max_ms: self.ops_multiplexer.max_hold_ms,
            });
        }
        self.feature_flags.validate()?;
        Ok(())
    }
}

/// Runtime RPC transport settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Default per-request timeout, in milliseconds.
    pub request_timeout_ms: u64,
    /// How long to wait for the runtime to exit on shutdown before killing it.
    pub shutdown_grace_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Stream registry settings.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamRegistryConfig {
    /// Default per-stream timeout, in milliseconds.
    pub default_timeout_ms: u64,
    /// Baseline cap on concurrently active streams. When adaptive limits are
    /// enabled this is only the starting point.
    pub max_active_streams: usize,
    pub adaptive_limits: AdaptiveLimitsConfig,
    pub chunk_pooling: ChunkPoolingConfig,
    pub backpressure: BackpressureConfig,
    /// Per-tenant caps on concurrently active streams. Tenants without an
    /// entry are unbounded.
    pub tenant_budgets: HashMap<String, usize>,
}

impl Default for StreamRegistryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 300_000,
            max_active_streams: 100,
            adaptive_limits: AdaptiveLimitsConfig::default(),
            chunk_pooling: ChunkPoolingConfig::default(),
            backpressure: BackpressureConfig::default(),
            tenant_budgets: HashMap::new(),
        }
    }
}

impl StreamRegistryConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Adaptive admission control for the stream registry.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveLimitsConfig {
    pub enabled: bool,
    pub min_streams: usize,
    pub max_streams: usize,
    /// TTFT the controller steers toward, in milliseconds.
    pub target_ttft_ms: f64,
    /// Utilization above which the limit grows (given healthy TTFT).
    pub scale_up_threshold: f64,
    /// Utilization below which the limit shrinks.
    pub scale_down_threshold: f64,
    pub adjustment_interval_ms: u64,
    pub pid: PidGovernorConfig,
}

impl Default for AdaptiveLimitsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_streams: 10,
            max_streams: 500,
            target_ttft_ms: 2_000.0,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            adjustment_interval_ms: 1_000,
            pid: PidGovernorConfig::default(),
        }
    }
}

impl AdaptiveLimitsConfig {
    pub fn adjustment_interval(&self) -> Duration {
        Duration::from_millis(self.adjustment_interval_ms)
    }
}

/// The PID-governor variant of adaptive admission. Off by default; the
/// threshold rule applies when this is disabled.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PidGovernorConfig {
    pub enabled: bool,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for PidGovernorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kp: 0.05,
            ki: 0.01,
            kd: 0.02,
        }
    }
}

/// Reusable chunk records for the stream fan-out path.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChunkPoolingConfig {
    pub enabled: bool,
    pub pool_size: usize,
    pub pool_cleanup_interval_ms: u64,
}

impl Default for ChunkPoolingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool_size: 128,
            pool_cleanup_interval_ms: 60_000,
        }
    }
}

impl ChunkPoolingConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.pool_cleanup_interval_ms)
    }
}

/// Consumer acknowledgement tracking.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackpressureConfig {
    pub enabled: bool,
    pub max_unacked_chunks: u64,
    pub ack_timeout_ms: u64,
    pub slow_consumer_threshold_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_unacked_chunks: 100,
            ack_timeout_ms: 30_000,
            slow_consumer_threshold_ms: 5_000,
        }
    }
}

impl BackpressureConfig {
    pub fn slow_consumer_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_consumer_threshold_ms)
    }
}

/// Coalescing queue for small batchable RPC calls.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchQueueConfig {
    pub enabled: bool,
    /// Initial batch-size ceiling; adaptive sizing moves it within [1, 100].
    pub max_batch_size: usize,
    /// Debounce before a partial batch flushes, in milliseconds.
    pub flush_interval_ms: u64,
    /// Minimum hold before a high-priority entry forces a flush.
    pub min_hold_ms: u64,
    pub adaptive_sizing: bool,
    pub target_batch_time_ms: f64,
    pub priority_queue: bool,
}

impl Default for BatchQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 32,
            flush_interval_ms: 5,
            min_hold_ms: 1,
            adaptive_sizing: true,
            target_batch_time_ms: 50.0,
            priority_queue: true,
        }
    }
}

impl BatchQueueConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn min_hold(&self) -> Duration {
        Duration::from_millis(self.min_hold_ms)
    }
}

/// Transport-level batch envelope dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpsMultiplexerConfig {
    pub enabled: bool,
    /// Hold window bounds, in milliseconds. The effective hold shrinks from
    /// `max_hold_ms` toward `min_hold_ms` as inflight pressure rises.
    pub min_hold_ms: u64,
    pub max_hold_ms: u64,
    /// Inflight counts between which hold and ceiling interpolate.
    pub low_concurrency_threshold: usize,
    pub high_concurrency_threshold: usize,
    /// Batch ceiling reached at high inflight pressure. At low pressure the
    /// ceiling starts at `low_pressure_batch_size`.
    pub max_batch_size: usize,
    pub low_pressure_batch_size: usize,
}

impl Default for OpsMultiplexerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_hold_ms: 1,
            max_hold_ms: 5,
            low_concurrency_threshold: 4,
            high_concurrency_threshold: 32,
            max_batch_size: 16,
            low_pressure_batch_size: 4,
        }
    }
}

/// Per-tier admission caps for the model concurrency limiter.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcurrencyLimiterConfig {
    pub enabled: bool,
    /// Overrides keyed by tier label (`"30b+"`, `"13b-27b"`, `"7b-13b"`,
    /// `"3b-7b"`, `"<3b"`). Unlisted tiers keep their defaults.
    pub tier_limits: BTreeMap<String, TierLimitsConfig>,
}

impl Default for ConcurrencyLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tier_limits: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TierLimitsConfig {
    pub max_concurrent: usize,
    pub queue_depth: usize,
    pub queue_timeout_ms: u64,
}

/// Model loading, caching, and lifecycle policies.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub default_context_length: usize,
    pub max_loaded_models: usize,
    /// How long an unload waits for in-flight generations to drain.
    pub drain_timeout_ms: u64,
    pub memory_cache: MemoryCacheConfig,
    pub lifecycle: LifecycleConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_context_length: 4_096,
            max_loaded_models: 3,
            drain_timeout_ms: 30_000,
            memory_cache: MemoryCacheConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl ModelConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryCacheConfig {
    pub enabled: bool,
    pub max_cached_models: usize,
    pub eviction_strategy: EvictionStrategy,
    pub warmup_on_start: Vec<String>,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cached_models: 3,
            eviction_strategy: EvictionStrategy::Lru,
            warmup_on_start: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    #[default]
    Lru,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    /// Ready, unpinned, idle models older than this are unloaded.
    pub idle_timeout_ms: u64,
    pub idle_sweep_interval_ms: u64,
    pub prefetch: PrefetchConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 300_000,
            idle_sweep_interval_ms: 60_000,
            prefetch: PrefetchConfig::default(),
        }
    }
}

impl LifecycleConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrefetchConfig {
    pub enabled: bool,
    /// Minimum `P(next | current)` before a transition triggers a prefetch.
    pub min_confidence: f64,
    pub max_concurrency: usize,
    /// A prefetched model accessed within this window counts as a hit.
    pub hit_window_ms: u64,
    /// Number of recent accesses the transition matrix is built over.
    pub history_window: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.4,
            max_concurrency: 2,
            hit_window_ms: 300_000,
            history_window: 100,
        }
    }
}

impl PrefetchConfig {
    pub fn hit_window(&self) -> Duration {
        Duration::from_millis(self.hit_window_ms)
    }
}

/// Controller-side request routing.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct RequestRoutingConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub timeout_ms: u64,
    pub streaming_timeout_ms: u64,
    /// Estimated model bytes are multiplied by this before comparing against
    /// a worker's free memory.
    pub hardware_safety_factor: f64,
    pub heartbeat_interval_ms: u64,
    /// Heartbeats missed in a row before a worker flips to offline.
    pub heartbeat_miss_limit: u32,
}

impl Default for RequestRoutingConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            timeout_ms: 30_000,
            streaming_timeout_ms: 300_000,
            hardware_safety_factor: 1.2,
            heartbeat_interval_ms: 5_000,
            heartbeat_miss_limit: 3,
        }
    }
}

impl RequestRoutingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Failure classes that are safe to retry on another worker. Anything
    /// outside this list fails the request immediately.
    pub retryable: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retryable: vec!["no_responders".to_owned(), "timeout".to_owned()],
        }
    }
}

/// Feature flag and canary rollout configuration.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureFlagsConfig {
    pub features: HashMap<String, FeatureFlagConfig>,
    pub phase_rollout: PhaseRolloutConfig,
    pub emergency: EmergencyConfig,
    pub canary: CanaryConfig,
}

impl FeatureFlagsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, flag) in &self.features {
            if !(0.0..=100.0).contains(&flag.rollout_percentage) {
                return Err(ConfigError::InvalidPercentage {
                    name: name.clone(),
                    value: flag.rollout_percentage,
                });
            }
        }
        if !(0.0..=100.0).contains(&self.phase_rollout.percentage) {
            return Err(ConfigError::InvalidPercentage {
                name: "phase_rollout".to_owned(),
                value: self.phase_rollout.percentage,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureFlagConfig {
    pub enabled: bool,
    pub rollout_percentage: f64,
    pub hash_seed: String,
}

impl Default for FeatureFlagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rollout_percentage: 0.0,
            hash_seed: String::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhaseRolloutConfig {
    pub enabled: bool,
    pub percentage: f64,
    pub hash_seed: String,
}

impl Default for PhaseRolloutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            percentage: 100.0,
            hash_seed: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmergencyConfig {
    pub kill_switch: bool,
    pub rollback_to_baseline: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CanaryConfig {
    pub cache_size: usize,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self { cache_size: 1_024 }
    }
}
