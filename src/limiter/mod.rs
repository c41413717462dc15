//! The model-size-aware concurrency limiter.
//!
//! The limiter is the only admission gate for GPU work: a slot must be
//! acquired before the `generate` RPC is issued and released on every
//! terminal stream transition. Models are classified into coarse tiers by
//! the parameter count embedded in their id, and each tier caps how many
//! generations may run at once plus how many may wait in line.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, LazyLock},
    time::Duration,
};

use parking_lot::Mutex;
use regex::Regex;
use snafu::Snafu;
use tokio::{
    sync::oneshot,
    time::{Instant, timeout},
};

use crate::{
    config::{ConcurrencyLimiterConfig, TierLimitsConfig},
    internal_events::{
        SlotAdmitted, SlotQueueTimeout, SlotQueued, SlotRejected, SlotReleased, emit,
    },
};

/// Coarse parameter-count class of a model, used solely to cap GPU
/// concurrency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelTier {
    /// ≥ 30B parameters.
    XLarge,
    /// 13–30B parameters. The config label is `13b-27b`; ids between 27B
    /// and the 30B cutoff land here as well.
    Large,
    /// 7–13B parameters.
    Medium,
    /// 3–7B parameters.
    Small,
    /// < 3B parameters.
    XSmall,
}

static PARAM_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)b").expect("hardcoded regex is valid"));

impl ModelTier {
    pub const ALL: [Self; 5] = [
        Self::XLarge,
        Self::Large,
        Self::Medium,
        Self::Small,
        Self::XSmall,
    ];

    /// Classifies a model id by the first `<number>b` token in it, skipping
    /// the literal `byte`. Ids without a recognizable parameter count land
    /// in the middle tier.
    pub fn classify(model_id: &str) -> Self {
        let lowered = model_id.to_lowercase();
        for capture in PARAM_COUNT.captures_iter(&lowered) {
            let whole = capture.get(0).expect("match always has group 0");
            if lowered[whole.end()..].starts_with("yte") {
                continue;
            }
            let Ok(billions) = capture[1].parse::<f64>() else {
                continue;
            };
            return Self::from_billions(billions);
        }
        Self::Medium
    }

    fn from_billions(billions: f64) -> Self {
        if billions >= 30.0 {
            Self::XLarge
        } else if billions >= 13.0 {
            Self::Large
        } else if billions >= 7.0 {
            Self::Medium
        } else if billions >= 3.0 {
            Self::Small
        } else {
            Self::XSmall
        }
    }

    /// The label used for config overrides and metric tags.
    pub fn label(self) -> &'static str {
        match self {
            Self::XLarge => "30b+",
            Self::Large => "13b-27b",
            Self::Medium => "7b-13b",
            Self::Small => "3b-7b",
            Self::XSmall => "<3b",
        }
    }

    /// Rough weight-file size used by hardware-fit filtering.
    pub fn estimated_bytes(self) -> u64 {
        const GIB: u64 = 1024 * 1024 * 1024;
        match self {
            Self::XLarge => 32 * GIB,
            Self::Large => 16 * GIB,
            Self::Medium => 8 * GIB,
            Self::Small => 4 * GIB,
            Self::XSmall => 2 * GIB,
        }
    }

    fn default_limits(self) -> TierLimits {
        let (max_concurrent, queue_depth, queue_timeout_secs) = match self {
            Self::XLarge => (2, 10, 60),
            Self::Large => (4, 20, 45),
            Self::Medium => (6, 30, 30),
            Self::Small => (8, 40, 30),
            Self::XSmall => (10, 50, 30),
        };
        TierLimits {
            max_concurrent,
            queue_depth,
            queue_timeout: Duration::from_secs(queue_timeout_secs),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TierLimits {
    pub max_concurrent: usize,
    pub queue_depth: usize,
    pub queue_timeout: Duration,
}

impl From<&TierLimitsConfig> for TierLimits {
    fn from(config: &TierLimitsConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            queue_depth: config.queue_depth,
            queue_timeout: Duration::from_millis(config.queue_timeout_ms),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum AcquireError {
    #[snafu(display(
        "admission queue for `{model_id}` is full ({active} active, {queued} queued)"
    ))]
    LimitExceeded {
        model_id: String,
        active: usize,
        queued: usize,
    },
    #[snafu(display("queued admission for `{model_id}` timed out after {waited_ms} ms"))]
    QueueTimeout { model_id: String, waited_ms: u64 },
    #[snafu(display("limiter is shutting down"))]
    Shutdown,
}

struct Waiter {
    request_id: String,
    tx: oneshot::Sender<()>,
}

struct ModelSlots {
    tier: ModelTier,
    active: HashSet<String>,
    queue: VecDeque<Waiter>,
}

struct LimiterInner {
    enabled: bool,
    limits: HashMap<ModelTier, TierLimits>,
    models: Mutex<HashMap<String, ModelSlots>>,
}

/// Tiered admission over `(model_id, request_id)` pairs.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

impl ConcurrencyLimiter {
    pub fn new(config: &ConcurrencyLimiterConfig) -> Self {
        let mut limits: HashMap<ModelTier, TierLimits> = ModelTier::ALL
            .iter()
            .map(|tier| (*tier, tier.default_limits()))
            .collect();
        for tier in ModelTier::ALL {
            if let Some(overrides) = config.tier_limits.get(tier.label()) {
                limits.insert(tier, overrides.into());
            }
        }

        Self {
            inner: Arc::new(LimiterInner {
                enabled: config.enabled,
                limits,
                models: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn limits_for(&self, tier: ModelTier) -> TierLimits {
        self.inner.limits[&tier]
    }

    /// Acquires a slot for `(model_id, request_id)`.
    ///
    /// Admits immediately while the tier has headroom, waits in a FIFO queue
    /// while the queue has headroom, and fails fast once both are full. A
    /// queued acquisition that outlives the tier's queue timeout fails with
    /// [`AcquireError::QueueTimeout`].
    pub async fn acquire(&self, model_id: &str, request_id: &str) -> Result<(), AcquireError> {
        if !self.inner.enabled {
            return Ok(());
        }

        let tier = ModelTier::classify(model_id);
        let limits = self.inner.limits[&tier];

        let mut rx = {
            let mut models = self.inner.models.lock();
            let slots = models.entry(model_id.to_owned()).or_insert_with(|| ModelSlots {
                tier,
                active: HashSet::new(),
                queue: VecDeque::new(),
            });

            if slots.active.len() < limits.max_concurrent {
                slots.active.insert(request_id.to_owned());
                let active = slots.active.len();
                drop(models);
                emit(SlotAdmitted {
                    model_id,
                    tier: tier.label(),
                    active,
                });
                return Ok(());
            }

            if slots.queue.len() >= limits.queue_depth {
                let (active, queued) = (slots.active.len(), slots.queue.len());
                drop(models);
                emit(SlotRejected {
                    model_id,
                    tier: tier.label(),
                    active,
                    queued,
                });
                return Err(AcquireError::LimitExceeded {
                    model_id: model_id.to_owned(),
                    active,
                    queued,
                });
            }

            let (tx, rx) = oneshot::channel();
            slots.queue.push_back(Waiter {
                request_id: request_id.to_owned(),
                tx,
            });
            let queued = slots.queue.len();
            drop(models);
            emit(SlotQueued {
                model_id,
                tier: tier.label(),
                queued,
            });
            rx
        };

        let enqueued_at = Instant::now();
        match timeout(limits.queue_timeout, &mut rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AcquireError::Shutdown),
            Err(_) => {
                let mut models = self.inner.models.lock();
                // An admission may have raced the timeout; the permit
                // transfers to us if so.
                if rx.try_recv().is_ok() {
                    return Ok(());
                }
                if let Some(slots) = models.get_mut(model_id) {
                    slots
                        .queue
                        .retain(|waiter| waiter.request_id != request_id);
                }
                drop(models);
                let waited = enqueued_at.elapsed();
                emit(SlotQueueTimeout {
                    model_id,
                    tier: tier.label(),
                    waited,
                });
                Err(AcquireError::QueueTimeout {
                    model_id: model_id.to_owned(),
                    waited_ms: waited.as_millis() as u64,
                })
            }
        }
    }

    /// Releases the slot held by `(model_id, request_id)` and admits the
    /// next queued waiter, if any. Releasing a slot that is not held is a
    /// logged no-op.
    pub fn release(&self, model_id: &str, request_id: &str) {
        if !self.inner.enabled {
            return;
        }

        let mut admitted = None;
        let mut released = None;
        {
            let mut models = self.inner.models.lock();
            let Some(slots) = models.get_mut(model_id) else {
                warn!(
                    message = "Release for unknown model.",
                    model_id = %model_id,
                    request_id = %request_id,
                );
                return;
            };

            if !slots.active.remove(request_id) {
                warn!(
                    message = "Double release of concurrency slot.",
                    model_id = %model_id,
                    request_id = %request_id,
                );
                return;
            }
            released = Some((slots.tier, slots.active.len()));

            while let Some(waiter) = slots.queue.pop_front() {
                // A waiter whose receiver is gone timed out and removed
                // itself; skip it and admit the next in line.
                slots.active.insert(waiter.request_id.clone());
                if waiter.tx.send(()).is_ok() {
                    admitted = Some((slots.tier, slots.active.len()));
                    break;
                }
                slots.active.remove(&waiter.request_id);
            }

            if slots.active.is_empty() && slots.queue.is_empty() {
                models.remove(model_id);
            }
        }

        if let Some((tier, active)) = released {
            emit(SlotReleased {
                model_id,
                tier: tier.label(),
                active,
            });
        }
        if let Some((tier, active)) = admitted {
            emit(SlotAdmitted {
                model_id,
                tier: tier.label(),
                active,
            });
        }
    }

    pub fn active_count(&self, model_id: &str) -> usize {
        self.inner
            .models
            .lock()
            .get(model_id)
            .map_or(0, |slots| slots.active.len())
    }

    pub fn queued_count(&self, model_id: &str) -> usize {
        self.inner
            .models
            .lock()
            .get(model_id)
            .map_or(0, |slots| slots.queue.len())
    }

    /// Fails every queued waiter. Active slots are left to their owners.
    pub fn shutdown(&self) {
        let mut models = self.inner.models.lock();
        for slots in models.values_mut() {
            slots.queue.clear();
        }
    }
}
