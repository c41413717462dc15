//! Lifecycle policies over the model manager.
//!
//! Three policies run here: LRU-with-pinning capacity enforcement after
//! every load, an idle-drain sweep that unloads models nobody has touched
//! in a while, and transition-based prefetch that watches which model tends
//! to follow which and warms the likely next one ahead of time.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

use super::{ModelEvent, ModelManager, ModelState};
use crate::{
    config::{LifecycleConfig, ModelConfig, PrefetchConfig},
    internal_events::{ModelPrefetchHit, ModelPrefetchIssued, emit},
};

#[derive(Clone, Copy, Debug, Default)]
pub struct LifecycleMetrics {
    pub avg_cold_load_ms: Option<f64>,
    pub avg_warm_load_ms: Option<f64>,
    pub unloads: u64,
    pub evictions: u64,
    pub prefetch_issued: u64,
    pub prefetch_hits: u64,
    pub estimated_memory_bytes: u64,
}

impl LifecycleMetrics {
    pub fn prefetch_hit_rate(&self) -> f64 {
        if self.prefetch_issued == 0 {
            0.0
        } else {
            self.prefetch_hits as f64 / self.prefetch_issued as f64
        }
    }
}

#[derive(Default)]
struct LifecycleState {
    last_accessed: Option<String>,
    /// Transition history bounded to the configured window; counts in
    /// `transitions` decrement as pairs age out.
    recent: VecDeque<(String, String)>,
    transitions: HashMap<String, HashMap<String, u64>>,
    /// Prefetches whose target has not been accessed yet, by issue time.
    prefetched: HashMap<String, Instant>,
    prefetch_inflight: usize,
    cold_total_ms: f64,
    cold_count: u64,
    warm_total_ms: f64,
    warm_count: u64,
    unloads: u64,
    evictions: u64,
    prefetch_issued: u64,
    prefetch_hits: u64,
    overflow_logged: bool,
}

struct LifecycleShared {
    manager: ModelManager,
    capacity: usize,
    config: LifecycleConfig,
    state: Mutex<LifecycleState>,
}

#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<LifecycleShared>,
}

impl LifecycleManager {
    pub fn new(manager: ModelManager, model_config: &ModelConfig) -> Self {
        Self {
            inner: Arc::new(LifecycleShared {
                manager,
                capacity: model_config.max_loaded_models,
                config: model_config.lifecycle.clone(),
                state: Mutex::new(LifecycleState::default()),
            }),
        }
    }

    /// Consumes model events and runs the idle sweep until the event
    /// channel closes.
    pub fn run(&self, mut events: mpsc::UnboundedReceiver<ModelEvent>) -> JoinHandle<()> {
        let lifecycle = self.clone();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(lifecycle.inner.config.idle_sweep_interval());
            sweep.tick().await;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => lifecycle.handle_event(event).await,
                        None => break,
                    },
                    _ = sweep.tick() => lifecycle.idle_sweep().await,
                }
            }
        })
    }

    async fn handle_event(&self, event: ModelEvent) {
        match event {
            ModelEvent::Loaded {
                model_id,
                duration,
                cold,
            } => {
                {
                    let mut state = self.inner.state.lock();
                    let ms = duration.as_secs_f64() * 1_000.0;
                    if cold {
                        state.cold_total_ms += ms;
                        state.cold_count += 1;
                    } else {
                        state.warm_total_ms += ms;
                        state.warm_count += 1;
                    }
                }
                self.enforce_capacity(&model_id).await;
            }
            ModelEvent::Accessed { model_id } => self.handle_accessed(model_id),
            ModelEvent::Unloaded { model_id } => {
                let mut state = self.inner.state.lock();
                state.unloads += 1;
                state.prefetched.remove(&model_id);
            }
        }
    }

    /// Evicts least-recently-accessed unpinned models until the loaded set
    /// fits the capacity again. The model that just loaded is never the
    /// eviction victim.
    async fn enforce_capacity(&self, just_loaded: &str) {
        let loaded: Vec<_> = self
            .inner
            .manager
            .loaded_models()
            .into_iter()
            .filter(|snapshot| snapshot.state == ModelState::Ready)
            .collect();
        if loaded.len() <= self.inner.capacity {
            return;
        }

        let mut candidates: Vec<_> = loaded
            .iter()
            .filter(|snapshot| !snapshot.pinned && snapshot.model_id != just_loaded)
            .collect();
        if candidates.is_empty() {
            let mut state = self.inner.state.lock();
            if !state.overflow_logged {
                state.overflow_logged = true;
                warn!(
                    message = "Loaded models exceed capacity but all are pinned.",
                    loaded = loaded.len(),
                    capacity = self.inner.capacity,
                );
            }
            return;
        }
        // Most idle first; ties keep id order from the snapshot.
        candidates.sort_by(|a, b| b.idle_for.cmp(&a.idle_for));

        let excess = loaded.len() - self.inner.capacity;
        for victim in candidates.into_iter().take(excess) {
            self.inner.state.lock().evictions += 1;
            if let Err(error) = self
                .inner
                .manager
                .unload_with_reason(&victim.model_id, true)
                .await
            {
                warn!(
                    message = "Capacity eviction failed.",
                    model_id = %victim.model_id,
                    %error,
                );
            }
        }
    }

    fn handle_accessed(&self, model_id: String) {
        let prefetch = &self.inner.config.prefetch;
        let predictions = {
            let mut state = self.inner.state.lock();

            if let Some(issued_at) = state.prefetched.remove(&model_id) {
                if issued_at.elapsed() <= prefetch.hit_window() {
                    state.prefetch_hits += 1;
                    emit(ModelPrefetchHit {
                        model_id: &model_id,
                    });
                }
            }

            if let Some(previous) = state.last_accessed.clone() {
                if previous != model_id {
                    record_transition(&mut state, previous, model_id.clone(), prefetch);
                }
            }
            state.last_accessed = Some(model_id.clone());

            if prefetch.enabled {
                predict(&state, &model_id, prefetch.min_confidence)
            } else {
                Vec::new()
            }
        };

        for (target, confidence) in predictions {
            if self.inner.manager.state(&target) != ModelState::Unloaded {
                continue;
            }
            {
                let mut state = self.inner.state.lock();
                if state.prefetch_inflight >= prefetch.max_concurrency {
                    break;
                }
                state.prefetch_inflight += 1;
                state.prefetch_issued += 1;
                state.prefetched.insert(target.clone(), Instant::now());
            }
            emit(ModelPrefetchIssued {
                model_id: &target,
                confidence,
            });

            let lifecycle = self.clone();
            tokio::spawn(async move {
                if let Err(error) = lifecycle.inner.manager.load_model(&target).await {
                    debug!(
                        message = "Prefetch load failed.",
                        model_id = %target,
                        %error,
                    );
                    lifecycle.inner.state.lock().prefetched.remove(&target);
                }
                lifecycle.inner.state.lock().prefetch_inflight -= 1;
            });
        }
    }

    /// Unloads Ready, unpinned, idle models past the idle timeout.
    async fn idle_sweep(&self) {
        let idle_timeout = self.inner.config.idle_timeout();
        let idle: Vec<String> = self
            .inner
            .manager
            .loaded_models()
            .into_iter()
            .filter(|snapshot| {
                snapshot.state == ModelState::Ready
                    && !snapshot.pinned
                    && snapshot.in_flight == 0
                    && snapshot.idle_for >= idle_timeout
            })
            .map(|snapshot| snapshot.model_id)
            .collect();

        for model_id in idle {
            debug!(message = "Idle-draining model.", model_id = %model_id);
            if let Err(error) = self.inner.manager.unload_with_reason(&model_id, false).await {
                warn!(
                    message = "Idle drain failed.",
                    model_id = %model_id,
                    %error,
                );
            }
        }
    }

    pub fn metrics(&self) -> LifecycleMetrics {
        let state = self.inner.state.lock();
        let avg = |total: f64, count: u64| {
            if count == 0 {
                None
            } else {
                Some(total / count as f64)
            }
        };
        LifecycleMetrics {
            avg_cold_load_ms: avg(state.cold_total_ms, state.cold_count),
            avg_warm_load_ms: avg(state.warm_total_ms, state.warm_count),
            unloads: state.unloads,
            evictions: state.evictions,
            prefetch_issued: state.prefetch_issued,
            prefetch_hits: state.prefetch_hits,
            estimated_memory_bytes: self.inner.manager.estimated_memory_bytes(),
        }
    }
}

fn record_transition(
    state: &mut LifecycleState,
    from: String,
    to: String,
    prefetch: &PrefetchConfig,
) {
    *state
        .transitions
        .entry(from.clone())
        .or_default()
        .entry(to.clone())
        .or_insert(0) += 1;
    state.recent.push_back((from, to));

    while state.recent.len() > prefetch.history_window {
        let Some((old_from, old_to)) = state.recent.pop_front() else {
            break;
        };
        if let Some(outgoing) = state.transitions.get_mut(&old_from) {
            if let Some(count) = outgoing.get_mut(&old_to) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    outgoing.remove(&old_to);
                }
            }
            if outgoing.is_empty() {
                state.transitions.remove(&old_from);
            }
        }
    }
}

/// `P(to | from)` over the observed transitions, best first.
fn predict(state: &LifecycleState, from: &str, min_confidence: f64) -> Vec<(String, f64)> {
    let Some(outgoing) = state.transitions.get(from) else {
        return Vec::new();
    };
    let total: u64 = outgoing.values().sum();
    if total == 0 {
        return Vec::new();
    }

    let mut predictions: Vec<(String, f64)> = outgoing
        .iter()
        .map(|(to, count)| (to.clone(), *count as f64 / total as f64))
        .filter(|(_, confidence)| *confidence >= min_confidence)
        .collect();
    predictions
        .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    predictions
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::test_util::{MockReply, MockRuntime};

    async fn drain_events(
        lifecycle: &LifecycleManager,
        events: &mut mpsc::UnboundedReceiver<ModelEvent>,
    ) {
        while let Ok(event) = events.try_recv() {
            lifecycle.handle_event(event).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lru_evicts_the_least_recently_accessed() {
        let (transport, _runtime) = MockRuntime::start();
        let config = ModelConfig {
            max_loaded_models: 2,
            ..ModelConfig::default()
        };
        let (manager, mut events) = ModelManager::new(transport, config.clone());
        let lifecycle = LifecycleManager::new(manager.clone(), &config);

        manager.load_model("alpha-7b").await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        manager.load_model("bravo-7b").await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        drain_events(&lifecycle, &mut events).await;

        manager.load_model("charlie-7b").await.unwrap();
        drain_events(&lifecycle, &mut events).await;

        // alpha is the oldest access and must be the one evicted.
        assert_eq!(manager.state("alpha-7b"), ModelState::Unloaded);
        assert_eq!(manager.state("bravo-7b"), ModelState::Ready);
        assert_eq!(manager.state("charlie-7b"), ModelState::Ready);
        assert_eq!(lifecycle.metrics().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_models_are_never_evicted() {
        let (transport, _runtime) = MockRuntime::start();
        let config = ModelConfig {
            max_loaded_models: 2,
            ..ModelConfig::default()
        };
        let (manager, mut events) = ModelManager::new(transport, config.clone());
        let lifecycle = LifecycleManager::new(manager.clone(), &config);

        manager.load_model("alpha-7b").await.unwrap();
        manager.pin("alpha-7b", true).unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        manager.load_model("bravo-7b").await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        drain_events(&lifecycle, &mut events).await;

        manager.load_model("charlie-7b").await.unwrap();
        drain_events(&lifecycle, &mut events).await;

        // alpha is older but pinned; bravo takes the eviction.
        assert_eq!(manager.state("alpha-7b"), ModelState::Ready);
        assert_eq!(manager.state("bravo-7b"), ModelState::Unloaded);
        assert_eq!(manager.state("charlie-7b"), ModelState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn all_pinned_overflow_is_logged_not_evicted() {
        let (transport, _runtime) = MockRuntime::start();
        let config = ModelConfig {
            max_loaded_models: 1,
            ..ModelConfig::default()
        };
        let (manager, mut events) = ModelManager::new(transport, config.clone());
        let lifecycle = LifecycleManager::new(manager.clone(), &config);

        manager.load_model("alpha-7b").await.unwrap();
        manager.pin("alpha-7b", true).unwrap();
        manager.load_model("bravo-7b").await.unwrap();
        manager.pin("bravo-7b", true).unwrap();
        drain_events(&lifecycle, &mut events).await;

        assert_eq!(manager.state("alpha-7b"), ModelState::Ready);
        assert_eq!(manager.state("bravo-7b"), ModelState::Ready);
        assert_eq!(lifecycle.metrics().evictions, 0);
        assert!(lifecycle.inner.state.lock().overflow_logged);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_unloads_only_idle_unpinned_models() {
        let (transport, _runtime) = MockRuntime::start();
        let mut config = ModelConfig::default();
        config.lifecycle.idle_timeout_ms = 100;
        let (manager, mut events) = ModelManager::new(transport, config.clone());
        let lifecycle = LifecycleManager::new(manager.clone(), &config);

        manager.load_model("alpha-7b").await.unwrap();
        manager.load_model("bravo-7b").await.unwrap();
        manager.pin("bravo-7b", true).unwrap();
        drain_events(&lifecycle, &mut events).await;

        tokio::time::advance(Duration::from_millis(50)).await;
        lifecycle.idle_sweep().await;
        assert_eq!(manager.state("alpha-7b"), ModelState::Ready);

        tokio::time::advance(Duration::from_millis(100)).await;
        lifecycle.idle_sweep().await;
        assert_eq!(manager.state("alpha-7b"), ModelState::Unloaded);
        assert_eq!(manager.state("bravo-7b"), ModelState::Ready);
        assert_eq!(lifecycle.metrics().unloads, 0);

        drain_events(&lifecycle, &mut events).await;
        assert_eq!(lifecycle.metrics().unloads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_transitions_trigger_a_prefetch_and_count_hits() {
        let (transport, runtime) = MockRuntime::start();
        runtime.handle("load_model", |_| MockReply::Result(json!({})));
        let config = ModelConfig::default();
        let (manager, _events) = ModelManager::new(transport, config.clone());
        let lifecycle = LifecycleManager::new(manager.clone(), &config);

        // Teach the matrix that bravo follows alpha. Neither access has a
        // predictable successor yet, so nothing prefetches.
        lifecycle
            .handle_event(ModelEvent::Accessed {
                model_id: "alpha-7b".to_owned(),
            })
            .await;
        lifecycle
            .handle_event(ModelEvent::Accessed {
                model_id: "bravo-7b".to_owned(),
            })
            .await;
        assert_eq!(lifecycle.metrics().prefetch_issued, 0);

        // The next alpha access predicts bravo with full confidence.
        lifecycle
            .handle_event(ModelEvent::Accessed {
                model_id: "alpha-7b".to_owned(),
            })
            .await;
        // Let the spawned prefetch load run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(lifecycle.metrics().prefetch_issued, 1);
        assert_eq!(manager.state("bravo-7b"), ModelState::Ready);

        // Accessing the prefetched model inside the window is a hit.
        lifecycle
            .handle_event(ModelEvent::Accessed {
                model_id: "bravo-7b".to_owned(),
            })
            .await;
        assert_eq!(lifecycle.metrics().prefetch_hits, 1);
    }

    #[tokio::test]
    async fn low_confidence_transitions_do_not_prefetch() {
        let (transport, _runtime) = MockRuntime::start();
        let config = ModelConfig::default();
        let (manager, _events) = ModelManager::new(transport, config.clone());
        let lifecycle = LifecycleManager::new(manager.clone(), &config);

        // alpha is followed by three different models equally often, so no
        // successor clears the 0.4 confidence bar.
        {
            let mut state = lifecycle.inner.state.lock();
            let outgoing: HashMap<String, u64> =
                [("bravo-7b", 1), ("charlie-7b", 1), ("delta-7b", 1)]
                    .into_iter()
                    .map(|(id, count)| (id.to_owned(), count))
                    .collect();
            state.transitions.insert("alpha-7b".to_owned(), outgoing);
        }

        lifecycle
            .handle_event(ModelEvent::Accessed {
                model_id: "alpha-7b".to_owned(),
            })
            .await;
        tokio::task::yield_now().await;

        assert_eq!(lifecycle.metrics().prefetch_issued, 0);
        assert_eq!(manager.state("bravo-7b"), ModelState::Unloaded);
    }

    #[tokio::test]
    async fn transition_history_is_windowed() {
        let (transport, _runtime) = MockRuntime::start();
        let mut config = ModelConfig::default();
        config.lifecycle.prefetch.history_window = 1;
        let (manager, _events) = ModelManager::new(transport, config.clone());
        let lifecycle = LifecycleManager::new(manager.clone(), &config);

        for id in ["alpha-7b", "bravo-7b", "charlie-7b"] {
            lifecycle
                .handle_event(ModelEvent::Accessed {
                    model_id: id.to_owned(),
                })
                .await;
        }

        // Only the newest transition survives the window of one.
        let state = lifecycle.inner.state.lock();
        assert!(!state.transitions.contains_key("alpha-7b"));
        assert_eq!(state.transitions["bravo-7b"]["charlie-7b"], 1);
    }

    #[tokio::test]
    async fn load_time_metrics_split_cold_and_warm() {
        let (transport, _runtime) = MockRuntime::start();
        let config = ModelConfig::default();
        let (manager, _events) = ModelManager::new(transport, config.clone());
        let lifecycle = LifecycleManager::new(manager.clone(), &config);

        lifecycle
            .handle_event(ModelEvent::Loaded {
                model_id: "alpha-7b".to_owned(),
                duration: Duration::from_millis(100),
                cold: true,
            })
            .await;
        lifecycle
            .handle_event(ModelEvent::Loaded {
                model_id: "alpha-7b".to_owned(),
                duration: Duration::from_millis(40),
                cold: false,
            })
            .await;
        lifecycle
            .handle_event(ModelEvent::Loaded {
                model_id: "alpha-7b".to_owned(),
                duration: Duration::from_millis(60),
                cold: false,
            })
            .await;

        let metrics = lifecycle.metrics();
        assert_eq!(metrics.avg_cold_load_ms, Some(100.0));
        assert_eq!(metrics.avg_warm_load_ms, Some(50.0));
    }
}
