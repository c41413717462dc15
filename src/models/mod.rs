//! Model loading, caching, and draft pairing.
//!
//! The manager owns one entry per model the runtime knows about. Concurrent
//! loads of the same model coalesce onto a single in-flight RPC, unloads
//! drain in-flight generations first, and every state change is reported on
//! an event channel the lifecycle manager consumes.

mod lifecycle;

pub use lifecycle::{LifecycleManager, LifecycleMetrics};

use std::{
    collections::{HashMap, HashSet},
    mem,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snafu::Snafu;
use tokio::{
    sync::{Notify, mpsc, oneshot},
    time::Instant,
};

use crate::{
    config::ModelConfig,
    internal_events::{ModelLoaded, ModelUnloaded, emit},
    rpc::{RequestOptions, RpcTransport},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Draining,
    Unloading,
}

#[derive(Clone, Debug, Snafu)]
pub enum ModelError {
    #[snafu(display("failed to load model `{model_id}`: {message}"))]
    LoadFailed { model_id: String, message: String },
    #[snafu(display("failed to unload model `{model_id}`: {message}"))]
    UnloadFailed { model_id: String, message: String },
    #[snafu(display("model `{model_id}` is not loaded"))]
    NotLoaded { model_id: String },
    #[snafu(display("model `{model_id}` is busy in state {state:?}"))]
    Busy {
        model_id: String,
        state: ModelState,
    },
    #[snafu(display("draft compatibility check failed: {message}"))]
    DraftCheck { message: String },
}

/// Lifecycle-facing notification of a model state change.
#[derive(Clone, Debug)]
pub enum ModelEvent {
    Loaded {
        model_id: String,
        duration: Duration,
        cold: bool,
    },
    Accessed {
        model_id: String,
    },
    Unloaded {
        model_id: String,
    },
}

/// Point-in-time view of one entry.
#[derive(Clone, Debug)]
pub struct ModelEntrySnapshot {
    pub model_id: String,
    pub state: ModelState,
    pub pinned: bool,
    pub in_flight: usize,
    pub idle_for: Duration,
    pub load_count: u64,
    pub memory_bytes: Option<u64>,
}

/// Result of a `check_draft` call.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DraftReport {
    pub compatible: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DraftPairing {
    pub primary: String,
    pub draft: String,
}

struct Entry {
    state: ModelState,
    pinned: bool,
    in_flight: usize,
    last_accessed_at: Instant,
    load_count: u64,
    memory_bytes: Option<u64>,
    waiters: Vec<oneshot::Sender<Result<(), ModelError>>>,
    drained: Arc<Notify>,
}

impl Entry {
    fn new_loading() -> Self {
        Self {
            state: ModelState::Loading,
            pinned: false,
            in_flight: 0,
            last_accessed_at: Instant::now(),
            load_count: 0,
            memory_bytes: None,
            waiters: Vec::new(),
            drained: Arc::new(Notify::new()),
        }
    }
}

struct ManagerInner {
    transport: Arc<RpcTransport>,
    config: ModelConfig,
    entries: Mutex<HashMap<String, Entry>>,
    /// Every id that has ever completed a load; first-time loads are cold.
    seen: Mutex<HashSet<String>>,
    events: mpsc::UnboundedSender<ModelEvent>,
    draft_pair: Mutex<Option<DraftPairing>>,
}

impl ManagerInner {
    fn send_event(&self, event: ModelEvent) {
        // The lifecycle manager may be gone during shutdown; that is fine.
        let _ = self.events.send(event);
    }
}

#[derive(Clone)]
pub struct ModelManager {
    inner: Arc<ManagerInner>,
}

/// Keeps a model's `in_flight` count up for the duration of a generation.
/// Dropping the guard wakes any drain waiting on the model.
pub struct UsageGuard {
    inner: Arc<ManagerInner>,
    model_id: String,
}

impl std::fmt::Debug for UsageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageGuard")
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(&self.model_id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            if entry.in_flight == 0 && entry.state == ModelState::Draining {
                entry.drained.notify_waiters();
            }
        }
    }
}

enum LoadAction {
    Hit,
    Wait(oneshot::Receiver<Result<(), ModelError>>),
    Load,
}

impl ModelManager {
    pub fn new(
        transport: Arc<RpcTransport>,
        config: ModelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ModelEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(ManagerInner {
                transport,
                config,
                entries: Mutex::new(HashMap::new()),
                seen: Mutex::new(HashSet::new()),
                events,
                draft_pair: Mutex::new(None),
            }),
        };
        (manager, events_rx)
    }

    /// Ensures `model_id` is loaded.
    ///
    /// A Ready entry is a cache hit. Concurrent callers while a load is in
    /// flight share the outcome of that single `load_model` RPC.
    pub async fn load_model(&self, model_id: &str) -> Result<(), ModelError> {
        let action = {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(model_id) {
                Some(entry) if entry.state == ModelState::Ready => {
                    entry.last_accessed_at = Instant::now();
                    LoadAction::Hit
                }
                Some(entry) if entry.state == ModelState::Loading => {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    LoadAction::Wait(rx)
                }
                Some(entry) => {
                    return Err(ModelError::Busy {
                        model_id: model_id.to_owned(),
                        state: entry.state,
                    });
                }
                None => {
                    entries.insert(model_id.to_owned(), Entry::new_loading());
                    LoadAction::Load
                }
            }
        };

        match action {
            LoadAction::Hit => Ok(()),
            LoadAction::Wait(rx) => rx.await.unwrap_or_else(|_| {
                Err(ModelError::LoadFailed {
                    model_id: model_id.to_owned(),
                    message: "load was abandoned".to_owned(),
                })
            }),
            LoadAction::Load => self.run_load(model_id).await,
        }
    }

    async fn run_load(&self, model_id: &str) -> Result<(), ModelError> {
        let started = Instant::now();
        let outcome = self
            .inner
            .transport
            .request(
                "load_model",
                json!({ "model_id": model_id }),
                RequestOptions::default(),
            )
            .await;
        let duration = started.elapsed();

        match outcome {
            Ok(value) => {
                let waiters = {
                    let mut entries = self.inner.entries.lock();
                    let Some(entry) = entries.get_mut(model_id) else {
                        return Err(ModelError::LoadFailed {
                            model_id: model_id.to_owned(),
                            message: "entry vanished during load".to_owned(),
                        });
                    };
                    entry.state = ModelState::Ready;
                    entry.last_accessed_at = Instant::now();
                    entry.load_count += 1;
                    entry.memory_bytes = value.get("memory_bytes").and_then(Value::as_u64);
                    mem::take(&mut entry.waiters)
                };
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }

                let cold = self.inner.seen.lock().insert(model_id.to_owned());
                emit(ModelLoaded {
                    model_id,
                    duration,
                    cold,
                });
                self.inner.send_event(ModelEvent::Loaded {
                    model_id: model_id.to_owned(),
                    duration,
                    cold,
                });
                Ok(())
            }
            Err(error) => {
                let failure = ModelError::LoadFailed {
                    model_id: model_id.to_owned(),
                    message: error.to_string(),
                };
                let waiters = {
                    let mut entries = self.inner.entries.lock();
                    entries
                        .remove(model_id)
                        .map(|entry| entry.waiters)
                        .unwrap_or_default()
                };
                for waiter in waiters {
                    let _ = waiter.send(Err(failure.clone()));
                }
                warn!(
                    message = "Model load failed.",
                    model_id = %model_id,
                    error = %failure,
                );
                Err(failure)
            }
        }
    }

    /// Unloads a Ready model, draining in-flight generations first. The
    /// drain gives up after the configured timeout and unloads anyway.
    pub async fn unload_model(&self, model_id: &str) -> Result<(), ModelError> {
        self.unload_with_reason(model_id, false).await
    }

    pub(crate) async fn unload_with_reason(
        &self,
        model_id: &str,
        evicted: bool,
    ) -> Result<(), ModelError> {
        let drain = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(model_id) else {
                return Err(ModelError::NotLoaded {
                    model_id: model_id.to_owned(),
                });
            };
            match entry.state {
                ModelState::Ready if entry.in_flight > 0 => {
                    entry.state = ModelState::Draining;
                    Some(Arc::clone(&entry.drained))
                }
                ModelState::Ready => {
                    entry.state = ModelState::Unloading;
                    None
                }
                state => {
                    return Err(ModelError::Busy {
                        model_id: model_id.to_owned(),
                        state,
                    });
                }
            }
        };

        if let Some(notify) = drain {
            let deadline = Instant::now() + self.inner.config.drain_timeout();
            loop {
                let notified = notify.notified();
                {
                    let mut entries = self.inner.entries.lock();
                    let Some(entry) = entries.get_mut(model_id) else {
                        return Err(ModelError::NotLoaded {
                            model_id: model_id.to_owned(),
                        });
                    };
                    if entry.in_flight == 0 {
                        entry.state = ModelState::Unloading;
                        break;
                    }
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    warn!(
                        message = "Drain timeout exceeded, unloading anyway.",
                        model_id = %model_id,
                    );
                    if let Some(entry) = self.inner.entries.lock().get_mut(model_id) {
                        entry.state = ModelState::Unloading;
                    }
                    break;
                }
            }
        }

        let outcome = self
            .inner
            .transport
            .request(
                "unload_model",
                json!({ "model_id": model_id }),
                RequestOptions::default(),
            )
            .await;

        match outcome {
            Ok(_) => {
                self.inner.entries.lock().remove(model_id);
                emit(ModelUnloaded { model_id, evicted });
                self.inner.send_event(ModelEvent::Unloaded {
                    model_id: model_id.to_owned(),
                });
                Ok(())
            }
            Err(error) => {
                // The runtime still considers the model loaded.
                if let Some(entry) = self.inner.entries.lock().get_mut(model_id) {
                    entry.state = ModelState::Ready;
                }
                Err(ModelError::UnloadFailed {
                    model_id: model_id.to_owned(),
                    message: error.to_string(),
                })
            }
        }
    }

    /// Marks a generation as using the model and returns the guard that
    /// holds its `in_flight` count.
    pub fn mark_used(&self, model_id: &str) -> Result<UsageGuard, ModelError> {
        {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(model_id) else {
                return Err(ModelError::NotLoaded {
                    model_id: model_id.to_owned(),
                });
            };
            if entry.state != ModelState::Ready {
                return Err(ModelError::Busy {
                    model_id: model_id.to_owned(),
                    state: entry.state,
                });
            }
            entry.in_flight += 1;
            entry.last_accessed_at = Instant::now();
        }
        self.inner.send_event(ModelEvent::Accessed {
            model_id: model_id.to_owned(),
        });
        Ok(UsageGuard {
            inner: Arc::clone(&self.inner),
            model_id: model_id.to_owned(),
        })
    }

    /// Checks whether `draft` can speculate for `primary`; a compatible
    /// pair is remembered as the current pairing.
    pub async fn check_draft(
        &self,
        primary: &str,
        draft: &str,
    ) -> Result<DraftReport, ModelError> {
        let value = self
            .inner
            .transport
            .request(
                "check_draft",
                json!({ "primary_model": primary, "draft_model": draft }),
                RequestOptions::default(),
            )
            .await
            .map_err(|error| ModelError::DraftCheck {
                message: error.to_string(),
            })?;
        let report: DraftReport =
            serde_json::from_value(value).map_err(|error| ModelError::DraftCheck {
                message: format!("malformed report: {error}"),
            })?;

        if report.compatible {
            *self.inner.draft_pair.lock() = Some(DraftPairing {
                primary: primary.to_owned(),
                draft: draft.to_owned(),
            });
        }
        Ok(report)
    }

    pub fn draft_pairing(&self) -> Option<DraftPairing> {
        self.inner.draft_pair.lock().clone()
    }

    /// Loads the configured warmup list concurrently. Failures are logged
    /// and swallowed; startup never fails on a bad warmup entry.
    pub async fn warmup(&self) {
        let ids = self.inner.config.memory_cache.warmup_on_start.clone();
        if ids.is_empty() {
            return;
        }
        info!(message = "Warming up models.", count = ids.len());
        let loads = ids.iter().map(|model_id| self.load_model(model_id));
        for (model_id, outcome) in ids.iter().zip(futures::future::join_all(loads).await) {
            if let Err(error) = outcome {
                warn!(
                    message = "Warmup load failed.",
                    model_id = %model_id,
                    %error,
                );
            }
        }
    }

    pub fn pin(&self, model_id: &str, pinned: bool) -> Result<(), ModelError> {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(model_id) else {
            return Err(ModelError::NotLoaded {
                model_id: model_id.to_owned(),
            });
        };
        entry.pinned = pinned;
        Ok(())
    }

    pub fn state(&self, model_id: &str) -> ModelState {
        self.inner
            .entries
            .lock()
            .get(model_id)
            .map_or(ModelState::Unloaded, |entry| entry.state)
    }

    pub fn snapshot(&self, model_id: &str) -> Option<ModelEntrySnapshot> {
        let entries = self.inner.entries.lock();
        entries
            .get(model_id)
            .map(|entry| snapshot_of(model_id, entry))
    }

    pub fn loaded_models(&self) -> Vec<ModelEntrySnapshot> {
        let entries = self.inner.entries.lock();
        let mut list: Vec<ModelEntrySnapshot> = entries
            .iter()
            .map(|(model_id, entry)| snapshot_of(model_id, entry))
            .collect();
        list.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        list
    }

    /// Estimated bytes held by loaded models, where the runtime reported a
    /// size.
    pub fn estimated_memory_bytes(&self) -> u64 {
        let entries = self.inner.entries.lock();
        entries
            .values()
            .filter_map(|entry| entry.memory_bytes)
            .sum()
    }
}

fn snapshot_of(model_id: &str, entry: &Entry) -> ModelEntrySnapshot {
    ModelEntrySnapshot {
        model_id: model_id.to_owned(),
        state: entry.state,
        pinned: entry.pinned,
        in_flight: entry.in_flight,
        idle_for: entry.last_accessed_at.elapsed(),
        load_count: entry.load_count,
        memory_bytes: entry.memory_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{MockReply, MockRuntime};

    fn manager(
        transport: Arc<RpcTransport>,
        config: ModelConfig,
    ) -> (ModelManager, mpsc::UnboundedReceiver<ModelEvent>) {
        ModelManager::new(transport, config)
    }

    #[tokio::test]
    async fn load_then_hit_issues_one_rpc() {
        let (transport, runtime) = MockRuntime::start();
        let (manager, _events) = manager(transport, ModelConfig::default());

        manager.load_model("mistral-7b").await.unwrap();
        manager.load_model("mistral-7b").await.unwrap();

        assert_eq!(runtime.requests_for("load_model").len(), 1);
        assert_eq!(manager.state("mistral-7b"), ModelState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_loads_coalesce() {
        let (transport, runtime) = MockRuntime::start();
        runtime.handle("load_model", |_| MockReply::Delayed {
            delay: Duration::from_millis(100),
            result: json!({ "memory_bytes": 1024 }),
        });
        let (manager, _events) = manager(transport, ModelConfig::default());

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.load_model("mistral-7b").await })
        };
        tokio::task::yield_now().await;
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.load_model("mistral-7b").await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(runtime.requests_for("load_model").len(), 1);
        assert_eq!(
            manager.snapshot("mistral-7b").unwrap().memory_bytes,
            Some(1024)
        );
    }

    #[tokio::test]
    async fn failed_load_fails_every_waiter_and_clears_the_entry() {
        let (transport, runtime) = MockRuntime::start();
        runtime.handle("load_model", |_| {
            MockReply::Error(-32000, "weights missing".to_owned())
        });
        let (manager, _events) = manager(transport, ModelConfig::default());

        let error = manager.load_model("missing-7b").await.unwrap_err();
        assert!(matches!(error, ModelError::LoadFailed { .. }));
        assert_eq!(manager.state("missing-7b"), ModelState::Unloaded);

        // A retry is allowed to start fresh.
        let error = manager.load_model("missing-7b").await.unwrap_err();
        assert!(matches!(error, ModelError::LoadFailed { .. }));
        assert_eq!(runtime.requests_for("load_model").len(), 2);
    }

    #[tokio::test]
    async fn unload_waits_for_in_flight_generations() {
        let (transport, runtime) = MockRuntime::start();
        let (manager, _events) = manager(transport, ModelConfig::default());

        manager.load_model("mistral-7b").await.unwrap();
        let guard = manager.mark_used("mistral-7b").unwrap();

        let unload = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.unload_model("mistral-7b").await })
        };
        tokio::task::yield_now().await;
        assert_eq!(manager.state("mistral-7b"), ModelState::Draining);
        assert!(runtime.requests_for("unload_model").is_empty());

        drop(guard);
        unload.await.unwrap().unwrap();
        assert_eq!(manager.state("mistral-7b"), ModelState::Unloaded);
        assert_eq!(runtime.requests_for("unload_model").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_forces_the_unload() {
        let (transport, runtime) = MockRuntime::start();
        let config = ModelConfig {
            drain_timeout_ms: 50,
            ..ModelConfig::default()
        };
        let (manager, _events) = manager(transport, config);

        manager.load_model("mistral-7b").await.unwrap();
        let _guard = manager.mark_used("mistral-7b").unwrap();

        manager.unload_model("mistral-7b").await.unwrap();
        assert_eq!(manager.state("mistral-7b"), ModelState::Unloaded);
        assert_eq!(runtime.requests_for("unload_model").len(), 1);
    }

    #[tokio::test]
    async fn unload_of_a_missing_model_is_an_error() {
        let (transport, _runtime) = MockRuntime::start();
        let (manager, _events) = manager(transport, ModelConfig::default());

        let error = manager.unload_model("ghost-7b").await.unwrap_err();
        assert!(matches!(error, ModelError::NotLoaded { .. }));
    }

    #[tokio::test]
    async fn mark_used_requires_a_ready_model() {
        let (transport, _runtime) = MockRuntime::start();
        let (manager, _events) = manager(transport, ModelConfig::default());

        assert!(matches!(
            manager.mark_used("ghost-7b").unwrap_err(),
            ModelError::NotLoaded { .. }
        ));
    }

    #[tokio::test]
    async fn compatible_draft_check_stores_the_pairing() {
        let (transport, runtime) = MockRuntime::start();
        runtime.handle("check_draft", |_| {
            MockReply::Result(json!({ "compatible": true }))
        });
        let (manager, _events) = manager(transport, ModelConfig::default());

        let report = manager.check_draft("mistral-7b", "tiny-1b").await.unwrap();
        assert!(report.compatible);
        assert_eq!(
            manager.draft_pairing(),
            Some(DraftPairing {
                primary: "mistral-7b".to_owned(),
                draft: "tiny-1b".to_owned(),
            })
        );
    }

    #[tokio::test]
    async fn incompatible_draft_check_leaves_no_pairing() {
        let (transport, runtime) = MockRuntime::start();
        runtime.handle("check_draft", |_| {
            MockReply::Result(json!({ "compatible": false, "reason": "vocab mismatch" }))
        });
        let (manager, _events) = manager(transport, ModelConfig::default());

        let report = manager.check_draft("mistral-7b", "other-1b").await.unwrap();
        assert!(!report.compatible);
        assert_eq!(report.reason.as_deref(), Some("vocab mismatch"));
        assert!(manager.draft_pairing().is_none());
    }

    #[tokio::test]
    async fn warmup_loads_the_list_and_swallows_failures() {
        let (transport, runtime) = MockRuntime::start();
        runtime.handle("load_model", |params| {
            if params["model_id"] == "broken-7b" {
                MockReply::Error(-32000, "corrupt weights".to_owned())
            } else {
                MockReply::Result(json!({}))
            }
        });
        let mut config = ModelConfig::default();
        config.memory_cache.warmup_on_start =
            vec!["mistral-7b".to_owned(), "broken-7b".to_owned()];
        let (manager, _events) = manager(transport, config);

        manager.warmup().await;

        assert_eq!(manager.state("mistral-7b"), ModelState::Ready);
        assert_eq!(manager.state("broken-7b"), ModelState::Unloaded);
    }

    #[tokio::test]
    async fn events_flow_to_the_lifecycle_channel() {
        let (transport, _runtime) = MockRuntime::start();
        let (manager, mut events) = manager(transport, ModelConfig::default());

        manager.load_model("mistral-7b").await.unwrap();
        let guard = manager.mark_used("mistral-7b").unwrap();
        drop(guard);
        manager.unload_model("mistral-7b").await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            ModelEvent::Loaded { cold: true, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ModelEvent::Accessed { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ModelEvent::Unloaded { .. }
        ));
    }

    #[tokio::test]
    async fn reload_after_unload_is_warm() {
        let (transport, _runtime) = MockRuntime::start();
        let (manager, mut events) = manager(transport, ModelConfig::default());

        manager.load_model("mistral-7b").await.unwrap();
        manager.unload_model("mistral-7b").await.unwrap();
        manager.load_model("mistral-7b").await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            ModelEvent::Loaded { cold: true, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ModelEvent::Unloaded { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ModelEvent::Loaded { cold: false, .. }
        ));
    }
}
