//! The smart load balancer.
//!
//! Selection runs a snapshot through three filters, in order: liveness
//! (online and breaker-visible), skills (the worker has the model), and
//! hardware (enough free memory for the tier-estimated weights). Survivors
//! rank by active requests; ties rotate through a wrapping round-robin
//! pointer so equally-loaded workers share the traffic.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use snafu::Snafu;

use super::{
    WorkerRecord, WorkerStatus,
    breaker::{CircuitBreakerRegistry, PeerKey},
    registry::WorkerRegistry,
};
use crate::{
    internal_events::{WorkerSelected, emit},
    limiter::ModelTier,
};

#[derive(Debug, Snafu)]
pub enum RouteError {
    #[snafu(display("no online workers"))]
    NoOnlineWorkers,
    #[snafu(display("no worker can serve model `{model_id}`"))]
    NoWorkerForModel { model_id: String },
    #[snafu(display("circuit for worker `{worker_id}` is open"))]
    CircuitOpen { worker_id: String },
    #[snafu(display("all routing attempts failed: {message}"))]
    Exhausted { message: String },
}

pub struct LoadBalancer {
    registry: Arc<WorkerRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    round_robin: AtomicUsize,
    safety_factor: f64,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        safety_factor: f64,
    ) -> Self {
        Self {
            registry,
            breakers,
            round_robin: AtomicUsize::new(0),
            safety_factor,
        }
    }

    pub fn select(&self, model_id: &str) -> Result<WorkerRecord, RouteError> {
        self.select_excluding(model_id, &HashSet::new())
    }

    /// Selection with an exclusion set, used by retry loops so a failed
    /// worker is not picked again for the same request.
    pub fn select_excluding(
        &self,
        model_id: &str,
        excluded: &HashSet<String>,
    ) -> Result<WorkerRecord, RouteError> {
        let snapshot = self.registry.snapshot();

        // Liveness: online, not excluded, breaker-visible.
        let alive: Vec<&WorkerRecord> = snapshot
            .iter()
            .filter(|worker| worker.status == WorkerStatus::Online)
            .filter(|worker| !excluded.contains(&worker.worker_id))
            .filter(|worker| {
                self.breakers
                    .is_available(&PeerKey::peer(worker.worker_id.clone()))
            })
            .collect();
        if alive.is_empty() {
            return Err(RouteError::NoOnlineWorkers);
        }

        // Skills: the worker actually has the model.
        let skilled: Vec<&WorkerRecord> = alive
            .into_iter()
            .filter(|worker| worker.skills.has_model(model_id))
            .collect();
        if skilled.is_empty() {
            return Err(RouteError::NoWorkerForModel {
                model_id: model_id.to_owned(),
            });
        }

        // Hardware: enough free memory for the estimated weights. Workers
        // that have not reported metrics yet pass the filter.
        let needed =
            (ModelTier::classify(model_id).estimated_bytes() as f64 * self.safety_factor) as u64;
        let fitting: Vec<&WorkerRecord> = skilled
            .into_iter()
            .filter(|worker| {
                worker
                    .metrics
                    .as_ref()
                    .is_none_or(|metrics| metrics.mem_free_bytes() >= needed)
            })
            .collect();
        if fitting.is_empty() {
            return Err(RouteError::NoWorkerForModel {
                model_id: model_id.to_owned(),
            });
        }

        // Load: fewest active requests wins; ties rotate round-robin.
        let min_load = fitting
            .iter()
            .map(|worker| worker.active_requests())
            .min()
            .expect("fitting set is non-empty");
        let tied: Vec<&WorkerRecord> = fitting
            .into_iter()
            .filter(|worker| worker.active_requests() == min_load)
            .collect();

        let index = self.round_robin.fetch_add(1, Ordering::SeqCst) % tied.len();
        let selected = tied[index].clone();
        emit(WorkerSelected {
            worker_id: &selected.worker_id,
            model_id,
            candidates: tied.len(),
        });
        Ok(selected)
    }
}
