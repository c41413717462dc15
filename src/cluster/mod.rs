//! Controller-side clustering: worker records, routing, and health.
//!
//! A controller is authoritative; workers are stateless replicas of their
//! skills. Workers announce themselves over the bus, heartbeat their
//! metrics, and serve `<worker>.inference` requests the controller relays
//! to callers.

pub mod balancer;
pub mod breaker;
pub mod bus;
pub mod controller;
pub mod registry;

pub use balancer::{LoadBalancer, RouteError};
pub use breaker::{CircuitBreakerRegistry, CircuitSnapshot, CircuitState, PeerKey};
pub use bus::{BusError, BusMessage, InMemoryBus, MessageBus};
pub use controller::{Controller, InferenceBody, InferenceReply, InferenceRequest};
pub use registry::{WorkerHeartbeat, WorkerRegistration, WorkerRegistry};

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Degraded,
    Offline,
}

/// The models a worker host can serve.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct WorkerSkills {
    pub available_models: BTreeSet<String>,
    pub total_bytes: u64,
    #[serde(default)]
    pub last_scanned: Option<DateTime<Utc>>,
}

impl WorkerSkills {
    pub fn has_model(&self, model_id: &str) -> bool {
        self.available_models.contains(model_id)
    }
}

/// Utilization a worker reports with each heartbeat.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct WorkerMetrics {
    pub cpu_percent: f64,
    pub mem_used_gb: f64,
    pub mem_total_gb: f64,
    pub gpu_util_percent: f64,
    pub active_requests: u64,
    pub latency_avg_ms: f64,
}

impl WorkerMetrics {
    pub fn mem_free_bytes(&self) -> u64 {
        let free_gb = (self.mem_total_gb - self.mem_used_gb).max(0.0);
        (free_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }
}

/// One worker as the registry knows it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub skills: WorkerSkills,
    #[serde(default)]
    pub metrics: Option<WorkerMetrics>,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl WorkerRecord {
    pub fn active_requests(&self) -> u64 {
        self.metrics
            .as_ref()
            .map_or(0, |metrics| metrics.active_requests)
    }

    /// The bus subject this worker serves inference on.
    pub fn inference_subject(&self) -> String {
        format!("{}.inference", self.worker_id)
    }
}
