//! The worker registry.
//!
//! Workers register over the bus and heartbeat their metrics. The registry
//! is the authoritative view of the fleet; a staleness sweep flips workers
//! that stop heartbeating to offline so the balancer stops seeing them.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use super::{WorkerMetrics, WorkerRecord, WorkerSkills, WorkerStatus, bus::MessageBus};
use crate::{
    config::RequestRoutingConfig,
    internal_events::{WorkerMarkedOffline, emit},
};

/// `worker.register` payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub skills: WorkerSkills,
    pub status: WorkerStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// `worker.heartbeat` payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub metrics: WorkerMetrics,
    pub timestamp: DateTime<Utc>,
}

pub struct WorkerRegistry {
    workers: DashMap<String, WorkerRecord>,
    config: RequestRoutingConfig,
}

impl WorkerRegistry {
    pub fn new(config: RequestRoutingConfig) -> Arc<Self> {
        Arc::new(Self {
            workers: DashMap::new(),
            config,
        })
    }

    pub fn register(&self, registration: WorkerRegistration) {
        info!(
            message = "Worker registered.",
            worker_id = %registration.worker_id,
            hostname = %registration.hostname,
            models = registration.skills.available_models.len(),
        );
        let now = Utc::now();
        self.workers.insert(
            registration.worker_id.clone(),
            WorkerRecord {
                worker_id: registration.worker_id,
                hostname: registration.hostname,
                ip: registration.ip,
                port: registration.port,
                skills: registration.skills,
                metrics: None,
                status: registration.status,
                last_heartbeat: now,
                registered_at: now,
                priority: registration.priority,
                tags: registration.tags,
            },
        );
    }

    pub fn heartbeat(&self, heartbeat: WorkerHeartbeat) {
        let Some(mut record) = self.workers.get_mut(&heartbeat.worker_id) else {
            warn!(
                message = "Heartbeat from unknown worker dropped.",
                worker_id = %heartbeat.worker_id,
            );
            return;
        };
        record.status = heartbeat.status;
        record.metrics = Some(heartbeat.metrics);
        record.last_heartbeat = Utc::now();
    }

    /// Flips workers whose heartbeats stopped to offline. Returns how many
    /// workers were flipped.
    pub fn sweep(&self) -> usize {
        let allowance = ChronoDuration::milliseconds(
            (self.config.heartbeat_interval_ms * u64::from(self.config.heartbeat_miss_limit))
                as i64,
        );
        let cutoff = Utc::now() - allowance;

        let mut flipped = 0;
        for mut record in self.workers.iter_mut() {
            if record.status != WorkerStatus::Offline && record.last_heartbeat < cutoff {
                record.status = WorkerStatus::Offline;
                flipped += 1;
                emit(WorkerMarkedOffline {
                    worker_id: &record.worker_id,
                    missed: self.config.heartbeat_miss_limit,
                });
            }
        }
        flipped
    }

    pub fn snapshot(&self) -> Vec<WorkerRecord> {
        let mut workers: Vec<WorkerRecord> =
            self.workers.iter().map(|record| record.clone()).collect();
        // Deterministic order: priority first, then id.
        workers.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        workers
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.workers.get(worker_id).map(|record| record.clone())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Consumes `worker.register` and `worker.heartbeat` off the bus and
    /// runs the staleness sweep on the heartbeat interval.
    pub fn run(self: &Arc<Self>, bus: Arc<dyn MessageBus>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let (mut registrations, mut heartbeats) = match (
                bus.subscribe("worker.register").await,
                bus.subscribe("worker.heartbeat").await,
            ) {
                (Ok(r), Ok(h)) => (r, h),
                _ => {
                    error!(message = "Failed to subscribe to worker subjects.");
                    return;
                }
            };

            let mut sweep = tokio::time::interval(registry.config.heartbeat_interval());
            sweep.tick().await;
            loop {
                tokio::select! {
                    message = registrations.recv() => match message {
                        Some(message) => registry.on_register(&message.payload),
                        None => break,
                    },
                    message = heartbeats.recv() => match message {
                        Some(message) => registry.on_heartbeat(&message.payload),
                        None => break,
                    },
                    _ = sweep.tick() => {
                        registry.sweep();
                    }
                }
            }
        })
    }

    fn on_register(&self, payload: &Value) {
        match serde_json::from_value::<WorkerRegistration>(payload.clone()) {
            Ok(registration) => self.register(registration),
            Err(error) => warn!(message = "Malformed worker registration.", %error),
        }
    }

    fn on_heartbeat(&self, payload: &Value) {
        match serde_json::from_value::<WorkerHeartbeat>(payload.clone()) {
            Ok(heartbeat) => self.heartbeat(heartbeat),
            Err(error) => warn!(message = "Malformed worker heartbeat.", %error),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_registration(
    worker_id: &str,
    models: &[&str],
) -> WorkerRegistration {
    WorkerRegistration {
        worker_id: worker_id.to_owned(),
        hostname: format!("{worker_id}.local"),
        ip: "10.0.0.1".to_owned(),
        port: 4222,
        skills: WorkerSkills {
            available_models: models.iter().map(|m| (*m).to_owned()).collect(),
            total_bytes: 64 * 1024 * 1024 * 1024,
            last_scanned: Some(Utc::now()),
        },
        status: WorkerStatus::Online,
        timestamp: Utc::now(),
        priority: 0,
        tags: Vec::new(),
    }
}

#[cfg(test)]
pub(crate) fn test_heartbeat(worker_id: &str, active_requests: u64) -> WorkerHeartbeat {
    WorkerHeartbeat {
        worker_id: worker_id.to_owned(),
        status: WorkerStatus::Online,
        metrics: WorkerMetrics {
            cpu_percent: 20.0,
            mem_used_gb: 16.0,
            mem_total_gb: 64.0,
            gpu_util_percent: 35.0,
            active_requests,
            latency_avg_ms: 180.0,
        },
        timestamp: Utc::now(),
    }
}
