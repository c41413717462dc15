//! Adaptive admission control for the stream registry.
//!
//! The controller watches utilization and the rolling TTFT average and
//! moves the active-stream limit between the configured bounds. Two
//! policies exist: the default threshold rule (step up under load while
//! TTFT is healthy, step down when idle) and an optional PID governor that
//! steers TTFT toward its target directly.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::config::AdaptiveLimitsConfig;

/// Number of TTFT samples the rolling average keeps.
const TTFT_WINDOW: usize = 50;
const SCALE_UP_STEP: usize = 5;
const SCALE_DOWN_STEP: usize = 2;

struct AdmissionState {
    current_limit: usize,
    ttft_samples: VecDeque<f64>,
    pid_integral: f64,
    pid_last_error: Option<f64>,
}

pub struct AdmissionController {
    config: AdaptiveLimitsConfig,
    base_limit: usize,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub fn new(config: AdaptiveLimitsConfig, base_limit: usize) -> Self {
        let initial = if config.enabled {
            base_limit.clamp(config.min_streams, config.max_streams)
        } else {
            base_limit
        };
        Self {
            config,
            base_limit,
            state: Mutex::new(AdmissionState {
                current_limit: initial,
                ttft_samples: VecDeque::with_capacity(TTFT_WINDOW),
                pid_integral: 0.0,
                pid_last_error: None,
            }),
        }
    }

    /// The limit new registrations are admitted against right now.
    pub fn effective_limit(&self) -> usize {
        if self.config.enabled {
            self.state.lock().current_limit
        } else {
            self.base_limit
        }
    }

    pub fn record_ttft(&self, ttft_ms: f64) {
        let mut state = self.state.lock();
        if state.ttft_samples.len() == TTFT_WINDOW {
            state.ttft_samples.pop_front();
        }
        state.ttft_samples.push_back(ttft_ms);
    }

    pub fn avg_ttft_ms(&self) -> Option<f64> {
        let state = self.state.lock();
        if state.ttft_samples.is_empty() {
            None
        } else {
            Some(state.ttft_samples.iter().sum::<f64>() / state.ttft_samples.len() as f64)
        }
    }

    /// Runs one adjustment round against the current active count.
    /// Returns `(previous, new, utilization)` when the limit moved.
    pub fn adjust(&self, active: usize) -> Option<(usize, usize, f64)> {
        if !self.config.enabled {
            return None;
        }

        let mut state = self.state.lock();
        let current = state.current_limit;
        let utilization = if current == 0 {
            0.0
        } else {
            active as f64 / current as f64
        };

        let next = if self.config.pid.enabled {
            self.pid_next(&mut state, current)
        } else {
            self.threshold_next(&state, current, utilization)
        };
        let next = next.clamp(self.config.min_streams, self.config.max_streams);

        if next == current {
            return None;
        }
        state.current_limit = next;
        Some((current, next, utilization))
    }

    fn threshold_next(&self, state: &AdmissionState, current: usize, utilization: f64) -> usize {
        let avg_ttft = if state.ttft_samples.is_empty() {
            None
        } else {
            Some(state.ttft_samples.iter().sum::<f64>() / state.ttft_samples.len() as f64)
        };

        if utilization > self.config.scale_up_threshold
            && avg_ttft.is_some_and(|avg| avg < self.config.target_ttft_ms)
        {
            current + SCALE_UP_STEP
        } else if utilization < self.config.scale_down_threshold {
            current.saturating_sub(SCALE_DOWN_STEP)
        } else {
            current
        }
    }

    /// Positional PID on the TTFT error: slow streams shrink the limit,
    /// fast streams grow it.
    fn pid_next(&self, state: &mut AdmissionState, current: usize) -> usize {
        let Some(avg) = (if state.ttft_samples.is_empty() {
            None
        } else {
            Some(state.ttft_samples.iter().sum::<f64>() / state.ttft_samples.len() as f64)
        }) else {
            return current;
        };

        let error = avg - self.config.target_ttft_ms;
        state.pid_integral += error;
        let derivative = state
            .pid_last_error
            .map_or(0.0, |last| error - last);
        state.pid_last_error = Some(error);

        let gains = &self.config.pid;
        let control =
            gains.kp * error + gains.ki * state.pid_integral + gains.kd * derivative;
        let next = current as f64 - control;
        if next <= 0.0 { 0 } else { next.round() as usize }
    }
}
