//! Per-peer circuit breakers.
//!
//! Closed counts consecutive failures; enough of them open the circuit.
//! An open circuit rejects until its timeout passes, then admits exactly
//! one half-open probe at a time. Enough consecutive probe successes close
//! it again; any probe failure reopens it.

use dashmap::DashMap;
use tokio::time::Instant;

use crate::{
    config::CircuitBreakerConfig,
    internal_events::{CircuitTransition, emit},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn name(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub last_failure_at: Option<Instant>,
}

/// A breaker key: the peer, optionally narrowed to one model on it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub peer: String,
    pub model: Option<String>,
}

impl PeerKey {
    pub fn peer(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            model: None,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
    probe_taken: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            probe_taken: false,
        }
    }
}

pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    peers: DashMap<PeerKey, BreakerState>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            peers: DashMap::new(),
        }
    }

    /// Whether the peer could take a request right now, without consuming
    /// the half-open probe. Used by the balancer's visibility filter.
    pub fn is_available(&self, key: &PeerKey) -> bool {
        if !self.config.enabled {
            return true;
        }
        let Some(state) = self.peers.get(key) else {
            return true;
        };
        match state.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !state.probe_taken,
            CircuitState::Open => state
                .last_failure_at
                .is_some_and(|at| at.elapsed() >= self.config.timeout()),
        }
    }

    /// Claims the right to send one request to the peer. An open breaker
    /// past its timeout transitions to half-open and hands out the probe.
    pub fn try_acquire(&self, key: &PeerKey) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut state = self.peers.entry(key.clone()).or_default();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if state.probe_taken {
                    false
                } else {
                    state.probe_taken = true;
                    true
                }
            }
            CircuitState::Open => {
                let expired = state
                    .last_failure_at
                    .is_some_and(|at| at.elapsed() >= self.config.timeout());
                if expired {
                    state.state = CircuitState::HalfOpen;
                    state.consecutive_successes = 0;
                    state.probe_taken = true;
                    drop(state);
                    emit(CircuitTransition {
                        peer: &key.peer,
                        from: CircuitState::Open.name(),
                        to: CircuitState::HalfOpen.name(),
                    });
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, key: &PeerKey) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.peers.entry(key.clone()).or_default();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
                state.consecutive_successes = state.consecutive_successes.saturating_add(1);
            }
            CircuitState::HalfOpen => {
                state.probe_taken = false;
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.consecutive_failures = 0;
                    drop(state);
                    emit(CircuitTransition {
                        peer: &key.peer,
                        from: CircuitState::HalfOpen.name(),
                        to: CircuitState::Closed.name(),
                    });
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, key: &PeerKey) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.peers.entry(key.clone()).or_default();
        state.last_failure_at = Some(Instant::now());
        state.consecutive_successes = 0;
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    drop(state);
                    emit(CircuitTransition {
                        peer: &key.peer,
                        from: CircuitState::Closed.name(),
                        to: CircuitState::Open.name(),
                    });
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.probe_taken = false;
                state.consecutive_failures += 1;
                drop(state);
                emit(CircuitTransition {
                    peer: &key.peer,
                    from: CircuitState::HalfOpen.name(),
                    to: CircuitState::Open.name(),
                });
            }
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self, key: &PeerKey) -> CircuitSnapshot {
        self.peers.get(key).map_or(
            CircuitSnapshot {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure_at: None,
            },
            |state| CircuitSnapshot {
                state: state.state,
                failures: state.consecutive_failures,
                successes: state.consecutive_successes,
                last_failure_at: state.last_failure_at,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn full_lifecycle_closed_open_half_open_closed() {
        let breakers = registry();
        let key = PeerKey::peer("w1");

        // Five consecutive failures trip the breaker.
        for i in 1..=5 {
            breakers.record_failure(&key);
            let snapshot = breakers.snapshot(&key);
            if i < 5 {
                assert_eq!(snapshot.state, CircuitState::Closed);
                assert_eq!(snapshot.failures, i);
            }
        }
        assert_eq!(breakers.snapshot(&key).state, CircuitState::Open);
        assert!(!breakers.try_acquire(&key));

        // After the timeout the next acquire is the half-open probe.
        tokio::time::advance(Duration::from_millis(30_000)).await;
        assert!(breakers.try_acquire(&key));
        assert_eq!(breakers.snapshot(&key).state, CircuitState::HalfOpen);

        // Two consecutive successes close it.
        breakers.record_success(&key);
        assert_eq!(breakers.snapshot(&key).state, CircuitState::HalfOpen);
        assert!(breakers.try_acquire(&key));
        breakers.record_success(&key);
        assert_eq!(breakers.snapshot(&key).state, CircuitState::Closed);

        // A failure from Closed starts counting from one again.
        breakers.record_failure(&key);
        let snapshot = breakers.snapshot(&key);
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_probe_at_a_time() {
        let breakers = registry();
        let key = PeerKey::peer("w1");

        for _ in 0..5 {
            breakers.record_failure(&key);
        }
        tokio::time::advance(Duration::from_millis(30_000)).await;

        assert!(breakers.try_acquire(&key));
        // The probe is out; nobody else gets in.
        assert!(!breakers.try_acquire(&key));
        assert!(!breakers.is_available(&key));

        // The probe coming back frees the slot.
        breakers.record_success(&key);
        assert!(breakers.is_available(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breakers = registry();
        let key = PeerKey::peer("w1");

        for _ in 0..5 {
            breakers.record_failure(&key);
        }
        tokio::time::advance(Duration::from_millis(30_000)).await;
        assert!(breakers.try_acquire(&key));

        breakers.record_failure(&key);
        assert_eq!(breakers.snapshot(&key).state, CircuitState::Open);
        assert!(!breakers.try_acquire(&key));

        // And the open window starts over from the new failure.
        tokio::time::advance(Duration::from_millis(30_000)).await;
        assert!(breakers.try_acquire(&key));
        assert_eq!(breakers.snapshot(&key).state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn per_model_keys_are_independent() {
        let breakers = registry();
        let whole = PeerKey::peer("w1");
        let scoped = PeerKey {
            peer: "w1".to_owned(),
            model: Some("mistral-7b".to_owned()),
        };

        for _ in 0..5 {
            breakers.record_failure(&scoped);
        }
        assert_eq!(breakers.snapshot(&scoped).state, CircuitState::Open);
        assert_eq!(breakers.snapshot(&whole).state, CircuitState::Closed);
        assert!(breakers.is_available(&whole));
    }

    #[tokio::test]
    async fn disabled_breaker_is_always_available() {
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            enabled: false,
            ..CircuitBreakerConfig::default()
        });
        let key = PeerKey::peer("w1");
        for _ in 0..100 {
            breakers.record_failure(&key);
        }
        assert!(breakers.is_available(&key));
        assert!(breakers.try_acquire(&key));
    }
}
