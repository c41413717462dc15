//! Deterministic feature-flag gating.
//!
//! Every decision is a pure function of the flag configuration and the
//! request id: a seeded hash buckets the id into [0, 100) and the flag
//! admits ids under its rollout percentage. The configuration lives behind
//! a hot-swap handle; readers snapshot it once per evaluation and `reload`
//! replaces it atomically.

mod canary;

pub use canary::CanaryRouter;

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::{ConfigError, FeatureFlagsConfig};

/// FNV-1a, the stable 64-bit flavor. The bucket must agree across
/// processes and versions, so the hash is pinned here rather than borrowed
/// from the standard library's unspecified hasher.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// The integer in [0, 100) a request id lands on for a given seed, with
/// two decimal digits of resolution.
pub fn hash_bucket(request_id: &str, seed: &str) -> f64 {
    let hash = fnv1a(format!("{request_id}:{seed}").as_bytes());
    (hash % 10_000) as f64 / 100.0
}

pub struct FeatureFlags {
    config: ArcSwap<FeatureFlagsConfig>,
}

impl FeatureFlags {
    pub fn new(config: FeatureFlagsConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: ArcSwap::from_pointee(config),
        })
    }

    /// Atomically replaces the configuration. In-progress evaluations keep
    /// the snapshot they started with.
    pub fn reload(&self, config: FeatureFlagsConfig) -> Result<(), ConfigError> {
        config.validate()?;
        info!(message = "Feature flag configuration reloaded.");
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Whether `feature` is on for `request_id`. Deterministic and pure
    /// given one configuration snapshot.
    pub fn evaluate(&self, feature: &str, request_id: &str) -> bool {
        let config = self.config.load();

        if config.emergency.kill_switch || config.emergency.rollback_to_baseline {
            return false;
        }
        let Some(flag) = config.features.get(feature) else {
            return false;
        };
        if !flag.enabled {
            return false;
        }

        let phase = &config.phase_rollout;
        if !phase.enabled {
            return false;
        }
        if phase.percentage < 100.0
            && hash_bucket(request_id, &phase.hash_seed) >= phase.percentage
        {
            return false;
        }

        hash_bucket(request_id, &flag.hash_seed) < flag.rollout_percentage
    }

    /// The active configuration snapshot.
    pub fn snapshot(&self) -> Arc<FeatureFlagsConfig> {
        self.config.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureFlagConfig;

    fn config_with(name: &str, percentage: f64, seed: &str) -> FeatureFlagsConfig {
        let mut config = FeatureFlagsConfig::default();
        config.features.insert(
            name.to_owned(),
            FeatureFlagConfig {
                enabled: true,
                rollout_percentage: percentage,
                hash_seed: seed.to_owned(),
            },
        );
        config
    }

    #[test]
    fn evaluation_is_deterministic() {
        let flags = FeatureFlags::new(config_with("speculative", 50.0, "s1")).unwrap();

        let first: Vec<bool> = (0..200)
            .map(|i| flags.evaluate("speculative", &format!("req-{i}")))
            .collect();
        let second: Vec<bool> = (0..200)
            .map(|i| flags.evaluate("speculative", &format!("req-{i}")))
            .collect();
        assert_eq!(first, second);

        // A 50% rollout should admit a non-trivial share either way.
        let admitted = first.iter().filter(|on| **on).count();
        assert!(admitted > 50 && admitted < 150, "admitted {admitted} of 200");
    }

    #[test]
    fn zero_and_full_percentages_are_absolute() {
        let flags = FeatureFlags::new(config_with("off", 0.0, "s")).unwrap();
        assert!((0..100).all(|i| !flags.evaluate("off", &format!("req-{i}"))));

        let flags = FeatureFlags::new(config_with("on", 100.0, "s")).unwrap();
        assert!((0..100).all(|i| flags.evaluate("on", &format!("req-{i}"))));
    }

    #[test]
    fn unknown_and_disabled_features_are_off() {
        let mut config = config_with("known", 100.0, "s");
        config
            .features
            .get_mut("known")
            .expect("flag was inserted")
            .enabled = false;
        let flags = FeatureFlags::new(config).unwrap();

        assert!(!flags.evaluate("known", "req-1"));
        assert!(!flags.evaluate("unknown", "req-1"));
    }

    #[test]
    fn kill_switch_overrides_everything() {
        let mut config = config_with("speculative", 100.0, "s1");
        config.emergency.kill_switch = true;
        let flags = FeatureFlags::new(config).unwrap();
        assert!(!flags.evaluate("speculative", "req-1"));

        let mut config = config_with("speculative", 100.0, "s1");
        config.emergency.rollback_to_baseline = true;
        let flags = FeatureFlags::new(config).unwrap();
        assert!(!flags.evaluate("speculative", "req-1"));
    }

    #[test]
    fn disabled_phase_gate_turns_features_off() {
        let mut config = config_with("speculative", 100.0, "s1");
        config.phase_rollout.enabled = false;
        let flags = FeatureFlags::new(config).unwrap();
        assert!(!flags.evaluate("speculative", "req-1"));
    }

    #[test]
    fn phase_percentage_narrows_the_rollout() {
        let mut config = config_with("speculative", 100.0, "s1");
        config.phase_rollout.percentage = 50.0;
        config.phase_rollout.hash_seed = "phase".to_owned();
        let flags = FeatureFlags::new(config).unwrap();

        let admitted = (0..200)
            .filter(|i| flags.evaluate("speculative", &format!("req-{i}")))
            .count();
        assert!(admitted > 50 && admitted < 150, "admitted {admitted} of 200");
    }

    #[test]
    fn reload_swaps_the_decision_set() {
        let flags = FeatureFlags::new(config_with("speculative", 0.0, "s1")).unwrap();
        assert!(!flags.evaluate("speculative", "req-1"));

        flags
            .reload(config_with("speculative", 100.0, "s1"))
            .unwrap();
        assert!(flags.evaluate("speculative", "req-1"));
    }

    #[test]
    fn invalid_percentage_is_rejected_at_construction_and_reload() {
        assert!(FeatureFlags::new(config_with("bad", 150.0, "s")).is_err());

        let flags = FeatureFlags::new(config_with("ok", 10.0, "s")).unwrap();
        assert!(flags.reload(config_with("bad", -1.0, "s")).is_err());
    }

    #[test]
    fn different_seeds_give_different_buckets() {
        let a = hash_bucket("req-1", "seed-a");
        let b = hash_bucket("req-1", "seed-b");
        assert!((0.0..100.0).contains(&a));
        assert!((0.0..100.0).contains(&b));
        assert!((a - b).abs() > f64::EPSILON);
    }
}
