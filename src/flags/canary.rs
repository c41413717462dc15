//! MD5-bucketed canary routing with a decision cache.
//!
//! The canary variant hashes the identifier with MD5, maps the first 32
//! bits modulo 10000 into [0.00, 99.99], and admits identifiers under the
//! rollout percentage. Decisions are cached in an insertion-ordered map
//! with oldest-use eviction (a hit refreshes its position), and a
//! percentage change clears the cache so the new percentage applies
//! immediately.

use indexmap::IndexMap;
use md5::{Digest, Md5};
use parking_lot::Mutex;

use crate::{
    config::{CanaryConfig, ConfigError},
    internal_events::{CanaryCacheCleared, emit},
};

struct CanaryState {
    percentage: f64,
    cache: IndexMap<String, bool>,
}

pub struct CanaryRouter {
    cache_size: usize,
    state: Mutex<CanaryState>,
}

impl CanaryRouter {
    pub fn new(config: &CanaryConfig, percentage: f64) -> Result<Self, ConfigError> {
        validate_percentage(percentage)?;
        Ok(Self {
            cache_size: config.cache_size,
            state: Mutex::new(CanaryState {
                percentage,
                cache: IndexMap::new(),
            }),
        })
    }

    /// The bucket in [0.00, 99.99] for an identifier.
    pub fn bucket(identifier: &str) -> f64 {
        Self::bucket_of(&Md5::digest(identifier.as_bytes()))
    }

    /// First 32 big-endian bits of the digest, modulo 10000, scaled down.
    fn bucket_of(digest: &[u8]) -> f64 {
        let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        f64::from(head % 10_000) / 100.0
    }

    /// Whether `identifier` is in the canary. Cached; a hit refreshes the
    /// entry's position so eviction tracks oldest use.
    pub fn evaluate(&self, identifier: &str) -> bool {
        let mut state = self.state.lock();

        if let Some(admitted) = state.cache.shift_remove(identifier) {
            state.cache.insert(identifier.to_owned(), admitted);
            return admitted;
        }

        let digest = Md5::digest(identifier.as_bytes());
        let bucket = Self::bucket_of(&digest);
        let admitted = bucket < state.percentage;
        trace!(
            message = "Canary decision computed.",
            identifier = %identifier,
            digest = %hex::encode(digest),
            bucket,
            admitted,
        );
        state.cache.insert(identifier.to_owned(), admitted);
        while state.cache.len() > self.cache_size {
            state.cache.shift_remove_index(0);
        }
        admitted
    }

    pub fn percentage(&self) -> f64 {
        self.state.lock().percentage
    }

    /// Updates the rollout percentage and clears the decision cache so the
    /// new percentage takes effect at once.
    pub fn set_percentage(&self, percentage: f64) -> Result<(), ConfigError> {
        validate_percentage(percentage)?;
        let entries = {
            let mut state = self.state.lock();
            state.percentage = percentage;
            let entries = state.cache.len();
            state.cache.clear();
            entries
        };
        emit(CanaryCacheCleared { entries });
        Ok(())
    }

    pub fn cached_decisions(&self) -> usize {
        self.state.lock().cache.len()
    }
}

fn validate_percentage(percentage: f64) -> Result<(), ConfigError> {
    if (0.0..=100.0).contains(&percentage) {
        Ok(())
    } else {
        Err(ConfigError::InvalidPercentage {
            name: "canary".to_owned(),
            value: percentage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(percentage: f64, cache_size: usize) -> CanaryRouter {
        CanaryRouter::new(&CanaryConfig { cache_size }, percentage).unwrap()
    }

    #[test]
    fn buckets_are_stable_and_in_range() {
        for i in 0..100 {
            let id = format!("req-{i}");
            let bucket = CanaryRouter::bucket(&id);
            assert!((0.0..100.0).contains(&bucket));
            assert!((bucket - CanaryRouter::bucket(&id)).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn admitted_set_is_stable_across_evaluations() {
        let router = router(50.0, 1_024);
        let first: Vec<bool> = (0..100)
            .map(|i| router.evaluate(&format!("req-{i}")))
            .collect();
        let second: Vec<bool> = (0..100)
            .map(|i| router.evaluate(&format!("req-{i}")))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn percentage_change_clears_the_cache_and_rewidens() {
        let router = router(0.0, 1_024);
        assert!((0..50).all(|i| !router.evaluate(&format!("req-{i}"))));
        assert_eq!(router.cached_decisions(), 50);

        router.set_percentage(100.0).unwrap();
        assert_eq!(router.cached_decisions(), 0);
        assert!((0..50).all(|i| router.evaluate(&format!("req-{i}"))));
    }

    #[test]
    fn eviction_tracks_oldest_use_not_oldest_insertion() {
        let router = router(50.0, 2);
        let a = router.evaluate("id-a");
        router.evaluate("id-b");

        // Touching `a` refreshes it, so filling the cache evicts `b`.
        assert_eq!(router.evaluate("id-a"), a);
        router.evaluate("id-c");

        let state = router.state.lock();
        assert!(state.cache.contains_key("id-a"));
        assert!(!state.cache.contains_key("id-b"));
        assert!(state.cache.contains_key("id-c"));
    }

    #[test]
    fn invalid_percentages_are_rejected() {
        assert!(CanaryRouter::new(&CanaryConfig { cache_size: 8 }, 101.0).is_err());
        let router = router(50.0, 8);
        assert!(router.set_percentage(-0.5).is_err());
    }
}
