//! Per-position retry timers for callers that keep failing to use a POI.

use rand::Rng;
use std::collections::HashMap;
use strata_common::{BackoffConfig, BlockPos};

/// Linear backoff with a random increment per attempt, capped at
/// `max_delay`. Times are in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitteredLinearRetry {
    previous_attempt: u64,
    next_attempt: u64,
    current_delay: u32,
}

impl JitteredLinearRetry {
    pub fn new<R: Rng + ?Sized>(rng: &mut R, time: u64, config: &BackoffConfig) -> Self {
        let mut retry = Self {
            previous_attempt: time,
            next_attempt: time,
            current_delay: 0,
        };
        retry.mark_attempt(rng, time, config);
        retry
    }

    pub fn mark_attempt<R: Rng + ?Sized>(&mut self, rng: &mut R, time: u64, config: &BackoffConfig) {
        let increase = if config.max_increase >= config.min_increase {
            rng.gen_range(config.min_increase..=config.max_increase)
        } else {
            config.min_increase
        };
        self.previous_attempt = time;
        self.current_delay = self.current_delay.saturating_add(increase).min(config.max_delay);
        self.next_attempt = time + u64::from(self.current_delay);
    }

    /// False once the last attempt is older than `stale_after`.
    pub fn is_still_valid(&self, time: u64, config: &BackoffConfig) -> bool {
        time.saturating_sub(self.previous_attempt) < u64::from(config.stale_after)
    }

    pub fn should_retry(&self, time: u64) -> bool {
        time >= self.next_attempt
    }

    pub fn current_delay(&self) -> u32 {
        self.current_delay
    }

    pub fn next_attempt(&self) -> u64 {
        self.next_attempt
    }
}

/// Backoff timers of one caller, keyed by position.
#[derive(Debug, Clone)]
pub struct BackoffCache {
    config: BackoffConfig,
    entries: HashMap<i64, JitteredLinearRetry>,
}

impl BackoffCache {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Forget entries whose last attempt went stale.
    pub fn prune(&mut self, time: u64) {
        let config = self.config;
        self.entries.retain(|_, retry| retry.is_still_valid(time, &config));
    }

    /// Whether `pos` may be offered as a candidate now. Offering a position
    /// that is under backoff but due counts as a new attempt.
    pub fn allows<R: Rng + ?Sized>(&mut self, pos: BlockPos, time: u64, rng: &mut R) -> bool {
        match self.entries.get_mut(&pos.as_long()) {
            None => true,
            Some(retry) if !retry.should_retry(time) => false,
            Some(retry) => {
                retry.mark_attempt(rng, time, &self.config);
                true
            }
        }
    }

    /// Put `pos` under backoff unless it already is.
    pub fn back_off<R: Rng + ?Sized>(&mut self, pos: BlockPos, time: u64, rng: &mut R) {
        let config = self.config;
        self.entries
            .entry(pos.as_long())
            .or_insert_with(|| JitteredLinearRetry::new(rng, time, &config));
    }

    pub fn get(&self, pos: BlockPos) -> Option<&JitteredLinearRetry> {
        self.entries.get(&pos.as_long())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn delay_grows_linearly_and_caps() {
        let config = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mut retry = JitteredLinearRetry::new(&mut rng, 0, &config);
        let first = retry.current_delay();
        assert!((40..=80).contains(&first));
        let mut previous = first;
        for t in 1..20 {
            retry.mark_attempt(&mut rng, t * 10, &config);
            assert!(retry.current_delay() >= previous);
            assert!(retry.current_delay() <= 400);
            previous = retry.current_delay();
        }
        assert_eq!(retry.current_delay(), 400);
        assert_eq!(retry.next_attempt(), 190 + 400);
    }

    #[test]
    fn staleness_and_retry_window() {
        let config = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(2);
        let retry = JitteredLinearRetry::new(&mut rng, 100, &config);
        assert!(!retry.should_retry(100));
        assert!(retry.should_retry(100 + u64::from(retry.current_delay())));
        assert!(retry.is_still_valid(499, &config));
        assert!(!retry.is_still_valid(500, &config));
    }

    #[test]
    fn cache_blocks_until_due() {
        let mut cache = BackoffCache::new(BackoffConfig::default());
        let mut rng = StdRng::seed_from_u64(3);
        let pos = BlockPos::new(1, 64, 1);
        assert!(cache.allows(pos, 0, &mut rng));
        cache.back_off(pos, 0, &mut rng);
        assert!(!cache.allows(pos, 10, &mut rng));
        let due = cache.get(pos).unwrap().next_attempt();
        assert!(cache.allows(pos, due, &mut rng));
        // the allowed retry counted as an attempt
        assert!(cache.get(pos).unwrap().next_attempt() > due);

        cache.prune(due + 1000);
        assert!(cache.is_empty());
    }

    #[test]
    fn increment_bounds_are_inclusive() {
        let config = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(5);
        let mut seen_max = false;
        let mut seen_min = false;
        for _ in 0..2000 {
            let delay = JitteredLinearRetry::new(&mut rng, 0, &config).current_delay();
            assert!((40..=80).contains(&delay));
            seen_max |= delay == 80;
            seen_min |= delay == 40;
        }
        assert!(seen_min && seen_max);
    }

    #[test]
    fn fixed_increment_when_bounds_match() {
        let config = BackoffConfig {
            min_increase: 50,
            max_increase: 50,
            ..BackoffConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(4);
        let retry = JitteredLinearRetry::new(&mut rng, 0, &config);
        assert_eq!(retry.current_delay(), 50);
    }
}
