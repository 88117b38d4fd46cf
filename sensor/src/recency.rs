use crate::config::RecencyConfig;
use std::collections::HashSet;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Approximate "seen recently" set built from a ring of generations.
///
/// A key answers `true` while it sits in any generation but the oldest. At
/// most every `frequency` lookups, once `cycle` has elapsed, the oldest
/// generation is dropped and becomes the new current one, so a key that
/// stops appearing is forgotten after roughly `cycle * buckets`.
#[derive(Debug)]
pub struct RecentCache<K> {
    buckets: Vec<HashSet<K>>,
    current: usize,
    working_set: HashSet<K>,
    cycle: Duration,
    frequency: u64,
    count: u64,
    last_rotation: Instant,
}

impl<K: Eq + Hash + Clone> RecentCache<K> {
    pub fn new(config: RecencyConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    pub fn new_at(config: RecencyConfig, now: Instant) -> Self {
        let buckets = config.buckets.max(1);
        Self {
            buckets: (0..buckets).map(|_| HashSet::new()).collect(),
            current: 0,
            working_set: HashSet::new(),
            cycle: config.cycle(),
            frequency: config.frequency.max(1),
            count: 0,
            last_rotation: now,
        }
    }

    pub fn seen(&mut self, key: &K) -> bool {
        self.seen_at(key, Instant::now())
    }

    /// Returns `true` if `key` was seen recently, otherwise remembers it and
    /// returns `false`.
    pub fn seen_at(&mut self, key: &K, now: Instant) -> bool {
        self.check_rotation(now);
        if self.working_set.contains(key) {
            return true;
        }
        self.working_set.insert(key.clone());
        self.buckets[self.current].insert(key.clone());
        false
    }

    /// Distinct keys currently answering `true`.
    pub fn len(&self) -> usize {
        self.working_set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.working_set.is_empty()
    }

    fn check_rotation(&mut self, now: Instant) {
        self.count += 1;
        if self.count < self.frequency {
            return;
        }
        self.count = 0;
        if now.saturating_duration_since(self.last_rotation) < self.cycle {
            return;
        }
        self.rotate(now);
    }

    fn rotate(&mut self, now: Instant) {
        self.last_rotation = now;
        let oldest = (self.current + 1) % self.buckets.len();
        self.buckets[oldest].clear();
        self.current = oldest;
        self.working_set = self.buckets.iter().flatten().cloned().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(frequency: u64) -> RecencyConfig {
        RecencyConfig { cycle_secs: 30, buckets: 3, frequency }
    }

    #[test]
    fn second_lookup_is_seen() {
        let start = Instant::now();
        let mut cache = RecentCache::new_at(config(10), start);
        assert!(!cache.seen_at(&"k", start));
        assert!(cache.seen_at(&"k", start));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn forgotten_after_all_buckets_rotate() {
        let start = Instant::now();
        let mut cache = RecentCache::new_at(config(1), start);
        assert!(!cache.seen_at(&"k", start));

        // Two rotations keep the key in a surviving generation.
        let mut now = start;
        for _ in 0..2 {
            now += Duration::from_secs(31);
            cache.seen_at(&"other", now);
        }
        assert!(cache.working_set.contains("k"));

        now += Duration::from_secs(31);
        cache.seen_at(&"other", now);
        assert!(!cache.seen_at(&"k", now));
    }

    #[test]
    fn rotation_waits_for_frequency() {
        let start = Instant::now();
        let mut cache = RecentCache::new_at(config(10), start);
        cache.seen_at(&"k", start);
        let later = start + Duration::from_secs(3600);
        // Nine lookups in, no rotation check yet.
        for _ in 0..8 {
            cache.seen_at(&"filler", later);
        }
        assert_eq!(cache.last_rotation, start);
        cache.seen_at(&"x", later);
        assert_eq!(cache.last_rotation, later);
    }

    #[test]
    fn rotation_waits_for_cycle() {
        let start = Instant::now();
        let mut cache = RecentCache::new_at(config(1), start);
        cache.seen_at(&"k", start);
        for _ in 0..100 {
            assert!(cache.seen_at(&"k", start + Duration::from_secs(29)));
        }
        assert_eq!(cache.last_rotation, start);
    }
}
