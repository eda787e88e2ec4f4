use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mt_types::{BuildInputs, EvaluationResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Cached evaluation with access metadata
#[derive(Debug, Clone)]
struct CacheEntry {
    result: EvaluationResult,
    last_accessed: DateTime<Utc>,
    /// Logical clock value of the last access; breaks timestamp ties.
    last_tick: u64,
    access_count: u64,
}

impl CacheEntry {
    fn new(result: EvaluationResult, tick: u64) -> Self {
        Self {
            result,
            last_accessed: Utc::now(),
            last_tick: tick,
            access_count: 0,
        }
    }

    fn access(&mut self, tick: u64) {
        self.last_accessed = Utc::now();
        self.last_tick = tick;
        self.access_count += 1;
    }
}

/// In-memory cache of evaluation results keyed by the encoded build inputs.
///
/// Two assignments that encode to the same defines produce the same binary,
/// so one measurement serves both. Shared between concurrent evaluations.
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<BuildInputs, RwLock<CacheEntry>>,
    max_entries: usize,
    clock: AtomicU64,
    stats: RwLock<CacheStats>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCache {
    pub fn new() -> Self {
        Self::with_limit(4096)
    }

    pub fn with_limit(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            clock: AtomicU64::new(0),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, inputs: &BuildInputs) -> Option<EvaluationResult> {
        if let Some(entry_lock) = self.entries.get(inputs) {
            let mut entry = entry_lock.write();
            entry.access(self.tick());
            self.stats.write().hits += 1;
            return Some(entry.result.clone());
        }
        self.stats.write().misses += 1;
        None
    }

    pub fn store(&self, inputs: BuildInputs, result: EvaluationResult) {
        if !self.entries.contains_key(&inputs) && self.entries.len() >= self.max_entries {
            self.evict_lru();
        }
        let entry = CacheEntry::new(result, self.tick());
        self.entries.insert(inputs, RwLock::new(entry));
        self.stats.write().stores += 1;
    }

    /// Evict the least recently used tenth of the entries (at least one).
    fn evict_lru(&self) {
        let to_remove = (self.entries.len() / 10).max(1);
        let mut candidates: Vec<(BuildInputs, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().read().last_tick))
            .collect();
        candidates.sort_by_key(|(_, tick)| *tick);

        for (key, _) in candidates.into_iter().take(to_remove) {
            if let Some((key, entry)) = self.entries.remove(&key) {
                let entry = entry.into_inner();
                debug!(
                    inputs = %key,
                    hits = entry.access_count,
                    last_accessed = %entry.last_accessed,
                    "evicted cached evaluation"
                );
                self.stats.write().evictions += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        *self.stats.write() = CacheStats::default();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mt_types::{BuildDefine, Metrics};

    fn inputs(alignment: u32) -> BuildInputs {
        BuildInputs::new(vec![BuildDefine::new("ALIGNMENT", alignment.to_string())])
    }

    fn passing(util: f64) -> EvaluationResult {
        let mut metrics = Metrics::new();
        metrics.insert("util".to_string(), util);
        EvaluationResult::pass(metrics)
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = ResultCache::new();
        assert!(cache.get(&inputs(8)).is_none());

        cache.store(inputs(8), passing(0.7));
        let hit = cache.get(&inputs(8)).unwrap();
        assert_eq!(hit.metric("util"), Some(0.7));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResultCache::with_limit(3);
        cache.store(inputs(8), passing(0.1));
        cache.store(inputs(16), passing(0.2));
        cache.store(inputs(32), passing(0.3));

        // Touch the oldest so 16 becomes the eviction candidate.
        cache.get(&inputs(8));
        cache.store(inputs(64), passing(0.4));

        assert_eq!(cache.len(), 3);
        assert!(cache.get(&inputs(16)).is_none());
        assert!(cache.get(&inputs(8)).is_some());
        assert!(cache.get(&inputs(64)).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_clear_resets_stats() {
        let cache = ResultCache::new();
        cache.store(inputs(8), passing(0.1));
        cache.get(&inputs(8));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
