//! Learned conflict patterns.
//!
//! Occurrences and per-strategy outcomes keyed by (conflict type, resource
//! category). The table is LRU-capped so long-running peers stay bounded.
//! It only ever reorders recommendations; it never picks a strategy the
//! detector did not recommend.

use crate::conflict::{ConflictType, ResolutionStrategy};
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;

/// Capacity used when the configured one is zero.
const FALLBACK_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStats {
    pub attempts: u32,
    pub successes: u32,
}

impl StrategyStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPattern {
    pub conflict_type: ConflictType,
    pub resource_category: &'static str,
    pub occurrences: u64,
    pub strategies: BTreeMap<ResolutionStrategy, StrategyStats>,
    pub last_seen: DateTime<Utc>,
}

impl ConflictPattern {
    fn new(conflict_type: ConflictType, resource_category: &'static str, now: DateTime<Utc>) -> Self {
        Self {
            conflict_type,
            resource_category,
            occurrences: 0,
            strategies: BTreeMap::new(),
            last_seen: now,
        }
    }

    /// Successes over attempts across every strategy tried.
    pub fn success_rate(&self) -> f64 {
        let (attempts, successes) = self
            .strategies
            .values()
            .fold((0u32, 0u32), |(a, s), stats| (a + stats.attempts, s + stats.successes));
        if attempts == 0 {
            0.0
        } else {
            successes as f64 / attempts as f64
        }
    }
}

type PatternKey = (ConflictType, &'static str);

pub struct PatternTable {
    cache: LruCache<PatternKey, ConflictPattern>,
}

impl PatternTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(FALLBACK_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// Count one detection.
    pub fn observe(
        &mut self,
        conflict_type: ConflictType,
        category: &'static str,
        now: DateTime<Utc>,
    ) {
        let pattern = self.entry(conflict_type, category, now);
        pattern.occurrences += 1;
        pattern.last_seen = now;
    }

    /// Count one resolution attempt.
    pub fn record_attempt(
        &mut self,
        conflict_type: ConflictType,
        category: &'static str,
        strategy: ResolutionStrategy,
        success: bool,
        now: DateTime<Utc>,
    ) {
        let pattern = self.entry(conflict_type, category, now);
        let stats = pattern.strategies.entry(strategy).or_default();
        stats.attempts += 1;
        if success {
            stats.successes += 1;
        }
        pattern.last_seen = now;
    }

    /// Read without touching recency.
    pub fn get(&self, conflict_type: ConflictType, category: &'static str) -> Option<&ConflictPattern> {
        self.cache.peek(&(conflict_type, category))
    }

    /// Stable re-ranking by success rate.
    ///
    /// Strategies with fewer than `min_attempts` recorded attempts score a
    /// neutral 0.5 and keep their detector order relative to each other.
    pub fn rank(
        &self,
        conflict_type: ConflictType,
        category: &'static str,
        recommendations: &[ResolutionStrategy],
        min_attempts: u32,
    ) -> Vec<ResolutionStrategy> {
        let mut ranked: Vec<ResolutionStrategy> = recommendations.to_vec();
        let Some(pattern) = self.get(conflict_type, category) else {
            return ranked;
        };
        let score = |strategy: &ResolutionStrategy| -> f64 {
            match pattern.strategies.get(strategy) {
                Some(stats) if stats.attempts >= min_attempts => stats.success_rate(),
                _ => 0.5,
            }
        };
        ranked.sort_by(|a, b| score(b).total_cmp(&score(a)));
        ranked
    }

    /// Patterns from most to least recently used.
    pub fn patterns(&self) -> Vec<&ConflictPattern> {
        self.cache.iter().map(|(_, pattern)| pattern).collect()
    }

    fn entry(
        &mut self,
        conflict_type: ConflictType,
        category: &'static str,
        now: DateTime<Utc>,
    ) -> &mut ConflictPattern {
        self.cache.get_or_insert_mut((conflict_type, category), || {
            ConflictPattern::new(conflict_type, category, now)
        })
    }
}

impl std::fmt::Debug for PatternTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternTable")
            .field("len", &self.cache.len())
            .field("capacity", &self.cache.cap())
            .finish()
    }
}
