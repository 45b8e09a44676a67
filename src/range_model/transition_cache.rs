//! Cache of transition matrices keyed by (period, branch duration).
//!
//! Entries belong to one rate snapshot; a new snapshot generation empties the
//! cache before the next fill.

use std::collections::HashMap;

use ndarray::Array2;

/// Cache key: period index and the exact bit pattern of the duration.
pub type TransitionKey = (usize, u64);

pub fn transition_key(period: usize, duration: f64) -> TransitionKey {
    (period, duration.to_bits())
}

/// Hit/miss counters since the last reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
}

#[derive(Clone, Debug, Default)]
pub struct TransitionCache {
    generation: u64,
    entries: HashMap<TransitionKey, Array2<f64>>,
    hits: usize,
    misses: usize,
}

impl TransitionCache {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drop every entry if they were built for another rate snapshot.
    pub fn sync_generation(&mut self, generation: u64) {
        if self.generation != generation {
            self.entries.clear();
            self.generation = generation;
        }
    }

    pub fn contains(&self, key: &TransitionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, period: usize, duration: f64) -> Option<&Array2<f64>> {
        self.entries.get(&transition_key(period, duration))
    }

    pub fn insert(&mut self, key: TransitionKey, matrix: Array2<f64>) {
        self.entries.insert(key, matrix);
    }

    pub fn record(&mut self, hits: usize, misses: usize) {
        self.hits += hits;
        self.misses += misses;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits = 0;
        self.misses = 0;
    }
}
