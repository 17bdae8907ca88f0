//! Fingerprint prevalence: the set of canonical fingerprints seen before.
//!
//! Two tiers: an immutable known set seeded from the resource archive, and
//! an adaptive LRU learned at runtime. The adaptive set is the only mutable
//! state shared between worker threads; updates take the write lock with
//! `try_write` and are silently skipped under contention. LRU accuracy is
//! best-effort by design and never worth blocking a worker for.

use std::collections::HashSet;
use std::sync::RwLock;

use hashlink::LinkedHashMap;

pub const DEFAULT_MAX_CACHE_SIZE: usize = 100_000;

pub struct FingerprintPrevalence {
    known: HashSet<String>,
    adaptive: RwLock<LinkedHashMap<String, ()>>,
    max_cache_size: usize,
}

impl FingerprintPrevalence {
    pub fn new(max_cache_size: usize) -> Self {
        FingerprintPrevalence {
            known: HashSet::new(),
            adaptive: RwLock::new(LinkedHashMap::new()),
            max_cache_size,
        }
    }

    /// Seeds the immutable known set; load-time only.
    pub fn initial_add(&mut self, fp: &str) {
        self.known.insert(fp.to_string());
    }

    pub fn known_len(&self) -> usize {
        self.known.len()
    }

    pub fn adaptive_len(&self) -> usize {
        self.adaptive.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Checks the known set first, then the adaptive set under a shared
    /// lock.
    pub fn contains(&self, fp: &str) -> bool {
        if self.known.contains(fp) {
            return true;
        }
        match self.adaptive.read() {
            Ok(set) => set.contains_key(fp),
            Err(_) => false,
        }
    }

    /// Records a sighting. Known fingerprints are never cached; a
    /// contended write lock skips the update.
    pub fn update(&self, fp: &str) {
        if self.known.contains(fp) {
            return;
        }
        let Ok(mut set) = self.adaptive.try_write() else {
            return;
        };
        if set.to_back(fp).is_some() {
            return; // moved to the fresh end
        }
        if set.len() >= self.max_cache_size {
            set.pop_front();
        }
        set.insert(fp.to_string(), ());
    }
}
