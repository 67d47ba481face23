//! Per-policy mapping from partition key to limiter instance.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::clock::Clock;
use super::limiter::Limiter;
use super::options::LimiterOptions;
use super::partition::Partition;

/// Owns the limiters of one policy, keyed by partition key.
///
/// Lookup-or-create is atomic: when several requests see a new key at the
/// same time, exactly one limiter is built and all of them use it. The first
/// options seen for a key win. A retired limiter is never handed out; the
/// first request to find one replaces it.
pub struct PartitionMap {
    limiters: DashMap<String, Limiter>,
    clock: Arc<dyn Clock>,
    created: AtomicU64,
}

impl PartitionMap {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            limiters: DashMap::new(),
            clock,
            created: AtomicU64::new(0),
        }
    }

    /// Return the limiter for a partition, creating it on first sight.
    pub fn get_or_create(&self, partition: &Partition) -> Limiter {
        let (key, options) = match partition {
            Partition::NoLimit => return Limiter::NoLimit,
            Partition::Limited { key, options } => (key, options),
        };

        if let Some(limiter) = self.limiters.get(key) {
            if !limiter.is_retired() {
                return limiter.clone();
            }
        }

        match self.limiters.entry(key.clone()) {
            Entry::Occupied(mut entry) if entry.get().is_retired() => {
                let limiter = self.build(key, options);
                entry.insert(limiter.clone());
                limiter
            }
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let limiter = self.build(key, options);
                entry.insert(limiter.clone());
                limiter
            }
        }
    }

    fn build(&self, key: &str, options: &LimiterOptions) -> Limiter {
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(partition = %key, kind = options.kind(), "Creating partition limiter");
        Limiter::from_options(options, self.clock.clone())
    }

    pub fn get(&self, key: &str) -> Option<Limiter> {
        self.limiters.get(key).map(|limiter| limiter.clone())
    }

    /// Number of live partitions.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Limiters constructed over the map's lifetime.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Partition keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.limiters.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Retire and drop limiters that have been idle for at least `max_idle`.
    ///
    /// Handles resolved before the sweep stay valid but refuse to grant, so a
    /// partition never has two live limiters. Returns the number of
    /// partitions evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut evicted = 0;
        self.limiters.retain(|key, limiter| {
            if !limiter.retire_if_idle(max_idle) {
                return true;
            }
            debug!(partition = %key, "Evicting idle partition");
            evicted += 1;
            false
        });
        evicted
    }

    pub fn clear(&self) {
        self.limiters.clear();
    }
}

impl std::fmt::Debug for PartitionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionMap")
            .field("partitions", &self.limiters.len())
            .field("created", &self.created_count())
            .finish()
    }
}
