//! Process-wide accounting of loaded units.
//!
//! The census is the ground truth the leak detector reconciles against: a
//! unit counts as live from the moment its image is mapped until the last
//! [`UnitGuard`](crate::guard::UnitGuard) referring to it is dropped, which
//! may be long after the coordinator closed it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;

/// Point-in-time copy of the census counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CensusSnapshot {
    /// Units currently mapped.
    pub live_units: usize,

    /// Units mapped over the process lifetime.
    pub total_loaded: u64,

    /// Units unmapped over the process lifetime.
    pub total_unloaded: u64,
}

/// Counters of mapped units, overall and per package.
#[derive(Debug, Default)]
pub struct UnitCensus {
    live: AtomicUsize,
    total_loaded: AtomicU64,
    total_unloaded: AtomicU64,
    per_package: DashMap<String, usize>,
}

impl UnitCensus {
    /// Create an empty census.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_loaded(&self, package: &str) {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.total_loaded.fetch_add(1, Ordering::SeqCst);
        *self.per_package.entry(package.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn record_unloaded(&self, package: &str) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.total_unloaded.fetch_add(1, Ordering::SeqCst);
        if let Some(mut count) = self.per_package.get_mut(package) {
            *count = count.saturating_sub(1);
        }
        self.per_package.remove_if(package, |_, count| *count == 0);
    }

    /// Units currently mapped.
    pub fn live_units(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Units mapped over the process lifetime.
    pub fn total_loaded(&self) -> u64 {
        self.total_loaded.load(Ordering::SeqCst)
    }

    /// Units unmapped over the process lifetime.
    pub fn total_unloaded(&self) -> u64 {
        self.total_unloaded.load(Ordering::SeqCst)
    }

    /// Live units of one package.
    pub fn live_for(&self, package: &str) -> usize {
        self.per_package.get(package).map(|c| *c).unwrap_or(0)
    }

    /// Live units per package, for packages with at least one.
    pub fn live_by_package(&self) -> Vec<(String, usize)> {
        let mut out: Vec<_> = self
            .per_package
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        out.sort();
        out
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> CensusSnapshot {
        CensusSnapshot {
            live_units: self.live_units(),
            total_loaded: self.total_loaded(),
            total_unloaded: self.total_unloaded(),
        }
    }
}
