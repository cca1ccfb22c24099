//! Leak detection for isolation units.
//!
//! The detector keeps a ledger of units the coordinator believes are live
//! and periodically compares it with the number of units the process still
//! has loaded. Units that were closed but are still loaded (something holds
//! a reference into the package) show up as the difference. This is a
//! heuristic: release can lag behind close, so a positive is only reported
//! as suspected and never acted upon.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::LeakConfig;
use crate::memory::MemoryProbe;
use crate::telemetry::TelemetrySource;

/// Packages listed in a report.
const MAX_SUSPECTS: usize = 5;

/// Ledger and process counters at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LeakAssessment {
    /// Baseline plus units tracked as active.
    pub expected_units: usize,
    /// Units the process reports as loaded.
    pub actual_units: usize,
    /// `max(0, actual - expected)`.
    pub leaked_units: usize,
    /// Units loaded over the process lifetime.
    pub total_loaded: u64,
    /// Units unloaded over the process lifetime.
    pub total_unloaded: u64,
    /// `total_unloaded / total_loaded`, 1.0 before the first load.
    pub unload_ratio: f64,
    /// Whether a leak is suspected.
    pub suspected: bool,
}

/// A package ranked in a leak report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSuspect {
    /// Package name.
    pub package: String,
    /// Units of the package the process still has loaded.
    pub live_units: usize,
    /// Units of the package the ledger tracks as active.
    pub tracked_units: usize,
}

impl PackageSuspect {
    /// Loaded units not accounted for by the ledger.
    pub fn suspected_leaked(&self) -> usize {
        self.live_units.saturating_sub(self.tracked_units)
    }
}

/// Diagnostic report logged when a leak is suspected.
#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    /// Counters behind the verdict.
    pub assessment: LeakAssessment,
    /// Resident memory, when the platform exposes it.
    pub resident_bytes: Option<u64>,
    /// Resident memory against the configured budget.
    pub heap_utilization: f64,
    /// Packages ranked by suspected leaked units.
    pub suspects: Vec<PackageSuspect>,
    /// When the report was produced.
    pub generated_at: DateTime<Utc>,
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.assessment;
        writeln!(f, "=== Isolation unit leak report ({}) ===", self.generated_at.to_rfc3339())?;
        writeln!(f, "Expected units: {}", a.expected_units)?;
        writeln!(f, "Actual units:   {}", a.actual_units)?;
        writeln!(f, "Leaked units:   {}", a.leaked_units)?;
        writeln!(
            f,
            "Lifetime:       {} loaded, {} unloaded (ratio {:.2})",
            a.total_loaded, a.total_unloaded, a.unload_ratio
        )?;
        match self.resident_bytes {
            Some(bytes) => writeln!(f, "Resident:       {:.2} MiB", bytes as f64 / (1024.0 * 1024.0))?,
            None => writeln!(f, "Resident:       unavailable")?,
        }
        writeln!(f, "Heap:           {:.1}%", self.heap_utilization * 100.0)?;
        if self.suspects.is_empty() {
            write!(f, "No package holds unaccounted units")
        } else {
            write!(f, "Top suspects:")?;
            for s in &self.suspects {
                write!(
                    f,
                    "\n  {}: {} live, {} tracked, {} suspected",
                    s.package,
                    s.live_units,
                    s.tracked_units,
                    s.suspected_leaked()
                )?;
            }
            Ok(())
        }
    }
}

/// Correlates unit create/destroy events with process counters.
pub struct LeakDetector {
    config: LeakConfig,
    telemetry: Arc<dyn TelemetrySource>,
    memory: MemoryProbe,
    active: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
    per_package: DashMap<String, usize>,
    last: Mutex<Option<LeakAssessment>>,
}

impl LeakDetector {
    /// Create a detector reading counters from `telemetry`.
    pub fn new(config: LeakConfig, telemetry: Arc<dyn TelemetrySource>, memory: MemoryProbe) -> Self {
        Self {
            config,
            telemetry,
            memory,
            active: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            per_package: DashMap::new(),
            last: Mutex::new(None),
        }
    }

    /// Record that a unit was created for `package`.
    pub fn on_unit_created(&self, package: &str) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.per_package.entry(package.to_string()).or_insert(0) += 1;
        debug!(package = %package, active = self.tracked_active(), "Unit created");
    }

    /// Record that a unit of `package` was closed.
    pub fn on_unit_destroyed(&self, package: &str) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        if let Some(mut count) = self.per_package.get_mut(package) {
            *count = count.saturating_sub(1);
        }
        self.per_package.remove_if(package, |_, count| *count == 0);
        debug!(package = %package, active = self.tracked_active(), "Unit destroyed");
    }

    /// Units the ledger tracks as active.
    pub fn tracked_active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Units the ledger tracks as active for `package`.
    pub fn tracked_for(&self, package: &str) -> usize {
        self.per_package.get(package).map(|c| *c).unwrap_or(0)
    }

    /// Units created and destroyed over the detector's lifetime.
    pub fn lifetime_events(&self) -> (u64, u64) {
        (
            self.created.load(Ordering::SeqCst),
            self.destroyed.load(Ordering::SeqCst),
        )
    }

    /// Baseline plus tracked units.
    pub fn expected_units(&self) -> usize {
        self.config.baseline_units + self.tracked_active()
    }

    /// Loaded units not accounted for by the ledger; never negative.
    pub fn estimate_leaked(&self) -> usize {
        self.telemetry
            .loaded_units()
            .saturating_sub(self.expected_units())
    }

    /// Lifetime unload ratio; 1.0 before anything was loaded.
    pub fn unload_ratio(&self) -> f64 {
        let loaded = self.telemetry.total_loaded();
        if loaded == 0 {
            1.0
        } else {
            self.telemetry.total_unloaded() as f64 / loaded as f64
        }
    }

    /// Whether the counters suggest units are not being reclaimed.
    pub fn is_leak_suspected(&self) -> bool {
        self.assess().suspected
    }

    /// Read the counters once and judge them.
    pub fn assess(&self) -> LeakAssessment {
        let expected_units = self.expected_units();
        let actual_units = self.telemetry.loaded_units();
        let total_loaded = self.telemetry.total_loaded();
        let total_unloaded = self.telemetry.total_unloaded();
        let leaked_units = actual_units.saturating_sub(expected_units);
        let unload_ratio = if total_loaded == 0 {
            1.0
        } else {
            total_unloaded as f64 / total_loaded as f64
        };

        let ratio_suspect = total_loaded >= self.config.min_loaded_for_ratio
            && unload_ratio < self.config.unload_ratio_threshold;

        LeakAssessment {
            expected_units,
            actual_units,
            leaked_units,
            total_loaded,
            total_unloaded,
            unload_ratio,
            suspected: leaked_units > self.config.leak_threshold || ratio_suspect,
        }
    }

    /// Sampling tick: assess, remember the result, and log a report on suspicion.
    pub fn reconcile(&self) -> LeakAssessment {
        let assessment = self.assess();
        *self.last.lock() = Some(assessment);

        if assessment.suspected {
            warn!("Isolation unit leak suspected\n{}", self.report_for(assessment));
        } else {
            debug!(
                expected = assessment.expected_units,
                actual = assessment.actual_units,
                "Leak reconciliation clean"
            );
        }
        assessment
    }

    /// Result of the latest reconciliation tick.
    pub fn last_assessment(&self) -> Option<LeakAssessment> {
        *self.last.lock()
    }

    /// Build a diagnostic report from fresh counters.
    pub fn report(&self) -> LeakReport {
        self.report_for(self.assess())
    }

    fn report_for(&self, assessment: LeakAssessment) -> LeakReport {
        LeakReport {
            assessment,
            resident_bytes: self.memory.resident_bytes().ok(),
            heap_utilization: self.memory.utilization(),
            suspects: self.suspects(),
            generated_at: Utc::now(),
        }
    }

    fn suspects(&self) -> Vec<PackageSuspect> {
        let live = self.telemetry.loaded_units_by_package();

        let mut suspects: Vec<PackageSuspect> = if live.is_empty() {
            // No attribution available: rank by tracked units.
            self.per_package
                .iter()
                .map(|e| PackageSuspect {
                    package: e.key().clone(),
                    live_units: *e.value(),
                    tracked_units: *e.value(),
                })
                .collect()
        } else {
            live.into_iter()
                .map(|(package, live_units)| PackageSuspect {
                    tracked_units: self.tracked_for(&package),
                    package,
                    live_units,
                })
                .filter(|s| s.suspected_leaked() > 0)
                .collect()
        };

        suspects.sort_by(|a, b| {
            b.suspected_leaked()
                .cmp(&a.suspected_leaked())
                .then(b.live_units.cmp(&a.live_units))
                .then(a.package.cmp(&b.package))
        });
        suspects.truncate(MAX_SUSPECTS);
        suspects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ThreadSample;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeCounters {
        loaded: Mutex<Vec<(String, usize)>>,
        total_loaded: AtomicU64,
        total_unloaded: AtomicU64,
    }

    impl FakeCounters {
        fn load(&self, package: &str) {
            let mut loaded = self.loaded.lock();
            match loaded.iter_mut().find(|(p, _)| p == package) {
                Some((_, n)) => *n += 1,
                None => loaded.push((package.to_string(), 1)),
            }
            self.total_loaded.fetch_add(1, Ordering::SeqCst);
        }

        fn unload(&self, package: &str) {
            let mut loaded = self.loaded.lock();
            if let Some((_, n)) = loaded.iter_mut().find(|(p, _)| p == package) {
                *n -= 1;
            }
            loaded.retain(|(_, n)| *n > 0);
            self.total_unloaded.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl TelemetrySource for FakeCounters {
        fn loaded_units(&self) -> usize {
            self.loaded.lock().iter().map(|(_, n)| n).sum()
        }

        fn total_loaded(&self) -> u64 {
            self.total_loaded.load(Ordering::SeqCst)
        }

        fn total_unloaded(&self) -> u64 {
            self.total_unloaded.load(Ordering::SeqCst)
        }

        fn threads(&self) -> Vec<ThreadSample> {
            Vec::new()
        }

        fn loaded_units_by_package(&self) -> Vec<(String, usize)> {
            self.loaded.lock().clone()
        }
    }

    fn detector(config: LeakConfig) -> (Arc<FakeCounters>, LeakDetector) {
        let counters = Arc::new(FakeCounters::default());
        let detector = LeakDetector::new(config, counters.clone(), MemoryProbe::default());
        (counters, detector)
    }

    #[test]
    fn test_clean_deploy_undeploy_cycle() {
        let (counters, detector) = detector(LeakConfig::default());

        counters.load("repoA");
        detector.on_unit_created("repoA");
        assert_eq!(detector.estimate_leaked(), 0);
        assert_eq!(detector.tracked_for("repoA"), 1);

        detector.on_unit_destroyed("repoA");
        counters.unload("repoA");

        let assessment = detector.reconcile();
        assert_eq!(assessment.leaked_units, 0);
        assert_eq!(assessment.expected_units, 0);
        assert!(!assessment.suspected);
        assert_eq!(detector.tracked_for("repoA"), 0);
        assert_eq!(detector.last_assessment(), Some(assessment));
    }

    #[test]
    fn test_estimate_never_negative() {
        let (counters, detector) = detector(LeakConfig {
            baseline_units: 4,
            ..Default::default()
        });
        counters.load("repoA");
        assert_eq!(detector.estimate_leaked(), 0);

        // Destroy without a matching create must not underflow the ledger.
        detector.on_unit_destroyed("ghost");
        assert_eq!(detector.tracked_active(), 0);
        assert_eq!(detector.estimate_leaked(), 0);
    }

    #[test]
    fn test_unreclaimed_units_flagged() {
        let (counters, detector) = detector(LeakConfig {
            leak_threshold: 1,
            ..Default::default()
        });

        for _ in 0..3 {
            counters.load("repoA");
            detector.on_unit_created("repoA");
            detector.on_unit_destroyed("repoA");
        }
        counters.load("repoB");
        detector.on_unit_created("repoB");

        assert_eq!(detector.estimate_leaked(), 3);
        assert!(detector.is_leak_suspected());

        let report = detector.report();
        assert_eq!(report.suspects.len(), 1);
        assert_eq!(report.suspects[0].package, "repoA");
        assert_eq!(report.suspects[0].suspected_leaked(), 3);

        let text = report.to_string();
        assert!(text.contains("Leaked units:   3"));
        assert!(text.contains("repoA: 3 live, 0 tracked, 3 suspected"));
    }

    #[test]
    fn test_low_unload_ratio_needs_enough_samples() {
        let (counters, detector) = detector(LeakConfig {
            leak_threshold: 100,
            min_loaded_for_ratio: 4,
            ..Default::default()
        });

        for i in 0..3 {
            let package = format!("repo{}", i);
            counters.load(&package);
            detector.on_unit_created(&package);
        }
        assert!(!detector.is_leak_suspected());

        counters.load("repo3");
        detector.on_unit_created("repo3");
        assert_eq!(detector.unload_ratio(), 0.0);
        assert!(detector.is_leak_suspected());
    }
}
