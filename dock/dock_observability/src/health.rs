//! Host health evaluation.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, warn};

use crate::blocked::BlockedWorkerMonitor;
use crate::config::HealthConfig;
use crate::leak::LeakDetector;
use crate::memory::MemoryProbe;

/// Overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Serving normally.
    Healthy,
    /// Should be taken out of rotation.
    Unhealthy,
}

impl HealthStatus {
    /// Whether the status is healthy.
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Verdict.
    pub status: HealthStatus,
    /// Resident memory over the budget.
    pub heap_utilization: f64,
    /// Modules currently deployed.
    pub active_modules: usize,
    /// Threads tracked as blocked.
    pub blocked_threads: usize,
    /// Reactor threads tracked as blocked.
    pub blocked_reactor_threads: usize,
    /// Why the host is unhealthy, if it is.
    #[serde(skip)]
    pub reasons: Vec<String>,
}

/// Aggregates memory, leak and blocked-thread signals.
pub struct HealthChecker {
    config: HealthConfig,
    blocked_warn_count: usize,
    memory: MemoryProbe,
    leaks: Arc<LeakDetector>,
    blocked: Arc<BlockedWorkerMonitor>,
}

impl HealthChecker {
    /// Create a checker over the two monitors.
    pub fn new(
        config: HealthConfig,
        blocked_warn_count: usize,
        leaks: Arc<LeakDetector>,
        blocked: Arc<BlockedWorkerMonitor>,
    ) -> Self {
        let memory = MemoryProbe::new(config.memory_budget_bytes);
        Self {
            config,
            blocked_warn_count,
            memory,
            leaks,
            blocked,
        }
    }

    /// Evaluate health with `active_modules` deployed.
    pub fn check(&self, active_modules: usize) -> HealthReport {
        let heap_utilization = self.memory.utilization();
        self.evaluate(heap_utilization, active_modules)
    }

    fn evaluate(&self, heap_utilization: f64, active_modules: usize) -> HealthReport {
        let mut reasons = Vec::new();

        if heap_utilization > self.config.heap_critical {
            error!(
                heap_utilization,
                "Heap utilisation critical\n{}",
                self.leaks.report()
            );
            reasons.push(format!("heap utilisation {:.2}", heap_utilization));
        } else if heap_utilization > self.config.heap_warn {
            warn!(heap_utilization, "Heap utilisation high");
        }

        let assessment = self.leaks.assess();
        if assessment.suspected {
            reasons.push(format!(
                "{} isolation units suspected leaked",
                assessment.leaked_units
            ));
        }

        let blocked_threads = self.blocked.blocked_count();
        let blocked_reactor_threads = self.blocked.reactor_blocked_count();
        if blocked_reactor_threads > 0 {
            reasons.push(format!("{} reactor threads blocked", blocked_reactor_threads));
        }
        if blocked_threads > self.blocked_warn_count {
            warn!(
                blocked_threads,
                "Many threads blocked\n{}",
                self.blocked.report()
            );
        }

        let status = if reasons.is_empty() {
            HealthStatus::Healthy
        } else {
            warn!(reasons = ?reasons, "Host unhealthy");
            HealthStatus::Unhealthy
        };

        HealthReport {
            status,
            heap_utilization,
            active_modules,
            blocked_threads,
            blocked_reactor_threads,
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlockedConfig, LeakConfig};
    use crate::telemetry::{TelemetrySource, ThreadRole, ThreadSample, ThreadState};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Fake {
        loaded: Mutex<usize>,
        threads: Mutex<Vec<ThreadSample>>,
    }

    impl TelemetrySource for Fake {
        fn loaded_units(&self) -> usize {
            *self.loaded.lock()
        }

        fn total_loaded(&self) -> u64 {
            *self.loaded.lock() as u64
        }

        fn total_unloaded(&self) -> u64 {
            0
        }

        fn threads(&self) -> Vec<ThreadSample> {
            self.threads.lock().clone()
        }
    }

    fn checker(fake: Arc<Fake>) -> (HealthChecker, Arc<BlockedWorkerMonitor>) {
        let leaks = Arc::new(LeakDetector::new(
            LeakConfig::default(),
            fake.clone(),
            MemoryProbe::default(),
        ));
        let blocked = Arc::new(BlockedWorkerMonitor::new(BlockedConfig::default(), fake));
        let checker = HealthChecker::new(HealthConfig::default(), 10, leaks, blocked.clone());
        (checker, blocked)
    }

    #[test]
    fn test_healthy_when_quiet() {
        let (checker, _) = checker(Arc::new(Fake::default()));
        let report = checker.evaluate(0.10, 2);
        assert!(report.status.is_healthy());
        assert_eq!(report.active_modules, 2);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json.get("reasons").is_none());
    }

    #[test]
    fn test_heap_thresholds() {
        let (checker, _) = checker(Arc::new(Fake::default()));
        assert!(checker.evaluate(0.85, 0).status.is_healthy());
        assert_eq!(checker.evaluate(0.95, 0).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_blocked_reactor_is_unhealthy() {
        let fake = Arc::new(Fake::default());
        let (checker, blocked) = checker(fake.clone());
        *fake.threads.lock() = vec![ThreadSample {
            thread_id: 1,
            name: "dock-reactor-0".to_string(),
            role: ThreadRole::Reactor,
            state: ThreadState::Running,
            blocked_for: Duration::from_millis(400),
            stack: vec!["dispatch slow.v1".to_string()],
        }];
        blocked.sample();

        let report = checker.evaluate(0.10, 1);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.blocked_reactor_threads, 1);
        assert_eq!(report.blocked_threads, 1);
    }

    #[test]
    fn test_leak_is_unhealthy() {
        let fake = Arc::new(Fake::default());
        *fake.loaded.lock() = 5;
        let (checker, _) = checker(fake);

        let report = checker.evaluate(0.10, 0);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.reasons.len(), 1);
    }
}
