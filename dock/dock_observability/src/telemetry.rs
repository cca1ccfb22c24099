//! Process telemetry.
//!
//! [`TelemetrySource`] is the only view the leak detector and the
//! blocked-worker monitor have of the process: loaded-unit counters and
//! per-thread samples. [`ProcessTelemetry`] implements it over the unit
//! census and the thread registry; tests substitute their own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dock_isolation::UnitCensus;
use serde::Serialize;

use crate::threads::ThreadRegistry;

/// Role of a thread, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadRole {
    /// Multiplexes requests; must never block.
    Reactor,
    /// Runs blocking host work.
    Worker,
    /// Anything else.
    Other,
}

/// Scheduling state of a sampled thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    /// Executing a unit of work.
    Running,
    /// Waiting for work.
    Idle,
}

/// One thread as seen by a telemetry sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSample {
    /// Stable thread number.
    pub thread_id: u64,
    /// Thread name.
    pub name: String,
    /// Classified role.
    pub role: ThreadRole,
    /// Current state.
    pub state: ThreadState,
    /// Time spent in the current unit of work without yielding.
    pub blocked_for: Duration,
    /// Activity frames, outermost first.
    pub stack: Vec<String>,
}

/// Source of process-wide counters.
pub trait TelemetrySource: Send + Sync {
    /// Code units currently loaded.
    fn loaded_units(&self) -> usize;

    /// Code units loaded over the process lifetime.
    fn total_loaded(&self) -> u64;

    /// Code units unloaded over the process lifetime.
    fn total_unloaded(&self) -> u64;

    /// Every live thread the source can observe.
    fn threads(&self) -> Vec<ThreadSample>;

    /// Loaded units per package, where the runtime can attribute them.
    fn loaded_units_by_package(&self) -> Vec<(String, usize)> {
        Vec::new()
    }
}

/// Classifies threads by name fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleClassifier {
    reactor_pattern: String,
    worker_pattern: String,
}

impl RoleClassifier {
    /// Create a classifier from the two name fragments.
    pub fn new(reactor_pattern: impl Into<String>, worker_pattern: impl Into<String>) -> Self {
        Self {
            reactor_pattern: reactor_pattern.into(),
            worker_pattern: worker_pattern.into(),
        }
    }

    /// Role of a thread called `name`.
    pub fn classify(&self, name: &str) -> ThreadRole {
        if name.contains(&self.reactor_pattern) {
            ThreadRole::Reactor
        } else if name.contains(&self.worker_pattern) {
            ThreadRole::Worker
        } else {
            ThreadRole::Other
        }
    }
}

impl Default for RoleClassifier {
    fn default() -> Self {
        Self::new("dock-reactor", "dock-worker")
    }
}

/// Telemetry of the running process.
pub struct ProcessTelemetry {
    census: Arc<UnitCensus>,
    threads: Arc<ThreadRegistry>,
    classifier: RoleClassifier,
}

impl ProcessTelemetry {
    /// Observe `census` and `threads`.
    pub fn new(
        census: Arc<UnitCensus>,
        threads: Arc<ThreadRegistry>,
        classifier: RoleClassifier,
    ) -> Self {
        Self {
            census,
            threads,
            classifier,
        }
    }
}

impl TelemetrySource for ProcessTelemetry {
    fn loaded_units(&self) -> usize {
        self.census.live_units()
    }

    fn total_loaded(&self) -> u64 {
        self.census.total_loaded()
    }

    fn total_unloaded(&self) -> u64 {
        self.census.total_unloaded()
    }

    fn threads(&self) -> Vec<ThreadSample> {
        let now = Instant::now();
        self.threads
            .entries()
            .into_iter()
            .map(|entry| {
                let busy = entry.busy_for(now);
                ThreadSample {
                    thread_id: entry.id(),
                    name: entry.name().to_string(),
                    role: self.classifier.classify(entry.name()),
                    state: if busy.is_some() {
                        ThreadState::Running
                    } else {
                        ThreadState::Idle
                    },
                    blocked_for: busy.unwrap_or_default(),
                    stack: entry.frames(),
                }
            })
            .collect()
    }

    fn loaded_units_by_package(&self) -> Vec<(String, usize)> {
        self.census.live_by_package()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_classifier() {
        let classifier = RoleClassifier::default();
        assert_eq!(classifier.classify("dock-reactor-3"), ThreadRole::Reactor);
        assert_eq!(classifier.classify("dock-worker-0"), ThreadRole::Worker);
        assert_eq!(classifier.classify("main"), ThreadRole::Other);
    }

    #[test]
    fn test_process_samples_busy_thread() {
        let registry = Arc::new(ThreadRegistry::new());
        let telemetry = ProcessTelemetry::new(
            Arc::new(UnitCensus::new()),
            registry.clone(),
            RoleClassifier::default(),
        );

        let remote = registry.clone();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("dock-reactor-0".to_string())
            .spawn(move || {
                let _frame = remote.enter("dispatch slow.v1");
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .unwrap();

        started_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));

        let sample = telemetry
            .threads()
            .into_iter()
            .find(|s| s.name == "dock-reactor-0")
            .unwrap();
        assert_eq!(sample.role, ThreadRole::Reactor);
        assert_eq!(sample.state, ThreadState::Running);
        assert!(sample.blocked_for >= Duration::from_millis(20));
        assert_eq!(sample.stack, vec!["dispatch slow.v1"]);

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        assert_eq!(telemetry.loaded_units(), 0);
    }
}
