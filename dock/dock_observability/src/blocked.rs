//! Blocked-worker monitor.
//!
//! Samples every observable thread and tracks those that have held a unit of
//! work past the blocked threshold. Reactor threads are escalated to
//! critical as soon as they are tracked, since a blocked reactor stalls
//! every request multiplexed onto it; other threads escalate once they pass
//! the critical threshold.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::BlockedConfig;
use crate::telemetry::{TelemetrySource, ThreadRole, ThreadSample, ThreadState};

/// A thread currently tracked as blocked.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedThreadRecord {
    /// Thread number from the telemetry source.
    pub thread_id: u64,
    /// Thread name.
    pub name: String,
    /// Classified role.
    pub role: ThreadRole,
    /// State at the last sample.
    pub state: ThreadState,
    /// Blocked duration at the last sample.
    pub blocked_for: Duration,
    /// Activity frames at the last sample.
    pub stack: Vec<String>,
    /// When the thread was first seen blocked.
    pub first_seen: DateTime<Utc>,
    /// When the record was last refreshed.
    pub last_updated: DateTime<Utc>,
    /// Whether the record was escalated.
    pub critical: bool,
}

/// Snapshot of the tracked set, longest blocked first.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedReport {
    /// Tracked threads.
    pub threads: Vec<BlockedThreadRecord>,
    /// When the report was produced.
    pub generated_at: DateTime<Utc>,
}

impl fmt::Display for BlockedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "=== Blocked thread report ({}) ===\nBlocked threads: {}",
            self.generated_at.to_rfc3339(),
            self.threads.len()
        )?;
        for t in &self.threads {
            write!(
                f,
                "\n  [{:?}] {} (#{}) blocked {}ms since {}{}",
                t.role,
                t.name,
                t.thread_id,
                t.blocked_for.as_millis(),
                t.first_seen.to_rfc3339(),
                if t.critical { " CRITICAL" } else { "" }
            )?;
            for frame in t.stack.iter().rev() {
                write!(f, "\n      at {}", frame)?;
            }
        }
        Ok(())
    }
}

/// Outcome of one sampling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleSummary {
    /// Threads tracked after the pass.
    pub blocked: usize,
    /// Reactor threads tracked after the pass.
    pub reactor_blocked: usize,
    /// Threads added by the pass.
    pub newly_blocked: usize,
    /// Threads evicted by the pass.
    pub recovered: usize,
}

/// Samples thread telemetry and tracks blocked threads.
pub struct BlockedWorkerMonitor {
    config: BlockedConfig,
    telemetry: Arc<dyn TelemetrySource>,
    tracked: Mutex<HashMap<u64, BlockedThreadRecord>>,
}

impl BlockedWorkerMonitor {
    /// Create a monitor over `telemetry`.
    pub fn new(config: BlockedConfig, telemetry: Arc<dyn TelemetrySource>) -> Self {
        Self {
            config,
            telemetry,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Configured sampling interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.config.sample_interval_ms)
    }

    fn threshold(&self) -> Duration {
        Duration::from_millis(self.config.threshold_ms)
    }

    fn critical(&self) -> Duration {
        Duration::from_millis(self.config.critical_ms)
    }

    fn is_critical(&self, sample: &ThreadSample) -> bool {
        sample.role == ThreadRole::Reactor || sample.blocked_for >= self.critical()
    }

    /// Run one sampling pass.
    pub fn sample(&self) -> SampleSummary {
        let samples = self.telemetry.threads();
        let now = Utc::now();
        let threshold = self.threshold();
        let mut summary = SampleSummary::default();
        let mut seen = HashSet::new();

        let mut tracked = self.tracked.lock();
        for sample in samples {
            if sample.state != ThreadState::Running || sample.blocked_for < threshold {
                continue;
            }
            seen.insert(sample.thread_id);
            let critical = self.is_critical(&sample);

            match tracked.get_mut(&sample.thread_id) {
                Some(record) => {
                    if critical && !record.critical {
                        log_critical(&sample);
                    }
                    record.state = sample.state;
                    record.blocked_for = sample.blocked_for;
                    record.stack = sample.stack;
                    record.last_updated = now;
                    record.critical |= critical;
                }
                None => {
                    if critical {
                        log_critical(&sample);
                    } else {
                        warn!(
                            thread = %sample.name,
                            role = ?sample.role,
                            blocked_ms = sample.blocked_for.as_millis() as u64,
                            "Thread blocked"
                        );
                    }
                    summary.newly_blocked += 1;
                    tracked.insert(
                        sample.thread_id,
                        BlockedThreadRecord {
                            thread_id: sample.thread_id,
                            name: sample.name,
                            role: sample.role,
                            state: sample.state,
                            blocked_for: sample.blocked_for,
                            stack: sample.stack,
                            first_seen: now,
                            last_updated: now,
                            critical,
                        },
                    );
                }
            }
        }

        tracked.retain(|id, record| {
            let still_blocked = seen.contains(id);
            if !still_blocked {
                info!(
                    thread = %record.name,
                    blocked_ms = record.blocked_for.as_millis() as u64,
                    "Thread no longer blocked"
                );
                summary.recovered += 1;
            }
            still_blocked
        });

        summary.blocked = tracked.len();
        summary.reactor_blocked = tracked
            .values()
            .filter(|r| r.role == ThreadRole::Reactor)
            .count();
        summary
    }

    /// Threads currently tracked as blocked.
    pub fn blocked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Reactor threads currently tracked as blocked.
    pub fn reactor_blocked_count(&self) -> usize {
        self.count_role(ThreadRole::Reactor)
    }

    /// Worker threads currently tracked as blocked.
    pub fn worker_blocked_count(&self) -> usize {
        self.count_role(ThreadRole::Worker)
    }

    fn count_role(&self, role: ThreadRole) -> usize {
        self.tracked
            .lock()
            .values()
            .filter(|r| r.role == role)
            .count()
    }

    /// Longest blocked duration among tracked threads.
    pub fn max_blocked_duration(&self) -> Duration {
        self.tracked
            .lock()
            .values()
            .map(|r| r.blocked_for)
            .max()
            .unwrap_or_default()
    }

    /// Whether any reactor thread is currently blocked.
    pub fn is_any_reactor_thread_blocked(&self) -> bool {
        self.reactor_blocked_count() > 0
    }

    /// Tracked threads, longest blocked first.
    pub fn records(&self) -> Vec<BlockedThreadRecord> {
        let mut records: Vec<_> = self.tracked.lock().values().cloned().collect();
        records.sort_by(|a, b| b.blocked_for.cmp(&a.blocked_for));
        records
    }

    /// Report over the tracked set.
    pub fn report(&self) -> BlockedReport {
        BlockedReport {
            threads: self.records(),
            generated_at: Utc::now(),
        }
    }
}

fn log_critical(sample: &ThreadSample) {
    let stack = if sample.stack.is_empty() {
        "<no activity recorded>".to_string()
    } else {
        sample
            .stack
            .iter()
            .rev()
            .map(|frame| format!("    at {}", frame))
            .collect::<Vec<_>>()
            .join("\n")
    };

    if sample.role == ThreadRole::Reactor {
        error!(
            thread = %sample.name,
            blocked_ms = sample.blocked_for.as_millis() as u64,
            "Reactor thread blocked; every request on it is stalled\n{}",
            stack
        );
    } else {
        error!(
            thread = %sample.name,
            role = ?sample.role,
            blocked_ms = sample.blocked_for.as_millis() as u64,
            "Thread critically blocked\n{}",
            stack
        );
    }
}
