//! Configuration for the observability system

use serde::{Deserialize, Serialize};

use crate::error::ObservabilityError;

/// Configuration for the logging subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// The base log level or filter directive; `RUST_LOG` overrides it
    #[serde(default = "default_level")]
    pub level: String,

    /// Whether to emit structured (JSON) lines
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// Configuration for the leak detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakConfig {
    /// Units expected to be loaded by the host itself
    #[serde(default)]
    pub baseline_units: usize,

    /// Leaked units tolerated before a leak is suspected
    #[serde(default = "default_leak_threshold")]
    pub leak_threshold: usize,

    /// Lifetime unload ratio below which a leak is suspected
    #[serde(default = "default_unload_ratio_threshold")]
    pub unload_ratio_threshold: f64,

    /// Lifetime loads required before the unload ratio is considered
    #[serde(default = "default_min_loaded_for_ratio")]
    pub min_loaded_for_ratio: u64,

    /// Reconciliation interval (milliseconds)
    #[serde(default = "default_leak_interval_ms")]
    pub sample_interval_ms: u64,
}

fn default_leak_threshold() -> usize {
    3
}

fn default_unload_ratio_threshold() -> f64 {
    0.5
}

fn default_min_loaded_for_ratio() -> u64 {
    20
}

fn default_leak_interval_ms() -> u64 {
    30_000
}

impl Default for LeakConfig {
    fn default() -> Self {
        Self {
            baseline_units: 0,
            leak_threshold: default_leak_threshold(),
            unload_ratio_threshold: default_unload_ratio_threshold(),
            min_loaded_for_ratio: default_min_loaded_for_ratio(),
            sample_interval_ms: default_leak_interval_ms(),
        }
    }
}

/// Configuration for the blocked-worker monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedConfig {
    /// Sampling interval (milliseconds)
    #[serde(default = "default_blocked_interval_ms")]
    pub sample_interval_ms: u64,

    /// Busy time after which a thread counts as blocked (milliseconds)
    #[serde(default = "default_threshold_ms")]
    pub threshold_ms: u64,

    /// Busy time after which a blocked thread is critical (milliseconds)
    #[serde(default = "default_critical_ms")]
    pub critical_ms: u64,

    /// Thread name fragment identifying reactor threads
    #[serde(default = "default_reactor_pattern")]
    pub reactor_pattern: String,

    /// Thread name fragment identifying worker threads
    #[serde(default = "default_worker_pattern")]
    pub worker_pattern: String,

    /// Blocked thread count that triggers a report in health checks
    #[serde(default = "default_warn_count")]
    pub warn_count: usize,
}

fn default_blocked_interval_ms() -> u64 {
    1_000
}

fn default_threshold_ms() -> u64 {
    100
}

fn default_critical_ms() -> u64 {
    5_000
}

fn default_reactor_pattern() -> String {
    "dock-reactor".to_string()
}

fn default_worker_pattern() -> String {
    "dock-worker".to_string()
}

fn default_warn_count() -> usize {
    10
}

impl Default for BlockedConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_blocked_interval_ms(),
            threshold_ms: default_threshold_ms(),
            critical_ms: default_critical_ms(),
            reactor_pattern: default_reactor_pattern(),
            worker_pattern: default_worker_pattern(),
            warn_count: default_warn_count(),
        }
    }
}

/// Configuration for health evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Heap utilisation that logs a warning
    #[serde(default = "default_heap_warn")]
    pub heap_warn: f64,

    /// Heap utilisation that marks the host unhealthy
    #[serde(default = "default_heap_critical")]
    pub heap_critical: f64,

    /// Memory the host may use; defaults to the machine's total memory
    #[serde(default)]
    pub memory_budget_bytes: Option<u64>,
}

fn default_heap_warn() -> f64 {
    0.80
}

fn default_heap_critical() -> f64 {
    0.90
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heap_warn: default_heap_warn(),
            heap_critical: default_heap_critical(),
            memory_budget_bytes: None,
        }
    }
}

/// Aggregate observability configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Leak detector configuration
    #[serde(default)]
    pub leak: LeakConfig,

    /// Blocked-worker monitor configuration
    #[serde(default)]
    pub blocked: BlockedConfig,

    /// Health evaluation configuration
    #[serde(default)]
    pub health: HealthConfig,
}

impl ObservabilityConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ObservabilityError> {
        let invalid = |msg: &str| Err(ObservabilityError::ConfigurationError(msg.to_string()));

        if self.leak.sample_interval_ms == 0 || self.blocked.sample_interval_ms == 0 {
            return invalid("Sampling intervals cannot be zero");
        }
        if !(0.0..=1.0).contains(&self.leak.unload_ratio_threshold) {
            return invalid("Unload ratio threshold must be within 0.0..=1.0");
        }
        if self.blocked.threshold_ms == 0 {
            return invalid("Blocked threshold cannot be zero");
        }
        if self.blocked.critical_ms < self.blocked.threshold_ms {
            return invalid("Critical threshold cannot be below the blocked threshold");
        }
        if self.blocked.reactor_pattern.is_empty() || self.blocked.worker_pattern.is_empty() {
            return invalid("Thread role patterns cannot be empty");
        }
        if !(0.0..=1.0).contains(&self.health.heap_warn)
            || !(0.0..=1.0).contains(&self.health.heap_critical)
            || self.health.heap_warn > self.health.heap_critical
        {
            return invalid("Heap thresholds must satisfy 0 <= warn <= critical <= 1");
        }
        if self.health.memory_budget_bytes == Some(0) {
            return invalid("Memory budget cannot be zero");
        }
        Ok(())
    }
}
