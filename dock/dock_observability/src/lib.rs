//! Observability for the dock host.
//!
//! Structured logging, the thread activity registry, leak detection over
//! isolation units, blocked-worker monitoring and health evaluation.
//! Everything that samples runs on a [`Sampler`] thread of its own.

pub mod blocked;
pub mod config;
pub mod error;
pub mod health;
pub mod leak;
pub mod logging;
pub mod memory;
pub mod sampler;
pub mod telemetry;
pub mod threads;

pub use blocked::{BlockedReport, BlockedThreadRecord, BlockedWorkerMonitor, SampleSummary};
pub use config::{BlockedConfig, HealthConfig, LeakConfig, LoggingConfig, ObservabilityConfig};
pub use error::ObservabilityError;
pub use health::{HealthChecker, HealthReport, HealthStatus};
pub use leak::{LeakAssessment, LeakDetector, LeakReport, PackageSuspect};
pub use logging::init_logging;
pub use memory::MemoryProbe;
pub use sampler::Sampler;
pub use telemetry::{
    ProcessTelemetry, RoleClassifier, TelemetrySource, ThreadRole, ThreadSample, ThreadState,
};
pub use threads::{ActivityGuard, MonitoredFuture, ThreadEntry, ThreadRegistry};
