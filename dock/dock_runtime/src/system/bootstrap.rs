//! System bootstrap for the dock runtime
//!
//! Builds the process-scoped components once, in dependency order, and tears
//! them down once:
//!
//! 1. unit census and thread registry
//! 2. telemetry, leak detector, blocked-worker monitor, health checker
//! 3. worker pool reporting to the thread registry
//! 4. isolation boundary
//!
//! Samplers start in [`System::bootstrap`] and stop in [`System::shutdown`].
//! Nothing here is reachable through a global; components receive what they
//! need by reference.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dock_concurrency::{ThreadPool, ThreadPoolConfig};
use dock_isolation::{CatalogBoundary, ExportsFn, IsolationBoundary, NativeBoundary, UnitCensus};
use dock_observability::{
    BlockedWorkerMonitor, HealthChecker, LeakDetector, MemoryProbe, ProcessTelemetry,
    RoleClassifier, Sampler, TelemetrySource, ThreadRegistry,
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use super::config::RuntimeConfig;
use super::shutdown::ShutdownManager;
use super::threads::RegistryHooks;

/// Errors that can occur during bootstrap
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to start sampler {0}: {1}")]
    SamplerFailed(&'static str, std::io::Error),
}

/// Where package code comes from.
pub enum BoundaryKind {
    /// Bundles on disk, mapped as private shared libraries.
    Native,
    /// Packages linked into the host, by name.
    Catalog(Vec<(String, ExportsFn)>),
}

/// Process-scoped components of the host
pub struct System {
    config: RuntimeConfig,
    census: Arc<UnitCensus>,
    threads: Arc<ThreadRegistry>,
    telemetry: Arc<dyn TelemetrySource>,
    leaks: Arc<LeakDetector>,
    blocked: Arc<BlockedWorkerMonitor>,
    health: HealthChecker,
    pool: Arc<ThreadPool>,
    boundary: Arc<dyn IsolationBoundary>,
    samplers: Mutex<Vec<Sampler>>,
    shutdown_manager: Arc<ShutdownManager>,
}

impl System {
    /// Create every component. Samplers are not started yet.
    pub fn new(config: RuntimeConfig, boundary: BoundaryKind) -> Result<Self> {
        config
            .validate()
            .map_err(|e| BootstrapError::ConfigError(e.to_string()))?;

        let census = Arc::new(UnitCensus::new());
        let threads = Arc::new(ThreadRegistry::new());

        let classifier = RoleClassifier::new(
            config.blocked.reactor_pattern.clone(),
            config.blocked.worker_pattern.clone(),
        );
        let telemetry: Arc<dyn TelemetrySource> = Arc::new(ProcessTelemetry::new(
            census.clone(),
            threads.clone(),
            classifier,
        ));

        let leaks = Arc::new(LeakDetector::new(
            config.leak.clone(),
            telemetry.clone(),
            MemoryProbe::new(config.health.memory_budget_bytes),
        ));
        let blocked = Arc::new(BlockedWorkerMonitor::new(
            config.blocked.clone(),
            telemetry.clone(),
        ));
        let health = HealthChecker::new(
            config.health.clone(),
            config.blocked.warn_count,
            leaks.clone(),
            blocked.clone(),
        );

        let pool = Arc::new(ThreadPool::with_hooks(
            ThreadPoolConfig {
                threads: config.worker_pool.threads,
                queue_size: config.worker_pool.queue_size,
                thread_name_prefix: config.blocked.worker_pattern.clone(),
            },
            Arc::new(RegistryHooks::new(threads.clone())),
        )
        .context("Failed to start worker pool")?);

        let boundary: Arc<dyn IsolationBoundary> = match boundary {
            BoundaryKind::Native => {
                Arc::new(
                    NativeBoundary::new(config.shadow_dir.clone(), census.clone())
                        .with_reaper(pool.clone()),
                )
            }
            BoundaryKind::Catalog(packages) => {
                let catalog = CatalogBoundary::new(census.clone());
                for (name, exports) in packages {
                    catalog.register(name, exports);
                }
                Arc::new(catalog)
            }
        };
        info!(boundary = boundary.name(), "Isolation boundary ready");

        let shutdown_manager = Arc::new(ShutdownManager::new(&config));

        Ok(Self {
            config,
            census,
            threads,
            telemetry,
            leaks,
            blocked,
            health,
            pool,
            boundary,
            samplers: Mutex::new(Vec::new()),
            shutdown_manager,
        })
    }

    /// Start the blocked-worker and leak samplers. Calling twice is a no-op.
    pub async fn bootstrap(&self) -> Result<()> {
        let mut samplers = self.samplers.lock();
        if !samplers.is_empty() {
            return Ok(());
        }
        info!("Starting system samplers");

        let blocked = self.blocked.clone();
        let blocked_sampler = Sampler::spawn("dock-blocked-monitor", blocked.interval(), move || {
            blocked.sample();
        })
        .map_err(|e| BootstrapError::SamplerFailed("dock-blocked-monitor", e))?;
        samplers.push(blocked_sampler);

        let leaks = self.leaks.clone();
        let leak_interval = Duration::from_millis(self.config.leak.sample_interval_ms);
        let leak_sampler = Sampler::spawn("dock-leak-detector", leak_interval, move || {
            leaks.reconcile();
        })
        .map_err(|e| BootstrapError::SamplerFailed("dock-leak-detector", e))?;
        samplers.push(leak_sampler);

        info!(samplers = samplers.len(), "System bootstrap complete");
        Ok(())
    }

    /// Stop the samplers and the worker pool
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down system");

        let samplers: Vec<Sampler> = self.samplers.lock().drain(..).collect();
        for mut sampler in samplers {
            sampler.stop();
        }

        let pool = self.pool.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || pool.join()).await {
            warn!("Worker pool did not join cleanly: {}", e);
        }

        let live = self.census.live_units();
        if live > 0 {
            warn!(live, "Isolation units still live at shutdown");
        }
        Ok(())
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Process-wide unit counters
    pub fn census(&self) -> &Arc<UnitCensus> {
        &self.census
    }

    /// Thread activity registry
    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    /// Telemetry read by the monitors
    pub fn telemetry(&self) -> &Arc<dyn TelemetrySource> {
        &self.telemetry
    }

    /// Leak detector
    pub fn leaks(&self) -> &Arc<LeakDetector> {
        &self.leaks
    }

    /// Blocked-worker monitor
    pub fn blocked(&self) -> &Arc<BlockedWorkerMonitor> {
        &self.blocked
    }

    /// Health checker
    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    /// Worker pool for blocking work
    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Isolation boundary
    pub fn boundary(&self) -> &Arc<dyn IsolationBoundary> {
        &self.boundary
    }

    /// Shutdown manager
    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown_manager
    }

    /// Number of running samplers
    pub fn running_samplers(&self) -> usize {
        self.samplers.lock().len()
    }
}
