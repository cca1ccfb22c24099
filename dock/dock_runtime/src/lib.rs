//! Dock Runtime - host runtime for hot-deployable packages
//!
//! This crate ties the dock components together: configuration, the
//! process-scoped system components, the dependency container and the
//! lifecycle coordinator that deploys, undeploys and dispatches to packages.

pub mod package;
pub mod system;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use dock_core::{
    DeployError, DispatchError, GlobalConfig, ModuleRequest, ModuleResponse, ReactorHandle,
};
use dock_observability::{BlockedReport, HealthReport, LeakReport};
use tracing::{info, warn};

pub use package::{
    Coordinator, DeploySummary, DeploymentInfo, PackageLayout, PackageState, UndeployReport,
};
pub use system::{BoundaryKind, RuntimeConfig, System};

/// Runtime facade that provides a unified interface to the dock host.
pub struct DockRuntime {
    /// Coordinator for deploy, undeploy and dispatch
    pub coordinator: Arc<Coordinator>,

    /// Process-scoped components
    pub system: Arc<System>,
}

impl DockRuntime {
    /// Create a runtime from a configuration file, or defaults
    pub async fn load(config_path: Option<&Path>, boundary: BoundaryKind) -> Result<Self> {
        let config = RuntimeConfig::load(config_path).await?;
        Self::new(config, boundary)
    }

    /// Create a runtime. Must be called from within a tokio runtime.
    pub fn new(config: RuntimeConfig, boundary: BoundaryKind) -> Result<Self> {
        info!("Initializing dock runtime");

        let reactor = ReactorHandle::try_current()
            .ok_or_else(|| anyhow::anyhow!("Dock runtime must be created inside a tokio runtime"))?;
        let global = GlobalConfig::new(config.global.clone());
        let layout = PackageLayout::from_config(&config);

        let system = Arc::new(System::new(config, boundary)?);
        let container = Arc::new(package::Container::new(reactor.clone(), global));

        let coordinator = Arc::new(Coordinator::new(
            layout,
            system.boundary().clone(),
            container,
            system.pool().clone(),
            system.leaks().clone(),
            system.threads().clone(),
            reactor,
        ));

        info!("Dock runtime initialized");
        Ok(Self {
            coordinator,
            system,
        })
    }

    /// Start the samplers and arm coordinator shutdown
    pub async fn start(&self) -> Result<()> {
        info!("Starting dock runtime");

        self.system.bootstrap().await?;

        let mut handle = self
            .system
            .shutdown_manager()
            .register_component("coordinator");
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            handle.wait_for_shutdown().await;
            let report = coordinator.shutdown().await;
            info!(
                packages = report.packages.len(),
                issues = report.issues.len(),
                "Coordinator stopped"
            );
            handle.shutdown_complete();
        });

        info!("Dock runtime started");
        Ok(())
    }

    /// Gracefully shut down: undeploy everything, stop samplers and workers
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down dock runtime");

        if let Err(e) = self.system.shutdown_manager().request_shutdown().await {
            warn!("Component shutdown incomplete: {}", e);
        }
        // Covers a runtime that was never started.
        self.coordinator.shutdown().await;

        self.system.shutdown().await?;

        info!("Dock runtime shut down");
        Ok(())
    }

    /// Deploy a package by name
    pub async fn deploy(&self, package: &str) -> Result<DeploySummary, DeployError> {
        self.coordinator.deploy(package).await
    }

    /// Undeploy one package, or every package when `package` is `None`
    pub async fn undeploy(&self, package: Option<&str>) -> UndeployReport {
        match package {
            Some(package) => self.coordinator.undeploy_package(package).await,
            None => self.coordinator.undeploy_all().await,
        }
    }

    /// Route a request to the module at `address`
    pub async fn dispatch(
        &self,
        address: &str,
        request: ModuleRequest,
    ) -> Result<ModuleResponse, DispatchError> {
        self.coordinator.dispatch(address, request).await
    }

    /// Evaluate host health
    pub fn health(&self) -> HealthReport {
        self.system
            .health()
            .check(self.coordinator.active_modules())
    }

    /// Leak diagnostics from fresh counters
    pub fn leak_report(&self) -> LeakReport {
        self.system.leaks().report()
    }

    /// Threads currently tracked as blocked
    pub fn blocked_report(&self) -> BlockedReport {
        self.system.blocked().report()
    }

    /// Per-package deployment snapshot
    pub fn deployments(&self) -> Vec<DeploymentInfo> {
        self.coordinator.deployments()
    }
}
