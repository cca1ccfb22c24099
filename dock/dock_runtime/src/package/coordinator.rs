//! Lifecycle coordinator
//!
//! Owns the address routing map and one slot per package name, and drives
//! deploy, undeploy and dispatch.
//!
//! - Dispatch reads the routing map without taking any lock beyond the
//!   map's per-shard ones, so it never waits for a deploy.
//! - Deploy and undeploy of one package are serialised by that package's
//!   slot mutex; different packages proceed concurrently. Undeploy-all takes
//!   the gate exclusively.
//! - Everything that touches the disk, maps code or runs package hooks is
//!   offloaded to the worker pool; the reactor only awaits the result.
//! - Deploy and undeploy run as their own reactor tasks. A caller that stops
//!   waiting (timeout, dropped request) does not abandon an activated unit:
//!   the operation still publishes or rolls back.
//!
//! A redeploy retires the previous deployment (addresses unpublished,
//! modules stopped, initializer shut down, unit closed) before the new unit
//! is loaded, so the new address set fully replaces the old one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dock_concurrency::ThreadPool;
use dock_core::{
    ConstructionError, DeployError, DeploymentId, DispatchError, HookContext, ModuleRequest,
    ModuleResponse, ReactorHandle, ShutdownFailure, UnitId,
};
use dock_isolation::{IsolationBoundary, IsolationUnit};
use dock_observability::{LeakDetector, MonitoredFuture, ThreadRegistry};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, error, info, warn};

use super::container::Container;
use super::layout::{normalize_address, PackageLayout, PackagePlan};
use super::lifecycle::{ModuleInstance, PackageState, SharedInitInstance};

/// Snapshot of one package's deployment.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentInfo {
    pub package: String,
    pub state: PackageState,
    pub deployment: Option<DeploymentId>,
    pub unit: Option<UnitId>,
    pub addresses: Vec<String>,
    pub shared_initializer: Option<String>,
    pub deployed_at: Option<DateTime<Utc>>,
}

impl DeploymentInfo {
    fn unloaded(package: &str) -> Self {
        Self {
            package: package.to_string(),
            state: PackageState::Unloaded,
            deployment: None,
            unit: None,
            addresses: Vec::new(),
            shared_initializer: None,
            deployed_at: None,
        }
    }
}

/// Outcome of a successful deploy.
#[derive(Debug, Clone, Serialize)]
pub struct DeploySummary {
    pub package: String,
    pub deployment: DeploymentId,
    pub unit: UnitId,
    pub addresses: Vec<String>,
    pub shared_initializer: Option<String>,
    pub elapsed_ms: u64,
}

/// Outcome of an undeploy. Undeploy never fails; absorbed failures are listed here.
#[derive(Debug, Clone, Default)]
pub struct UndeployReport {
    /// Packages torn down.
    pub packages: Vec<String>,
    /// Modules stopped.
    pub modules_stopped: usize,
    /// Failures logged and absorbed along the way.
    pub issues: Vec<ShutdownFailure>,
}

impl UndeployReport {
    /// Whether every hook and close succeeded.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    fn absorb(&mut self, other: UndeployReport) {
        self.packages.extend(other.packages);
        self.modules_stopped += other.modules_stopped;
        self.issues.extend(other.issues);
    }
}

/// A live package: its unit and everything built from it.
///
/// Field order is drop order: instances go before the unit they came from.
struct Deployment {
    id: DeploymentId,
    package: String,
    modules: Vec<Arc<ModuleInstance>>,
    shared: Option<SharedInitInstance>,
    unit: IsolationUnit,
    deployed_at: DateTime<Utc>,
}

struct PackageSlot {
    current: AsyncMutex<Option<Deployment>>,
    info: Mutex<DeploymentInfo>,
}

impl PackageSlot {
    fn new(package: &str) -> Self {
        Self {
            current: AsyncMutex::new(None),
            info: Mutex::new(DeploymentInfo::unloaded(package)),
        }
    }

    fn set_state(&self, state: PackageState) {
        let mut info = self.info.lock();
        debug!(package = %info.package, from = %info.state, to = %state, "Package state");
        info.state = state;
    }

    fn reset(&self) {
        let mut info = self.info.lock();
        *info = DeploymentInfo::unloaded(&info.package);
    }

    fn activate(&self, deployment: &Deployment) {
        let mut info = self.info.lock();
        info.state = PackageState::ModulesActive;
        info.deployment = Some(deployment.id);
        info.unit = Some(deployment.unit.id());
        info.addresses = deployment
            .modules
            .iter()
            .map(|m| m.address().to_string())
            .collect();
        info.shared_initializer = deployment.shared.as_ref().map(|s| s.class_ref().to_string());
        info.deployed_at = Some(deployment.deployed_at);
    }

    fn info(&self) -> DeploymentInfo {
        self.info.lock().clone()
    }
}

/// The blocking half of deploy and undeploy, run on the worker pool.
#[derive(Clone)]
struct Activation {
    boundary: Arc<dyn IsolationBoundary>,
    container: Arc<Container>,
    leaks: Arc<LeakDetector>,
    reactor: ReactorHandle,
}

impl Activation {
    fn hook_context(&self, package: &str, address: Option<&str>, config: serde_json::Value) -> HookContext {
        HookContext {
            package: package.to_string(),
            address: address.map(str::to_string),
            config,
            reactor: self.reactor.clone(),
        }
    }

    /// Load the unit and bring every module up, or roll everything back.
    fn activate(&self, plan: &PackagePlan, slot: &PackageSlot) -> Result<Deployment, DeployError> {
        slot.set_state(PackageState::Loading);
        let unit = self.boundary.load(&plan.package, &plan.bundle)?;
        self.leaks.on_unit_created(&plan.package);
        info!(package = %plan.package, unit = %unit.id(), boundary = self.boundary.name(), "Loaded isolation unit");

        let mut deployment = Deployment {
            id: DeploymentId::new(),
            package: plan.package.clone(),
            modules: Vec::with_capacity(plan.modules.len()),
            shared: None,
            unit,
            deployed_at: Utc::now(),
        };

        match self.populate(&mut deployment, plan, slot) {
            Ok(()) => Ok(deployment),
            Err(err) => {
                error!(package = %plan.package, error = %err, "Deploy aborted, rolling back");
                let report = self.teardown(deployment);
                debug!(
                    package = %plan.package,
                    stopped = report.modules_stopped,
                    issues = report.issues.len(),
                    "Rollback complete"
                );
                Err(err)
            }
        }
    }

    fn populate(
        &self,
        deployment: &mut Deployment,
        plan: &PackagePlan,
        slot: &PackageSlot,
    ) -> Result<(), DeployError> {
        let package = plan.package.as_str();
        let not_exported = |class_ref: &str| ConstructionError {
            class_ref: class_ref.to_string(),
            reason: format!("not exported by package {}", package),
        };

        if let Some(init_ref) = &plan.shared_init {
            slot.set_state(PackageState::SharedInitRunning);
            let class = deployment
                .unit
                .exports()
                .find_initializer(init_ref)
                .ok_or_else(|| not_exported(init_ref))?;
            let instance = self.container.build(class)?;
            let shared = SharedInitInstance::new(package, init_ref, instance, deployment.unit.guard());

            shared
                .initialize(&self.hook_context(package, None, serde_json::json!({})))
                .map_err(|source| DeployError::SharedInitFailure {
                    package: package.to_string(),
                    class_ref: init_ref.clone(),
                    source,
                })?;
            info!(package = %package, class = %init_ref, "Shared initializer ready");
            deployment.shared = Some(shared);
        }

        slot.set_state(PackageState::ModulesStarting);
        for descriptor in &plan.modules {
            let class = deployment
                .unit
                .exports()
                .find_module(&descriptor.class_ref)
                .ok_or_else(|| not_exported(&descriptor.class_ref))?;
            let module = self.container.build(class)?;
            let instance = Arc::new(ModuleInstance::new(
                package,
                &descriptor.class_ref,
                &descriptor.address,
                module,
                deployment.unit.guard(),
            ));

            let failed = |hook: &'static str, source| DeployError::ModuleInitFailure {
                package: package.to_string(),
                class_ref: descriptor.class_ref.clone(),
                address: descriptor.address.clone(),
                hook,
                source,
            };

            let ctx = self.hook_context(package, Some(&descriptor.address), descriptor.config.clone());
            instance.start(&ctx).map_err(|source| failed("start", source))?;
            deployment.modules.push(instance.clone());
            instance.init().map_err(|source| failed("init", source))?;

            debug!(package = %package, address = %descriptor.address, class = %descriptor.class_ref, "Module ready");
        }

        Ok(())
    }

    /// Stop every module, shut the initializer down and close the unit. Never fails.
    fn teardown(&self, deployment: Deployment) -> UndeployReport {
        let Deployment {
            package,
            modules,
            shared,
            unit,
            ..
        } = deployment;
        let mut report = UndeployReport::default();

        for module in &modules {
            report.issues.extend(module.stop());
            report.modules_stopped += 1;
        }
        drop(modules);

        if let Some(shared) = shared {
            report.issues.extend(shared.shutdown());
        }

        let unit_id = unit.id();
        if let Err(err) = self.boundary.close(unit) {
            warn!(package = %package, unit = %unit_id, error = %err, "Isolation unit did not close cleanly");
            report.issues.push(ShutdownFailure::Unit {
                package: package.clone(),
                unit: unit_id,
                reason: err.to_string(),
            });
        }
        self.leaks.on_unit_destroyed(&package);

        report.packages.push(package);
        report
    }
}

/// Central orchestrator for deploy, undeploy and dispatch.
pub struct Coordinator {
    layout: PackageLayout,
    activation: Activation,
    pool: Arc<ThreadPool>,
    threads: Arc<ThreadRegistry>,
    routes: DashMap<String, Arc<ModuleInstance>>,
    packages: DashMap<String, Arc<PackageSlot>>,
    gate: RwLock<()>,
    closed: AtomicBool,
}

impl Coordinator {
    /// Create a coordinator. Blocking work goes to `pool`; dispatch activity is reported to `threads`.
    pub fn new(
        layout: PackageLayout,
        boundary: Arc<dyn IsolationBoundary>,
        container: Arc<Container>,
        pool: Arc<ThreadPool>,
        leaks: Arc<LeakDetector>,
        threads: Arc<ThreadRegistry>,
        reactor: ReactorHandle,
    ) -> Self {
        Self {
            layout,
            activation: Activation {
                boundary,
                container,
                leaks,
                reactor,
            },
            pool,
            threads,
            routes: DashMap::new(),
            packages: DashMap::new(),
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Package layout in use.
    pub fn layout(&self) -> &PackageLayout {
        &self.layout
    }

    fn slot(&self, package: &str) -> Arc<PackageSlot> {
        self.packages
            .entry(package.to_string())
            .or_insert_with(|| Arc::new(PackageSlot::new(package)))
            .value()
            .clone()
    }

    async fn offload<R, F>(&self, package: &str, label: String, f: F) -> Result<R, DeployError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let offload_error = |reason: String| DeployError::Offload {
            package: package.to_string(),
            reason,
        };
        let handle = self
            .pool
            .submit(label, f)
            .map_err(|e| offload_error(e.to_string()))?;
        handle.join().await.map_err(|e| offload_error(e.to_string()))
    }

    /// Deploy `package`, replacing any deployment it already has.
    pub async fn deploy(self: &Arc<Self>, package: &str) -> Result<DeploySummary, DeployError> {
        let this = self.clone();
        let name = package.to_string();
        let task = self
            .activation
            .reactor
            .handle()
            .spawn(async move { this.run_deploy(&name).await });
        task.await.map_err(|e| DeployError::Offload {
            package: package.to_string(),
            reason: e.to_string(),
        })?
    }

    async fn run_deploy(&self, package: &str) -> Result<DeploySummary, DeployError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeployError::ShuttingDown);
        }
        let started = Instant::now();
        let _gate = self.gate.read().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeployError::ShuttingDown);
        }

        let slot = self.slot(package);
        let mut current = slot.current.lock().await;
        info!(package = %package, "Deploying package");

        let layout = self.layout.clone();
        let name = package.to_string();
        let plan = self
            .offload(package, format!("plan {}", package), move || layout.plan(&name))
            .await??;
        self.check_conflicts(&plan)?;

        if let Some(previous) = current.take() {
            info!(package = %package, deployment = %previous.id, "Retiring previous deployment");
            let report = self.retire(previous, &slot).await;
            log_issues(&report);
        }

        let activation = self.activation.clone();
        let task_plan = plan.clone();
        let task_slot = slot.clone();
        let activated = self
            .offload(package, format!("deploy {}", package), move || {
                activation.activate(&task_plan, &task_slot)
            })
            .await
            .and_then(|result| result);

        let deployment = match activated {
            Ok(deployment) => deployment,
            Err(err) => {
                slot.reset();
                error!(package = %package, error = %err, elapsed_ms = started.elapsed().as_millis() as u64, "Deploy failed");
                return Err(err);
            }
        };

        if let Err(err) = self.publish(&deployment) {
            error!(package = %package, error = %err, "Publishing failed, rolling back");
            let report = self.run_teardown(deployment).await;
            log_issues(&report);
            slot.reset();
            return Err(err);
        }

        slot.activate(&deployment);
        let summary = DeploySummary {
            package: package.to_string(),
            deployment: deployment.id,
            unit: deployment.unit.id(),
            addresses: deployment
                .modules
                .iter()
                .map(|m| m.address().to_string())
                .collect(),
            shared_initializer: deployment.shared.as_ref().map(|s| s.class_ref().to_string()),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        *current = Some(deployment);

        info!(
            package = %package,
            deployment = %summary.deployment,
            unit = %summary.unit,
            addresses = ?summary.addresses,
            elapsed_ms = summary.elapsed_ms,
            "Deployed package"
        );
        Ok(summary)
    }

    fn check_conflicts(&self, plan: &PackagePlan) -> Result<(), DeployError> {
        let mut seen = HashSet::new();
        for address in plan.addresses() {
            let owner = if !seen.insert(address) {
                Some(plan.package.clone())
            } else {
                self.routes
                    .get(address)
                    .map(|route| route.package().to_string())
                    .filter(|owner| *owner != plan.package)
            };
            if let Some(owner) = owner {
                return Err(DeployError::AddressConflict {
                    address: address.to_string(),
                    owner,
                });
            }
        }
        Ok(())
    }

    fn publish(&self, deployment: &Deployment) -> Result<(), DeployError> {
        for module in &deployment.modules {
            module.mark_serving();
        }

        let mut published: Vec<&str> = Vec::with_capacity(deployment.modules.len());
        for module in &deployment.modules {
            let owner = match self.routes.entry(module.address().to_string()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(module.clone());
                    published.push(module.address());
                    continue;
                }
                Entry::Occupied(occupied) => occupied.get().package().to_string(),
            };

            for address in published {
                self.routes.remove(address);
            }
            return Err(DeployError::AddressConflict {
                address: module.address().to_string(),
                owner,
            });
        }
        Ok(())
    }

    fn unpublish(&self, deployment: &Deployment) {
        for module in &deployment.modules {
            self.routes
                .remove_if(module.address(), |_, route| Arc::ptr_eq(route, module));
        }
    }

    async fn retire(&self, deployment: Deployment, slot: &PackageSlot) -> UndeployReport {
        slot.set_state(PackageState::ShuttingDown);
        self.unpublish(&deployment);
        let report = self.run_teardown(deployment).await;
        slot.reset();
        report
    }

    async fn run_teardown(&self, deployment: Deployment) -> UndeployReport {
        let package = deployment.package.clone();
        let unit = deployment.unit.id();
        let cell = Arc::new(Mutex::new(Some(deployment)));

        let activation = self.activation.clone();
        let task_cell = cell.clone();
        let submitted = self.pool.submit(format!("undeploy {}", package), move || {
            task_cell
                .lock()
                .take()
                .map(|deployment| activation.teardown(deployment))
                .unwrap_or_default()
        });

        let reason = match submitted {
            Ok(handle) => match handle.join().await {
                Ok(report) => return report,
                Err(err) => err.to_string(),
            },
            Err(err) => err.to_string(),
        };

        // The task never ran (pool full or shutting down) or died part way.
        let leftover = cell.lock().take();
        let Some(deployment) = leftover else {
            error!(package = %package, error = %reason, "Teardown task failed");
            return UndeployReport {
                packages: vec![package.clone()],
                modules_stopped: 0,
                issues: vec![ShutdownFailure::Unit {
                    package,
                    unit,
                    reason,
                }],
            };
        };

        warn!(package = %package, error = %reason, "Worker pool did not run teardown, tearing down on a blocking thread");
        let activation = self.activation.clone();
        match tokio::task::spawn_blocking(move || activation.teardown(deployment)).await {
            Ok(report) => report,
            Err(err) => {
                error!(package = %package, error = %err, "Fallback teardown failed");
                UndeployReport {
                    packages: vec![package.clone()],
                    modules_stopped: 0,
                    issues: vec![ShutdownFailure::Unit {
                        package,
                        unit,
                        reason: err.to_string(),
                    }],
                }
            }
        }
    }

    /// Tear down one package. Never fails.
    pub async fn undeploy_package(self: &Arc<Self>, package: &str) -> UndeployReport {
        let this = self.clone();
        let name = package.to_string();
        self.detached(async move { this.run_undeploy(&name).await }).await
    }

    async fn run_undeploy(&self, package: &str) -> UndeployReport {
        let _gate = self.gate.read().await;
        let slot = match self.packages.get(package) {
            Some(slot) => slot.value().clone(),
            None => {
                debug!(package = %package, "Undeploy of unknown package");
                return UndeployReport::default();
            }
        };

        let mut current = slot.current.lock().await;
        let report = match current.take() {
            Some(deployment) => {
                info!(package = %package, deployment = %deployment.id, "Undeploying package");
                self.retire(deployment, &slot).await
            }
            None => UndeployReport::default(),
        };
        log_issues(&report);
        report
    }

    /// Tear down every package. Never fails.
    pub async fn undeploy_all(self: &Arc<Self>) -> UndeployReport {
        let this = self.clone();
        self.detached(async move { this.run_undeploy_all().await }).await
    }

    async fn run_undeploy_all(&self) -> UndeployReport {
        let _gate = self.gate.write().await;
        let slots: Vec<Arc<PackageSlot>> = self.packages.iter().map(|e| e.value().clone()).collect();

        let mut retiring = Vec::new();
        for slot in slots {
            let deployment = slot.current.lock().await.take();
            if let Some(deployment) = deployment {
                slot.set_state(PackageState::ShuttingDown);
                retiring.push((slot, deployment));
            }
        }
        self.routes.clear();

        let mut report = UndeployReport::default();
        for (slot, deployment) in retiring {
            report.absorb(self.run_teardown(deployment).await);
            slot.reset();
        }

        log_issues(&report);
        info!(
            packages = report.packages.len(),
            modules = report.modules_stopped,
            issues = report.issues.len(),
            "Undeployed all packages"
        );
        report
    }

    /// Run an undeploy to completion even if the caller stops waiting.
    async fn detached<F>(&self, undeploy: F) -> UndeployReport
    where
        F: std::future::Future<Output = UndeployReport> + Send + 'static,
    {
        match self.activation.reactor.handle().spawn(undeploy).await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "Undeploy task failed");
                UndeployReport::default()
            }
        }
    }

    /// Refuse further deploys and tear everything down.
    pub async fn shutdown(self: &Arc<Self>) -> UndeployReport {
        self.closed.store(true, Ordering::SeqCst);
        self.undeploy_all().await
    }

    /// Route `request` to the module serving `address`.
    pub async fn dispatch(
        &self,
        address: &str,
        request: ModuleRequest,
    ) -> Result<ModuleResponse, DispatchError> {
        let address = normalize_address(address);
        let route = self.routes.get(&address).map(|route| route.value().clone());
        let instance = match route {
            Some(instance) => instance,
            None => {
                debug!(address = %address, "No module at address");
                return Err(DispatchError::AddressNotFound(address));
            }
        };

        let label = format!("dispatch {}", address);
        MonitoredFuture::new(self.threads.clone(), label, instance.handle(request))
            .await
            .map_err(|source| {
                warn!(address = %address, error = %source, "Handler failed");
                DispatchError::HandlerFailed { address, source }
            })
    }

    /// Number of routable addresses.
    pub fn active_modules(&self) -> usize {
        self.routes.len()
    }

    /// Routable addresses, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.routes.iter().map(|e| e.key().clone()).collect();
        addresses.sort();
        addresses
    }

    /// Package serving `address`.
    pub fn route_owner(&self, address: &str) -> Option<String> {
        self.routes
            .get(&normalize_address(address))
            .map(|route| route.package().to_string())
    }

    /// Packages that are not unloaded, sorted by name.
    pub fn deployments(&self) -> Vec<DeploymentInfo> {
        let mut infos: Vec<_> = self
            .packages
            .iter()
            .map(|e| e.value().info())
            .filter(|info| info.state != PackageState::Unloaded)
            .collect();
        infos.sort_by(|a, b| a.package.cmp(&b.package));
        infos
    }

    /// State of `package`.
    pub fn package_state(&self, package: &str) -> PackageState {
        self.packages
            .get(package)
            .map(|slot| slot.info.lock().state)
            .unwrap_or(PackageState::Unloaded)
    }
}

fn log_issues(report: &UndeployReport) {
    for issue in &report.issues {
        warn!(issue = %issue, "Absorbed shutdown failure");
    }
}
