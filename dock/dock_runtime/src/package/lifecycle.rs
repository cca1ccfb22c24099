//! Package and module lifecycle
//!
//! A package moves through
//! `Unloaded -> Loading -> SharedInitRunning -> ModulesStarting -> ModulesActive -> ShuttingDown -> Unloaded`,
//! skipping `SharedInitRunning` when it declares no shared initializer.
//! Each module moves through `Constructed -> Started -> Initialized -> Serving -> Stopped`,
//! skipping `Initialized` when it does not declare the initializer capability.
//!
//! Every hook call is guarded: a panic inside package code becomes a
//! [`HookError::Panicked`] instead of unwinding into the host.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use dock_core::{
    HookContext, HookError, Module, ModuleRequest, ModuleResponse, SharedInitializer,
    ShutdownFailure,
};
use dock_isolation::UnitGuard;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

/// Lifecycle state of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    Unloaded,
    Loading,
    SharedInitRunning,
    ModulesStarting,
    ModulesActive,
    ShuttingDown,
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackageState::Unloaded => "unloaded",
            PackageState::Loading => "loading",
            PackageState::SharedInitRunning => "shared_init_running",
            PackageState::ModulesStarting => "modules_starting",
            PackageState::ModulesActive => "modules_active",
            PackageState::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Constructed,
    Started,
    Initialized,
    Serving,
    Stopped,
}

pub(crate) fn guard_hook<R>(f: impl FnOnce() -> Result<R, HookError>) -> Result<R, HookError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(HookError::from_panic(payload)))
}

/// A constructed module bound to one address.
///
/// Holds a guard on the unit its code came from; `module` is declared
/// before `_unit` so the instance is dropped while the code is still mapped.
pub struct ModuleInstance {
    package: String,
    class_ref: String,
    address: String,
    state: Mutex<ModuleState>,
    module: Box<dyn Module>,
    _unit: UnitGuard,
}

impl ModuleInstance {
    pub(crate) fn new(
        package: &str,
        class_ref: &str,
        address: &str,
        module: Box<dyn Module>,
        unit: UnitGuard,
    ) -> Self {
        Self {
            package: package.to_string(),
            class_ref: class_ref.to_string(),
            address: address.to_string(),
            state: Mutex::new(ModuleState::Constructed),
            module,
            _unit: unit,
        }
    }

    /// Owning package.
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Exported class the instance was built from.
    pub fn class_ref(&self) -> &str {
        &self.class_ref
    }

    /// Bound address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current state.
    pub fn state(&self) -> ModuleState {
        *self.state.lock()
    }

    /// Whether the module declares the initializer capability.
    pub fn has_initializer(&self) -> bool {
        self.module.initializer().is_some()
    }

    fn set_state(&self, state: ModuleState) {
        debug!(address = %self.address, state = ?state, "Module state");
        *self.state.lock() = state;
    }

    /// Run the start hook.
    pub(crate) fn start(&self, ctx: &HookContext) -> Result<(), HookError> {
        guard_hook(|| self.module.start(ctx))?;
        self.set_state(ModuleState::Started);
        Ok(())
    }

    /// Run the init hook if the module declares one.
    pub(crate) fn init(&self) -> Result<(), HookError> {
        if let Some(initializer) = self.module.initializer() {
            guard_hook(|| initializer.init())?;
            self.set_state(ModuleState::Initialized);
        }
        Ok(())
    }

    pub(crate) fn mark_serving(&self) {
        self.set_state(ModuleState::Serving);
    }

    /// Run the shutdown hook, if declared, then stop. Failures are returned, never raised.
    pub(crate) fn stop(&self) -> Vec<ShutdownFailure> {
        let mut failures = Vec::new();
        let failure = |hook: &'static str, source: HookError| {
            warn!(address = %self.address, class = %self.class_ref, hook, error = %source, "Module hook failed during shutdown");
            ShutdownFailure::Module {
                class_ref: self.class_ref.clone(),
                address: self.address.clone(),
                hook,
                source,
            }
        };

        if let Some(initializer) = self.module.initializer() {
            if let Err(source) = guard_hook(|| initializer.shutdown()) {
                failures.push(failure("shutdown", source));
            }
        }
        if let Err(source) = guard_hook(|| self.module.stop()) {
            failures.push(failure("stop", source));
        }

        self.set_state(ModuleState::Stopped);
        failures
    }

    /// Run the handler.
    pub async fn handle(&self, request: ModuleRequest) -> Result<ModuleResponse, HookError> {
        AssertUnwindSafe(self.module.handle(request))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(HookError::from_panic(payload)))
    }
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("package", &self.package)
            .field("class_ref", &self.class_ref)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

/// The live shared initializer of a package.
pub struct SharedInitInstance {
    package: String,
    class_ref: String,
    initializer: Box<dyn SharedInitializer>,
    _unit: UnitGuard,
}

impl SharedInitInstance {
    pub(crate) fn new(
        package: &str,
        class_ref: &str,
        initializer: Box<dyn SharedInitializer>,
        unit: UnitGuard,
    ) -> Self {
        Self {
            package: package.to_string(),
            class_ref: class_ref.to_string(),
            initializer,
            _unit: unit,
        }
    }

    /// Exported class the instance was built from.
    pub fn class_ref(&self) -> &str {
        &self.class_ref
    }

    pub(crate) fn initialize(&self, ctx: &HookContext) -> Result<(), HookError> {
        guard_hook(|| self.initializer.initialize(ctx))
    }

    pub(crate) fn shutdown(&self) -> Option<ShutdownFailure> {
        let source = guard_hook(|| self.initializer.shutdown()).err()?;
        warn!(package = %self.package, class = %self.class_ref, error = %source, "Shared initializer shutdown failed");
        Some(ShutdownFailure::SharedInitializer {
            package: self.package.clone(),
            class_ref: self.class_ref.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dock_core::{async_trait, ModuleInitializer, ReactorHandle, UnitId};
    use dock_isolation::UnitCensus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Calls {
        init: AtomicUsize,
        shutdown: AtomicUsize,
        stop: AtomicUsize,
    }

    struct Tracked {
        calls: Arc<Calls>,
        fail_shutdown: bool,
    }

    impl ModuleInitializer for Tracked {
        fn init(&self) -> Result<(), HookError> {
            self.calls.init.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&self) -> Result<(), HookError> {
            self.calls.shutdown.fetch_add(1, Ordering::SeqCst);
            if self.fail_shutdown {
                Err(HookError::failed("flush failed"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Module for Tracked {
        async fn handle(&self, request: ModuleRequest) -> Result<ModuleResponse, HookError> {
            if request.payload.is_empty() {
                panic!("empty payload");
            }
            Ok(ModuleResponse::ok(request.payload))
        }

        fn stop(&self) -> Result<(), HookError> {
            self.calls.stop.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn initializer(&self) -> Option<&dyn ModuleInitializer> {
            Some(self)
        }
    }

    fn instance(fail_shutdown: bool) -> (ModuleInstance, Arc<Calls>, Arc<UnitCensus>) {
        let census = Arc::new(UnitCensus::new());
        let guard = UnitGuard::new(UnitId::new(), "repoA", census.clone(), None);
        let calls = Arc::new(Calls::default());
        let module = Box::new(Tracked {
            calls: calls.clone(),
            fail_shutdown,
        });
        (
            ModuleInstance::new("repoA", "X", "x.v1", module, guard),
            calls,
            census,
        )
    }

    fn ctx() -> HookContext {
        HookContext {
            package: "repoA".to_string(),
            address: Some("x.v1".to_string()),
            config: serde_json::json!({}),
            reactor: ReactorHandle::new(tokio::runtime::Handle::current()),
        }
    }

    #[tokio::test]
    async fn test_module_walks_states() {
        let (module, calls, census) = instance(false);
        assert_eq!(module.state(), ModuleState::Constructed);
        assert!(module.has_initializer());

        module.start(&ctx()).unwrap();
        assert_eq!(module.state(), ModuleState::Started);
        module.init().unwrap();
        assert_eq!(module.state(), ModuleState::Initialized);
        module.mark_serving();
        assert_eq!(module.state(), ModuleState::Serving);

        assert!(module.stop().is_empty());
        assert_eq!(module.state(), ModuleState::Stopped);
        assert_eq!(calls.init.load(Ordering::SeqCst), 1);
        assert_eq!(calls.shutdown.load(Ordering::SeqCst), 1);
        assert_eq!(calls.stop.load(Ordering::SeqCst), 1);

        assert_eq!(census.live_units(), 1);
        drop(module);
        assert_eq!(census.live_units(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_failure_absorbed_and_stop_still_runs() {
        let (module, calls, _census) = instance(true);
        let failures = module.stop();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            ShutdownFailure::Module { hook: "shutdown", .. }
        ));
        assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error() {
        let (module, _calls, _census) = instance(false);
        let ok = module.handle(ModuleRequest::new("x.v1", "hi")).await.unwrap();
        assert_eq!(ok.body, bytes::Bytes::from("hi"));

        let err = module
            .handle(ModuleRequest::new("x.v1", bytes::Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(err, HookError::Panicked("empty payload".to_string()));
    }

    #[test]
    fn test_hook_panic_guarded() {
        let result: Result<(), HookError> = guard_hook(|| panic!("bad hook"));
        assert_eq!(result, Err(HookError::Panicked("bad hook".to_string())));
    }
}
