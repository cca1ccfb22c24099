//! Dependency container
//!
//! Builds module and initializer instances from their exported classes.
//! A class with an injectable constructor is resolved against a fresh child
//! scope of the process-wide service registry, so every instance gets its
//! own scoped services while sharing the singletons. When resolution fails,
//! or the class has no injectable constructor, the default constructor is
//! tried instead.

use std::panic::{catch_unwind, AssertUnwindSafe};

use dock_core::error::panic_message;
use dock_core::{Class, ConstructionError, GlobalConfig, ReactorHandle, ResolveError, ServiceRegistry};
use tracing::debug;

/// How an instance came to be.
pub enum Construction<T: ?Sized> {
    /// Built by the injectable constructor.
    ResolvedViaContainer(Box<T>),
    /// Built by the default constructor.
    ResolvedViaDefault(Box<T>),
    /// Neither constructor produced an instance.
    Failed(ConstructionError),
}

impl<T: ?Sized> Construction<T> {
    /// The instance, or why there is none.
    pub fn into_result(self) -> Result<Box<T>, ConstructionError> {
        match self {
            Construction::ResolvedViaContainer(instance)
            | Construction::ResolvedViaDefault(instance) => Ok(instance),
            Construction::Failed(err) => Err(err),
        }
    }

    /// Name of the strategy, for logs.
    pub fn strategy(&self) -> &'static str {
        match self {
            Construction::ResolvedViaContainer(_) => "container",
            Construction::ResolvedViaDefault(_) => "default",
            Construction::Failed(_) => "failed",
        }
    }
}

/// Process-wide service registry plus the construction strategy.
#[derive(Debug, Clone)]
pub struct Container {
    services: ServiceRegistry,
}

impl Container {
    /// Container exposing the reactor handle and the global configuration.
    pub fn new(reactor: ReactorHandle, global: GlobalConfig) -> Self {
        let mut services = ServiceRegistry::new();
        services.singleton(reactor).singleton(global);
        Self { services }
    }

    /// Container over an existing registry.
    pub fn with_services(services: ServiceRegistry) -> Self {
        Self { services }
    }

    /// Registry for adding further services before the container is shared.
    pub fn services_mut(&mut self) -> &mut ServiceRegistry {
        &mut self.services
    }

    /// The registry.
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Build an instance of `class`, trying the injectable constructor first.
    pub fn construct<T: ?Sized>(&self, class: &Class<T>) -> Construction<T> {
        let class_ref = class.class_ref();

        let injected = match class.injectable_ctor() {
            Some(ctor) => {
                let mut scope = self.services.scope();
                guarded(|| ctor(&mut scope).map_err(|e| e.to_string()))
            }
            None => Err(ResolveError::NotInjectable.to_string()),
        };

        let resolve_failure = match injected {
            Ok(instance) => return Construction::ResolvedViaContainer(instance),
            Err(reason) => reason,
        };
        debug!(class = %class_ref, reason = %resolve_failure, "Injection failed, trying default constructor");

        match class.default_ctor() {
            Some(ctor) => match guarded(|| ctor().map_err(|e| e.to_string())) {
                Ok(instance) => Construction::ResolvedViaDefault(instance),
                Err(reason) => Construction::Failed(ConstructionError {
                    class_ref: class_ref.to_string(),
                    reason: format!("injection: {}; default constructor: {}", resolve_failure, reason),
                }),
            },
            None => Construction::Failed(ConstructionError {
                class_ref: class_ref.to_string(),
                reason: format!("injection: {}; no default constructor", resolve_failure),
            }),
        }
    }

    /// Build an instance of `class` or fail.
    pub fn build<T: ?Sized>(&self, class: &Class<T>) -> Result<Box<T>, ConstructionError> {
        let construction = self.construct(class);
        debug!(class = %class.class_ref(), strategy = construction.strategy(), "Constructed");
        construction.into_result()
    }
}

// Second line of defence; package-side guards already catch panics from
// bundles with their own runtime.
fn guarded<R>(f: impl FnOnce() -> Result<R, String>) -> Result<R, String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}
