//! Service registry and resolution scopes.
//!
//! The host registers process-wide singletons (the reactor handle, global
//! configuration) and scoped factories in a [`ServiceRegistry`]. Each module
//! construction opens its own [`Scope`], so scoped services are shared within
//! one module's dependency graph but never between two modules.
//!
//! Services are keyed by [`type_name`] rather than `TypeId`. A native bundle is
//! compiled separately from the host, and the same type can carry a different
//! `TypeId` on each side of the boundary; its path within the shared
//! `dock_core` revision does not change.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ResolveError;

type AnyArc = Arc<dyn Any + Send + Sync>;
type Provider = Arc<dyn Fn(&mut Scope<'_>) -> Result<AnyArc, ResolveError> + Send + Sync>;

/// Handle to the reactor runtime, registered as a singleton.
#[derive(Clone, Debug)]
pub struct ReactorHandle(tokio::runtime::Handle);

impl ReactorHandle {
    /// Wrap a runtime handle.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self(handle)
    }

    /// Handle of the runtime the caller is running on, if any.
    pub fn try_current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self)
    }

    /// The underlying tokio handle.
    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.0
    }
}

/// Host-wide configuration handed to modules, registered as a singleton.
#[derive(Clone, Debug, Default)]
pub struct GlobalConfig(Arc<serde_json::Value>);

impl GlobalConfig {
    /// Wrap a configuration document.
    pub fn new(value: serde_json::Value) -> Self {
        Self(Arc::new(value))
    }

    /// The whole document.
    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Look up a value by JSON pointer, e.g. `/db/url`.
    pub fn pointer(&self, pointer: &str) -> Option<&serde_json::Value> {
        self.0.pointer(pointer)
    }
}

#[derive(Clone)]
enum Registration {
    Singleton(AnyArc),
    Scoped(Provider),
}

/// Stable service key: the type's path.
type Key = &'static str;

/// Registry of factory functions keyed by the service type they produce.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    entries: HashMap<Key, Registration>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process-wide singleton.
    pub fn singleton<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.singleton_arc(Arc::new(value))
    }

    /// Register an already shared singleton.
    pub fn singleton_arc<T: Send + Sync + 'static>(&mut self, value: Arc<T>) -> &mut Self {
        self.entries
            .insert(type_name::<T>(), Registration::Singleton(value));
        self
    }

    /// Register a factory resolved at most once per scope.
    pub fn scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&mut Scope<'_>) -> Result<T, ResolveError> + Send + Sync + 'static,
    {
        let provider: Provider = Arc::new(move |scope| factory(scope).map(|v| Arc::new(v) as AnyArc));
        self.entries
            .insert(type_name::<T>(), Registration::Scoped(provider));
        self
    }

    /// Whether a provider for `T` exists.
    pub fn contains<T: 'static>(&self) -> bool {
        self.entries.contains_key(type_name::<T>())
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Open a fresh child scope.
    pub fn scope(&self) -> Scope<'_> {
        Scope {
            registry: self,
            resolved: HashMap::new(),
            resolving: Vec::new(),
        }
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        f.debug_struct("ServiceRegistry")
            .field("services", &names)
            .finish()
    }
}

fn cast<T: Send + Sync + 'static>(value: AnyArc) -> Arc<T> {
    match value.downcast::<T>() {
        Ok(typed) => typed,
        // Same type seen from the other side of a bundle boundary.
        Err(value) => {
            // SAFETY: every value stored under `type_name::<T>()` was created as
            // an `Arc<T>` by `singleton_arc` or `scoped`. Host and bundle link
            // the same dock_core revision, which the loader checks through
            // ABI_VERSION, so equal names denote identical types.
            unsafe { Arc::from_raw(Arc::into_raw(value) as *const T) }
        }
    }
}

/// A resolution scope; one per constructed module.
pub struct Scope<'r> {
    registry: &'r ServiceRegistry,
    resolved: HashMap<Key, AnyArc>,
    resolving: Vec<Key>,
}

impl Scope<'_> {
    /// Resolve a service.
    pub fn get<T: Send + Sync + 'static>(&mut self) -> Result<Arc<T>, ResolveError> {
        let name = type_name::<T>();
        let registry = self.registry;
        let registration = registry
            .entries
            .get(name)
            .ok_or(ResolveError::Unregistered(name))?;

        let value = match registration {
            Registration::Singleton(value) => value.clone(),
            Registration::Scoped(provider) => {
                if let Some(value) = self.resolved.get(name) {
                    value.clone()
                } else {
                    if self.resolving.contains(&name) {
                        return Err(ResolveError::Cycle(name));
                    }
                    self.resolving.push(name);
                    let result = provider(self);
                    self.resolving.pop();
                    let value = result?;
                    self.resolved.insert(name, value.clone());
                    value
                }
            }
        };

        Ok(cast::<T>(value))
    }

    /// Resolve a service, mapping absence to `None`.
    pub fn try_get<T: Send + Sync + 'static>(&mut self) -> Option<Arc<T>> {
        self.get::<T>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    struct Repo {
        counter: Arc<Counter>,
    }

    struct Service {
        repo: Arc<Repo>,
    }

    fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry
            .singleton(Counter(AtomicUsize::new(0)))
            .singleton(GlobalConfig::new(serde_json::json!({"db": {"url": "mem://"}})))
            .scoped(|scope| {
                let counter = scope.get::<Counter>()?;
                counter.0.fetch_add(1, Ordering::SeqCst);
                Ok(Repo { counter })
            })
            .scoped(|scope| Ok(Service { repo: scope.get::<Repo>()? }));
        registry
    }

    #[test]
    fn test_singletons_shared_across_scopes() {
        let registry = registry();
        let a = registry.scope().get::<Counter>().unwrap();
        let b = registry.scope().get::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let config = registry.scope().get::<GlobalConfig>().unwrap();
        assert_eq!(config.pointer("/db/url").unwrap(), "mem://");
    }

    #[test]
    fn test_scoped_services_isolated_per_scope() {
        let registry = registry();

        let mut first = registry.scope();
        let repo = first.get::<Repo>().unwrap();
        let service = first.get::<Service>().unwrap();
        assert!(Arc::ptr_eq(&repo, &service.repo));

        let mut second = registry.scope();
        let other = second.get::<Repo>().unwrap();
        assert!(!Arc::ptr_eq(&repo, &other));
        assert!(Arc::ptr_eq(&repo.counter, &other.counter));
        assert_eq!(repo.counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregistered_service() {
        let registry = ServiceRegistry::new();
        let err = registry.scope().get::<Counter>().err().unwrap();
        assert!(matches!(err, ResolveError::Unregistered(name) if name.ends_with("Counter")));
    }

    struct Ping(#[allow(dead_code)] Arc<Pong>);
    struct Pong(#[allow(dead_code)] Arc<Ping>);

    #[test]
    fn test_cycle_detected() {
        let mut registry = ServiceRegistry::new();
        registry
            .scoped(|scope| Ok(Ping(scope.get::<Pong>()?)))
            .scoped(|scope| Ok(Pong(scope.get::<Ping>()?)));

        let err = registry.scope().get::<Ping>().err().unwrap();
        assert!(matches!(err, ResolveError::Cycle(_)));
    }

    #[repr(C)]
    struct Settings {
        level: u64,
    }

    #[repr(C)]
    #[allow(dead_code)]
    struct ForeignSettings {
        level: u64,
    }

    #[test]
    fn test_resolves_by_name_when_type_ids_differ() {
        // A bundle's view of `Settings` may carry a different TypeId than the
        // host's; stand it in with a distinct type of the same layout.
        let mut registry = ServiceRegistry::new();
        let foreign: AnyArc = Arc::new(ForeignSettings { level: 3 });
        registry
            .entries
            .insert(type_name::<Settings>(), Registration::Singleton(foreign));

        assert!(registry.contains::<Settings>());
        let settings = registry.scope().get::<Settings>().unwrap();
        assert_eq!(settings.level, 3);
    }
}
