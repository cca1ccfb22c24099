//! Package export tables.
//!
//! A package publishes a [`PackageExports`] table naming every class its
//! descriptors may reference. Classes carry constructors rather than
//! reflection: an optional injectable constructor that pulls services from a
//! [`Scope`], and an optional zero-argument constructor. The builders wrap
//! each constructor, and every instance it returns, in the package-side
//! panic guards of [`ffi_guard`](crate::ffi_guard).
//!
//! Native packages expose the table with [`declare_package!`](crate::declare_package).

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{panic_message, HookError, ResolveError};
use crate::ffi_guard::{guard_hook, Contain};
use crate::inject::Scope;
use crate::module::{Module, SharedInitializer};

/// Revision of the host/package contract. Bumped whenever a type in this crate
/// changes layout; the host refuses bundles reporting a different value.
pub const ABI_VERSION: u32 = 1;

/// Symbol returning the bundle's [`ABI_VERSION`].
pub const ABI_VERSION_SYMBOL: &[u8] = b"dock_abi_version\0";

/// Symbol returning a heap-allocated [`PackageExports`].
pub const EXPORTS_SYMBOL: &[u8] = b"dock_package_exports\0";

/// Constructor resolving its dependencies from a scope, as written by the package.
pub type InjectFn<T> = fn(&mut Scope<'_>) -> Result<Box<T>, ResolveError>;

/// Zero-argument constructor, as written by the package.
pub type DefaultFn<T> = fn() -> Box<T>;

/// Guarded injectable constructor handed to the host.
pub type InjectCtor<T> = Arc<dyn Fn(&mut Scope<'_>) -> Result<Box<T>, ResolveError> + Send + Sync>;

/// Guarded zero-argument constructor handed to the host.
pub type DefaultCtor<T> = Arc<dyn Fn() -> Result<Box<T>, HookError> + Send + Sync>;

/// A constructible class exported by a package.
pub struct Class<T: ?Sized> {
    class_ref: String,
    injectable: Option<InjectCtor<T>>,
    default: Option<DefaultCtor<T>>,
}

/// A module class.
pub type ModuleClass = Class<dyn Module>;

/// A shared initializer class.
pub type InitializerClass = Class<dyn SharedInitializer>;

impl<T: ?Sized + Contain + 'static> Class<T> {
    /// Declare a class with no constructors yet.
    pub fn new(class_ref: impl Into<String>) -> Self {
        Self {
            class_ref: class_ref.into(),
            injectable: None,
            default: None,
        }
    }

    /// Attach the injectable constructor.
    pub fn injectable(mut self, ctor: InjectFn<T>) -> Self {
        let guarded: InjectCtor<T> = Arc::new(move |scope: &mut Scope<'_>| {
            match catch_unwind(AssertUnwindSafe(|| ctor(scope))) {
                Ok(built) => built.map(T::contain),
                Err(payload) => Err(ResolveError::Panicked(panic_message(payload.as_ref()))),
            }
        });
        self.injectable = Some(guarded);
        self
    }

    /// Attach the zero-argument constructor.
    pub fn with_default(mut self, ctor: DefaultFn<T>) -> Self {
        let guarded: DefaultCtor<T> = Arc::new(move || guard_hook(|| Ok(ctor())).map(T::contain));
        self.default = Some(guarded);
        self
    }
}

impl<T: ?Sized> Class<T> {
    /// Name descriptors use to refer to this class.
    pub fn class_ref(&self) -> &str {
        &self.class_ref
    }

    /// The injectable constructor, if declared.
    pub fn injectable_ctor(&self) -> Option<InjectCtor<T>> {
        self.injectable.clone()
    }

    /// The zero-argument constructor, if declared.
    pub fn default_ctor(&self) -> Option<DefaultCtor<T>> {
        self.default.clone()
    }
}

impl<T: ?Sized> Clone for Class<T> {
    fn clone(&self) -> Self {
        Self {
            class_ref: self.class_ref.clone(),
            injectable: self.injectable.clone(),
            default: self.default.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Class<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("class_ref", &self.class_ref)
            .field("injectable", &self.injectable.is_some())
            .field("default", &self.default.is_some())
            .finish()
    }
}

/// Everything a package makes available to the host.
#[derive(Clone, Debug, Default)]
pub struct PackageExports {
    modules: BTreeMap<String, ModuleClass>,
    initializers: BTreeMap<String, InitializerClass>,
}

impl PackageExports {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Export a module class.
    pub fn module(mut self, class: ModuleClass) -> Self {
        self.modules.insert(class.class_ref.clone(), class);
        self
    }

    /// Export a shared initializer class.
    pub fn initializer(mut self, class: InitializerClass) -> Self {
        self.initializers.insert(class.class_ref.clone(), class);
        self
    }

    /// Look up a module class.
    pub fn find_module(&self, class_ref: &str) -> Option<&ModuleClass> {
        self.modules.get(class_ref)
    }

    /// Look up a shared initializer class.
    pub fn find_initializer(&self, class_ref: &str) -> Option<&InitializerClass> {
        self.initializers.get(class_ref)
    }

    /// Exported module class names, sorted.
    pub fn module_refs(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Exported initializer class names, sorted.
    pub fn initializer_refs(&self) -> impl Iterator<Item = &str> {
        self.initializers.keys().map(String::as_str)
    }
}

/// Export a package's class table from a `cdylib`.
///
/// Takes the path of a `fn() -> PackageExports`. The bundle must be built by
/// the same toolchain and against the same `dock_core` as the host: the
/// table crosses the boundary as Rust types. A panic in the export function
/// is caught in the package and reported to the host as a null table.
///
/// ```ignore
/// fn exports() -> dock_core::package::PackageExports {
///     dock_core::package::PackageExports::new()
/// }
///
/// dock_core::declare_package!(exports);
/// ```
#[macro_export]
macro_rules! declare_package {
    ($exports:path) => {
        #[no_mangle]
        pub extern "C" fn dock_abi_version() -> u32 {
            $crate::package::ABI_VERSION
        }

        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn dock_package_exports() -> *mut $crate::package::PackageExports {
            $crate::ffi_guard::guard_with_default(::std::ptr::null_mut(), || {
                let exports: $crate::package::PackageExports = $exports();
                ::std::boxed::Box::into_raw(::std::boxed::Box::new(exports))
            })
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HookError;
    use crate::inject::{GlobalConfig, ServiceRegistry};
    use crate::module::{ModuleRequest, ModuleResponse};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Greeter {
        greeting: String,
    }

    #[async_trait]
    impl Module for Greeter {
        async fn handle(&self, request: ModuleRequest) -> Result<ModuleResponse, HookError> {
            Ok(ModuleResponse::text(format!(
                "{} {}",
                self.greeting,
                request.payload_str()
            )))
        }
    }

    fn greeter_class() -> ModuleClass {
        ModuleClass::new("demo::Greeter")
            .injectable(|scope| {
                let config: Arc<GlobalConfig> = scope.get()?;
                let greeting = config
                    .pointer("/greeting")
                    .and_then(|v| v.as_str())
                    .unwrap_or("hello")
                    .to_string();
                Ok(Box::new(Greeter { greeting }))
            })
            .with_default(|| {
                Box::new(Greeter {
                    greeting: "hi".to_string(),
                })
            })
    }

    fn exports() -> PackageExports {
        PackageExports::new().module(greeter_class())
    }

    crate::declare_package!(exports);

    #[test]
    fn test_class_lookup() {
        let exports = exports();
        let class = exports.find_module("demo::Greeter").unwrap();
        assert!(class.injectable_ctor().is_some());
        assert!(class.default_ctor().is_some());
        assert!(exports.find_module("demo::Missing").is_none());
        assert_eq!(exports.module_refs().collect::<Vec<_>>(), vec!["demo::Greeter"]);
    }

    #[tokio::test]
    async fn test_injectable_constructor_reads_scope() {
        let mut registry = ServiceRegistry::new();
        registry.singleton(GlobalConfig::new(serde_json::json!({"greeting": "hey"})));

        let class = greeter_class();
        let ctor = class.injectable_ctor().unwrap();
        let module = ctor(&mut registry.scope()).unwrap();
        let response = module.handle(ModuleRequest::new("greet", "you")).await.unwrap();
        assert_eq!(response.body, "hey you");
    }

    #[test]
    fn test_exported_symbols() {
        assert_eq!(dock_abi_version(), ABI_VERSION);
        let table = unsafe { Box::from_raw(dock_package_exports()) };
        assert!(table.find_module("demo::Greeter").is_some());
    }

    struct Fuse;

    #[async_trait]
    impl Module for Fuse {
        async fn handle(&self, _request: ModuleRequest) -> Result<ModuleResponse, HookError> {
            panic!("fuse blown")
        }
    }

    #[tokio::test]
    async fn test_constructors_and_instances_are_guarded() {
        let registry = ServiceRegistry::new();
        let class = ModuleClass::new("demo::Fuse")
            .injectable(|_| panic!("inject exploded"))
            .with_default(|| Box::new(Fuse));

        let ctor = class.injectable_ctor().unwrap();
        let err = ctor(&mut registry.scope()).err().unwrap();
        assert_eq!(err, ResolveError::Panicked("inject exploded".to_string()));

        let module = (class.default_ctor().unwrap())().unwrap();
        let err = module.handle(ModuleRequest::new("fuse", "")).await.unwrap_err();
        assert_eq!(err, HookError::Panicked("fuse blown".to_string()));

        let broken = ModuleClass::new("demo::Broken").with_default(|| panic!("default exploded"));
        let err = (broken.default_ctor().unwrap())().err().unwrap();
        assert_eq!(err, HookError::Panicked("default exploded".to_string()));
    }
}
