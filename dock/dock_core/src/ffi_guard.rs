//! Panic guards compiled into the package.
//!
//! A native package carries its own copy of the standard library, so a panic
//! unwinding out of package code looks like a foreign exception to the host
//! and cannot be caught there. Every entry point the host calls is therefore
//! wrapped on the package side: class constructors, the export function and
//! each module or initializer hook.
//!
//! The wrapping happens in [`Class`](crate::Class) builders and in
//! [`declare_package!`](crate::declare_package), which are instantiated inside
//! the package. Package authors do not call anything here directly.

use std::panic::{catch_unwind, AssertUnwindSafe};

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::error::HookError;
use crate::module::{HookContext, Module, ModuleInitializer, ModuleRequest, ModuleResponse, SharedInitializer};

/// Run a hook, turning a panic into [`HookError::Panicked`].
pub fn guard_hook<R>(f: impl FnOnce() -> Result<R, HookError>) -> Result<R, HookError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(HookError::from_panic(payload)),
    }
}

/// Run `f`, returning `default` if it panics.
pub fn guard_with_default<T>(default: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(default)
}

/// Trait objects that can be wrapped in a panic guard.
pub trait Contain {
    /// Wrap `inner` so that none of its hooks unwind into the caller.
    fn contain(inner: Box<Self>) -> Box<Self>;
}

impl Contain for dyn Module {
    fn contain(inner: Box<Self>) -> Box<Self> {
        Box::new(GuardedModule { inner })
    }
}

impl Contain for dyn SharedInitializer {
    fn contain(inner: Box<Self>) -> Box<Self> {
        Box::new(GuardedInitializer { inner })
    }
}

struct GuardedModule {
    inner: Box<dyn Module>,
}

#[async_trait]
impl Module for GuardedModule {
    fn start(&self, ctx: &HookContext) -> Result<(), HookError> {
        guard_hook(|| self.inner.start(ctx))
    }

    async fn handle(&self, request: ModuleRequest) -> Result<ModuleResponse, HookError> {
        match AssertUnwindSafe(self.inner.handle(request)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(HookError::from_panic(payload)),
        }
    }

    fn stop(&self) -> Result<(), HookError> {
        guard_hook(|| self.inner.stop())
    }

    fn initializer(&self) -> Option<&dyn ModuleInitializer> {
        let declared = guard_with_default(false, || self.inner.initializer().is_some());
        if declared {
            Some(self)
        } else {
            None
        }
    }
}

impl ModuleInitializer for GuardedModule {
    fn init(&self) -> Result<(), HookError> {
        guard_hook(|| match self.inner.initializer() {
            Some(initializer) => initializer.init(),
            None => Ok(()),
        })
    }

    fn shutdown(&self) -> Result<(), HookError> {
        guard_hook(|| match self.inner.initializer() {
            Some(initializer) => initializer.shutdown(),
            None => Ok(()),
        })
    }
}

struct GuardedInitializer {
    inner: Box<dyn SharedInitializer>,
}

impl SharedInitializer for GuardedInitializer {
    fn initialize(&self, ctx: &HookContext) -> Result<(), HookError> {
        guard_hook(|| self.inner.initialize(ctx))
    }

    fn shutdown(&self) -> Result<(), HookError> {
        guard_hook(|| self.inner.shutdown())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inject::ReactorHandle;

    struct Explosive;

    impl ModuleInitializer for Explosive {
        fn init(&self) -> Result<(), HookError> {
            panic!("init exploded")
        }

        fn shutdown(&self) -> Result<(), HookError> {
            Err(HookError::failed("refused"))
        }
    }

    #[async_trait]
    impl Module for Explosive {
        fn start(&self, _ctx: &HookContext) -> Result<(), HookError> {
            panic!("start exploded")
        }

        async fn handle(&self, request: ModuleRequest) -> Result<ModuleResponse, HookError> {
            if request.payload.is_empty() {
                panic!("handler exploded");
            }
            Ok(ModuleResponse::ok(request.payload))
        }

        fn initializer(&self) -> Option<&dyn ModuleInitializer> {
            Some(self)
        }
    }

    struct Plain;

    #[async_trait]
    impl Module for Plain {
        async fn handle(&self, _request: ModuleRequest) -> Result<ModuleResponse, HookError> {
            Ok(ModuleResponse::text("plain"))
        }
    }

    struct Setup;

    impl SharedInitializer for Setup {
        fn initialize(&self, _ctx: &HookContext) -> Result<(), HookError> {
            panic!("setup exploded")
        }

        fn shutdown(&self) -> Result<(), HookError> {
            Ok(())
        }
    }

    fn context() -> HookContext {
        HookContext {
            package: "repoA".to_string(),
            address: Some("boom".to_string()),
            config: serde_json::Value::Null,
            reactor: ReactorHandle::new(tokio::runtime::Handle::current()),
        }
    }

    #[tokio::test]
    async fn test_module_hooks_never_unwind() {
        let module = <dyn Module as Contain>::contain(Box::new(Explosive));

        let err = module.start(&context()).unwrap_err();
        assert_eq!(err, HookError::Panicked("start exploded".to_string()));

        let err = module
            .handle(ModuleRequest::new("boom", ""))
            .await
            .unwrap_err();
        assert_eq!(err, HookError::Panicked("handler exploded".to_string()));

        let response = module.handle(ModuleRequest::new("boom", "ok")).await.unwrap();
        assert_eq!(response.body, "ok");

        let initializer = module.initializer().unwrap();
        assert!(matches!(initializer.init(), Err(HookError::Panicked(m)) if m == "init exploded"));
        assert_eq!(initializer.shutdown(), Err(HookError::failed("refused")));
    }

    #[tokio::test]
    async fn test_module_without_initializer_stays_without() {
        let module = <dyn Module as Contain>::contain(Box::new(Plain));
        assert!(module.initializer().is_none());
        assert!(module.stop().is_ok());
    }

    #[tokio::test]
    async fn test_shared_initializer_guarded() {
        let initializer = <dyn SharedInitializer as Contain>::contain(Box::new(Setup));
        let err = initializer.initialize(&context()).unwrap_err();
        assert_eq!(err, HookError::Panicked("setup exploded".to_string()));
        assert!(initializer.shutdown().is_ok());
    }

    #[test]
    fn test_guard_with_default() {
        assert_eq!(guard_with_default(0, || 7), 7);
        assert_eq!(guard_with_default(0, || -> i32 { panic!("no value") }), 0);
    }
}
