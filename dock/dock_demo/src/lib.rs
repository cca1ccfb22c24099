//! Sample dock package.
//!
//! - `demo::Init` publishes the greeting from the host's global
//!   configuration for the package's modules.
//! - `demo::Echo` returns the payload unchanged.
//! - `demo::Greeter` greets the payload, with punctuation from its descriptor.
//! - `demo::Upper` upper-cases the payload once its init hook has run.
//! - `demo::Fragile` panics on every request; the host answers with an error
//!   and keeps serving.
//!
//! Built as a `cdylib`, each deployment maps a fresh copy of this library,
//! so `GREETING` is per deployment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dock_core::{
    async_trait, GlobalConfig, HookContext, HookError, InitializerClass, Module, ModuleClass,
    ModuleInitializer, ModuleRequest, ModuleResponse, PackageExports, ResolveError, Scope,
    SharedInitializer,
};
use tracing::info;

static GREETING: RwLock<Option<String>> = RwLock::new(None);

fn poisoned<T>(_: T) -> HookError {
    HookError::failed("greeting lock poisoned")
}

/// Shared initializer publishing the greeting.
pub struct Init {
    greeting: String,
}

impl SharedInitializer for Init {
    fn initialize(&self, ctx: &HookContext) -> Result<(), HookError> {
        *GREETING.write().map_err(poisoned)? = Some(self.greeting.clone());
        info!(package = %ctx.package, greeting = %self.greeting, "Demo package initialized");
        Ok(())
    }

    fn shutdown(&self) -> Result<(), HookError> {
        *GREETING.write().map_err(poisoned)? = None;
        Ok(())
    }
}

fn inject_init(scope: &mut Scope<'_>) -> Result<Box<dyn SharedInitializer>, ResolveError> {
    let global: Arc<GlobalConfig> = scope.get()?;
    let greeting = global
        .pointer("/greeting")
        .and_then(|v| v.as_str())
        .unwrap_or("hello")
        .to_string();
    Ok(Box::new(Init { greeting }))
}

/// Returns the payload unchanged.
pub struct Echo;

#[async_trait]
impl Module for Echo {
    async fn handle(&self, request: ModuleRequest) -> Result<ModuleResponse, HookError> {
        let mut response = ModuleResponse::ok(request.payload);
        if request.content_type.is_some() {
            response.content_type = request.content_type;
        }
        Ok(response)
    }
}

/// Greets the payload.
#[derive(Default)]
pub struct Greeter {
    punctuation: RwLock<String>,
}

#[async_trait]
impl Module for Greeter {
    fn start(&self, ctx: &HookContext) -> Result<(), HookError> {
        let punctuation = ctx
            .config
            .get("punctuation")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        *self.punctuation.write().map_err(poisoned)? = punctuation.to_string();
        Ok(())
    }

    async fn handle(&self, request: ModuleRequest) -> Result<ModuleResponse, HookError> {
        let greeting = GREETING
            .read()
            .map_err(poisoned)?
            .clone()
            .ok_or_else(|| HookError::failed("demo package not initialized"))?;
        let punctuation = self.punctuation.read().map_err(poisoned)?.clone();
        Ok(ModuleResponse::text(format!(
            "{} {}{}",
            greeting,
            request.payload_str(),
            punctuation
        )))
    }
}

/// Upper-cases the payload.
#[derive(Default)]
pub struct Upper {
    ready: AtomicBool,
}

impl ModuleInitializer for Upper {
    fn init(&self) -> Result<(), HookError> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), HookError> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Module for Upper {
    async fn handle(&self, request: ModuleRequest) -> Result<ModuleResponse, HookError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Ok(ModuleResponse::text("not ready").with_status(503));
        }
        Ok(ModuleResponse::text(request.payload_str().to_uppercase()))
    }

    fn initializer(&self) -> Option<&dyn ModuleInitializer> {
        Some(self)
    }
}

/// Panics while handling.
pub struct Fragile;

#[async_trait]
impl Module for Fragile {
    async fn handle(&self, request: ModuleRequest) -> Result<ModuleResponse, HookError> {
        panic!("fragile module gave way on {:?}", request.payload_str());
    }
}

/// Export table of the package.
pub fn exports() -> PackageExports {
    PackageExports::new()
        .initializer(InitializerClass::new("demo::Init").injectable(inject_init))
        .module(ModuleClass::new("demo::Echo").with_default(|| Box::new(Echo)))
        .module(ModuleClass::new("demo::Greeter").with_default(|| Box::<Greeter>::default()))
        .module(ModuleClass::new("demo::Upper").with_default(|| Box::<Upper>::default()))
        .module(ModuleClass::new("demo::Fragile").with_default(|| Box::new(Fragile)))
}

dock_core::declare_package!(exports);
