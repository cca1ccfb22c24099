//! # Dock Core
//!
//! `dock_core` is the platform boundary shared by the dock host and every
//! package it loads. Host and packages must link the identical revision of
//! this crate: module trait objects, request types and the export table all
//! cross the isolation boundary as Rust values.
//!
//! ## Crate Structure
//!
//! - **error**: Error types for all dock components
//! - **ffi_guard**: Panic guards compiled into each package
//! - **id**: Strongly-typed identifiers
//! - **inject**: Service registry and per-module resolution scopes
//! - **module**: Module, module initializer and shared initializer contracts
//! - **package**: Export tables and the `declare_package!` macro
//!
//! ## Writing a package
//!
//! ```
//! use dock_core::async_trait;
//! use dock_core::{HookError, Module, ModuleClass, ModuleRequest, ModuleResponse, PackageExports};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Module for Echo {
//!     async fn handle(&self, request: ModuleRequest) -> Result<ModuleResponse, HookError> {
//!         Ok(ModuleResponse::ok(request.payload))
//!     }
//! }
//!
//! fn exports() -> PackageExports {
//!     PackageExports::new().module(ModuleClass::new("echo::Echo").with_default(|| Box::new(Echo)))
//! }
//! # let _ = exports();
//! ```

pub mod error;
pub mod ffi_guard;
pub mod id;
pub mod inject;
pub mod module;
pub mod package;

pub use error::{
    ConstructionError, DeployError, DispatchError, Error, HookError, IsolationError,
    ResolveError, Result, ShutdownFailure,
};
pub use id::{DeploymentId, UnitId};
pub use inject::{GlobalConfig, ReactorHandle, Scope, ServiceRegistry};
pub use module::{
    HookContext, Module, ModuleInitializer, ModuleRequest, ModuleResponse, SharedInitializer,
};
pub use package::{Class, InitializerClass, ModuleClass, PackageExports, ABI_VERSION};

// Re-exported so packages can implement `Module` without a direct dependency.
pub use async_trait::async_trait;
