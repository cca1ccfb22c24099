//! Error types for the dock host.
//!
//! Errors are organised by subsystem. The root `Error` wraps each of them so
//! the outer layers (runtime facade, binary) can treat failures uniformly,
//! while the coordinator and the isolation layer keep precise types.

use std::any::Any;
use std::path::PathBuf;

use thiserror::Error;

use crate::id::UnitId;

/// Root error type for the dock host.
#[derive(Debug, Error)]
pub enum Error {
    /// Package deployment errors
    #[error("Deploy error: {0}")]
    Deploy(#[from] DeployError),

    /// Request dispatch errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Isolation boundary errors
    #[error("Isolation error: {0}")]
    Isolation(#[from] IsolationError),

    /// Service resolution errors
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// Errors raised from module hooks
    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General runtime errors
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Result type used throughout the dock crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a module, module initializer or shared initializer hook.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HookError {
    /// The hook returned an error
    #[error("{0}")]
    Failed(String),

    /// The hook panicked
    #[error("panicked: {0}")]
    Panicked(String),
}

impl HookError {
    /// Shorthand for `HookError::Failed`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Convert a payload caught by `catch_unwind` into a hook error.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(panic_message(payload.as_ref()))
    }
}

/// Extract the message carried by a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Errors raised while resolving services from a scope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// Nothing is registered for the requested service type
    #[error("no provider registered for {0}")]
    Unregistered(&'static str),

    /// The service (transitively) depends on itself
    #[error("dependency cycle while resolving {0}")]
    Cycle(&'static str),

    /// A registered provider returned an error
    #[error("provider for {service} failed: {reason}")]
    ProviderFailed {
        service: &'static str,
        reason: String,
    },

    /// The class has no injectable constructor
    #[error("class declares no injectable constructor")]
    NotInjectable,

    /// The injectable constructor panicked
    #[error("constructor panicked: {0}")]
    Panicked(String),
}

/// Errors raised by an isolation boundary.
#[derive(Debug, Error)]
pub enum IsolationError {
    /// The boundary has no code for the package
    #[error("package not found: {0}")]
    PackageNotFound(String),

    /// The bundle exists but could not be mapped
    #[error("failed to load {}: {reason}", .path.display())]
    LoadFailed { path: PathBuf, reason: String },

    /// The bundle was built against a different platform revision
    #[error("ABI mismatch: host expects {expected}, package reports {found}")]
    AbiMismatch { expected: u32, found: u32 },

    /// A required export is absent from the bundle
    #[error("missing exported symbol `{0}`")]
    MissingSymbol(&'static str),

    /// The bundle could not be staged before loading
    #[error("failed to stage {}: {source}", .path.display())]
    ShadowCopy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The boundary cannot operate on this platform
    #[error("isolation boundary unsupported: {0}")]
    Unsupported(&'static str),

    /// Closing the unit reported a failure
    #[error("unit {unit} failed to close: {reason}")]
    CloseFailed { unit: UnitId, reason: String },
}

/// Neither the injectable nor the default constructor produced an instance.
#[derive(Debug, Clone, Error)]
#[error("cannot construct {class_ref}: {reason}")]
pub struct ConstructionError {
    /// The class that failed to construct
    pub class_ref: String,

    /// Why both strategies failed
    pub reason: String,
}

/// Errors that abort a package deployment.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Manifest directory or bundle is absent
    #[error("package {package}: missing {what} at {}", .path.display())]
    ArtifactMissing {
        package: String,
        what: &'static str,
        path: PathBuf,
    },

    /// The manifest directory holds no module descriptors
    #[error("package {package}: no module descriptors in {}", .dir.display())]
    NoManifests { package: String, dir: PathBuf },

    /// A module descriptor could not be read
    #[error("package {package}: invalid descriptor {}: {reason}", .path.display())]
    InvalidManifest {
        package: String,
        path: PathBuf,
        reason: String,
    },

    /// The isolation boundary failed to load the bundle
    #[error(transparent)]
    Isolation(#[from] IsolationError),

    /// A module or initializer could not be constructed
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    /// The shared initializer hook failed
    #[error("package {package}: shared initializer {class_ref} failed: {source}")]
    SharedInitFailure {
        package: String,
        class_ref: String,
        #[source]
        source: HookError,
    },

    /// A module start or init hook failed
    #[error("package {package}: module {class_ref} at {address} failed in {hook}: {source}")]
    ModuleInitFailure {
        package: String,
        class_ref: String,
        address: String,
        hook: &'static str,
        #[source]
        source: HookError,
    },

    /// Another package already serves the address
    #[error("address {address} is already served by package {owner}")]
    AddressConflict { address: String, owner: String },

    /// The blocking part of the deploy could not be handed to the worker pool
    #[error("package {package}: could not offload deploy: {reason}")]
    Offload { package: String, reason: String },

    /// The host no longer accepts deployments
    #[error("host is shutting down")]
    ShuttingDown,
}

impl DeployError {
    /// Whether the failure stems from the package as supplied rather than from the host.
    pub fn is_artifact_error(&self) -> bool {
        matches!(
            self,
            DeployError::ArtifactMissing { .. }
                | DeployError::NoManifests { .. }
                | DeployError::InvalidManifest { .. }
        )
    }
}

/// Errors reported to a dispatching caller.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No module is published at the address
    #[error("no module serves address {0}")]
    AddressNotFound(String),

    /// The module's handler failed
    #[error("handler for {address} failed: {source}")]
    HandlerFailed {
        address: String,
        #[source]
        source: HookError,
    },
}

/// A failure absorbed while tearing a package down.
#[derive(Debug, Clone, Error)]
pub enum ShutdownFailure {
    /// A module shutdown or stop hook failed
    #[error("module {class_ref} at {address}: {hook} failed: {source}")]
    Module {
        class_ref: String,
        address: String,
        hook: &'static str,
        source: HookError,
    },

    /// A shared initializer shutdown hook failed
    #[error("shared initializer {class_ref} of {package}: shutdown failed: {source}")]
    SharedInitializer {
        package: String,
        class_ref: String,
        source: HookError,
    },

    /// The isolation unit did not close cleanly
    #[error("unit {unit} of {package} did not close cleanly: {reason}")]
    Unit {
        package: String,
        unit: UnitId,
        reason: String,
    },
}
