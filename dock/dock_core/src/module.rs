//! Module contracts.
//!
//! A package exposes one or more modules, each bound to a single address
//! once it is active, and optionally one shared initializer that runs before
//! any of the package's modules are initialized.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::error::HookError;
use crate::inject::ReactorHandle;

/// A request routed to a module.
#[derive(Debug, Clone)]
pub struct ModuleRequest {
    /// Normalised address the request was matched against.
    pub address: String,

    /// Declared content type of the payload, if any.
    pub content_type: Option<String>,

    /// Raw payload.
    pub payload: Bytes,
}

impl ModuleRequest {
    /// Create a request without a content type.
    pub fn new(address: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            address: address.into(),
            content_type: None,
            payload: payload.into(),
        }
    }

    /// Attach a content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Payload interpreted as UTF-8, lossily.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A module's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleResponse {
    /// HTTP-style status code.
    pub status: u16,

    /// Content type of the body, if any.
    pub content_type: Option<String>,

    /// Response body.
    pub body: Bytes,
}

impl ModuleResponse {
    /// A 200 response with an opaque body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            content_type: Some("application/octet-stream".to_string()),
            body: body.into(),
        }
    }

    /// A 200 plain-text response.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: Some("text/plain; charset=utf-8".to_string()),
            body: Bytes::from(body.into()),
        }
    }

    /// A 200 JSON response.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, HookError> {
        let body = serde_json::to_vec(value).map_err(|e| HookError::failed(e.to_string()))?;
        Ok(Self {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: Bytes::from(body),
        })
    }

    /// Override the status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// Context handed to start and initialize hooks.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Package the hook belongs to.
    pub package: String,

    /// Address the module will serve; `None` for shared initializers.
    pub address: Option<String>,

    /// Descriptor-level configuration (every descriptor key the host does not consume).
    pub config: serde_json::Value,

    /// Handle to the reactor, for spawning non-blocking work.
    pub reactor: ReactorHandle,
}

/// A request-handling unit inside a package.
///
/// Hooks take `&self`; implementations keep mutable state behind interior
/// mutability since instances are shared with in-flight requests.
#[async_trait]
pub trait Module: Send + Sync {
    /// Called once after construction, before the module is published.
    fn start(&self, _ctx: &HookContext) -> Result<(), HookError> {
        Ok(())
    }

    /// Handle one request.
    ///
    /// Runs on a reactor thread and must not block it.
    async fn handle(&self, request: ModuleRequest) -> Result<ModuleResponse, HookError>;

    /// Called once when the module is withdrawn, after its shutdown hook.
    fn stop(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// The optional init/shutdown capability.
    fn initializer(&self) -> Option<&dyn ModuleInitializer> {
        None
    }
}

/// Optional per-module initialization capability.
pub trait ModuleInitializer: Send + Sync {
    /// Runs after `start`, before the module is published.
    fn init(&self) -> Result<(), HookError>;

    /// Runs before `stop` during undeploy.
    fn shutdown(&self) -> Result<(), HookError>;
}

/// Package-wide initializer, run once per deployment before any module is initialized.
pub trait SharedInitializer: Send + Sync {
    /// Prepare state shared by the package's modules.
    fn initialize(&self, ctx: &HookContext) -> Result<(), HookError>;

    /// Release that state once every module of the package has stopped.
    fn shutdown(&self) -> Result<(), HookError>;
}
