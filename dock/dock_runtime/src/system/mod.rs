//! System management for the dock runtime
//!
//! Configuration, construction of the process-scoped components, worker
//! telemetry hooks and orderly shutdown.

pub mod bootstrap;
pub mod config;
pub mod shutdown;
pub mod threads;

pub use bootstrap::{BoundaryKind, System};
pub use config::RuntimeConfig;
pub use shutdown::{ShutdownHandle, ShutdownManager};
