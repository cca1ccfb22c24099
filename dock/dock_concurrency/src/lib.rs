//! # Dock Concurrency
//!
//! The bounded worker pool blocking host operations are offloaded to.

pub mod pool;

pub use pool::{TaskError, TaskHandle, ThreadPool, ThreadPoolConfig, ThreadPoolError, ThreadPoolStats, WorkerHooks};
