//! # Dock CLI
//!
//! The `dock` binary: command handlers and the HTTP surface in front of the
//! runtime.
//!
//! - **commands**: `serve` and `check`
//! - **http**: routes, payload validation and error mapping

pub mod commands;
pub mod http;
