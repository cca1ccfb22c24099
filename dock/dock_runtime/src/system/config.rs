//! Configuration for the dock runtime
//!
//! Handles loading and merging the host configuration. Files are JSON or
//! TOML, chosen by extension.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dock_observability::{
    BlockedConfig, HealthConfig, LeakConfig, LoggingConfig, ObservabilityConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

/// Errors that can occur in configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted `application/octet-stream` payload
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker threads
    #[serde(default = "default_worker_threads")]
    pub threads: usize,

    /// Bounded queue length
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_worker_threads() -> usize {
    4
}

fn default_queue_size() -> usize {
    64
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            threads: default_worker_threads(),
            queue_size: default_queue_size(),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding one subdirectory per package
    #[serde(default = "default_packages_root")]
    pub packages_root: PathBuf,

    /// Manifest directory inside a package
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: String,

    /// Bundle directory inside a package
    #[serde(default = "default_bundle_dir")]
    pub bundle_dir: String,

    /// Where bundles are staged before loading
    #[serde(default = "default_shadow_dir")]
    pub shadow_dir: PathBuf,

    /// HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Reactor threads
    #[serde(default = "default_reactor_threads")]
    pub reactor_threads: usize,

    /// Worker pool for blocking deploy work
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,

    /// Leak detector
    #[serde(default)]
    pub leak: LeakConfig,

    /// Blocked-worker monitor
    #[serde(default)]
    pub blocked: BlockedConfig,

    /// Health evaluation
    #[serde(default)]
    pub health: HealthConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Global configuration handed to modules
    #[serde(default = "default_global")]
    pub global: serde_json::Value,

    /// Shutdown timeout (seconds)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u32,
}

fn default_packages_root() -> PathBuf {
    PathBuf::from("..")
}

fn default_manifest_dir() -> String {
    "config".to_string()
}

fn default_bundle_dir() -> String {
    "build".to_string()
}

fn default_shadow_dir() -> PathBuf {
    std::env::temp_dir().join("dock-units")
}

fn default_reactor_threads() -> usize {
    num_cpus::get()
}

fn default_global() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn default_shutdown_timeout() -> u32 {
    30
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            packages_root: default_packages_root(),
            manifest_dir: default_manifest_dir(),
            bundle_dir: default_bundle_dir(),
            shadow_dir: default_shadow_dir(),
            server: ServerConfig::default(),
            reactor_threads: default_reactor_threads(),
            worker_pool: WorkerPoolConfig::default(),
            leak: LeakConfig::default(),
            blocked: BlockedConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
            global: default_global(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a file, or defaults when `path` is `None`
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());

                if !path.exists() {
                    warn!("Configuration file not found: {}", path.display());
                    RuntimeConfig::default()
                } else {
                    let content = fs::read_to_string(path).await.with_context(|| {
                        format!("Failed to read configuration file: {}", path.display())
                    })?;
                    Self::parse(path, &content).with_context(|| {
                        format!("Failed to parse configuration file: {}", path.display())
                    })?
                }
            }
            None => {
                info!("No configuration file specified, using defaults");
                RuntimeConfig::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse `content`, choosing the format from `path`'s extension
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        if is_toml {
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))
        } else {
            serde_json::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manifest_dir.is_empty() || self.bundle_dir.is_empty() {
            return Err(ConfigError::Invalid(
                "Package directories cannot be empty".to_string(),
            ));
        }

        if self.reactor_threads == 0 {
            return Err(ConfigError::Invalid("Reactor threads cannot be zero".to_string()));
        }

        if self.worker_pool.threads == 0 || self.worker_pool.queue_size == 0 {
            return Err(ConfigError::Invalid(
                "Worker pool threads and queue size cannot be zero".to_string(),
            ));
        }

        if self.server.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid("Payload limit cannot be zero".to_string()));
        }

        if self.shutdown_timeout_secs == 0 {
            return Err(ConfigError::Invalid("Shutdown timeout cannot be zero".to_string()));
        }

        if !self.global.is_object() {
            warn!("Global configuration is not an object; modules will see it as-is");
        }

        self.observability()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Observability sections as one value
    pub fn observability(&self) -> ObservabilityConfig {
        ObservabilityConfig {
            logging: self.logging.clone(),
            leak: self.leak.clone(),
            blocked: self.blocked.clone(),
            health: self.health.clone(),
        }
    }

    /// Overlay every field of `other` that differs from the default
    pub fn merge(&mut self, other: RuntimeConfig) {
        let defaults = RuntimeConfig::default();

        if other.packages_root != defaults.packages_root {
            self.packages_root = other.packages_root;
        }
        if other.manifest_dir != defaults.manifest_dir {
            self.manifest_dir = other.manifest_dir;
        }
        if other.bundle_dir != defaults.bundle_dir {
            self.bundle_dir = other.bundle_dir;
        }
        if other.shadow_dir != defaults.shadow_dir {
            self.shadow_dir = other.shadow_dir;
        }
        if other.server != defaults.server {
            self.server = other.server;
        }
        if other.reactor_threads != defaults.reactor_threads {
            self.reactor_threads = other.reactor_threads;
        }
        if other.worker_pool != defaults.worker_pool {
            self.worker_pool = other.worker_pool;
        }
        if other.leak != defaults.leak {
            self.leak = other.leak;
        }
        if other.blocked != defaults.blocked {
            self.blocked = other.blocked;
        }
        if other.health != defaults.health {
            self.health = other.health;
        }
        if other.logging != defaults.logging {
            self.logging = other.logging;
        }
        match (&mut self.global, other.global) {
            (serde_json::Value::Object(into), serde_json::Value::Object(from)) => into.extend(from),
            (current, global) => {
                if global != defaults.global {
                    *current = global;
                }
            }
        }
        if other.shutdown_timeout_secs != defaults.shutdown_timeout_secs {
            self.shutdown_timeout_secs = other.shutdown_timeout_secs;
        }
    }
}
