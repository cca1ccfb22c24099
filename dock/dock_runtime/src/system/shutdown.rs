//! Shutdown coordination for long-running host components
//!
//! Components that outlive a single request (the HTTP listener, samplers)
//! register here. Shutdown runs in two phases: every component is signalled
//! to stop accepting work, then the manager waits, up to the configured
//! timeout, for each to report completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::RuntimeConfig;

/// Errors that can occur during shutdown
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("Shutdown timeout; still running: {}", .0.join(", "))]
    Timeout(Vec<String>),

    #[error("Shutdown already in progress")]
    AlreadyInProgress,
}

#[derive(Default)]
struct Registry {
    pending: HashMap<String, String>,
    in_progress: bool,
}

struct Shared {
    registry: Mutex<Registry>,
    completed: Notify,
}

/// Shutdown handle for a component
#[derive(Clone)]
pub struct ShutdownHandle {
    signal: watch::Receiver<bool>,
    shared: Arc<Shared>,
    id: String,
    name: String,
}

impl ShutdownHandle {
    /// Wait for the shutdown signal
    pub async fn wait_for_shutdown(&mut self) {
        // A closed channel means the manager is gone; treat it as a signal.
        let _ = self.signal.wait_for(|requested| *requested).await;
    }

    /// Whether shutdown was requested
    pub fn is_shutdown_requested(&self) -> bool {
        *self.signal.borrow()
    }

    /// Report that this component finished shutting down
    pub fn shutdown_complete(&self) {
        let removed = self.shared.registry.lock().pending.remove(&self.id);
        if removed.is_some() {
            debug!("Component completed shutdown: {} ({})", self.name, self.id);
            self.shared.completed.notify_waiters();
        }
    }

    /// Component name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// ID of this handle
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Manager for host shutdown
pub struct ShutdownManager {
    signal: watch::Sender<bool>,
    shared: Arc<Shared>,
    timeout: Duration,
}

impl ShutdownManager {
    /// Create a shutdown manager using the configured timeout
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_timeout(Duration::from_secs(config.shutdown_timeout_secs as u64))
    }

    /// Create a shutdown manager with an explicit timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal,
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                completed: Notify::new(),
            }),
            timeout,
        }
    }

    /// Register a component for shutdown
    pub fn register_component(&self, name: &str) -> ShutdownHandle {
        let id = Uuid::new_v4().to_string();
        self.shared
            .registry
            .lock()
            .pending
            .insert(id.clone(), name.to_string());

        info!("Registered component for shutdown: {} ({})", name, id);

        ShutdownHandle {
            signal: self.signal.subscribe(),
            shared: self.shared.clone(),
            id,
            name: name.to_string(),
        }
    }

    /// Number of components that have not completed shutdown
    pub fn pending_components(&self) -> usize {
        self.shared.registry.lock().pending.len()
    }

    /// Whether shutdown was requested
    pub fn is_shutdown_requested(&self) -> bool {
        *self.signal.borrow()
    }

    /// Request a graceful shutdown
    pub async fn request_shutdown(&self) -> Result<(), ShutdownError> {
        {
            let mut registry = self.shared.registry.lock();
            if registry.in_progress {
                return Err(ShutdownError::AlreadyInProgress);
            }
            registry.in_progress = true;
        }

        info!("Phase A: Signalling components to stop accepting new work");
        self.signal.send_replace(true);

        info!("Phase B: Waiting for components to complete");
        match timeout(self.timeout, self.wait_for_completion()).await {
            Ok(()) => {
                info!("All components shut down");
                Ok(())
            }
            Err(_) => {
                let mut pending: Vec<String> = self
                    .shared
                    .registry
                    .lock()
                    .pending
                    .values()
                    .cloned()
                    .collect();
                pending.sort();
                error!(
                    "{} components did not complete shutdown within {:?}",
                    pending.len(),
                    self.timeout
                );
                for name in &pending {
                    warn!("  Component still running: {}", name);
                }
                Err(ShutdownError::Timeout(pending))
            }
        }
    }

    async fn wait_for_completion(&self) {
        loop {
            let notified = self.shared.completed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.registry.lock().pending.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
