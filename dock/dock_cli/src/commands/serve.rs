//! `dock serve`: run the host.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use clap::Args;
use dock_observability::{init_logging, ThreadRegistry};
use dock_runtime::{BoundaryKind, DockRuntime, RuntimeConfig};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::http::{self, AppState};

/// Arguments for the serve command
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Configuration file (JSON or TOML)
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[clap(long)]
    pub port: Option<u16>,

    /// Address to bind
    #[clap(long)]
    pub host: Option<String>,

    /// Directory holding the packages
    #[clap(long)]
    pub packages_root: Option<PathBuf>,
}

/// Implementation of the serve command
pub fn execute(args: ServeArgs) -> Result<()> {
    let mut config = super::load_config(args.config.as_deref(), args.packages_root)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    config.validate()?;

    init_logging(&config.logging)?;

    let registry: Arc<OnceLock<Arc<ThreadRegistry>>> = Arc::new(OnceLock::new());
    let reactor = reactor(&config, registry.clone())?;
    reactor.block_on(serve(config, registry))
}

/// Multi-threaded reactor whose threads are named for the blocked-worker monitor.
fn reactor(
    config: &RuntimeConfig,
    registry: Arc<OnceLock<Arc<ThreadRegistry>>>,
) -> Result<tokio::runtime::Runtime> {
    let prefix = config.blocked.reactor_pattern.clone();
    let next = AtomicUsize::new(0);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.reactor_threads)
        .thread_name_fn(move || format!("{}-{}", prefix, next.fetch_add(1, Ordering::SeqCst)))
        .on_thread_stop(move || {
            if let Some(registry) = registry.get() {
                registry.deregister_current();
            }
        })
        .enable_all()
        .build()
        .context("Failed to start reactor")
}

async fn serve(config: RuntimeConfig, registry: Arc<OnceLock<Arc<ThreadRegistry>>>) -> Result<()> {
    let bind = format!("{}:{}", config.server.host, config.server.port);
    let max_payload_bytes = config.server.max_payload_bytes;

    let runtime = Arc::new(DockRuntime::new(config, BoundaryKind::Native)?);
    let _ = registry.set(runtime.system.threads().clone());
    runtime.start().await?;

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Dock listening on {}", listener.local_addr()?);

    let mut signal = runtime.system.shutdown_manager().register_component("http");
    let done = signal.clone();
    let app = http::router(AppState::new(runtime.clone(), max_payload_bytes));
    let mut server = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.wait_for_shutdown().await })
            .await;
        done.shutdown_complete();
        served
    });

    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("Failed to listen for Ctrl-C")?;
            info!("Interrupt received, shutting down");
        }
        finished = &mut server => {
            match finished {
                Ok(Ok(())) => info!("HTTP server stopped"),
                Ok(Err(e)) => error!("HTTP server failed: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
            }
        }
    }

    runtime.shutdown().await?;
    if !server.is_finished() {
        server.abort();
    }
    Ok(())
}
