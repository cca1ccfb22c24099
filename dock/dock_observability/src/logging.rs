//! Process-wide log subscriber.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::ObservabilityError;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Records emitted through
/// the `log` crate are forwarded as well. Fails if a subscriber is already
/// installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ObservabilityError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| ObservabilityError::ConfigurationError(format!("log level: {}", e)))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ObservabilityError::InitializationError(e.to_string()))
}
