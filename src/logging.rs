//! Tracing subscriber setup for the command-line tool and embedding applications.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{BusError, BusResult};

/// Build the filter: `RUST_LOG` wins when set, otherwise the configured level applies to
/// this crate and `warn` to everything else.
pub fn env_filter(config: &LoggingConfig) -> BusResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = config.level.to_ascii_lowercase();
    EnvFilter::try_new(format!("warn,instrument_bus={level}"))
        .map_err(|e| BusError::Logging(e.to_string()))
}

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> BusResult<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| BusError::Logging(e.to_string()))
}
