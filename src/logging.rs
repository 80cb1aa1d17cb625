use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error). `RUST_LOG`
    /// takes precedence when set.
    #[serde(default = "default_level")]
    pub level: String,

    /// Colored console output.
    #[serde(default = "default_true")]
    pub ansi: bool,

    /// Include the module target in each line.
    #[serde(default)]
    pub with_target: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            ansi: true,
            with_target: false,
        }
    }
}

/// Install the global fmt subscriber. Calling it again after a subscriber
/// is already installed is a no-op.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::Config(format!("log level '{}': {}", config.level, e)))?,
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(config.with_target)
        .try_init();

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}
