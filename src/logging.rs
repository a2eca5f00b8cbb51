//! Tracing initialization helpers.
//!
//! The server core itself only emits `tracing` events; wiring a subscriber
//! is the embedding application's choice. These helpers cover the common
//! cases.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset (e.g. "info", "debug")
    pub level: String,
    /// Explicit filter directives, overriding `level` (e.g.
    /// "riptide_ws=debug,tokio=warn")
    pub env_filter: Option<String>,
    /// Include target module paths in output
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            env_filter: None,
            include_target: false,
        }
    }
}

impl LoggingConfig {
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            env_filter: Some("riptide_ws=debug".to_string()),
            include_target: true,
        }
    }
}

/// Installs a global fmt subscriber. Safe to call more than once; repeat
/// initialization (e.g. across tests) is ignored.
pub fn init_logging(config: &LoggingConfig) {
    let filter = match &config.env_filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.clone())),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(config.include_target))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig::default();
        init_logging(&config);
        init_logging(&config);
    }
}
