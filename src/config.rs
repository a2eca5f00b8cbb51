//! Server configuration
//!
//! Explicit configuration structs constructed once at startup and passed by
//! reference into each component, replacing any hidden service-locator
//! state.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: got {value:?}, expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("validation failed for {field}: {reason}")]
    ValidationFailed { field: String, reason: String },
}

/// Core server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server identifier, used in logs only
    pub id: String,
    /// Bind host
    pub host: String,
    /// Bind port (0 selects an ephemeral port)
    pub port: u16,
    /// Number of accept workers
    pub listener_workers: usize,
    /// Dispatch workers per accept worker; total dispatch workers are
    /// `listener_workers * client_worker_multiplier`
    pub client_worker_multiplier: usize,
    /// Disable Nagle's algorithm on accepted sockets
    pub no_delay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: "riptide".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            listener_workers: 1,
            client_worker_multiplier: 3,
            no_delay: false,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from `RIPTIDE_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = env::var("RIPTIDE_HOST").unwrap_or(defaults.host);
        let id = env::var("RIPTIDE_ID").unwrap_or(defaults.id);

        let port = parse_env("RIPTIDE_PORT", defaults.port, "valid port number")?;
        let listener_workers = parse_env(
            "RIPTIDE_LISTENER_WORKERS",
            defaults.listener_workers,
            "positive worker count",
        )?;
        let client_worker_multiplier = parse_env(
            "RIPTIDE_CLIENT_WORKER_MULTIPLIER",
            defaults.client_worker_multiplier,
            "positive multiplier",
        )?;
        let no_delay = parse_env("RIPTIDE_NO_DELAY", defaults.no_delay, "true or false")?;

        let config = Self {
            id,
            host,
            port,
            listener_workers,
            client_worker_multiplier,
            no_delay,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener_workers == 0 {
            return Err(ConfigError::ValidationFailed {
                field: "listener_workers".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.client_worker_multiplier == 0 {
            return Err(ConfigError::ValidationFailed {
                field: "client_worker_multiplier".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_listener_workers(mut self, workers: usize) -> Self {
        self.listener_workers = workers;
        self
    }

    pub fn with_client_worker_multiplier(mut self, multiplier: usize) -> Self {
        self.client_worker_multiplier = multiplier;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }
}

fn parse_env<T: std::str::FromStr>(
    name: &str,
    default: T,
    expected: &str,
) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            field: name.to_string(),
            value: raw,
            expected: expected.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Secure-transport policy surface.
///
/// The TLS wrap itself is the external [`SecureTransport`] capability
/// (`crate::security`); this struct only carries the policy knobs an
/// implementation needs.
///
/// [`SecureTransport`]: crate::security::SecureTransport
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub enabled: bool,
    pub certificate_path: Option<PathBuf>,
    pub client_certificate_required: bool,
    pub certificate_revocation_enabled: bool,
    /// Allowed protocol version names, e.g. "TLSv1.3"
    pub enabled_protocols: Vec<String>,
}
