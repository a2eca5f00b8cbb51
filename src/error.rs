//! Error taxonomy for the server core.
//!
//! Per-connection failures (transport, protocol, handshake) are contained
//! within the owning connection task and never escalate past it; only
//! startup failures (`Bind`, `Config`) surface to the caller of
//! `Server::run`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed")]
    StreamClosed,

    #[error("payload length out of range, min 0 max 2 GiB, actual {0} bytes")]
    PayloadTooLarge(u64),

    #[error("http header block too large to fit in buffer (16KB)")]
    HeaderTooLarge,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("failed to bind listener: {0}")]
    Bind(std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Result type for WebSocket operations
pub type WsResult<T> = Result<T, WsError>;
