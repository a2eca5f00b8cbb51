//! Secure-transport capability seam.
//!
//! TLS itself is an external collaborator: given a plaintext byte stream,
//! an implementation returns an encrypted byte stream or fails. The server
//! core only distinguishes authentication failures (the client is told
//! nothing and the connection closes "unauthorized") from transport
//! failures.

use crate::types::Transport;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecureTransportError {
    #[error("client failed transport authentication")]
    Unauthorized,

    #[error("secure transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Wraps a raw accepted stream before any bytes are interpreted as HTTP.
#[async_trait]
pub trait SecureTransport: Send + Sync {
    async fn wrap(&self, stream: Transport) -> Result<Transport, SecureTransportError>;
}
