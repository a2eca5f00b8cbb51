//! riptide-ws - asynchronous WebSocket server
//!
//! A standalone RFC 6455 server core for tokio: frame codec, HTTP upgrade
//! handshake, per-connection lifecycle tasks, a concurrent connection
//! registry with broadcast, and an accept/dispatch worker pool.
//!
//! ```no_run
//! use riptide_ws::{RouteHandler, RouteTable, Server, ServerConfig};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl RouteHandler for Echo {
//!     async fn on_text(&self, conn: &Arc<riptide_ws::Connection>, message: &str) {
//!         conn.send_text(message).await;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> riptide_ws::WsResult<()> {
//!     let routes = RouteTable::new().route("/echo", Arc::new(Echo));
//!     let server = Server::new(ServerConfig::default(), routes);
//!     server.run(true).await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod logging;
pub mod registry;
pub mod security;
pub mod server;
pub mod types;

pub use config::{ConfigError, SecurityConfig, ServerConfig};
pub use connection::Connection;
pub use error::{WsError, WsResult};
pub use handler::{RouteHandler, RouteTable};
pub use handshake::HandshakeRequest;
pub use logging::{init_logging, LoggingConfig};
pub use registry::ConnectionRegistry;
pub use security::{SecureTransport, SecureTransportError};
pub use server::Server;
pub use types::{
    AsyncStream, CloseCode, CloseEvent, ConnectionId, ConnectionState, Frame, OpCode, Transport,
};
