//! Per-route application handlers.
//!
//! The core dispatches connection events into a [`RouteHandler`]; every
//! callback defaults to a no-op so handlers implement only what they react
//! to. Routes are wired explicitly into a [`RouteTable`] at startup.

use crate::connection::Connection;
use crate::types::CloseEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Capability set the core invokes on application routes. An unhandled
/// event is a safe no-op.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    /// Connection completed its handshake on this route.
    async fn on_open(&self, _connection: &Arc<Connection>, _query_params: &HashMap<String, String>) {
    }

    /// Remote peer sent a Close frame.
    async fn on_close(&self, _connection: &Arc<Connection>, _event: CloseEvent) {}

    /// Whole text message (single final frame, or a reassembled fragmented
    /// message).
    async fn on_text(&self, _connection: &Arc<Connection>, _message: &str) {}

    /// One fragment of a fragmented text message; `is_last` carries the
    /// fragment's FIN flag.
    async fn on_text_part(&self, _connection: &Arc<Connection>, _fragment: &str, _is_last: bool) {}

    /// Whole binary message.
    async fn on_binary(&self, _connection: &Arc<Connection>, _payload: &[u8]) {}

    /// One fragment of a fragmented binary message.
    async fn on_binary_part(&self, _connection: &Arc<Connection>, _fragment: &[u8], _is_last: bool) {
    }

    async fn on_ping(&self, _connection: &Arc<Connection>, _payload: &[u8]) {}

    async fn on_pong(&self, _connection: &Arc<Connection>, _payload: &[u8]) {}
}

/// Route path → handler mapping, built once at startup and shared read-only
/// by every connection.
#[derive(Default, Clone)]
pub struct RouteTable {
    routes: HashMap<String, Arc<dyn RouteHandler>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn route(mut self, path: impl Into<String>, handler: Arc<dyn RouteHandler>) -> Self {
        self.insert(path, handler);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, handler: Arc<dyn RouteHandler>) {
        self.routes.insert(path.into(), handler);
    }

    pub fn get(&self, route: &str) -> Option<Arc<dyn RouteHandler>> {
        self.routes.get(route).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
