//! Concurrent connection registry.
//!
//! Owns the live connection map and spawns one lifecycle task per accepted
//! transport. Lookups and broadcasts iterate a snapshot of the map so they
//! never hold shard locks across awaits.

use crate::connection::{run_lifecycle, Connection};
use crate::handler::RouteTable;
use crate::security::SecureTransport;
use crate::types::{ConnectionId, Transport};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bounded retries when removing an entry, in case a concurrent shard
/// operation delays the removal.
const MAX_UNREGISTER_ATTEMPTS: usize = 5;

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    routes: Arc<RouteTable>,
    security: Option<Arc<dyn SecureTransport>>,
}

impl ConnectionRegistry {
    pub fn new(routes: Arc<RouteTable>, security: Option<Arc<dyn SecureTransport>>) -> Self {
        Self {
            connections: DashMap::new(),
            routes,
            security,
        }
    }

    /// Adopts a freshly accepted transport: creates the connection, inserts
    /// it, and spawns its lifecycle task. The task owns the transport from
    /// here on.
    pub fn register(&self, transport: Transport) -> ConnectionId {
        let conn = Connection::new();
        let id = conn.id;
        self.connections.insert(id, conn.clone());
        info!("registered connection {}", id);

        tokio::spawn(run_lifecycle(
            conn,
            transport,
            self.routes.clone(),
            self.security.clone(),
        ));
        id
    }

    /// Removes a connection from the map. Missing ids are a no-op; a
    /// removal that keeps failing is logged and abandoned.
    pub fn unregister(&self, id: ConnectionId) {
        for _ in 0..MAX_UNREGISTER_ATTEMPTS {
            if self.connections.remove(&id).is_some() {
                debug!("unregistered connection {}", id);
                return;
            }
            if !self.connections.contains_key(&id) {
                return;
            }
        }
        warn!("failed to unregister connection {}", id);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// All live connections whose application-assigned identifier matches.
    pub fn get_by_client_identifier(&self, identifier: &str) -> Vec<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .filter(|conn| conn.is_alive() && conn.client_identifier() == identifier)
            .collect()
    }

    /// Sends a text message to every live connection, or only to those
    /// matching `client_identifier` when one is given. Dead connections are
    /// skipped; individual write failures never abort the sweep.
    pub async fn broadcast_text(&self, message: &str, client_identifier: Option<&str>) {
        for conn in self.broadcast_targets(client_identifier) {
            conn.send_text(message).await;
        }
    }

    pub async fn broadcast_binary(&self, payload: &[u8], client_identifier: Option<&str>) {
        for conn in self.broadcast_targets(client_identifier) {
            conn.send_binary(payload).await;
        }
    }

    /// Sweeps out every connection that is no longer alive and returns how
    /// many were removed.
    pub fn remove_dead_connections(&self) -> usize {
        let dead: Vec<ConnectionId> = self
            .snapshot()
            .into_iter()
            .filter(|conn| !conn.is_alive())
            .map(|conn| conn.id)
            .collect();

        for id in &dead {
            self.unregister(*id);
        }
        if !dead.is_empty() {
            debug!("reaped {} dead connections", dead.len());
        }
        dead.len()
    }

    /// Requests a cooperative stop on every connection.
    pub fn stop_all(&self) {
        for conn in self.snapshot() {
            conn.request_stop();
        }
    }

    pub fn total_connections(&self) -> usize {
        self.connections.len()
    }

    fn broadcast_targets(&self, client_identifier: Option<&str>) -> Vec<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .filter(|conn| {
                conn.is_alive()
                    && client_identifier
                        .map_or(true, |wanted| conn.client_identifier() == wanted)
            })
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
