//! Connection counters exported next to device metrics.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use mqtt_iot_exporter_core::{ClientInfo, ConnectionEvents};
use tracing::debug;

/// Counters fed by the broker's connection lifecycle.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    connected_clients: AtomicI64,
    total_connections: AtomicU64,
    unclean_disconnects: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Currently connected MQTT clients.
    pub connected_clients: i64,
    /// Connections established since start.
    pub total_connections: u64,
    /// Connections that ended without a DISCONNECT packet.
    pub unclean_disconnects: u64,
}

/// Shareable stats handle.
pub type SharedStats = Arc<ConnectionStats>;

impl ConnectionStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connected_clients: self.connected_clients.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            unclean_disconnects: self.unclean_disconnects.load(Ordering::Relaxed),
        }
    }
}

impl ConnectionEvents for ConnectionStats {
    fn on_connect(&self, client: &ClientInfo) {
        self.connected_clients.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        debug!(client_id = %client.client_id, "Client connected");
    }

    fn on_disconnect(&self, client: &ClientInfo, clean: bool) {
        self.connected_clients.fetch_sub(1, Ordering::Relaxed);
        if !clean {
            self.unclean_disconnects.fetch_add(1, Ordering::Relaxed);
        }
        debug!(client_id = %client.client_id, clean, "Client disconnected");
    }
}
