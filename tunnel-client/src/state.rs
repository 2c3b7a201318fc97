//! Shared application state for the client's control loop and workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

/// The three states the control loop moves through, surfaced on the
/// client's status line (the rich terminal/web UI that would render this
/// richly is out of scope here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Reconnecting,
    Online,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Online => "online",
        };
        f.write_str(s)
    }
}

/// Maps a server-assigned tunnel URL to the local address it forwards to,
/// resolved from the `ReqId` used when the tunnel was requested.
pub struct LocalTunnelMap {
    /// `ReqId -> local addr` established when each `ReqTunnel` is sent.
    pending: RwLock<HashMap<String, String>>,
    /// `Url -> local addr` populated once the matching `NewTunnel` arrives.
    resolved: RwLock<HashMap<String, String>>,
}

impl LocalTunnelMap {
    pub fn new() -> Self {
        LocalTunnelMap {
            pending: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_pending(&self, req_id: &str, local_addr: &str) {
        self.pending.write().insert(req_id.to_string(), local_addr.to_string());
    }

    /// Called on a `NewTunnel` ack: moves the pending mapping for `req_id`
    /// to a resolved `Url -> local addr` mapping. Returns the local addr
    /// on success.
    pub fn resolve(&self, req_id: &str, url: &str) -> Option<String> {
        let local_addr = self.pending.write().remove(req_id)?;
        self.resolved.write().insert(url.to_string(), local_addr.clone());
        Some(local_addr)
    }

    pub fn local_addr_for(&self, url: &str) -> Option<String> {
        self.resolved.read().get(url).cloned()
    }

    pub fn urls(&self) -> Vec<String> {
        self.resolved.read().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.pending.write().clear();
        self.resolved.write().clear();
    }
}

impl Default for LocalTunnelMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared client state: connection status plus the local tunnel map, read
/// by the status line and written by the control loop.
pub struct ClientState {
    pub tunnels: LocalTunnelMap,
    /// Persists across reconnects so the server can hand back the same
    /// affinity-cached URLs.
    pub client_id: RwLock<String>,
    status: RwLock<ConnectionStatus>,
    last_pong: RwLock<Instant>,
}

impl ClientState {
    pub fn new() -> Arc<Self> {
        Arc::new(ClientState {
            tunnels: LocalTunnelMap::new(),
            client_id: RwLock::new(String::new()),
            status: RwLock::new(ConnectionStatus::Connecting),
            last_pong: RwLock::new(Instant::now()),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        let mut guard = self.status.write();
        if *guard != status {
            tracing::info!(status = %status, "connection status changed");
        }
        *guard = status;
    }

    pub fn record_pong(&self) {
        *self.last_pong.write() = Instant::now();
    }

    pub fn reset_pong_clock(&self) {
        self.record_pong();
    }

    pub fn pong_age(&self) -> std::time::Duration {
        self.last_pong.read().elapsed()
    }
}
