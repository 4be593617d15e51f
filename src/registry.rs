//! Tunnel lifecycle: create, restore by id, authenticate, attach/detach the
//! single live WebSocket, look up by id.
//!
//! The registry is the single source of truth for "is this tunnel live" —
//! every other component asks it. At most one live connection exists per
//! `tunnelId`; attaching a second signals the old handler to close with
//! code 1001 before the replacement takes over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::Message;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::protocol::RelayFrame;
use crate::util;

/// One laptop's registration. The record survives disconnects so the laptop
/// can restore the same id later; only the connection is transient.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub tunnel_id: String,
    pub api_key: String,
    pub name: String,
    pub created_at_ms: u64,
}

/// Why the registry asked a connection handler to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Initial watch value; no close requested.
    Open,
    /// A newer connection attached for the same tunnel.
    Replaced,
    /// The relay is shutting down.
    Shutdown,
}

/// A completed relayed request: status and JSON body from the laptop.
#[derive(Debug, Clone)]
pub struct RelayedResponse {
    pub status_code: u16,
    pub body: Value,
}

/// Map of in-flight relayed requests awaiting their `http_response` frame.
pub type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<RelayedResponse>>>>;

/// Handle to the live WebSocket of a tunnel. Cheap to clone; shared between
/// the socket handler, the HTTP proxy, and stream subscribers.
#[derive(Clone)]
pub struct TunnelConnection {
    /// Distinguishes this connection from a replacement with the same id.
    pub conn_id: String,
    /// Outgoing messages; the socket handler's writer task drains this.
    pub frame_tx: mpsc::Sender<Message>,
    /// Close signal observed by the socket handler.
    pub shutdown_tx: watch::Sender<CloseReason>,
    /// Milliseconds (registry epoch) of the last inbound frame or pong.
    pub last_activity_ms: Arc<AtomicU64>,
    /// Relayed requests awaiting responses, keyed by `requestId`.
    pub pending: PendingRequests,
    /// Outbound frames dropped because the write queue was full.
    pub dropped_frames: Arc<AtomicU64>,
    /// Wall-clock ms when this connection attached.
    pub connected_at_ms: u64,
}

impl TunnelConnection {
    /// Build a connection around an outgoing message queue. Returns the
    /// handle plus the close-signal receiver for the socket handler.
    pub fn new(frame_tx: mpsc::Sender<Message>, now_ms: u64) -> (Self, watch::Receiver<CloseReason>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(CloseReason::Open);
        (
            Self {
                conn_id: uuid::Uuid::new_v4().to_string(),
                frame_tx,
                shutdown_tx,
                last_activity_ms: Arc::new(AtomicU64::new(now_ms)),
                pending: Arc::new(Mutex::new(HashMap::new())),
                dropped_frames: Arc::new(AtomicU64::new(0)),
                connected_at_ms: util::now_ms(),
            },
            shutdown_rx,
        )
    }

    /// Serialize and enqueue a frame for the laptop. Fails when the
    /// connection is gone or its write queue is full.
    pub fn send_frame(&self, frame: &RelayFrame) -> Result<(), ()> {
        let text = serde_json::to_string(frame)
            .unwrap_or_else(|_| r#"{"type":"relay_shutdown"}"#.to_string());
        if self.frame_tx.try_send(Message::Text(text.into())).is_err() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return Err(());
        }
        Ok(())
    }

    /// Record inbound activity (any frame or pong counts as liveness).
    pub fn touch(&self, now_ms: u64) {
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Drop every pending waiter. Receivers observe the closed channel and
    /// answer their HTTP caller with 503.
    pub async fn drain_pending(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        if count > 0 {
            info!(count, "Drained {count} pending relayed requests: {reason}");
        }
    }
}

/// Registry failures, mapped to the caller-visible taxonomy by handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    NotFound,
    AuthFailed,
}

struct TunnelEntry {
    record: Tunnel,
    client_auth_key: Option<String>,
    connection: Option<TunnelConnection>,
}

/// Per-tunnel observability snapshot for the admin listing.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub name: String,
    pub created_at_ms: u64,
    pub connected: bool,
    pub last_activity_age_ms: Option<u64>,
    pub pending_requests: usize,
    pub dropped_frames: u64,
    pub connected_at_ms: Option<u64>,
}

/// The tunnel table. One registry per relay process.
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, TunnelEntry>>,
    /// Process epoch for lock-free activity timestamps.
    epoch: Instant,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the registry epoch, for activity bookkeeping.
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Create a tunnel, or restore one by id.
    ///
    /// A `suggested_id` is adopted unless a tunnel with that id is currently
    /// live; adoption always mints a fresh `apiKey` and reports
    /// `restored = true`. A live id (or no suggestion) allocates a fresh id.
    pub async fn create(&self, name: Option<&str>, suggested_id: Option<&str>) -> (Tunnel, bool) {
        let mut tunnels = self.tunnels.write().await;

        if let Some(id) = suggested_id {
            let live = tunnels
                .get(id)
                .is_some_and(|entry| entry.connection.is_some());
            if !live {
                let previous = tunnels.get(id);
                let record = Tunnel {
                    tunnel_id: id.to_string(),
                    api_key: uuid::Uuid::new_v4().to_string(),
                    name: name
                        .map(ToString::to_string)
                        .or_else(|| previous.map(|e| e.record.name.clone()))
                        .unwrap_or_else(|| "laptop".to_string()),
                    created_at_ms: previous
                        .map_or_else(util::now_ms, |e| e.record.created_at_ms),
                };
                let client_auth_key = previous.and_then(|e| e.client_auth_key.clone());
                tunnels.insert(
                    id.to_string(),
                    TunnelEntry {
                        record: record.clone(),
                        client_auth_key,
                        connection: None,
                    },
                );
                info!(tunnel_id = %id, "Tunnel restored");
                return (record, true);
            }
            warn!(tunnel_id = %id, "Suggested tunnel id is live, allocating fresh id");
        }

        let record = Tunnel {
            tunnel_id: uuid::Uuid::new_v4().to_string(),
            api_key: uuid::Uuid::new_v4().to_string(),
            name: name.unwrap_or("laptop").to_string(),
            created_at_ms: util::now_ms(),
        };
        tunnels.insert(
            record.tunnel_id.clone(),
            TunnelEntry {
                record: record.clone(),
                client_auth_key: None,
                connection: None,
            },
        );
        info!(tunnel_id = %record.tunnel_id, "Tunnel created");
        (record, false)
    }

    /// Validate a tunnel's `apiKey`. Constant-time comparison on the key.
    pub async fn authenticate(&self, tunnel_id: &str, api_key: &str) -> Result<Tunnel, RegistryError> {
        let tunnels = self.tunnels.read().await;
        let entry = tunnels.get(tunnel_id).ok_or(RegistryError::NotFound)?;
        if !crate::auth::constant_time_eq(entry.record.api_key.as_bytes(), api_key.as_bytes()) {
            return Err(RegistryError::AuthFailed);
        }
        Ok(entry.record.clone())
    }

    /// Bind the live WebSocket. An existing connection is told to close with
    /// code 1001 and its pending requests are drained before the new one
    /// takes over.
    pub async fn attach(&self, tunnel_id: &str, conn: TunnelConnection) -> Result<(), RegistryError> {
        let mut tunnels = self.tunnels.write().await;
        let entry = tunnels.get_mut(tunnel_id).ok_or(RegistryError::NotFound)?;
        if let Some(old) = entry.connection.replace(conn) {
            warn!(tunnel_id = %tunnel_id, "Tunnel reconnecting while a connection exists, replacing old");
            let _ = old.shutdown_tx.send(CloseReason::Replaced);
            old.drain_pending("replaced by new connection").await;
        }
        info!(tunnel_id = %tunnel_id, "Tunnel attached");
        Ok(())
    }

    /// Remove the live connection, but only when `conn_id` still names it —
    /// a handler exiting after being replaced must not detach its successor.
    /// The `Tunnel` record stays for a later restore.
    pub async fn detach(&self, tunnel_id: &str, conn_id: &str) -> bool {
        let mut tunnels = self.tunnels.write().await;
        let Some(entry) = tunnels.get_mut(tunnel_id) else {
            return false;
        };
        let matches = entry
            .connection
            .as_ref()
            .is_some_and(|c| c.conn_id == conn_id);
        if !matches {
            return false;
        }
        if let Some(old) = entry.connection.take() {
            old.drain_pending("tunnel disconnected").await;
        }
        info!(tunnel_id = %tunnel_id, "Tunnel detached");
        true
    }

    pub async fn lookup(&self, tunnel_id: &str) -> Option<Tunnel> {
        let tunnels = self.tunnels.read().await;
        tunnels.get(tunnel_id).map(|e| e.record.clone())
    }

    /// Clone the live connection handle, if any.
    pub async fn connection(&self, tunnel_id: &str) -> Option<TunnelConnection> {
        let tunnels = self.tunnels.read().await;
        tunnels.get(tunnel_id).and_then(|e| e.connection.clone())
    }

    pub async fn is_live(&self, tunnel_id: &str) -> bool {
        let tunnels = self.tunnels.read().await;
        tunnels
            .get(tunnel_id)
            .is_some_and(|e| e.connection.is_some())
    }

    /// Store the key gating mobile-client access. Overwrites any previous
    /// registration; the latest wins.
    pub async fn set_client_auth_key(&self, tunnel_id: &str, key: String) -> bool {
        let mut tunnels = self.tunnels.write().await;
        match tunnels.get_mut(tunnel_id) {
            Some(entry) => {
                entry.client_auth_key = Some(key);
                true
            }
            None => false,
        }
    }

    pub async fn client_auth_key(&self, tunnel_id: &str) -> Option<String> {
        let tunnels = self.tunnels.read().await;
        tunnels.get(tunnel_id).and_then(|e| e.client_auth_key.clone())
    }

    /// Handles of every live connection (used for shutdown notification).
    pub async fn live_connections(&self) -> Vec<TunnelConnection> {
        let tunnels = self.tunnels.read().await;
        tunnels
            .values()
            .filter_map(|e| e.connection.clone())
            .collect()
    }

    /// Observability snapshot for the admin listing.
    pub async fn snapshot(&self) -> Vec<TunnelInfo> {
        let now = self.now_ms();
        let tunnels = self.tunnels.read().await;
        let mut out = Vec::with_capacity(tunnels.len());
        for entry in tunnels.values() {
            let (connected, last_age, pending, dropped, connected_at) = match &entry.connection {
                Some(conn) => {
                    let last = conn.last_activity_ms.load(Ordering::Relaxed);
                    (
                        true,
                        Some(now.saturating_sub(last)),
                        conn.pending.lock().await.len(),
                        conn.dropped_frames.load(Ordering::Relaxed),
                        Some(conn.connected_at_ms),
                    )
                }
                None => (false, None, 0, 0, None),
            };
            out.push(TunnelInfo {
                tunnel_id: entry.record.tunnel_id.clone(),
                name: entry.record.name.clone(),
                created_at_ms: entry.record.created_at_ms,
                connected,
                last_activity_age_ms: last_age,
                pending_requests: pending,
                dropped_frames: dropped,
                connected_at_ms: connected_at,
            });
        }
        out
    }

    /// Shut every connection down: signal close with 1001 and drain pending
    /// waiters. Records are kept (moot for a process that is exiting, but it
    /// keeps the operation testable).
    pub async fn shutdown_all(&self) {
        let mut tunnels = self.tunnels.write().await;
        for entry in tunnels.values_mut() {
            if let Some(conn) = entry.connection.take() {
                let _ = conn.shutdown_tx.send(CloseReason::Shutdown);
                conn.drain_pending("relay shutting down").await;
            }
        }
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection() -> (TunnelConnection, watch::Receiver<CloseReason>) {
        let (tx, _rx) = mpsc::channel(8);
        TunnelConnection::new(tx, 0)
    }

    #[tokio::test]
    async fn test_create_fresh() {
        let registry = TunnelRegistry::new();
        let (tunnel, restored) = registry.create(Some("laptop-1"), None).await;
        assert!(!restored);
        assert!(!tunnel.tunnel_id.is_empty());
        assert!(!tunnel.api_key.is_empty());
        assert_eq!(tunnel.name, "laptop-1");
        assert!(registry.lookup(&tunnel.tunnel_id).await.is_some());
    }

    #[tokio::test]
    async fn test_restore_keeps_id_and_rotates_key() {
        let registry = TunnelRegistry::new();
        let (first, _) = registry.create(Some("laptop-1"), None).await;
        let (second, restored) = registry.create(None, Some(&first.tunnel_id)).await;
        assert!(restored);
        assert_eq!(second.tunnel_id, first.tunnel_id);
        assert_ne!(second.api_key, first.api_key);
        assert_eq!(second.name, "laptop-1");
    }

    #[tokio::test]
    async fn test_restore_unknown_id_is_adopted() {
        let registry = TunnelRegistry::new();
        let (tunnel, restored) = registry.create(None, Some("laptop-after-restart")).await;
        assert!(restored);
        assert_eq!(tunnel.tunnel_id, "laptop-after-restart");
    }

    #[tokio::test]
    async fn test_restore_live_id_allocates_fresh() {
        let registry = TunnelRegistry::new();
        let (first, _) = registry.create(None, None).await;
        let (conn, _rx) = test_connection();
        registry.attach(&first.tunnel_id, conn).await.unwrap();

        let (second, restored) = registry.create(None, Some(&first.tunnel_id)).await;
        assert!(!restored);
        assert_ne!(second.tunnel_id, first.tunnel_id);
    }

    #[tokio::test]
    async fn test_authenticate() {
        let registry = TunnelRegistry::new();
        let (tunnel, _) = registry.create(None, None).await;
        assert!(registry
            .authenticate(&tunnel.tunnel_id, &tunnel.api_key)
            .await
            .is_ok());
        assert_eq!(
            registry.authenticate(&tunnel.tunnel_id, "wrong").await,
            Err(RegistryError::AuthFailed)
        );
        assert_eq!(
            registry.authenticate("missing", "any").await,
            Err(RegistryError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_attach_replaces_and_signals_old() {
        let registry = TunnelRegistry::new();
        let (tunnel, _) = registry.create(None, None).await;

        let (old, mut old_rx) = test_connection();
        registry.attach(&tunnel.tunnel_id, old).await.unwrap();

        let (new, _new_rx) = test_connection();
        let new_id = new.conn_id.clone();
        registry.attach(&tunnel.tunnel_id, new).await.unwrap();

        old_rx.changed().await.unwrap();
        assert_eq!(*old_rx.borrow(), CloseReason::Replaced);

        let live = registry.connection(&tunnel.tunnel_id).await.unwrap();
        assert_eq!(live.conn_id, new_id);
    }

    #[tokio::test]
    async fn test_detach_is_guarded_by_conn_id() {
        let registry = TunnelRegistry::new();
        let (tunnel, _) = registry.create(None, None).await;
        let (conn, _rx) = test_connection();
        let conn_id = conn.conn_id.clone();
        registry.attach(&tunnel.tunnel_id, conn).await.unwrap();

        assert!(!registry.detach(&tunnel.tunnel_id, "stale-conn").await);
        assert!(registry.is_live(&tunnel.tunnel_id).await);

        assert!(registry.detach(&tunnel.tunnel_id, &conn_id).await);
        assert!(!registry.is_live(&tunnel.tunnel_id).await);
        // The record survives for restore.
        assert!(registry.lookup(&tunnel.tunnel_id).await.is_some());
    }

    #[tokio::test]
    async fn test_detach_drains_pending() {
        let registry = TunnelRegistry::new();
        let (tunnel, _) = registry.create(None, None).await;
        let (conn, _rx) = test_connection();
        let conn_id = conn.conn_id.clone();
        let pending = conn.pending.clone();
        registry.attach(&tunnel.tunnel_id, conn).await.unwrap();

        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("r1".to_string(), tx);
        registry.detach(&tunnel.tunnel_id, &conn_id).await;
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_set_client_auth_key_overwrites() {
        let registry = TunnelRegistry::new();
        let (tunnel, _) = registry.create(None, None).await;
        assert!(registry
            .set_client_auth_key(&tunnel.tunnel_id, "first".into())
            .await);
        assert!(registry
            .set_client_auth_key(&tunnel.tunnel_id, "second".into())
            .await);
        assert_eq!(
            registry.client_auth_key(&tunnel.tunnel_id).await.as_deref(),
            Some("second")
        );
        assert!(!registry.set_client_auth_key("missing", "k".into()).await);
    }

    #[tokio::test]
    async fn test_client_auth_key_survives_restore() {
        let registry = TunnelRegistry::new();
        let (tunnel, _) = registry.create(None, None).await;
        registry
            .set_client_auth_key(&tunnel.tunnel_id, "mobile".into())
            .await;
        let (_restored, _) = registry.create(None, Some(&tunnel.tunnel_id)).await;
        assert_eq!(
            registry.client_auth_key(&tunnel.tunnel_id).await.as_deref(),
            Some("mobile")
        );
    }

    #[tokio::test]
    async fn test_shutdown_all_signals_and_clears() {
        let registry = TunnelRegistry::new();
        let (tunnel, _) = registry.create(None, None).await;
        let (conn, mut rx) = test_connection();
        registry.attach(&tunnel.tunnel_id, conn).await.unwrap();

        registry.shutdown_all().await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), CloseReason::Shutdown);
        assert!(!registry.is_live(&tunnel.tunnel_id).await);
    }
}
