//! The relay server — binds every externally visible endpoint and
//! coordinates the registry, the fan-out hub, and the pending-request
//! tables.
//!
//! Endpoints:
//! 1. `POST /tunnel/create` — create/restore a tunnel (registration key).
//! 2. `GET /tunnel` — admin listing of tunnels (registration key).
//! 3. `GET /tunnel/{tunnelId}` — laptop WebSocket (tunnel `apiKey`).
//! 4. `ANY /api/{tunnelId}/…` — relayed HTTP surface.
//! 5. `GET /terminal|recording|agent/{tunnelId}/{sessionId}/stream` —
//!    client-side stream subscriptions (WebSocket; SSE for recording).
//! 6. `GET /health` — liveness.

pub mod proxy;
pub mod streams;
pub mod tunnel_ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth;
use crate::config::Config;
use crate::error::ApiError;
use crate::fanout::{FanoutHub, StreamKind};
use crate::protocol::RelayFrame;
use crate::registry::TunnelRegistry;
use crate::util;

/// State shared across all relay handlers.
#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<Config>,
    pub registry: Arc<TunnelRegistry>,
    pub hub: Arc<FanoutHub>,
}

impl RelayState {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            registry: Arc::new(TunnelRegistry::new()),
            hub: Arc::new(FanoutHub::new()),
        }
    }
}

/// Build the relay router with all endpoints.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tunnel/create", post(create_tunnel))
        .route("/tunnel", get(list_tunnels))
        .route("/tunnel/{tunnel_id}", get(tunnel_ws::tunnel_ws))
        .route("/api/{tunnel_id}", any(proxy::relay_api_root))
        .route("/api/{tunnel_id}/{*rest}", any(proxy::relay_api))
        .route(
            "/terminal/{tunnel_id}/{session_id}/stream",
            get(streams::terminal_stream),
        )
        .route(
            "/recording/{tunnel_id}/{session_id}/stream",
            get(streams::recording_stream),
        )
        .route(
            "/agent/{tunnel_id}/{session_id}/stream",
            get(streams::agent_stream),
        )
        .with_state(state)
}

/// Orderly teardown: notify laptops, close subscribers with 1001, drain
/// pending requests (their waiters answer 503), close tunnel sockets.
pub async fn shutdown(state: &RelayState) {
    info!("Notifying tunnels of relay shutdown...");
    for conn in state.registry.live_connections().await {
        let _ = conn.send_frame(&RelayFrame::RelayShutdown);
    }
    state.hub.shutdown().await;
    state.registry.shutdown_all().await;
}

/// `GET /health` — liveness.
async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Check the process-wide registration key carried in `X-API-Key`.
fn require_registration_key(state: &RelayState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = &state.config.relay.registration_api_key;
    let provided = auth::registration_key(headers)
        .ok_or_else(|| ApiError::auth("Missing X-API-Key header"))?;
    if !auth::constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return Err(ApiError::auth("Invalid registration key"));
    }
    Ok(())
}

/// Body of `POST /tunnel/create`.
#[derive(Debug, Default, Deserialize)]
pub struct CreateTunnelRequest {
    pub name: Option<String>,
    pub tunnel_id: Option<String>,
}

/// `POST /tunnel/create` — create or restore a tunnel.
async fn create_tunnel(
    State(state): State<RelayState>,
    headers: HeaderMap,
    body: Option<Json<CreateTunnelRequest>>,
) -> Result<Json<Value>, ApiError> {
    require_registration_key(&state, &headers)?;
    let request = body.map(|Json(b)| b).unwrap_or_default();

    let (tunnel, restored) = state
        .registry
        .create(request.name.as_deref(), request.tunnel_id.as_deref())
        .await;

    let relay = &state.config.relay;
    let public_url = util::public_url(
        &relay.public_protocol,
        &relay.host,
        relay.port,
        relay.public_host.as_deref(),
        &tunnel.tunnel_id,
    );
    let ws_url = util::ws_url(
        &relay.public_protocol,
        &relay.host,
        relay.port,
        relay.public_host.as_deref(),
        &tunnel.tunnel_id,
    );

    Ok(Json(json!({
        "config": {
            "tunnelId": tunnel.tunnel_id,
            "apiKey": tunnel.api_key,
            "publicUrl": public_url,
            "wsUrl": ws_url,
            "isRestored": restored,
        }
    })))
}

/// `GET /tunnel` — admin listing of tunnels (requires registration key).
async fn list_tunnels(
    State(state): State<RelayState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_registration_key(&state, &headers)?;

    let snapshot = state.registry.snapshot().await;
    let mut list: Vec<Value> = Vec::with_capacity(snapshot.len());
    for info in snapshot {
        let counts = state.hub.counts_for_tunnel(&info.tunnel_id).await;
        list.push(json!({
            "tunnelId": info.tunnel_id,
            "name": info.name,
            "createdAt": info.created_at_ms,
            "connected": info.connected,
            "lastActivityAgoMs": info.last_activity_age_ms,
            "pendingRequests": info.pending_requests,
            "droppedFrames": info.dropped_frames,
            "connectedAt": info.connected_at_ms,
            "subscribers": {
                "terminal": counts.get(&StreamKind::Terminal).copied().unwrap_or(0),
                "recording": counts.get(&StreamKind::Recording).copied().unwrap_or(0),
                "agent": counts.get(&StreamKind::Agent).copied().unwrap_or(0),
            },
        }));
    }

    Ok(Json(json!({"tunnels": list})))
}
