//! The relayed HTTP surface: `ANY /api/{tunnelId}/{…}`.
//!
//! Each request is serialized as an `http_request` frame, sent over the
//! tunnel WebSocket, and held open until the matching `http_response` frame
//! arrives or the wall-clock deadline expires.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use super::RelayState;
use crate::auth;
use crate::error::{ApiError, ErrorCode};
use crate::protocol::{normalize_path, RelayFrame};
use crate::registry::{RelayedResponse, TunnelConnection};

/// `ANY /api/{tunnelId}` — relayed request with an empty remainder path.
pub async fn relay_api_root(
    State(state): State<RelayState>,
    AxumPath(tunnel_id): AxumPath<String>,
    Query(query): Query<HashMap<String, String>>,
    request: Request<Body>,
) -> Result<Response, ApiError> {
    relay_request(state, tunnel_id, String::new(), query, request).await
}

/// `ANY /api/{tunnelId}/{rest…}` — the relayed HTTP surface.
pub async fn relay_api(
    State(state): State<RelayState>,
    AxumPath((tunnel_id, rest)): AxumPath<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    request: Request<Body>,
) -> Result<Response, ApiError> {
    relay_request(state, tunnel_id, rest, query, request).await
}

async fn relay_request(
    state: RelayState,
    tunnel_id: String,
    rest: String,
    query: HashMap<String, String>,
    request: Request<Body>,
) -> Result<Response, ApiError> {
    if state.registry.lookup(&tunnel_id).await.is_none() {
        return Err(ApiError::tunnel_not_found(&tunnel_id));
    }

    // When the laptop registered a clientAuthKey, mobile callers must
    // present it as a Bearer token.
    if let Some(expected) = state.registry.client_auth_key(&tunnel_id).await {
        let provided = auth::bearer_token(request.headers())
            .ok_or_else(|| ApiError::auth("Missing Authorization header"))?;
        if !auth::constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            return Err(ApiError::auth("Invalid client auth key"));
        }
    }

    let Some(conn) = state.registry.connection(&tunnel_id).await else {
        return Err(ApiError::not_connected(&tunnel_id));
    };

    let method = request.method().to_string();
    let mut headers = HashMap::new();
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }

    let body_bytes = axum::body::to_bytes(request.into_body(), state.config.relay.max_body_bytes)
        .await
        .map_err(|_| ApiError::invalid("Failed to read request body"))?;
    let body: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes)
            .map_err(|_| ApiError::invalid("Request body must be JSON"))?
    };

    let request_id = uuid::Uuid::new_v4().to_string();
    let frame = RelayFrame::HttpRequest {
        request_id: request_id.clone(),
        method,
        path: normalize_path(&rest),
        headers,
        query,
        body,
    };

    let timeout = Duration::from_secs(state.config.relay.request_timeout_secs);
    let response = relay_over_tunnel(&conn, &request_id, &frame, timeout).await?;

    debug!(
        tunnel_id = %tunnel_id,
        request_id = %request_id,
        status = response.status_code,
        "Relayed request completed"
    );
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(response.body)).into_response())
}

/// Register a waiter, send the frame, and await the matching response.
///
/// On timeout the waiter is removed and the caller answers 504; a response
/// frame arriving later finds no waiter and is discarded with a warning by
/// the tunnel frame dispatcher.
pub async fn relay_over_tunnel(
    conn: &TunnelConnection,
    request_id: &str,
    frame: &RelayFrame,
    timeout: Duration,
) -> Result<RelayedResponse, ApiError> {
    let (tx, rx) = oneshot::channel();
    conn.pending.lock().await.insert(request_id.to_string(), tx);

    if conn.send_frame(frame).is_err() {
        conn.pending.lock().await.remove(request_id);
        return Err(ApiError::new(
            ErrorCode::TunnelConnectionError,
            "Failed to send to laptop",
        ));
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => Err(ApiError::new(
            ErrorCode::TunnelConnectionError,
            "Tunnel disconnected while waiting for response",
        )),
        Err(_) => {
            conn.pending.lock().await.remove(request_id);
            Err(ApiError::timeout())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TunnelConnection;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn connection() -> (TunnelConnection, mpsc::Receiver<axum::extract::ws::Message>) {
        let (tx, rx) = mpsc::channel(8);
        let (conn, _shutdown) = TunnelConnection::new(tx, 0);
        (conn, rx)
    }

    fn request_frame(request_id: &str) -> RelayFrame {
        RelayFrame::HttpRequest {
            request_id: request_id.to_string(),
            method: "GET".into(),
            path: "/terminal/list".into(),
            headers: HashMap::new(),
            query: HashMap::new(),
            body: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_completion_resolves_waiter() {
        let (conn, mut wire) = connection();
        let pending = conn.pending.clone();

        let responder = tokio::spawn(async move {
            // The frame reaches the wire before the response is produced.
            let _ = wire.recv().await;
            let tx = loop {
                if let Some(tx) = pending.lock().await.remove("r1") {
                    break tx;
                }
                tokio::task::yield_now().await;
            };
            let _ = tx.send(RelayedResponse {
                status_code: 200,
                body: json!({"sessions": []}),
            });
        });

        let response = relay_over_tunnel(
            &conn,
            "r1",
            &request_frame("r1"),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, json!({"sessions": []}));
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_answers_504_and_removes_waiter() {
        let (conn, _wire) = connection();
        let err = relay_over_tunnel(
            &conn,
            "r2",
            &request_frame("r2"),
            Duration::from_secs(60),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::UpstreamTimeout);
        // A later-arriving response finds no waiter.
        assert!(conn.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_answers_connection_error() {
        let (conn, _wire) = connection();
        let pending = conn.pending.clone();

        let dropper = tokio::spawn(async move {
            loop {
                if pending.lock().await.remove("r3").is_some() {
                    // Dropping the sender mimics drain on disconnect.
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        let err = relay_over_tunnel(
            &conn,
            "r3",
            &request_frame("r3"),
            Duration::from_secs(60),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::TunnelConnectionError);
        dropper.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_write_queue_answers_connection_error() {
        let (tx, _rx) = mpsc::channel(1);
        let (conn, _shutdown) = TunnelConnection::new(tx, 0);
        // Fill the single-slot queue so the request frame cannot be enqueued.
        assert!(conn.send_frame(&RelayFrame::RelayShutdown).is_ok());

        let err = relay_over_tunnel(
            &conn,
            "r4",
            &request_frame("r4"),
            Duration::from_secs(60),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::TunnelConnectionError);
        assert!(conn.pending.lock().await.is_empty());
    }
}
