//! The laptop-facing tunnel WebSocket: `GET /tunnel/{tunnelId}?api_key=…`.
//!
//! One reader task per connection dispatches every inbound frame; one writer
//! task drains the outgoing queue so writes stay strictly serialized. Two
//! timers watch the peer: a ping every 20 s and a liveness check that
//! terminates the socket when no frame or pong arrived within the window.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path as AxumPath, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use super::RelayState;
use crate::error::ApiError;
use crate::event::AgentEvent;
use crate::fanout::StreamKind;
use crate::protocol::LaptopFrame;
use crate::registry::{CloseReason, RegistryError, RelayedResponse, TunnelConnection};
use crate::util;

/// Outgoing queue depth per tunnel socket.
const TUNNEL_QUEUE_DEPTH: usize = 256;

#[derive(Deserialize)]
pub struct TunnelWsQuery {
    api_key: String,
}

/// `GET /tunnel/{tunnelId}?api_key=…` — laptop WebSocket upgrade.
pub async fn tunnel_ws(
    State(state): State<RelayState>,
    AxumPath(tunnel_id): AxumPath<String>,
    Query(query): Query<TunnelWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.registry.authenticate(&tunnel_id, &query.api_key).await {
        Ok(_) => {
            info!(tunnel_id = %tunnel_id, "Tunnel connecting...");
            ws.on_upgrade(move |socket| {
                let span = info_span!("tunnel", tunnel_id = %tunnel_id);
                handle_tunnel_socket(socket, state, tunnel_id).instrument(span)
            })
        }
        Err(RegistryError::NotFound) => ApiError::tunnel_not_found(&tunnel_id).into_response(),
        Err(RegistryError::AuthFailed) => ApiError::auth("Invalid api_key").into_response(),
    }
}

/// Drive one tunnel connection until close, death, or replacement.
async fn handle_tunnel_socket(socket: WebSocket, state: RelayState, tunnel_id: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::channel::<Message>(TUNNEL_QUEUE_DEPTH);
    let (conn, mut shutdown_rx) = TunnelConnection::new(frame_tx, state.registry.now_ms());
    let conn_id = conn.conn_id.clone();

    if state.registry.attach(&tunnel_id, conn.clone()).await.is_err() {
        warn!("Tunnel record vanished before attach");
        return;
    }

    // Writer: the only task that touches the sink.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = frame_rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if ws_sink.send(msg).await.is_err() || is_close {
                break;
            }
        }
    });

    let ping_every = Duration::from_secs(state.config.relay.ping_interval_secs);
    let liveness_every = Duration::from_secs(state.config.relay.liveness_timeout_secs);
    let liveness_window_ms = state.config.relay.liveness_timeout_secs * 1000;
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
    let mut liveness =
        tokio::time::interval_at(tokio::time::Instant::now() + liveness_every, liveness_every);

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                conn.touch(state.registry.now_ms());
                match msg {
                    Message::Text(text) => {
                        dispatch_frame(&state, &tunnel_id, &conn, text.as_str()).await;
                    }
                    Message::Close(_) => break,
                    // Pings are answered by the protocol layer; pongs only
                    // matter as liveness, recorded above.
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
                }
            }
            _ = ping.tick() => {
                let _ = conn.frame_tx.try_send(Message::Ping(Vec::new().into()));
            }
            _ = liveness.tick() => {
                let last = conn.last_activity_ms.load(Ordering::Relaxed);
                let age = state.registry.now_ms().saturating_sub(last);
                if age > liveness_window_ms {
                    warn!(age_ms = age, "Tunnel missed liveness window, terminating");
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                let reason = match *shutdown_rx.borrow() {
                    CloseReason::Replaced => "replaced by new connection",
                    CloseReason::Shutdown => "relay shutting down",
                    CloseReason::Open => continue,
                };
                info!(reason, "Closing tunnel connection");
                let _ = conn.frame_tx.try_send(Message::Close(Some(CloseFrame {
                    code: 1001,
                    reason: reason.into(),
                })));
                break;
            }
        }
    }

    state.registry.detach(&tunnel_id, &conn_id).await;
    info!("Tunnel disconnected");

    // Let the writer flush a close frame before tearing it down.
    drop(conn);
    let mut send_task = send_task;
    if tokio::time::timeout(Duration::from_secs(2), &mut send_task)
        .await
        .is_err()
    {
        debug!("Tunnel writer did not drain in time");
        send_task.abort();
    }
}

/// Dispatch one inbound tunnel frame by its `type`.
async fn dispatch_frame(state: &RelayState, tunnel_id: &str, conn: &TunnelConnection, text: &str) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        debug!("Discarding non-JSON tunnel frame");
        return;
    };

    // Agent events go through the codec so decode failures carry the
    // structured failure code.
    if value.get("type").and_then(Value::as_str) == Some("agent_event") {
        match AgentEvent::decode_value(value.get("event").cloned().unwrap_or(Value::Null)) {
            Ok(event) => {
                let key = StreamKind::Agent.stream_key(tunnel_id, &event.session_id);
                state
                    .hub
                    .broadcast(StreamKind::Agent, &key, event.to_value())
                    .await;
            }
            Err(e) => warn!(code = e.code(), "Discarding undecodable agent event: {e}"),
        }
        return;
    }

    match serde_json::from_value::<LaptopFrame>(value.clone()) {
        Ok(LaptopFrame::HttpResponse {
            request_id,
            status_code,
            body,
        }) => {
            let mut pending = conn.pending.lock().await;
            match pending.remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(RelayedResponse { status_code, body });
                }
                None => warn!(
                    request_id = %request_id,
                    "Response arrived for timed-out or unknown request (dropped)"
                ),
            }
        }
        Ok(LaptopFrame::ClientAuthKey { key }) => {
            state.registry.set_client_auth_key(tunnel_id, key).await;
            info!("Client auth key registered");
        }
        Ok(LaptopFrame::TerminalOutput { session_id, data }) => {
            let key = StreamKind::Terminal.stream_key(tunnel_id, &session_id);
            state
                .hub
                .broadcast(
                    StreamKind::Terminal,
                    &key,
                    json!({
                        "type": "output",
                        "session_id": session_id,
                        "data": data,
                        "timestamp": util::now_ms(),
                    }),
                )
                .await;
        }
        Ok(LaptopFrame::RecordingOutput {
            session_id,
            text,
            delta,
            raw,
            timestamp,
            is_complete,
        }) => {
            let mut payload = json!({
                "type": "recording_output",
                "session_id": session_id,
                "text": text,
                "delta": delta,
                "timestamp": timestamp.unwrap_or_else(util::now_ms),
            });
            if let Some(raw) = raw {
                payload["raw"] = raw;
            }
            if let Some(is_complete) = is_complete {
                payload["isComplete"] = json!(is_complete);
            }
            let key = StreamKind::Recording.stream_key(tunnel_id, &session_id);
            state
                .hub
                .broadcast(StreamKind::Recording, &key, payload)
                .await;
        }
        // Intercepted above.
        Ok(LaptopFrame::AgentEvent { .. }) => {}
        Err(_) => {
            debug!(
                frame_type = value.get("type").and_then(serde_json::Value::as_str).unwrap_or(""),
                frame = %util::redact(&value),
                "Unknown tunnel frame discarded"
            );
        }
    }
}
