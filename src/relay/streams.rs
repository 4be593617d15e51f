//! Client-side stream subscriptions:
//!
//! - `GET /terminal/{tunnelId}/{sessionId}/stream` — WebSocket; receives
//!   `{type:"output", …}` frames and may send `{type:"input", data}` which
//!   the relay forwards to the laptop as `terminal_input`.
//! - `GET /recording/{tunnelId}/{sessionId}/stream` — WebSocket or SSE.
//! - `GET /agent/{tunnelId}/{sessionId}/stream` — WebSocket, bidirectional
//!   `AgentEvent` frames.
//!
//! When the laptop registered a `clientAuthKey`, subscribers must present it
//! as a Bearer token or a `?token=` query parameter (browsers can't set
//! headers on WebSocket upgrades).

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path as AxumPath, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, info_span, warn, Instrument};

use super::RelayState;
use crate::auth;
use crate::error::ApiError;
use crate::event::AgentEvent;
use crate::fanout::{FanoutHub, StreamKind, SubscriberMessage};
use crate::protocol::{RelayFrame, SubscriberFrame};

#[derive(Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
}

/// Gate a subscription: the tunnel must exist, and when a `clientAuthKey`
/// is registered the caller must present it.
async fn authorize_stream(
    state: &RelayState,
    tunnel_id: &str,
    headers: &HeaderMap,
    token: Option<&str>,
) -> Result<(), ApiError> {
    if state.registry.lookup(tunnel_id).await.is_none() {
        return Err(ApiError::tunnel_not_found(tunnel_id));
    }
    if let Some(expected) = state.registry.client_auth_key(tunnel_id).await {
        let provided = token
            .or_else(|| auth::bearer_token(headers))
            .ok_or_else(|| ApiError::auth("Missing client auth key"))?;
        if !auth::constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            return Err(ApiError::auth("Invalid client auth key"));
        }
    }
    Ok(())
}

/// `GET /terminal/{tunnelId}/{sessionId}/stream`
pub async fn terminal_stream(
    State(state): State<RelayState>,
    AxumPath((tunnel_id, session_id)): AxumPath<(String, String)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    authorize_stream(&state, &tunnel_id, &headers, query.token.as_deref()).await?;
    let span = info_span!("terminal_stream", tunnel_id = %tunnel_id, session_id = %session_id);
    Ok(ws.on_upgrade(move |socket| {
        handle_stream_socket(socket, state, StreamKind::Terminal, tunnel_id, session_id)
            .instrument(span)
    }))
}

/// `GET /agent/{tunnelId}/{sessionId}/stream`
pub async fn agent_stream(
    State(state): State<RelayState>,
    AxumPath((tunnel_id, session_id)): AxumPath<(String, String)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    authorize_stream(&state, &tunnel_id, &headers, query.token.as_deref()).await?;
    let span = info_span!("agent_stream", tunnel_id = %tunnel_id, session_id = %session_id);
    Ok(ws.on_upgrade(move |socket| {
        handle_stream_socket(socket, state, StreamKind::Agent, tunnel_id, session_id)
            .instrument(span)
    }))
}

/// `GET /recording/{tunnelId}/{sessionId}/stream` — WebSocket when the
/// caller upgrades, SSE otherwise.
pub async fn recording_stream(
    State(state): State<RelayState>,
    AxumPath((tunnel_id, session_id)): AxumPath<(String, String)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, ApiError> {
    authorize_stream(&state, &tunnel_id, &headers, query.token.as_deref()).await?;
    match ws {
        Some(ws) => {
            let span =
                info_span!("recording_stream", tunnel_id = %tunnel_id, session_id = %session_id);
            Ok(ws.on_upgrade(move |socket| {
                handle_stream_socket(socket, state, StreamKind::Recording, tunnel_id, session_id)
                    .instrument(span)
            }))
        }
        None => Ok(recording_sse(state, tunnel_id, session_id).await),
    }
}

/// SSE variant of the recording stream: each broadcast becomes one
/// `event: recording_output` with the JSON payload on the data line.
async fn recording_sse(state: RelayState, tunnel_id: String, session_id: String) -> Response {
    let kind = StreamKind::Recording;
    let key = kind.stream_key(&tunnel_id, &session_id);
    let subscriber_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = FanoutHub::channel();
    state.hub.subscribe(kind, &key, &subscriber_id, tx).await;
    info!(tunnel_id = %tunnel_id, session_id = %session_id, "SSE subscriber connected");

    // When the client goes away the receiver is dropped and the next
    // broadcast prunes the subscription.
    let stream = futures::stream::unfold(rx, move |mut rx| async move {
        match rx.recv().await {
            Some(SubscriberMessage::Event(value)) => {
                let event = Event::default()
                    .event(kind.event_name())
                    .data(value.to_string());
                Some((Ok::<_, std::convert::Infallible>(event), rx))
            }
            Some(SubscriberMessage::Close(_)) | None => None,
        }
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default().interval(Duration::from_secs(15)))
        .into_response()
}

/// Drive one stream subscriber WebSocket until close or death. Subscribers
/// run the same ping/liveness timer pair as tunnel connections.
async fn handle_stream_socket(
    socket: WebSocket,
    state: RelayState,
    kind: StreamKind,
    tunnel_id: String,
    session_id: String,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let key = kind.stream_key(&tunnel_id, &session_id);
    let subscriber_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = FanoutHub::channel();
    state.hub.subscribe(kind, &key, &subscriber_id, tx).await;
    info!(subscriber_id = %subscriber_id, "Stream subscriber connected");

    let ping_every = Duration::from_secs(state.config.relay.ping_interval_secs);
    let liveness_every = Duration::from_secs(state.config.relay.liveness_timeout_secs);
    let liveness_window_ms = state.config.relay.liveness_timeout_secs * 1000;
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
    let mut liveness =
        tokio::time::interval_at(tokio::time::Instant::now() + liveness_every, liveness_every);
    let mut last_activity_ms = state.registry.now_ms();

    loop {
        tokio::select! {
            delivery = rx.recv() => {
                match delivery {
                    Some(SubscriberMessage::Event(value)) => {
                        if ws_sink
                            .send(Message::Text(value.to_string().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(SubscriberMessage::Close(code)) => {
                        let _ = ws_sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: "shutting down".into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                }
            }
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                last_activity_ms = state.registry.now_ms();
                match msg {
                    Message::Text(text) => {
                        handle_subscriber_frame(&state, kind, &tunnel_id, &session_id, text.as_str())
                            .await;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
                }
            }
            _ = ping.tick() => {
                if ws_sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            _ = liveness.tick() => {
                let age = state.registry.now_ms().saturating_sub(last_activity_ms);
                if age > liveness_window_ms {
                    warn!(age_ms = age, "Stream subscriber missed liveness window, terminating");
                    break;
                }
            }
        }
    }

    state.hub.unsubscribe(kind, &key, &subscriber_id).await;
    info!(subscriber_id = %subscriber_id, "Stream subscriber disconnected");
}

/// Inbound frames from a subscriber: terminal `input` and agent events are
/// forwarded over the tunnel; everything else is ignored.
async fn handle_subscriber_frame(
    state: &RelayState,
    kind: StreamKind,
    tunnel_id: &str,
    session_id: &str,
    text: &str,
) {
    match kind {
        StreamKind::Terminal => {
            let Ok(SubscriberFrame::Input { data }) = serde_json::from_str(text) else {
                debug!("Ignoring unknown terminal subscriber frame");
                return;
            };
            let frame = RelayFrame::TerminalInput {
                session_id: session_id.to_string(),
                data,
            };
            match state.registry.connection(tunnel_id).await {
                Some(conn) => {
                    if conn.send_frame(&frame).is_err() {
                        warn!("Failed to forward terminal input to laptop");
                    }
                }
                None => warn!("Dropping terminal input, tunnel not connected"),
            }
        }
        StreamKind::Agent => {
            let event = match AgentEvent::decode(text) {
                Ok(event) => event,
                Err(e) => {
                    warn!(code = e.code(), "Discarding undecodable agent event from subscriber: {e}");
                    return;
                }
            };
            match state.registry.connection(tunnel_id).await {
                Some(conn) => {
                    if conn.send_frame(&RelayFrame::AgentEvent { event }).is_err() {
                        warn!("Failed to forward agent event to laptop");
                    }
                }
                None => warn!("Dropping agent event, tunnel not connected"),
            }
        }
        StreamKind::Recording => {
            debug!("Ignoring inbound frame on recording stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::TunnelConnection;
    use std::sync::Arc;

    fn test_state() -> RelayState {
        let config: Config = toml::from_str("").expect("defaults parse");
        RelayState::new(Arc::new(config))
    }

    #[tokio::test]
    async fn test_authorize_stream_unknown_tunnel() {
        let state = test_state();
        let err = authorize_stream(&state, "missing", &HeaderMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::TunnelNotFound);
    }

    #[tokio::test]
    async fn test_authorize_stream_without_key_is_open() {
        let state = test_state();
        let (tunnel, _) = state.registry.create(None, None).await;
        assert!(
            authorize_stream(&state, &tunnel.tunnel_id, &HeaderMap::new(), None)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_authorize_stream_enforces_client_auth_key() {
        let state = test_state();
        let (tunnel, _) = state.registry.create(None, None).await;
        state
            .registry
            .set_client_auth_key(&tunnel.tunnel_id, "mobile".into())
            .await;

        let err = authorize_stream(&state, &tunnel.tunnel_id, &HeaderMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::TunnelAuthError);

        assert!(
            authorize_stream(&state, &tunnel.tunnel_id, &HeaderMap::new(), Some("mobile"))
                .await
                .is_ok()
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            axum::http::HeaderValue::from_static("Bearer mobile"),
        );
        assert!(authorize_stream(&state, &tunnel.tunnel_id, &headers, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_terminal_input_is_forwarded_over_tunnel() {
        let state = test_state();
        let (tunnel, _) = state.registry.create(None, None).await;
        let (tx, mut wire) = tokio::sync::mpsc::channel(8);
        let (conn, _shutdown) = TunnelConnection::new(tx, 0);
        state.registry.attach(&tunnel.tunnel_id, conn).await.unwrap();

        handle_subscriber_frame(
            &state,
            StreamKind::Terminal,
            &tunnel.tunnel_id,
            "S",
            r#"{"type":"input","data":"ls\n"}"#,
        )
        .await;

        let Some(Message::Text(text)) = wire.recv().await else {
            panic!("no frame forwarded");
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["type"], "terminal_input");
        assert_eq!(value["sessionId"], "S");
        assert_eq!(value["data"], "ls\n");
    }

    #[tokio::test]
    async fn test_agent_event_from_subscriber_is_forwarded() {
        let state = test_state();
        let (tunnel, _) = state.registry.create(None, None).await;
        let (tx, mut wire) = tokio::sync::mpsc::channel(8);
        let (conn, _shutdown) = TunnelConnection::new(tx, 0);
        state.registry.attach(&tunnel.tunnel_id, conn).await.unwrap();

        let frame = r#"{"type":"command_text","session_id":"S","message_id":"m1","timestamp":1,"payload":{"text":"hi"}}"#;
        handle_subscriber_frame(&state, StreamKind::Agent, &tunnel.tunnel_id, "S", frame).await;

        let Some(Message::Text(text)) = wire.recv().await else {
            panic!("no frame forwarded");
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["type"], "agent_event");
        assert_eq!(value["event"]["type"], "command_text");
        assert_eq!(value["event"]["payload"]["text"], "hi");
    }

    #[tokio::test]
    async fn test_malformed_agent_event_from_subscriber_is_dropped() {
        let state = test_state();
        let (tunnel, _) = state.registry.create(None, None).await;
        let (tx, mut wire) = tokio::sync::mpsc::channel(8);
        let (conn, _shutdown) = TunnelConnection::new(tx, 0);
        state.registry.attach(&tunnel.tunnel_id, conn).await.unwrap();

        handle_subscriber_frame(
            &state,
            StreamKind::Agent,
            &tunnel.tunnel_id,
            "S",
            r#"{"type":"command_text"}"#,
        )
        .await;
        assert!(wire.try_recv().is_err());
    }
}
