//! The laptop-side tunnel client — one outbound WebSocket to the relay.
//!
//! Maintains a persistent connection with exponential-backoff reconnect,
//! heartbeat, and stateful recovery: relayed `http_request` frames are
//! demultiplexed into [`LocalDispatcher`] calls, `terminal_input` and
//! `agent_event` frames go to their sinks, and streaming outputs are pushed
//! back best-effort.
//!
//! Lifecycle: `disconnected → connecting → connected`, then on failure
//! `dead/disconnected → reconnecting → connecting` with delay
//! `min(2^attempt, 30) s`, attempt resetting on each successful open.
//! Retries are unbounded until [`TunnelClient::disconnect`].

pub mod dispatch;
pub mod forward;

pub use dispatch::{
    AgentEventSink, LocalDispatcher, LocalRequest, LocalResponse, TerminalInputSink,
};

use std::net::SocketAddr;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::event::AgentEvent;
use crate::protocol::{normalize_path, LaptopFrame, RelayFrame};

/// Connection lifecycle state, readable lock-free by embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Dead = 3,
    Reconnecting = 4,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Dead,
            4 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }
}

/// Connection statistics — atomics for lock-free hot-path updates.
#[derive(Debug, Default)]
pub struct ClientStats {
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub dropped_outbound: AtomicU64,
}

/// Connection parameters for one tunnel.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Tunnel WebSocket URL, e.g. `wss://relay.example.com/tunnel/{id}`.
    pub ws_url: String,
    /// The tunnel's `apiKey`, sent as `?api_key=`.
    pub api_key: String,
    /// Registered after connect; gates mobile access to the tunnel.
    pub client_auth_key: Option<String>,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
    pub reconnect_max_delay: Duration,
}

impl ClientOptions {
    pub fn new(ws_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key: api_key.into(),
            client_auth_key: None,
            ping_interval: Duration::from_secs(20),
            liveness_timeout: Duration::from_secs(30),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// What the embedding process plugs into the client.
pub struct ClientHooks {
    pub dispatcher: Arc<dyn LocalDispatcher>,
    pub terminal_sink: Option<Arc<dyn TerminalInputSink>>,
    pub agent_sink: Option<Arc<dyn AgentEventSink>>,
}

/// Streaming speech-transcription update pushed to the relay.
#[derive(Debug, Clone, Default)]
pub struct RecordingUpdate {
    pub text: String,
    pub delta: String,
    pub raw: Option<Value>,
    pub timestamp: Option<u64>,
    pub is_complete: Option<bool>,
}

struct ClientInner {
    options: ClientOptions,
    hooks: ClientHooks,
    state: AtomicU8,
    stats: ClientStats,
    /// Present while a connection is open; frames enqueued here reach the
    /// writer task.
    outbound: std::sync::Mutex<Option<mpsc::Sender<WsMessage>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

/// Cloneable handle to the tunnel client.
#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<ClientInner>,
}

impl TunnelClient {
    pub fn new(options: ClientOptions, hooks: ClientHooks) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                options,
                hooks,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                stats: ClientStats::default(),
                outbound: std::sync::Mutex::new(None),
                shutdown_tx,
            }),
        }
    }

    /// Spawn the supervision loop. Returns a handle that runs until
    /// [`disconnect`](Self::disconnect) or a permanent error.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(run_loop(inner))
    }

    /// Terminal: stop reconnecting and close any open socket.
    pub fn disconnect(&self) {
        // send_replace records the value even when the supervision loop has
        // not subscribed yet.
        self.inner.shutdown_tx.send_replace(true);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.load(Ordering::Relaxed).into()
    }

    pub fn stats(&self) -> &ClientStats {
        &self.inner.stats
    }

    /// Push one chunk of terminal output for a session. Best-effort: dropped
    /// with a warning when the socket is not open.
    pub fn send_terminal_output(&self, session_id: &str, data: &str) {
        self.enqueue_frame(&LaptopFrame::TerminalOutput {
            session_id: session_id.to_string(),
            data: data.to_string(),
        });
    }

    /// Push a speech-transcription update for a session. Best-effort.
    pub fn send_recording_output(&self, session_id: &str, update: RecordingUpdate) {
        self.enqueue_frame(&LaptopFrame::RecordingOutput {
            session_id: session_id.to_string(),
            text: update.text,
            delta: update.delta,
            raw: update.raw,
            timestamp: update.timestamp,
            is_complete: update.is_complete,
        });
    }

    /// Push a typed envelope event. Best-effort.
    pub fn send_agent_event(&self, event: AgentEvent) {
        self.enqueue_frame(&LaptopFrame::AgentEvent { event });
    }

    fn enqueue_frame(&self, frame: &LaptopFrame) {
        let sender = self
            .inner
            .outbound
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        let Some(sender) = sender else {
            self.inner.stats.dropped_outbound.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping outbound frame, tunnel not connected");
            return;
        };
        let text = serde_json::to_string(frame).unwrap_or_default();
        if sender.try_send(WsMessage::Text(text.into())).is_err() {
            self.inner.stats.dropped_outbound.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping outbound frame, write queue full");
        } else {
            self.inner.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Why one connection ended.
enum Disconnect {
    /// Normal close frame or EOF; back off and reconnect.
    Clean,
    /// Liveness window missed; socket terminated.
    Dead,
    /// Relay announced shutdown; reconnect immediately, skipping backoff.
    RelayClosing,
    /// `disconnect()` was requested; stop for good.
    Shutdown,
}

/// Classification of connection errors for backoff strategy.
enum ConnectError {
    /// Auth rejected or tunnel unknown — stop retrying entirely; the
    /// embedder must re-register.
    Permanent(String),
    /// DNS timeout, TCP timeout, TLS failure — exponential backoff.
    Transient(Box<dyn std::error::Error + Send + Sync>),
}

/// `min(2^attempt, max)` seconds, for `attempt >= 1`.
fn backoff_delay(attempt: u32, max: Duration) -> Duration {
    let exp = attempt.clamp(1, 6);
    Duration::from_secs((1u64 << exp).min(max.as_secs()))
}

/// Supervision loop: connect, run, classify the exit, back off, repeat.
async fn run_loop(inner: Arc<ClientInner>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);
        info!("Tunnel: connecting to {}", inner.options.ws_url);

        let outcome = connect_and_run(&inner, &mut shutdown_rx, &mut attempt).await;
        inner.stats.connected.store(false, Ordering::Relaxed);
        if let Ok(mut slot) = inner.outbound.lock() {
            *slot = None;
        }

        match outcome {
            Ok(Disconnect::Shutdown) => break,
            Ok(Disconnect::RelayClosing) => {
                info!("Tunnel: relay shutting down, reconnecting immediately");
                attempt = 0;
                inner.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Ok(Disconnect::Clean) => {
                inner.set_state(ConnectionState::Disconnected);
                info!("Tunnel: connection closed, reconnecting...");
            }
            Ok(Disconnect::Dead) => {
                inner.set_state(ConnectionState::Dead);
                warn!("Tunnel: peer missed liveness window, reconnecting...");
            }
            Err(ConnectError::Permanent(message)) => {
                inner.set_state(ConnectionState::Disconnected);
                error!("Tunnel: permanent error: {message} — stopping client");
                break;
            }
            Err(ConnectError::Transient(e)) => {
                inner.set_state(ConnectionState::Disconnected);
                warn!("Tunnel: connection error: {e}");
            }
        }

        attempt += 1;
        inner.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        let delay = backoff_delay(attempt, inner.options.reconnect_max_delay);
        info!("Tunnel: reconnecting in {}s", delay.as_secs());
        inner.set_state(ConnectionState::Reconnecting);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    inner.set_state(ConnectionState::Disconnected);
    info!("Tunnel: client stopped");
}

/// Configure TCP keepalive on a connected stream.
///
/// NAT timeouts on mobile and hotel networks commonly sit at 30-60s. Without
/// keepalive, a silent NAT expiry kills the connection and the relay won't
/// see heartbeats. Parameters: start probing after `idle` seconds, probe
/// every `interval` seconds, give up after `count` failed probes.
#[cfg(unix)]
#[allow(clippy::cast_possible_wrap)]
fn set_tcp_keepalive(stream: &TcpStream, idle: u32, interval: u32, count: u32) {
    use std::ptr;

    let fd = stream.as_raw_fd();
    let sz = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        let enable: libc::c_int = 1;
        let idle = idle as libc::c_int;
        let interval = interval as libc::c_int;
        let count = count as libc::c_int;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            ptr::addr_of!(enable).cast(),
            sz,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPIDLE,
            ptr::addr_of!(idle).cast(),
            sz,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPINTVL,
            ptr::addr_of!(interval).cast(),
            sz,
        );
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPCNT,
            ptr::addr_of!(count).cast(),
            sz,
        );
    }
}

/// Resolve DNS for a `ws(s)://` URL and connect TCP, preferring IPv4.
///
/// Laptops on broken dual-stack networks can spend minutes timing out on
/// IPv6 routes before falling back; sorting IPv4 first avoids the delay.
async fn connect_tcp_ipv4_preferred(
    url: &str,
) -> Result<TcpStream, Box<dyn std::error::Error + Send + Sync>> {
    let without_scheme = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    let default_port = if url.starts_with("wss://") { 443 } else { 80 };
    let (host, port) = match authority.rfind(':') {
        Some(colon) => match authority[colon + 1..].parse::<u16>() {
            Ok(p) => (&authority[..colon], p),
            Err(_) => (authority, default_port),
        },
        None => (authority, default_port),
    };
    let host_port = format!("{host}:{port}");

    let mut addrs: Vec<SocketAddr> =
        tokio::time::timeout(Duration::from_secs(10), tokio::net::lookup_host(&host_port))
            .await
            .map_err(|_| -> Box<dyn std::error::Error + Send + Sync> {
                format!("DNS lookup timed out (10s) for {host}").into()
            })??
            .collect();
    addrs.sort_by_key(|a| i32::from(!a.is_ipv4()));
    if addrs.is_empty() {
        return Err(format!("DNS resolution failed for {host}").into());
    }

    let mut last_err = None;
    for addr in &addrs {
        match tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                // Probe after 15s idle, every 5s, 3 probes before dead:
                // detects a dead relay path in ~30s, matching the liveness
                // window.
                #[cfg(unix)]
                set_tcp_keepalive(&stream, 15, 5, 3);
                debug!("Tunnel: TCP connected to {addr}");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                warn!("Tunnel: TCP connect to {addr} failed: {e}");
                last_err = Some(e.into());
            }
            Err(_) => {
                warn!("Tunnel: TCP connect to {addr} timed out (10s)");
                last_err = Some(format!("connect to {addr} timed out").into());
            }
        }
    }
    Err(last_err.unwrap_or_else(|| "all addresses failed".into()))
}

/// A single connection attempt: connect, run until disconnect.
async fn connect_and_run(
    inner: &Arc<ClientInner>,
    shutdown_rx: &mut watch::Receiver<bool>,
    attempt: &mut u32,
) -> Result<Disconnect, ConnectError> {
    let url = format!("{}?api_key={}", inner.options.ws_url, inner.options.api_key);
    let connect_start = Instant::now();

    let tcp_stream = connect_tcp_ipv4_preferred(&url)
        .await
        .map_err(ConnectError::Transient)?;

    let (ws_stream, _response) = tokio::time::timeout(
        Duration::from_secs(15),
        tokio_tungstenite::client_async_tls(url.as_str(), tcp_stream),
    )
    .await
    .map_err(|_| ConnectError::Transient("TLS/WS handshake timed out (15s)".into()))?
    .map_err(|e| match &e {
        tokio_tungstenite::tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403 | 404) =>
        {
            ConnectError::Permanent(format!(
                "Relay rejected connection ({}): re-register the tunnel",
                response.status()
            ))
        }
        _ => ConnectError::Transient(e.into()),
    })?;

    info!(
        "Tunnel: connected ({}ms)",
        connect_start.elapsed().as_millis()
    );
    inner.set_state(ConnectionState::Connected);
    inner.stats.connected.store(true, Ordering::Relaxed);
    *attempt = 0;

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(256);
    if let Ok(mut slot) = inner.outbound.lock() {
        *slot = Some(outbound_tx.clone());
    }

    // Register the client auth key before anything else flows.
    if let Some(key) = &inner.options.client_auth_key {
        let frame = LaptopFrame::ClientAuthKey { key: key.clone() };
        let text = serde_json::to_string(&frame).unwrap_or_default();
        let _ = outbound_tx.send(WsMessage::Text(text.into())).await;
    }

    // Writer: the only task that touches the sink. A failed write trips the
    // watch so the read loop reconnects.
    let (writer_failed_tx, mut writer_failed_rx) = watch::channel(false);
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let is_close = matches!(msg, WsMessage::Close(_));
            if ws_sink.send(msg).await.is_err() {
                let _ = writer_failed_tx.send(true);
                break;
            }
            if is_close {
                let _ = ws_sink.flush().await;
                break;
            }
        }
    });

    let ping_every = inner.options.ping_interval;
    let liveness_every = inner.options.liveness_timeout;
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
    let mut liveness =
        tokio::time::interval_at(tokio::time::Instant::now() + liveness_every, liveness_every);
    let mut last_frame_at = Instant::now();

    let reason = loop {
        tokio::select! {
            msg = ws_stream.next() => {
                let Some(msg) = msg else { break Disconnect::Clean };
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Tunnel: WS read error: {e}");
                        break Disconnect::Clean;
                    }
                };
                last_frame_at = Instant::now();
                inner.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                match msg {
                    WsMessage::Text(text) => {
                        if handle_relay_frame(inner, &outbound_tx, text.as_str()) {
                            break Disconnect::RelayClosing;
                        }
                    }
                    WsMessage::Ping(payload) => {
                        let _ = outbound_tx.try_send(WsMessage::Pong(payload));
                    }
                    WsMessage::Close(_) => break Disconnect::Clean,
                    WsMessage::Pong(_) | WsMessage::Binary(_) | WsMessage::Frame(_) => {}
                }
            }
            _ = ping.tick() => {
                if outbound_tx.try_send(WsMessage::Ping(Vec::new().into())).is_err() {
                    warn!("Tunnel: ping enqueue failed, reconnecting");
                    break Disconnect::Clean;
                }
            }
            _ = liveness.tick() => {
                if last_frame_at.elapsed() > inner.options.liveness_timeout {
                    break Disconnect::Dead;
                }
            }
            _ = writer_failed_rx.changed() => {
                warn!("Tunnel: write failed, reconnecting");
                break Disconnect::Clean;
            }
            _ = shutdown_rx.changed() => {
                let _ = outbound_tx.try_send(WsMessage::Close(None));
                break Disconnect::Shutdown;
            }
        }
    };

    if let Ok(mut slot) = inner.outbound.lock() {
        *slot = None;
    }
    drop(outbound_tx);
    let mut send_task = send_task;
    if tokio::time::timeout(Duration::from_secs(2), &mut send_task)
        .await
        .is_err()
    {
        debug!("Tunnel: writer did not drain in time");
        send_task.abort();
    }
    Ok(reason)
}

/// Demultiplex one inbound relay frame. Returns true when the relay
/// announced shutdown.
fn handle_relay_frame(
    inner: &Arc<ClientInner>,
    outbound: &mpsc::Sender<WsMessage>,
    text: &str,
) -> bool {
    let frame: RelayFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Tunnel: discarding unknown frame: {e}");
            return false;
        }
    };

    match frame {
        RelayFrame::HttpRequest {
            request_id,
            method,
            path,
            headers,
            query,
            body,
        } => {
            // Dispatch off the read loop so a slow handler never stalls
            // heartbeats; responses correlate by requestId, not order.
            let dispatcher = inner.hooks.dispatcher.clone();
            let outbound = outbound.clone();
            let inner = inner.clone();
            tokio::spawn(async move {
                let response = dispatcher
                    .handle(LocalRequest {
                        method,
                        path: normalize_path(&path),
                        headers,
                        query,
                        body,
                    })
                    .await;
                let frame = LaptopFrame::HttpResponse {
                    request_id,
                    status_code: response.status,
                    body: response.body,
                };
                let text = serde_json::to_string(&frame).unwrap_or_default();
                if outbound.send(WsMessage::Text(text.into())).await.is_err() {
                    inner.stats.dropped_outbound.fetch_add(1, Ordering::Relaxed);
                    warn!("Tunnel: dropping http_response, connection closed");
                } else {
                    inner.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
        RelayFrame::TerminalInput { session_id, data } => {
            match &inner.hooks.terminal_sink {
                Some(sink) => sink.on_input(&session_id, &data),
                None => debug!("Tunnel: no terminal sink registered, dropping input"),
            }
        }
        RelayFrame::AgentEvent { event } => match &inner.hooks.agent_sink {
            Some(sink) => sink.on_event(event),
            None => debug!("Tunnel: no agent sink registered, dropping event"),
        },
        RelayFrame::RelayShutdown => return true,
    }
    false
}

/// One tunnel registration as returned by `POST /tunnel/create`.
#[derive(Debug, Clone)]
pub struct RegisteredTunnel {
    pub tunnel_id: String,
    pub api_key: String,
    pub public_url: String,
    pub ws_url: String,
    pub restored: bool,
}

/// Create or restore a tunnel against the relay's HTTP API.
pub async fn register_tunnel(
    relay_url: &str,
    registration_key: &str,
    name: &str,
    suggested_id: Option<&str>,
) -> Result<RegisteredTunnel, Box<dyn std::error::Error + Send + Sync>> {
    let mut body = serde_json::json!({"name": name});
    if let Some(id) = suggested_id {
        body["tunnel_id"] = Value::String(id.to_string());
    }

    let url = format!("{}/tunnel/create", relay_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .header("X-API-Key", registration_key)
        .json(&body)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(format!("tunnel create failed ({status}): {text}").into());
    }

    let value: Value = response.json().await?;
    let config = &value["config"];
    let field = |name: &str| -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        config[name]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| format!("tunnel create response missing config.{name}").into())
    };
    Ok(RegisteredTunnel {
        tunnel_id: field("tunnelId")?,
        api_key: field("apiKey")?,
        public_url: field("publicUrl")?,
        ws_url: field("wsUrl")?,
        restored: config["isRestored"].as_bool().unwrap_or(false),
    })
}
