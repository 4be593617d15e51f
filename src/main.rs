#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # backhaul
//!
//! Reverse tunnel relay for reaching laptop agents behind NAT.
//!
//! The relay accepts HTTPS and WebSocket traffic addressed to a per-laptop
//! tunnel id and multiplexes it over a single persistent WebSocket back to
//! the laptop; the laptop runs the tunnel client and re-injects relayed
//! requests into a local HTTP handler.
//!
//! ## Subcommands
//!
//! - `backhaul relay` — run the public relay server
//! - `backhaul connect` — run the laptop-side tunnel client

use std::sync::Arc;

use backhaul::client::forward::HttpForwarder;
use backhaul::client::{register_tunnel, ClientHooks, ClientOptions, TunnelClient};
use backhaul::store::{PersistedState, StateStore, StoredTunnel};
use backhaul::{relay, Config, RelayState};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Reverse tunnel relay for laptop agents behind NAT.
#[derive(Parser)]
#[command(name = "backhaul", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public relay server.
    Relay {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the laptop-side tunnel client.
    Connect {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Relay { config } => run_relay(config.as_deref()).await,
        Commands::Connect { config } => run_connect(config.as_deref()).await,
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_relay(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    let validation_errors = config.validate_relay();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("backhaul relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}:{}", config.relay.host, config.relay.port);

    let listen = format!("{}:{}", config.relay.host, config.relay.port);
    let max_connections = config.relay.max_connections;
    let state = RelayState::new(Arc::new(config));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::HeaderName::from_static("x-api-key"),
        ]);

    let app = relay::router(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections));

    let listener = TcpListener::bind(&listen).await.expect("Failed to bind");
    info!("Relay ready");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    relay::shutdown(&state).await;
    info!("Goodbye");
}

async fn run_connect(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    let validation_errors = config.validate_client();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("Config error: {err}");
        }
        std::process::exit(1);
    }
    let client_config = config.client.expect("validated above");

    info!("backhaul connect v{} starting", env!("CARGO_PKG_VERSION"));

    // Register against the relay, reusing a persisted tunnel id so the
    // public URL survives restarts on either side.
    let store = StateStore::new(&client_config.state_path);
    let mut state = match store.load().await {
        Ok(state) => state,
        Err(e) => {
            warn!("Could not read state file, starting fresh: {e}");
            PersistedState::default()
        }
    };
    let suggested_id = state.tunnel.as_ref().map(|t| t.tunnel_id.clone());

    let registered = match register_tunnel(
        &client_config.relay_url,
        &client_config.registration_api_key,
        &client_config.laptop_name,
        suggested_id.as_deref(),
    )
    .await
    {
        Ok(registered) => registered,
        Err(e) => {
            error!("Tunnel registration failed: {e}");
            std::process::exit(1);
        }
    };
    info!(
        tunnel_id = %registered.tunnel_id,
        restored = registered.restored,
        "Tunnel registered, public URL: {}",
        registered.public_url
    );

    let created_at = state
        .tunnel
        .as_ref()
        .filter(|t| t.tunnel_id == registered.tunnel_id)
        .map_or_else(backhaul::util::now_ms, |t| t.created_at);
    state.tunnel = Some(StoredTunnel {
        tunnel_id: registered.tunnel_id.clone(),
        api_key: registered.api_key.clone(),
        public_url: registered.public_url.clone(),
        ws_url: registered.ws_url.clone(),
        created_at,
        laptop_name: client_config.laptop_name.clone(),
        extra: serde_json::Map::new(),
    });
    if let Err(e) = store.save(&mut state).await {
        warn!("Could not persist tunnel state: {e}");
    }

    info!(
        "Forwarding relayed requests to {}",
        client_config.local_forward
    );
    let mut options = ClientOptions::new(registered.ws_url, registered.api_key);
    options.client_auth_key = client_config.client_auth_key.clone();
    options.ping_interval = std::time::Duration::from_secs(client_config.ping_interval_secs);
    options.liveness_timeout =
        std::time::Duration::from_secs(client_config.liveness_timeout_secs);
    options.reconnect_max_delay =
        std::time::Duration::from_secs(client_config.reconnect_max_delay_secs);

    let hooks = ClientHooks {
        dispatcher: Arc::new(HttpForwarder::new(client_config.local_forward.clone())),
        terminal_sink: None,
        agent_sink: None,
    };
    let client = TunnelClient::new(options, hooks);
    let handle = client.spawn();

    tokio::signal::ctrl_c().await.ok();
    info!("Received SIGINT, disconnecting...");
    client.disconnect();
    let _ = handle.await;
    info!("Goodbye");
}
