//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TUNNEL_REGISTRATION_API_KEY`, `PORT`,
//!    `HOST`, `PUBLIC_HOST`, `PUBLIC_PROTOCOL`, `LOG_LEVEL` for the relay;
//!    `BACKHAUL_RELAY_URL`, `BACKHAUL_LOCAL_FORWARD`, `BACKHAUL_STATE_PATH`,
//!    `BACKHAUL_CLIENT_AUTH_KEY`, `BACKHAUL_LAPTOP_NAME` for the client.
//! 2. **Config file** — path via `--config <path>`, or `backhaul.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [relay]
//! host = "0.0.0.0"
//! port = 8000
//! registration_api_key = "your-secret-key"
//! public_host = "tunnel.example.com"   # optional, authority used in publicUrl
//! public_protocol = "https"            # http | https
//! request_timeout_secs = 60
//! ping_interval_secs = 20
//! liveness_timeout_secs = 30
//!
//! [client]
//! relay_url = "https://tunnel.example.com"
//! registration_api_key = "your-secret-key"
//! local_forward = "http://127.0.0.1:3000"
//! laptop_name = "dev-laptop"
//! state_path = "backhaul-state.json"
//! client_auth_key = "mobile-shared-secret"   # optional
//! reconnect_max_delay_secs = 30
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    /// Client-mode settings. Required for `backhaul connect`.
    pub client: Option<ClientConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Bind address (default `0.0.0.0`). Override with `HOST`.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port (default 8000). Override with `PORT`.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Process-wide key gating `POST /tunnel/create` and the admin listing.
    /// Required in relay mode. Override with `TUNNEL_REGISTRATION_API_KEY`.
    #[serde(default)]
    pub registration_api_key: String,
    /// Authority used when building `publicUrl`/`wsUrl` (e.g. behind a
    /// reverse proxy). Defaults to `host[:port]`. Override with `PUBLIC_HOST`.
    pub public_host: Option<String>,
    /// `http` or `https` (default `http`). Override with `PUBLIC_PROTOCOL`.
    /// The WebSocket scheme in `wsUrl` follows: `wss` iff `https`.
    #[serde(default = "default_public_protocol")]
    pub public_protocol: String,
    /// Wall-clock deadline for a relayed HTTP request in seconds (default 60).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Seconds between WebSocket pings (default 20).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Seconds without any inbound frame before a peer is declared dead
    /// (default 30).
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
    /// Maximum relayed request body size in bytes (default 10 MB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Maximum concurrent TCP connections (default 1024).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Tunnel client (laptop-side) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Relay base URL, e.g. `https://tunnel.example.com`.
    pub relay_url: String,
    /// Registration key for `POST /tunnel/create`.
    #[serde(default)]
    pub registration_api_key: String,
    /// Local HTTP handler that relayed requests are forwarded to
    /// (default `http://127.0.0.1:3000`).
    #[serde(default = "default_local_forward")]
    pub local_forward: String,
    /// Display name sent on tunnel creation (default the hostname, falling
    /// back to `laptop`).
    #[serde(default = "default_laptop_name")]
    pub laptop_name: String,
    /// Path of the persisted tunnel state document
    /// (default `backhaul-state.json`).
    #[serde(default = "default_state_path")]
    pub state_path: String,
    /// Optional key registered after connect; the relay then requires it from
    /// mobile clients on relayed requests and stream subscriptions.
    pub client_auth_key: Option<String>,
    /// Seconds between WebSocket pings (default 20).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Seconds without any inbound frame before the relay is declared dead
    /// (default 30).
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
    /// Cap on the exponential reconnect backoff in seconds (default 30).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `LOG_LEVEL` or
    /// `RUST_LOG` env vars.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_public_protocol() -> String {
    "http".to_string()
}
fn default_request_timeout() -> u64 {
    60
}
fn default_ping_interval() -> u64 {
    20
}
fn default_liveness_timeout() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10 MB
}
fn default_max_connections() -> usize {
    1024
}
fn default_local_forward() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_laptop_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "laptop".to_string())
}
fn default_state_path() -> String {
    "backhaul-state.json".to_string()
}
fn default_reconnect_max_delay() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            registration_api_key: String::new(),
            public_host: None,
            public_protocol: default_public_protocol(),
            request_timeout_secs: default_request_timeout(),
            ping_interval_secs: default_ping_interval(),
            liveness_timeout_secs: default_liveness_timeout(),
            max_body_bytes: default_max_body_bytes(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `backhaul.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("backhaul.toml").exists() {
            let content =
                std::fs::read_to_string("backhaul.toml").expect("Failed to read backhaul.toml");
            toml::from_str(&content).expect("Failed to parse backhaul.toml")
        } else {
            Config {
                relay: RelayConfig::default(),
                client: None,
                logging: LoggingConfig::default(),
            }
        };

        config.apply_env();
        config
    }

    /// Env var overrides, applied after the file layer.
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("TUNNEL_REGISTRATION_API_KEY") {
            self.relay.registration_api_key = key.clone();
            if let Some(client) = self.client.as_mut() {
                client.registration_api_key = key;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(parsed) = port.parse() {
                self.relay.port = parsed;
            }
        }
        if let Ok(host) = std::env::var("HOST") {
            self.relay.host = host;
        }
        if let Ok(public_host) = std::env::var("PUBLIC_HOST") {
            self.relay.public_host = Some(public_host);
        }
        if let Ok(protocol) = std::env::var("PUBLIC_PROTOCOL") {
            self.relay.public_protocol = protocol;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(client) = self.client.as_mut() {
            if let Ok(url) = std::env::var("BACKHAUL_RELAY_URL") {
                client.relay_url = url;
            }
            if let Ok(forward) = std::env::var("BACKHAUL_LOCAL_FORWARD") {
                client.local_forward = forward;
            }
            if let Ok(path) = std::env::var("BACKHAUL_STATE_PATH") {
                client.state_path = path;
            }
            if let Ok(key) = std::env::var("BACKHAUL_CLIENT_AUTH_KEY") {
                client.client_auth_key = Some(key);
            }
            if let Ok(name) = std::env::var("BACKHAUL_LAPTOP_NAME") {
                client.laptop_name = name;
            }
        }
    }

    /// Validate relay-mode settings. Returns human-readable errors; the
    /// binary logs each and exits non-zero when any are present.
    pub fn validate_relay(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.relay.registration_api_key.is_empty() {
            errors.push(
                "relay.registration_api_key is required (set TUNNEL_REGISTRATION_API_KEY)"
                    .to_string(),
            );
        }
        if !matches!(self.relay.public_protocol.as_str(), "http" | "https") {
            errors.push(format!(
                "relay.public_protocol must be 'http' or 'https', got '{}'",
                self.relay.public_protocol
            ));
        }
        if self.relay.request_timeout_secs == 0 {
            errors.push("relay.request_timeout_secs must be positive".to_string());
        }
        errors
    }

    /// Validate client-mode settings.
    pub fn validate_client(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match &self.client {
            None => errors.push("[client] section is required for connect mode".to_string()),
            Some(client) => {
                if client.relay_url.is_empty() {
                    errors.push("client.relay_url is required".to_string());
                }
                if client.registration_api_key.is_empty() {
                    errors.push(
                        "client.registration_api_key is required (set TUNNEL_REGISTRATION_API_KEY)"
                            .to_string(),
                    );
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.relay.host, "0.0.0.0");
        assert_eq!(config.relay.port, 8000);
        assert_eq!(config.relay.public_protocol, "http");
        assert_eq!(config.relay.request_timeout_secs, 60);
        assert_eq!(config.relay.ping_interval_secs, 20);
        assert_eq!(config.relay.liveness_timeout_secs, 30);
        assert!(config.client.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_full_file() {
        let config: Config = toml::from_str(
            r#"
            [relay]
            port = 9000
            registration_api_key = "reg"
            public_host = "tunnel.example.com"
            public_protocol = "https"

            [client]
            relay_url = "https://tunnel.example.com"
            registration_api_key = "reg"
            client_auth_key = "mobile"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.relay.public_host.as_deref(), Some("tunnel.example.com"));
        let client = config.client.unwrap();
        assert_eq!(client.relay_url, "https://tunnel.example.com");
        assert_eq!(client.client_auth_key.as_deref(), Some("mobile"));
        assert_eq!(client.reconnect_max_delay_secs, 30);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validate_relay_requires_registration_key() {
        let config: Config = toml::from_str("").unwrap();
        let errors = config.validate_relay();
        assert!(errors.iter().any(|e| e.contains("registration_api_key")));
    }

    #[test]
    fn test_validate_relay_rejects_bad_protocol() {
        let config: Config = toml::from_str(
            r#"
            [relay]
            registration_api_key = "reg"
            public_protocol = "gopher"
            "#,
        )
        .unwrap();
        let errors = config.validate_relay();
        assert!(errors.iter().any(|e| e.contains("public_protocol")));
    }

    #[test]
    fn test_validate_client_requires_section() {
        let config: Config = toml::from_str("").unwrap();
        assert!(!config.validate_client().is_empty());
    }
}
