//! Small shared helpers: wall-clock timestamps, public URL construction,
//! and secret redaction for logs.

use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Build the authority (`host[:port]`) part of the relay's public URLs.
///
/// When `public_host` is set it is used verbatim (it may carry its own port,
/// e.g. behind a reverse proxy). Otherwise the listen host and port are used,
/// with the port elided when it is the default for the protocol (80 for http,
/// 443 for https).
fn public_authority(protocol: &str, host: &str, port: u16, public_host: Option<&str>) -> String {
    if let Some(public) = public_host {
        return public.to_string();
    }
    let default_port = if protocol == "https" { 443 } else { 80 };
    if port == default_port {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

/// `publicUrl` for a tunnel: `{protocol}://{authority}/api/{tunnelId}`.
pub fn public_url(
    protocol: &str,
    host: &str,
    port: u16,
    public_host: Option<&str>,
    tunnel_id: &str,
) -> String {
    let authority = public_authority(protocol, host, port, public_host);
    format!("{protocol}://{authority}/api/{tunnel_id}")
}

/// `wsUrl` for a tunnel: `{ws-protocol}://{authority}/tunnel/{tunnelId}`.
/// The WebSocket scheme is `wss` iff the public protocol is `https`.
pub fn ws_url(
    protocol: &str,
    host: &str,
    port: u16,
    public_host: Option<&str>,
    tunnel_id: &str,
) -> String {
    let ws_protocol = if protocol == "https" { "wss" } else { "ws" };
    let authority = public_authority(protocol, host, port, public_host);
    format!("{ws_protocol}://{authority}/tunnel/{tunnel_id}")
}

/// Key names whose values must never reach the logs.
const SECRET_KEYS: &[&str] = &[
    "apikey",
    "api_key",
    "token",
    "password",
    "authkey",
    "auth_key",
    "secret",
    "registrationapikey",
    "clientauthkey",
    "key",
];

/// True when `key` names a credential field.
pub fn is_secret_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SECRET_KEYS.contains(&lowered.as_str())
}

/// Return a copy of `value` with every credential field masked, recursively.
/// Used whenever a frame or config value is logged at debug.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                if is_secret_key(k) {
                    out.insert(k.clone(), Value::String("***".to_string()));
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_public_url_elides_default_port() {
        assert_eq!(
            public_url("https", "relay.example.com", 443, None, "t1"),
            "https://relay.example.com/api/t1"
        );
        assert_eq!(
            public_url("http", "relay.example.com", 80, None, "t1"),
            "http://relay.example.com/api/t1"
        );
    }

    #[test]
    fn test_public_url_keeps_nonstandard_port() {
        assert_eq!(
            public_url("http", "0.0.0.0", 8000, None, "t1"),
            "http://0.0.0.0:8000/api/t1"
        );
        assert_eq!(
            public_url("https", "relay.example.com", 8443, None, "t1"),
            "https://relay.example.com:8443/api/t1"
        );
    }

    #[test]
    fn test_public_host_used_verbatim() {
        assert_eq!(
            public_url("https", "0.0.0.0", 8000, Some("tunnel.example.com"), "t1"),
            "https://tunnel.example.com/api/t1"
        );
    }

    #[test]
    fn test_ws_url_scheme_follows_protocol() {
        assert_eq!(
            ws_url("https", "relay.example.com", 443, None, "t1"),
            "wss://relay.example.com/tunnel/t1"
        );
        assert_eq!(
            ws_url("http", "localhost", 8000, None, "t1"),
            "ws://localhost:8000/tunnel/t1"
        );
    }

    #[test]
    fn test_redact_masks_secret_keys() {
        let value = json!({
            "apiKey": "sk-123",
            "name": "laptop-1",
            "nested": {"client_auth_key": "abc", "token": "t", "data": "ok"},
            "list": [{"password": "p"}],
        });
        let redacted = redact(&value);
        assert_eq!(redacted["apiKey"], "***");
        assert_eq!(redacted["name"], "laptop-1");
        assert_eq!(redacted["nested"]["client_auth_key"], "***");
        assert_eq!(redacted["nested"]["token"], "***");
        assert_eq!(redacted["nested"]["data"], "ok");
        assert_eq!(redacted["list"][0]["password"], "***");
    }

    #[test]
    fn test_now_ms_is_recent() {
        // Any date after 2024-01-01 counts as sane here.
        assert!(now_ms() > 1_704_000_000_000);
    }
}
