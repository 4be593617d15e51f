//! Error taxonomy shared by every caller-visible surface.
//!
//! All HTTP errors leave the relay as `{"error": <code>, "message": <text>}`
//! with a stable code. Internal failures are logged with context and surface
//! as a bare 500 — no internal detail leaks to the caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Stable error codes seen by mobile clients and laptop operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Unknown `tunnelId`.
    TunnelNotFound,
    /// Wrong registration key, `apiKey`, or `clientAuthKey`.
    TunnelAuthError,
    /// Tunnel registered but no live WebSocket.
    TunnelConnectionError,
    /// Malformed request body or frame.
    InvalidRequest,
    /// Relayed request deadline exceeded.
    UpstreamTimeout,
    /// Anything else; details stay in the logs.
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TunnelNotFound => "TUNNEL_NOT_FOUND",
            Self::TunnelAuthError => "TUNNEL_AUTH_ERROR",
            Self::TunnelConnectionError => "TUNNEL_CONNECTION_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            Self::TunnelNotFound => StatusCode::NOT_FOUND,
            Self::TunnelAuthError => StatusCode::UNAUTHORIZED,
            Self::TunnelConnectionError => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A caller-visible error: stable code plus human-readable message.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn tunnel_not_found(tunnel_id: &str) -> Self {
        Self::new(
            ErrorCode::TunnelNotFound,
            format!("Tunnel '{tunnel_id}' not found"),
        )
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TunnelAuthError, message)
    }

    pub fn not_connected(tunnel_id: &str) -> Self {
        Self::new(
            ErrorCode::TunnelConnectionError,
            format!("Tunnel '{tunnel_id}' has no live connection"),
        )
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn timeout() -> Self {
        Self::new(
            ErrorCode::UpstreamTimeout,
            "Laptop did not respond in time",
        )
    }

    pub fn internal() -> Self {
        Self::new(ErrorCode::Internal, "Internal error")
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.code.status(),
            Json(json!({
                "error": self.code.as_str(),
                "message": self.message,
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_map_to_statuses() {
        assert_eq!(ErrorCode::TunnelNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::TunnelAuthError.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ErrorCode::TunnelConnectionError.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorCode::InvalidRequest.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::UpstreamTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_code_strings_are_stable() {
        assert_eq!(ErrorCode::TunnelNotFound.as_str(), "TUNNEL_NOT_FOUND");
        assert_eq!(ErrorCode::UpstreamTimeout.as_str(), "UPSTREAM_TIMEOUT");
    }
}
