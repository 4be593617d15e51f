//! Contracts between the tunnel client and the embedding laptop process.
//!
//! The tunnel client never knows what a terminal, an agent planner, or a
//! speech vendor is — relayed requests go to a [`LocalDispatcher`], terminal
//! keystrokes to a [`TerminalInputSink`], and inbound envelope events to an
//! [`AgentEventSink`]. The `connect` subcommand wires a
//! [`super::forward::HttpForwarder`] as the dispatcher; embedders supply
//! their own.

use std::collections::HashMap;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::event::AgentEvent;

/// A relayed HTTP request, demultiplexed from the tunnel.
#[derive(Debug, Clone)]
pub struct LocalRequest {
    pub method: String,
    /// Normalized: leading slash guaranteed, double slashes collapsed.
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Value,
}

/// What the local handler answered; sent back as `http_response`.
#[derive(Debug, Clone)]
pub struct LocalResponse {
    pub status: u16,
    pub body: Value,
}

impl LocalResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn status(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            body: json!({"error": "NOT_FOUND", "message": "No such route"}),
        }
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: 502,
            body: json!({"error": "LOCAL_FORWARD_FAILED", "message": message.into()}),
        }
    }
}

/// Handles relayed HTTP requests on the laptop.
pub trait LocalDispatcher: Send + Sync + 'static {
    fn handle(&self, request: LocalRequest) -> BoxFuture<'static, LocalResponse>;
}

impl<F> LocalDispatcher for F
where
    F: Fn(LocalRequest) -> BoxFuture<'static, LocalResponse> + Send + Sync + 'static,
{
    fn handle(&self, request: LocalRequest) -> BoxFuture<'static, LocalResponse> {
        self(request)
    }
}

/// Receives `terminal_input` keystrokes forwarded from stream subscribers.
pub trait TerminalInputSink: Send + Sync + 'static {
    fn on_input(&self, session_id: &str, data: &str);
}

impl<F> TerminalInputSink for F
where
    F: Fn(&str, &str) + Send + Sync + 'static,
{
    fn on_input(&self, session_id: &str, data: &str) {
        self(session_id, data);
    }
}

/// Receives client-originated `AgentEvent`s forwarded over the tunnel.
pub trait AgentEventSink: Send + Sync + 'static {
    fn on_event(&self, event: AgentEvent);
}

impl<F> AgentEventSink for F
where
    F: Fn(AgentEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: AgentEvent) {
        self(event);
    }
}
