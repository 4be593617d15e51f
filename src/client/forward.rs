//! [`LocalDispatcher`] that forwards relayed requests to a local HTTP
//! server — how the `connect` subcommand reaches the laptop's terminal,
//! agent, and speech handlers when the library is not embedded directly.

use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::dispatch::{LocalDispatcher, LocalRequest, LocalResponse};

/// Hop-by-hop or transport-owned headers that must not be replayed against
/// the local server.
const SKIPPED_HEADERS: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];

/// Forwards each [`LocalRequest`] to `{base_url}{path}?{query}`.
pub struct HttpForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
}

impl HttpForwarder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url: base_url.into(),
        }
    }
}

/// Compose the local URL from the forward base, the normalized path, and
/// the query map.
fn build_url(base_url: &str, path: &str, query: &HashMap<String, String>) -> Result<String, String> {
    let mut url = url::Url::parse(base_url).map_err(|e| format!("invalid forward base: {e}"))?;
    url.set_path(path);
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        // Sorted for a deterministic wire form.
        let mut entries: Vec<_> = query.iter().collect();
        entries.sort();
        for (k, v) in entries {
            pairs.append_pair(k, v);
        }
    }
    Ok(url.to_string())
}

impl LocalDispatcher for HttpForwarder {
    fn handle(&self, request: LocalRequest) -> BoxFuture<'static, LocalResponse> {
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        Box::pin(async move {
            let url = match build_url(&base_url, &request.path, &request.query) {
                Ok(url) => url,
                Err(message) => return LocalResponse::bad_gateway(message),
            };
            let method = Method::from_bytes(request.method.as_bytes()).unwrap_or(Method::GET);

            let mut builder = Request::builder().method(method).uri(&url);
            for (name, value) in &request.headers {
                if SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                    continue;
                }
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    builder = builder.header(name, value);
                }
            }

            let body_bytes = if request.body.is_null() {
                Bytes::new()
            } else {
                builder = builder.header("content-type", "application/json");
                Bytes::from(serde_json::to_vec(&request.body).unwrap_or_default())
            };

            let http_request = match builder.body(Full::new(body_bytes)) {
                Ok(r) => r,
                Err(e) => return LocalResponse::bad_gateway(format!("bad request: {e}")),
            };

            debug!(url = %url, "Forwarding relayed request to local server");
            let response = match client.request(http_request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Local forward failed: {e}");
                    return LocalResponse::bad_gateway(e.to_string());
                }
            };

            let status = response.status().as_u16();
            let bytes = match response.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => return LocalResponse::bad_gateway(format!("body read failed: {e}")),
            };
            let body: Value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                    json!({"raw": String::from_utf8_lossy(&bytes).to_string()})
                })
            };

            LocalResponse { status, body }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_joins_path_and_query() {
        let mut query = HashMap::new();
        query.insert("list".to_string(), "true".to_string());
        query.insert("path".to_string(), "/tmp/x y".to_string());
        let url = build_url("http://127.0.0.1:3000", "/terminal/list", &query).unwrap();
        assert_eq!(
            url,
            "http://127.0.0.1:3000/terminal/list?list=true&path=%2Ftmp%2Fx+y"
        );
    }

    #[test]
    fn test_build_url_without_query() {
        let url = build_url("http://127.0.0.1:3000", "/health", &HashMap::new()).unwrap();
        assert_eq!(url, "http://127.0.0.1:3000/health");
    }

    #[test]
    fn test_build_url_rejects_bad_base() {
        assert!(build_url("not a url", "/x", &HashMap::new()).is_err());
    }
}
