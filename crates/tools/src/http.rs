//! Reference HTTP driver backed by `reqwest`.
//!
//! Request shape:
//!
//! ```json
//! { "method": "GET", "url": "https://...", "path": "/invoices/INV-1",
//!   "headers": { "Accept": "application/json" }, "body_json": { ... } }
//! ```
//!
//! `path` is appended to the tool's `connection` when `url` is absent. The
//! response is `{ "http_status": 200, "body": "<text, truncated>",
//! "json": <parsed body, when it is valid JSON> }`.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::driver::ToolDriver;
use crate::error::TransportError;
use crate::tool::ToolConfig;

/// Maximum number of body characters kept in the response.
const MAX_BODY_CHARS: usize = 5_000;

pub struct HttpDriver {
    client: reqwest::Client,
}

impl HttpDriver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolDriver for HttpDriver {
    async fn call(&self, tool: &ToolConfig, request: &Value) -> Result<Value, TransportError> {
        let url = resolve_url(tool, request)?;
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| TransportError::Rejected(format!("Invalid HTTP method '{method}'")))?;

        let mut builder = self.client.request(method, &url);
        if let Some(headers) = request.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                builder = builder.header(name.as_str(), value);
            }
        }
        if let Some(body) = request.get("body_json") {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify_reqwest)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(classify_reqwest)?;

        tracing::debug!(tool = %tool.name, url = %url, status, "HTTP tool call completed");

        if let Some(err) = classify_status(status, &text) {
            return Err(err);
        }

        let mut out = json!({
            "http_status": status,
            "body": truncate(&text, MAX_BODY_CHARS),
        });
        if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
            out["json"] = parsed;
        }
        Ok(out)
    }
}

fn resolve_url(tool: &ToolConfig, request: &Value) -> Result<String, TransportError> {
    if let Some(url) = request.get("url").and_then(Value::as_str) {
        return Ok(url.to_string());
    }
    if tool.connection.is_empty() {
        return Err(TransportError::Rejected(format!(
            "Tool '{}' has no connection and the request has no url",
            tool.name
        )));
    }
    let path = request.get("path").and_then(Value::as_str).unwrap_or("");
    Ok(format!(
        "{}/{}",
        tool.connection.trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

fn classify_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() {
        TransportError::Rejected(err.to_string())
    } else {
        TransportError::Unavailable(err.to_string())
    }
}

/// Map a non-success status to a transport error.
fn classify_status(status: u16, body: &str) -> Option<TransportError> {
    let detail = || format!("HTTP {status}: {}", truncate(body, 200));
    match status {
        200..=399 => None,
        401 | 403 => Some(TransportError::Auth(detail())),
        408 => Some(TransportError::Timeout),
        429 => Some(TransportError::RateLimited(detail())),
        400..=499 => Some(TransportError::Rejected(detail())),
        _ => Some(TransportError::Unavailable(detail())),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
