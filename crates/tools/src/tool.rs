//! Tool registry bindings.

use std::fmt;
use std::time::Duration;

use attestor_core::path::JsonPath;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Http,
    Sql,
    Rpa,
    File,
    Cache,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Http => "http",
            ToolKind::Sql => "sql",
            ToolKind::Rpa => "rpa",
            ToolKind::File => "file",
            ToolKind::Cache => "cache",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding of a tool name to a driver kind and its call limits.
///
/// Unset limits fall back to the run-wide defaults in
/// [`OrchestratorSettings`](crate::orchestrator::OrchestratorSettings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    pub kind: ToolKind,
    /// Opaque connection handle (base URL, fixture directory, DSN alias).
    /// Secrets are resolved outside the engine.
    #[serde(default)]
    pub connection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Per-tool inflight limit, applied on top of the per-run limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inflight: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
    /// `0` disables caching for this tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_ms: Option<u64>,
    /// Response paths stripped from the persisted evidence copy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redact: Vec<JsonPath>,
}

impl ToolConfig {
    pub fn new(name: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            name: name.into(),
            kind,
            connection: String::new(),
            timeout_ms: None,
            retries: None,
            max_inflight: None,
            queue_depth: None,
            cache_ttl_ms: None,
            redact: Vec::new(),
        }
    }

    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = Some(max_inflight);
        self
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = Some(queue_depth);
        self
    }

    pub fn with_cache_ttl_ms(mut self, cache_ttl_ms: u64) -> Self {
        self.cache_ttl_ms = Some(cache_ttl_ms);
        self
    }

    pub fn with_redact(mut self, paths: Vec<JsonPath>) -> Self {
        self.redact = paths;
        self
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_ms.map(Duration::from_millis)
    }
}
