//! Redaction hook applied to the persisted copy of every tool response.
//!
//! The orchestrator never masks data itself; it hands the response and the
//! tool's declared paths to a [`Redactor`] supplied at configuration time.

use attestor_core::path::JsonPath;
use serde_json::Value;

/// Paths declared for redaction on one tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedactionPolicy {
    pub tool: String,
    pub paths: Vec<JsonPath>,
}

impl RedactionPolicy {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

pub trait Redactor: Send + Sync {
    /// Return the copy of `value` that may be persisted as evidence.
    fn redact(&self, value: &Value, policy: &RedactionPolicy) -> Value;
}

/// Identity redactor used when no hook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Redactor for PassThrough {
    fn redact(&self, value: &Value, _policy: &RedactionPolicy) -> Value {
        value.clone()
    }
}
