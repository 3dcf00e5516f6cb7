//! Shared fixtures: an in-memory invoice system and a canned judge.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use attestor_engine::{Engine, Judgment, JudgmentError, JudgmentService, ValidationRequest};
use attestor_tools::{DriverRegistry, ToolConfig, ToolDriver, ToolKind, TransportError};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Invoice system driver
// ---------------------------------------------------------------------------

/// Answers `{"invoice_id": ...}` lookups from a fixed table.
pub struct InvoiceSystem {
    invoices: HashMap<String, Value>,
    /// Transient failures returned before the first success.
    fail_first: AtomicU32,
    /// Calls after the transient failures that stall for an hour.
    stalls: AtomicU32,
    /// Error returned on every call when set.
    always: Option<TransportError>,
    delay: Duration,
    calls: AtomicU32,
}

impl InvoiceSystem {
    pub fn new(invoices: &[(&str, Value)]) -> Self {
        Self {
            invoices: invoices
                .iter()
                .map(|(id, v)| (id.to_string(), v.clone()))
                .collect(),
            fail_first: AtomicU32::new(0),
            stalls: AtomicU32::new(0),
            always: None,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing_first(self, n: u32) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn stalling(self, n: u32) -> Self {
        self.stalls.store(n, Ordering::SeqCst);
        self
    }

    pub fn always_failing(mut self, error: TransportError) -> Self {
        self.always = Some(error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolDriver for InvoiceSystem {
    async fn call(&self, _tool: &ToolConfig, request: &Value) -> Result<Value, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(error) = &self.always {
            return Err(error.clone());
        }
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Unavailable("HTTP 503".into()));
        }
        let stalls = self.stalls.load(Ordering::SeqCst);
        if stalls > 0 {
            self.stalls.store(stalls - 1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let id = request["invoice_id"].as_str().unwrap_or_default();
        self.invoices
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::Rejected(format!("unknown invoice {id}")))
    }
}

// ---------------------------------------------------------------------------
// Judge
// ---------------------------------------------------------------------------

pub struct CannedJudge {
    answer: String,
    confidence: Option<f64>,
    calls: AtomicU32,
}

impl CannedJudge {
    pub fn new(answer: &str, confidence: Option<f64>) -> Self {
        Self {
            answer: answer.to_string(),
            confidence,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JudgmentService for CannedJudge {
    async fn judge(&self, _prompt: &str, _context: &Value) -> Result<Judgment, JudgmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Judgment::new(self.answer.clone(), self.confidence))
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn engine_with(system: Arc<InvoiceSystem>) -> Engine {
    let mut drivers = DriverRegistry::new();
    drivers.register_kind(ToolKind::Http, system);
    Engine::new(drivers)
}

pub fn invoice_schema() -> Value {
    json!({"fields": [
        {"name": "invoice_id", "type": "string", "required": true},
        {"name": "amount", "type": "number"},
        {"name": "currency", "type": "string"},
        {"name": "po_number", "type": "string"},
        {"name": "description", "type": "string"}
    ]})
}

pub fn erp_tool() -> Value {
    json!({"name": "erp", "kind": "http", "connection": "http://erp.test"})
}

/// The cross-system amount check against the `erp` tool.
pub fn amount_matches_erp() -> Value {
    json!({
        "id": "amount_matches_erp",
        "type": "cross_system",
        "lookup": {"tool": "erp", "request": {"invoice_id": "{{invoice_id}}"}},
        "assert": {"path": "amount", "operator": "approx", "tolerance": 0.01, "compare_to": "amount"}
    })
}

pub fn request(data: Value, rules: Value, tools: Value, runtime: Value) -> ValidationRequest {
    serde_json::from_value(json!({
        "run_id": "run-test",
        "data": data,
        "schema": invoice_schema(),
        "rules": {"version": "2024.06", "rules": rules},
        "tools": tools,
        "runtime": runtime,
        "output_prefs": {"evidence": "all"}
    }))
    .expect("valid request")
}

pub fn fast_runtime() -> Value {
    json!({
        "tool_timeout_ms": 1000,
        "backoff_initial_ms": 10,
        "backoff_max_ms": 50,
        "rule_timeout_ms": 10000
    })
}
