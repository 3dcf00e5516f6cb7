//! Validation request document.

use attestor_core::record::Record;
use attestor_core::rule::RuleSet;
use attestor_core::schema::Schema;
use attestor_core::types::RunId;
use attestor_tools::ToolConfig;
use serde::{Deserialize, Serialize};

use crate::config::{OutputPrefs, RuntimeConfig};

/// Everything needed for one run: data, schema, rules, tools and options.
///
/// ```json
/// {
///   "run_id": "run-42",
///   "data": [{"record_id": "r1", "payload": {"invoice_id": "INV-123"}}],
///   "schema": {"fields": [{"name": "invoice_id", "type": "string"}]},
///   "rules": {"version": "2024.1", "rules": [
///     {"id": "id_present", "type": "not_null", "field": "invoice_id"}
///   ]},
///   "tools": [],
///   "runtime": {"rule_timeout_ms": 5000},
///   "output_prefs": {"evidence": "all"}
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    /// Caller-supplied run id; a time-ordered uuid is assigned when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub data: Vec<Record>,
    #[serde(default)]
    pub schema: Schema,
    pub rules: RuleSet,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub output_prefs: OutputPrefs,
}

impl ValidationRequest {
    pub fn new(data: Vec<Record>, schema: Schema, rules: RuleSet) -> Self {
        Self {
            run_id: None,
            data,
            schema,
            rules,
            tools: Vec::new(),
            runtime: RuntimeConfig::default(),
            output_prefs: OutputPrefs::default(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolConfig>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_output_prefs(mut self, output_prefs: OutputPrefs) -> Self {
        self.output_prefs = output_prefs;
        self
    }
}
