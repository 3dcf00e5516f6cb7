//! Run result document.

use attestor_core::aggregate::Summary;
use attestor_core::outcome::{CheckOutcome, CheckStatus, Scope};
use attestor_core::types::{RecordId, RunId, Timestamp};
use serde::{Deserialize, Serialize};

/// Outcomes for one record, ordered by rule id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordResult {
    pub record_id: RecordId,
    pub status: CheckStatus,
    pub checks: Vec<CheckOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    /// `urn:attestor:report:<run_id>`
    pub report: String,
    /// Evidence urns recorded during the run, sorted.
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub latency_ms: u64,
    pub checks: usize,
    pub tool_calls: u64,
    pub tool_retries: u64,
    pub cache_hits: u64,
    pub breaker_rejections: u64,
    pub judgment_calls: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub rule_set_version: String,
    pub status: CheckStatus,
    /// Set when the run was cancelled before every check settled.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    pub summary: Summary,
    /// One entry per input record, in batch order.
    pub results: Vec<RecordResult>,
    /// Batch-scoped outcomes, ordered by rule id.
    pub batch_checks: Vec<CheckOutcome>,
    pub artifacts: Artifacts,
    pub metrics: Metrics,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

pub fn report_urn(run_id: &str) -> String {
    format!("urn:attestor:report:{run_id}")
}

impl RunResult {
    pub fn record(&self, record_id: &str) -> Option<&RecordResult> {
        self.results.iter().find(|r| r.record_id == record_id)
    }

    /// The outcome of `rule_id` for `scope`, if one was produced.
    pub fn check(&self, rule_id: &str, scope: &Scope) -> Option<&CheckOutcome> {
        let checks = match scope {
            Scope::Record(id) => &self.record(id)?.checks,
            Scope::Batch => &self.batch_checks,
        };
        checks.iter().find(|c| c.rule_id == rule_id)
    }

    /// Every outcome in the document: record checks first, then batch checks.
    pub fn outcomes(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.results
            .iter()
            .flat_map(|r| r.checks.iter())
            .chain(self.batch_checks.iter())
    }
}
