//! Check outcome types: the single terminal verdict per (rule, scope).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rule::Severity;
use crate::types::{RecordId, RuleId, Timestamp};

// ---------------------------------------------------------------------------
// CheckStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    #[serde(alias = "PASS")]
    Pass,
    #[serde(alias = "WARN")]
    Warn,
    #[serde(alias = "FAIL")]
    Fail,
    #[serde(alias = "INCOMPLETE")]
    Incomplete,
}

impl CheckStatus {
    /// Rollup rank: FAIL > WARN > INCOMPLETE > PASS.
    pub fn rank(&self) -> u8 {
        match self {
            CheckStatus::Pass => 0,
            CheckStatus::Incomplete => 1,
            CheckStatus::Warn => 2,
            CheckStatus::Fail => 3,
        }
    }

    /// The more severe of two statuses.
    pub fn max(self, other: CheckStatus) -> CheckStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
            CheckStatus::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// What a single check outcome is about: one record, or the batch as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Record(RecordId),
    Batch,
}

impl Scope {
    pub fn record_id(&self) -> Option<&str> {
        match self {
            Scope::Record(id) => Some(id),
            Scope::Batch => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Record(id) => write!(f, "record:{id}"),
            Scope::Batch => f.write_str("batch"),
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy and failure causes
// ---------------------------------------------------------------------------

/// Which evaluation strategy produced the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Deterministic,
    Tool,
    Semantic,
    /// Conditional rule whose trigger condition was false.
    Skipped,
}

/// Cause category reported when a check could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    ToolTimeout,
    ToolAuth,
    ToolUnavailable,
    ToolRateLimited,
    ToolRejected,
    JudgmentUnavailable,
    MalformedRule,
    MissingData,
    RuleTimeout,
    Cancelled,
    TaskFailed,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::ToolTimeout => "tool_timeout",
            FailureCause::ToolAuth => "tool_auth",
            FailureCause::ToolUnavailable => "tool_unavailable",
            FailureCause::ToolRateLimited => "tool_rate_limited",
            FailureCause::ToolRejected => "tool_rejected",
            FailureCause::JudgmentUnavailable => "judgment_unavailable",
            FailureCause::MalformedRule => "malformed_rule",
            FailureCause::MissingData => "missing_data",
            FailureCause::RuleTimeout => "rule_timeout",
            FailureCause::Cancelled => "cancelled",
            FailureCause::TaskFailed => "task_failed",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CheckOutcome
// ---------------------------------------------------------------------------

/// Terminal verdict of one rule for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub rule_id: RuleId,
    pub scope: Scope,
    pub status: CheckStatus,
    /// Severity used for rollup (after advisory capping).
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    pub started_at: Timestamp,
    pub duration_ms: u64,
}

impl CheckOutcome {
    /// An INCOMPLETE outcome with a cause category and explanation.
    pub fn incomplete(
        rule_id: impl Into<RuleId>,
        scope: Scope,
        severity: Severity,
        cause: FailureCause,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            scope,
            status: CheckStatus::Incomplete,
            severity,
            strategy: None,
            fallback_used: false,
            evidence_ref: None,
            explanation: Some(explanation.into()),
            cause: Some(cause),
            started_at: chrono::Utc::now(),
            duration_ms: 0,
        }
    }

    /// Key under which the outcome is unique within a run.
    pub fn key(&self) -> (RuleId, Scope) {
        (self.rule_id.clone(), self.scope.clone())
    }
}
