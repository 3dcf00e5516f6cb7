//! Transport and orchestration errors.

use attestor_core::outcome::FailureCause;

/// Failure reported by a [`ToolDriver`](crate::driver::ToolDriver) for a
/// single attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The attempt did not complete within the tool timeout.
    #[error("Call timed out")]
    Timeout,

    /// Credentials were missing or rejected (401/403-equivalent).
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The remote system is down or failing (5xx-equivalent, connect error).
    #[error("Tool unavailable: {0}")]
    Unavailable(String),

    /// The remote system asked the caller to slow down (429-equivalent).
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The request itself was refused (other 4xx-equivalent, bad input).
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout | TransportError::Unavailable(_) | TransportError::RateLimited(_)
        )
    }

    /// Whether the failure says something about the tool's health.
    ///
    /// A rejected request is the caller's fault and does not count towards
    /// the circuit breaker's error rate.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

/// Error surfaced to the rule evaluator once the orchestrator has exhausted
/// retries or refused the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("Tool '{tool}' timed out after {attempts} attempt(s)")]
    Timeout { tool: String, attempts: u32 },

    #[error("Tool '{tool}' rejected credentials: {message}")]
    Auth { tool: String, message: String },

    #[error("Tool '{tool}' unavailable: {message}")]
    Unavailable { tool: String, message: String },

    #[error("Tool '{tool}' rate limited: {message}")]
    RateLimited { tool: String, message: String },

    #[error("Tool '{tool}' rejected the request: {message}")]
    Rejected { tool: String, message: String },

    #[error("Unknown tool '{0}'")]
    UnknownTool(String),
}

impl ToolError {
    pub(crate) fn from_transport(tool: &str, err: TransportError, attempts: u32) -> Self {
        let tool = tool.to_string();
        match err {
            TransportError::Timeout => ToolError::Timeout { tool, attempts },
            TransportError::Auth(message) => ToolError::Auth { tool, message },
            TransportError::Unavailable(message) => ToolError::Unavailable { tool, message },
            TransportError::RateLimited(message) => ToolError::RateLimited { tool, message },
            TransportError::Rejected(message) => ToolError::Rejected { tool, message },
        }
    }

    /// Short machine-readable code, used in events.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::Timeout { .. } => "timeout",
            ToolError::Auth { .. } => "auth",
            ToolError::Unavailable { .. } => "unavailable",
            ToolError::RateLimited { .. } => "rate_limited",
            ToolError::Rejected { .. } => "rejected",
            ToolError::UnknownTool(_) => "unknown_tool",
        }
    }

    /// Cause category recorded on an INCOMPLETE outcome.
    pub fn cause(&self) -> FailureCause {
        match self {
            ToolError::Timeout { .. } => FailureCause::ToolTimeout,
            ToolError::Auth { .. } => FailureCause::ToolAuth,
            ToolError::Unavailable { .. } | ToolError::UnknownTool(_) => {
                FailureCause::ToolUnavailable
            }
            ToolError::RateLimited { .. } => FailureCause::ToolRateLimited,
            ToolError::Rejected { .. } => FailureCause::ToolRejected,
        }
    }
}
