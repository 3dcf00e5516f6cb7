//! Errors that abort compilation or a run.
//!
//! Anything that goes wrong while evaluating a single rule is folded into
//! that rule's outcome instead; only the variants below stop the engine.

use attestor_core::types::RuleId;

/// The rule set cannot be turned into a plan. Nothing has executed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompilationError {
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Rule '{0}' is defined more than once")]
    DuplicateRule(RuleId),

    #[error("Tool '{0}' is bound more than once")]
    DuplicateTool(String),

    #[error("Rule '{rule}' references unknown field '{field}'")]
    UnknownField { rule: RuleId, field: String },

    #[error("Rule '{rule}' references unknown tool '{tool}'")]
    UnknownTool { rule: RuleId, tool: String },

    #[error("Rule '{rule}' depends on unknown rule '{dependency}'")]
    UnknownDependency { rule: RuleId, dependency: RuleId },

    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<RuleId> },
}

/// An internal invariant was violated during a run. Indicates a defect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Duplicate outcome for rule '{rule_id}' at {scope}")]
    DuplicateOutcome { rule_id: RuleId, scope: String },
}

/// Top-level error for [`Engine::execute`](crate::engine::Engine::execute).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Compilation(#[from] CompilationError),

    #[error(transparent)]
    Run(#[from] RunError),
}
