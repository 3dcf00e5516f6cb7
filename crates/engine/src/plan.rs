//! Compiled execution plan.

use std::collections::HashMap;
use std::sync::Arc;

use attestor_core::rule::{RuleDef, RuleLevel, Severity};
use attestor_core::schema::Schema;
use attestor_core::types::RuleId;
use attestor_tools::ToolConfig;
use regex::Regex;

use crate::config::RuntimeConfig;

/// How a rule maps onto scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fanout {
    /// One evaluation per record.
    PerRecord,
    /// One evaluation over the batch view, scope `batch`.
    Batch,
    /// One evaluation over the batch, one outcome per record.
    BatchToRecords,
}

#[derive(Debug)]
pub struct CompiledRule {
    pub def: RuleDef,
    /// Severity used for rollup; advisory semantic rules are capped at WARN.
    pub effective_severity: Severity,
    /// Position in the global precedence order.
    pub precedence: usize,
    pub fanout: Fanout,
}

impl CompiledRule {
    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub fn rule_timeout(&self, runtime: &RuntimeConfig) -> std::time::Duration {
        std::time::Duration::from_millis(self.def.timeout_ms.unwrap_or(runtime.rule_timeout_ms))
    }
}

/// Rules whose dependencies are all satisfied by earlier groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionGroup {
    pub index: usize,
    /// Member rule ids in precedence order.
    pub rules: Vec<RuleId>,
}

/// Immutable output of [`compile`](crate::compile::compile).
#[derive(Debug)]
pub struct Plan {
    pub rule_set_version: String,
    pub schema: Schema,
    pub tools: Vec<ToolConfig>,
    pub runtime: RuntimeConfig,
    pub groups: Vec<ExecutionGroup>,
    rules: HashMap<RuleId, Arc<CompiledRule>>,
    /// Every pattern used by the plan; invalid ones keep their error text.
    patterns: HashMap<String, Result<Regex, String>>,
}

impl Plan {
    pub(crate) fn new(
        rule_set_version: String,
        schema: Schema,
        tools: Vec<ToolConfig>,
        runtime: RuntimeConfig,
        groups: Vec<ExecutionGroup>,
        rules: HashMap<RuleId, Arc<CompiledRule>>,
        patterns: HashMap<String, Result<Regex, String>>,
    ) -> Self {
        Self {
            rule_set_version,
            schema,
            tools,
            runtime,
            groups,
            rules,
            patterns,
        }
    }

    pub fn rule(&self, id: &str) -> Option<&Arc<CompiledRule>> {
        self.rules.get(id)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Precompiled regex for `pattern`, or the compile error message.
    pub fn pattern(&self, pattern: &str) -> Option<&Result<Regex, String>> {
        self.patterns.get(pattern)
    }

    /// Rule ids across all groups, in execution order.
    pub fn ordered_rules(&self) -> impl Iterator<Item = &Arc<CompiledRule>> {
        self.groups
            .iter()
            .flat_map(|g| g.rules.iter())
            .filter_map(|id| self.rules.get(id))
    }
}

impl Fanout {
    pub fn of(def: &RuleDef) -> Self {
        if def.kind.is_unique() {
            Fanout::BatchToRecords
        } else if def.level == RuleLevel::Batch {
            Fanout::Batch
        } else {
            Fanout::PerRecord
        }
    }
}
