//! Rule definitions.
//!
//! A [`RuleDef`] pairs identity and rollup metadata with a [`RuleKind`], a
//! closed sum type tagged by `"type"` on the wire. Adding a rule type means
//! adding a variant here and a handler in the evaluator's dispatch table;
//! nothing else branches on the kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operators::Operator;
use crate::outcome::CheckStatus;
use crate::path::JsonPath;
use crate::schema::FieldType;
use crate::template;
use crate::types::RuleId;

// ---------------------------------------------------------------------------
// Severity and level
// ---------------------------------------------------------------------------

/// Declared importance of a rule. Ordered `Info < Warn < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(alias = "INFO")]
    Info,
    #[serde(alias = "WARN", alias = "warning")]
    Warn,
    #[serde(alias = "ERROR")]
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleLevel {
    Field,
    Record,
    Batch,
}

// ---------------------------------------------------------------------------
// Rule parameters
// ---------------------------------------------------------------------------

/// External lookup issued by a `cross_system` rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lookup {
    pub tool: String,
    /// Request template; `{{path}}` placeholders bind to the record.
    #[serde(default)]
    pub request: Value,
}

/// Assertion applied to a tool response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    /// Path into the tool response.
    pub path: JsonPath,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
    /// Record path holding the expected value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare_to: Option<JsonPath>,
    /// Literal expected value, used when `compare_to` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Parameters of a `semantic` rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticCheck {
    /// Prompt template; `{{path}}` placeholders bind to the record.
    pub prompt: String,
    #[serde(default)]
    pub context_fields: Vec<JsonPath>,
    #[serde(default = "default_pass_answers")]
    pub pass_answers: Vec<String>,
    #[serde(default = "default_fail_answers")]
    pub fail_answers: Vec<String>,
    /// Minimum confidence for a categorical answer to count; falls back to
    /// the runtime default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Advisory checks never escalate past WARN in the rollup.
    #[serde(default = "default_true")]
    pub advisory: bool,
}

fn default_pass_answers() -> Vec<String> {
    vec!["yes".into(), "pass".into(), "true".into()]
}

fn default_fail_answers() -> Vec<String> {
    vec!["no".into(), "fail".into(), "false".into()]
}

fn default_true() -> bool {
    true
}

fn default_condition_statuses() -> Vec<CheckStatus> {
    vec![CheckStatus::Pass]
}

/// Trigger of a `conditional` rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// True when the prior outcome of `rule` (same record, or the batch) is
    /// one of `statuses`.
    Outcome {
        rule: RuleId,
        #[serde(default = "default_condition_statuses")]
        statuses: Vec<CheckStatus>,
    },
    /// True when the operator holds for the selected record value.
    Assert {
        path: JsonPath,
        operator: Operator,
        #[serde(default)]
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tolerance: Option<f64>,
    },
    /// True when the embedded check passes.
    Check { check: Box<RuleKind> },
    All { of: Vec<Condition> },
    Any { of: Vec<Condition> },
    Not { of: Box<Condition> },
}

impl Condition {
    fn visit<'a>(&'a self, f: &mut dyn FnMut(ConditionRef<'a>)) {
        match self {
            Condition::Outcome { rule, .. } => f(ConditionRef::Outcome(rule)),
            Condition::Assert { path, .. } => f(ConditionRef::Path(path)),
            Condition::Check { check } => f(ConditionRef::Kind(check)),
            Condition::All { of } | Condition::Any { of } => {
                of.iter().for_each(|c| c.visit(f));
            }
            Condition::Not { of } => of.visit(f),
        }
    }

    pub fn may_suspend(&self) -> bool {
        let mut suspends = false;
        self.visit(&mut |r| {
            if let ConditionRef::Kind(kind) = r {
                suspends |= kind.may_suspend();
            }
        });
        suspends
    }
}

enum ConditionRef<'a> {
    Outcome(&'a RuleId),
    Path(&'a JsonPath),
    Kind(&'a RuleKind),
}

// ---------------------------------------------------------------------------
// RuleKind
// ---------------------------------------------------------------------------

/// Broad evaluation strategy implied by a rule kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyClass {
    Deterministic,
    Tool,
    Semantic,
    Conditional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    NotNull {
        field: JsonPath,
    },
    Pattern {
        field: JsonPath,
        pattern: String,
    },
    Range {
        field: JsonPath,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Enum {
        field: JsonPath,
        values: Vec<Value>,
    },
    Unique {
        fields: Vec<JsonPath>,
    },
    TypeCheck {
        field: JsonPath,
        expected: FieldType,
    },
    Conditional {
        when: Condition,
        then: Box<RuleKind>,
    },
    CrossField {
        left: JsonPath,
        operator: Operator,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        right: Option<JsonPath>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tolerance: Option<f64>,
    },
    CrossSystem {
        lookup: Lookup,
        #[serde(rename = "assert")]
        assertion: Assertion,
    },
    Semantic(SemanticCheck),
}

impl RuleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleKind::NotNull { .. } => "not_null",
            RuleKind::Pattern { .. } => "pattern",
            RuleKind::Range { .. } => "range",
            RuleKind::Enum { .. } => "enum",
            RuleKind::Unique { .. } => "unique",
            RuleKind::TypeCheck { .. } => "type_check",
            RuleKind::Conditional { .. } => "conditional",
            RuleKind::CrossField { .. } => "cross_field",
            RuleKind::CrossSystem { .. } => "cross_system",
            RuleKind::Semantic(_) => "semantic",
        }
    }

    pub fn strategy_class(&self) -> StrategyClass {
        match self {
            RuleKind::CrossSystem { .. } => StrategyClass::Tool,
            RuleKind::Semantic(_) => StrategyClass::Semantic,
            RuleKind::Conditional { .. } => StrategyClass::Conditional,
            _ => StrategyClass::Deterministic,
        }
    }

    /// Whether evaluation may await an external call.
    pub fn may_suspend(&self) -> bool {
        match self {
            RuleKind::CrossSystem { .. } | RuleKind::Semantic(_) => true,
            RuleKind::Conditional { when, then } => when.may_suspend() || then.may_suspend(),
            _ => false,
        }
    }

    pub fn is_unique(&self) -> bool {
        matches!(self, RuleKind::Unique { .. })
    }

    /// Record paths the kind reads, including template placeholders.
    pub fn record_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_record_paths(&mut paths);
        paths
    }

    fn collect_record_paths(&self, out: &mut Vec<String>) {
        match self {
            RuleKind::NotNull { field }
            | RuleKind::Pattern { field, .. }
            | RuleKind::Range { field, .. }
            | RuleKind::Enum { field, .. }
            | RuleKind::TypeCheck { field, .. } => out.push(field.to_string()),
            RuleKind::Unique { fields } => out.extend(fields.iter().map(|f| f.to_string())),
            RuleKind::Conditional { when, then } => {
                when.visit(&mut |r| match r {
                    ConditionRef::Path(p) => out.push(p.to_string()),
                    ConditionRef::Kind(k) => k.collect_record_paths(out),
                    ConditionRef::Outcome(_) => {}
                });
                then.collect_record_paths(out);
            }
            RuleKind::CrossField { left, right, .. } => {
                out.push(left.to_string());
                if let Some(right) = right {
                    out.push(right.to_string());
                }
            }
            RuleKind::CrossSystem { lookup, assertion } => {
                out.extend(template::placeholders(&lookup.request));
                if let Some(compare_to) = &assertion.compare_to {
                    out.push(compare_to.to_string());
                }
            }
            RuleKind::Semantic(check) => {
                out.extend(template::placeholders_in(&check.prompt));
                out.extend(check.context_fields.iter().map(|f| f.to_string()));
            }
        }
    }

    /// Tool names referenced by the kind, including nested conditions.
    pub fn tools(&self) -> Vec<&str> {
        let mut tools = Vec::new();
        self.collect_tools(&mut tools);
        tools
    }

    fn collect_tools<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            RuleKind::CrossSystem { lookup, .. } => out.push(&lookup.tool),
            RuleKind::Conditional { when, then } => {
                when.visit(&mut |r| {
                    if let ConditionRef::Kind(k) = r {
                        k.collect_tools(out);
                    }
                });
                then.collect_tools(out);
            }
            _ => {}
        }
    }

    /// Rule ids whose outcomes feed a condition of this kind.
    pub fn outcome_refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        self.collect_outcome_refs(&mut refs);
        refs
    }

    fn collect_outcome_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        if let RuleKind::Conditional { when, then } = self {
            when.visit(&mut |r| match r {
                ConditionRef::Outcome(rule) => out.push(rule),
                ConditionRef::Kind(k) => k.collect_outcome_refs(out),
                ConditionRef::Path(_) => {}
            });
            then.collect_outcome_refs(out);
        }
    }

    /// Regex patterns used by pattern checks, including nested ones.
    pub fn patterns(&self) -> Vec<&str> {
        let mut patterns = Vec::new();
        self.collect_patterns(&mut patterns);
        patterns
    }

    fn collect_patterns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            RuleKind::Pattern { pattern, .. } => out.push(pattern),
            RuleKind::Conditional { when, then } => {
                when.visit(&mut |r| {
                    if let ConditionRef::Kind(k) = r {
                        k.collect_patterns(out);
                    }
                });
                then.collect_patterns(out);
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// RuleDef and RuleSet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDef {
    pub id: RuleId,
    #[serde(default = "default_level")]
    pub level: RuleLevel,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    /// Explicit precedence; lower runs first within a group.
    #[serde(default)]
    pub order: i32,
    #[serde(flatten)]
    pub kind: RuleKind,
    /// Strategy to retry with when the declared one cannot complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<RuleKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<RuleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_level() -> RuleLevel {
    RuleLevel::Record
}

fn default_severity() -> Severity {
    Severity::Error
}

impl RuleDef {
    pub fn new(id: impl Into<RuleId>, kind: RuleKind) -> Self {
        Self {
            id: id.into(),
            level: default_level(),
            severity: default_severity(),
            order: 0,
            kind,
            fallback: None,
            depends_on: Vec::new(),
            timeout_ms: None,
            description: None,
        }
    }

    pub fn with_level(mut self, level: RuleLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_fallback(mut self, fallback: RuleKind) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Immutable, versioned unit of rules; a run binds to exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub rules: Vec<RuleDef>,
}

fn default_version() -> String {
    "unversioned".to_string()
}

impl RuleSet {
    pub fn new(version: impl Into<String>, rules: Vec<RuleDef>) -> Self {
        Self {
            version: version.into(),
            rules,
        }
    }
}
