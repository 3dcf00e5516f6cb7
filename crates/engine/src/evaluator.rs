//! Rule evaluator: turns one `(rule, scope)` pair into a [`CheckOutcome`].
//!
//! Evaluation is an explicit state machine:
//!
//! ```text
//! Select -> Run --ok--> Done
//!             \--failed--> Fallback --declared--> Select (fallback kind)
//!                                   \--none-----> Done (INCOMPLETE)
//! ```
//!
//! A FAIL verdict is a completed evaluation and never triggers the fallback;
//! only a failure to reach a verdict does. The whole machine, fallback
//! included, runs under the rule timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use attestor_core::outcome::{CheckOutcome, CheckStatus, FailureCause, Scope, Strategy};
use attestor_core::record::Record;
use attestor_core::rule::{Assertion, Condition, Lookup, RuleKind, SemanticCheck};
use attestor_core::template::{self, TemplateError};
use attestor_core::types::{RuleId, RunId};
use attestor_events::{EventBus, EventKind, RunEvent};
use attestor_tools::{CallSite, ToolError, ToolOrchestrator};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};

use crate::checks;
use crate::config::EvidenceMode;
use crate::evidence::{EvidenceDraft, EvidenceStore};
use crate::judgment::JudgmentService;
use crate::plan::{CompiledRule, Plan};

/// Statuses of outcomes settled in earlier execution groups.
pub type PriorOutcomes = HashMap<(RuleId, Scope), CheckStatus>;

// ---------------------------------------------------------------------------
// Verdicts and failures
// ---------------------------------------------------------------------------

/// A completed evaluation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Verdict {
    pub status: CheckStatus,
    pub strategy: Strategy,
    pub explanation: Option<String>,
    pub evidence: Option<EvidenceDraft>,
}

impl Verdict {
    pub fn pass(strategy: Strategy, evidence: EvidenceDraft) -> Self {
        Self {
            status: CheckStatus::Pass,
            strategy,
            explanation: None,
            evidence: Some(evidence),
        }
    }

    pub fn fail(strategy: Strategy, explanation: impl Into<String>, evidence: EvidenceDraft) -> Self {
        Self {
            status: CheckStatus::Fail,
            strategy,
            explanation: Some(explanation.into()),
            evidence: Some(evidence),
        }
    }

    fn skipped() -> Self {
        Self {
            status: CheckStatus::Pass,
            strategy: Strategy::Skipped,
            explanation: Some("condition not met".to_string()),
            evidence: None,
        }
    }
}

/// Why an evaluation could not reach a verdict.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EvalFailure {
    Malformed(String),
    MissingData(String),
    Tool(ToolError),
    Judgment(String),
    Timeout(Duration),
}

impl EvalFailure {
    pub fn cause(&self) -> FailureCause {
        match self {
            EvalFailure::Malformed(_) => FailureCause::MalformedRule,
            EvalFailure::MissingData(_) => FailureCause::MissingData,
            EvalFailure::Tool(e) => e.cause(),
            EvalFailure::Judgment(_) => FailureCause::JudgmentUnavailable,
            EvalFailure::Timeout(_) => FailureCause::RuleTimeout,
        }
    }

    fn explanation(&self) -> String {
        match self {
            EvalFailure::Malformed(msg)
            | EvalFailure::MissingData(msg)
            | EvalFailure::Judgment(msg) => msg.clone(),
            EvalFailure::Tool(e) => e.to_string(),
            EvalFailure::Timeout(limit) => {
                format!("Rule did not finish within {} ms", limit.as_millis())
            }
        }
    }
}

fn template_failure(err: TemplateError) -> EvalFailure {
    match err {
        TemplateError::Missing(_) => EvalFailure::MissingData(err.to_string()),
        other => EvalFailure::Malformed(other.to_string()),
    }
}

struct Resolution {
    result: Result<Verdict, EvalFailure>,
    fallback_used: bool,
}

enum Step<'r> {
    Select { kind: &'r RuleKind, fallback_used: bool },
    Run { kind: &'r RuleKind, fallback_used: bool },
    Fallback { failure: EvalFailure },
    Done(Resolution),
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// What a rule is evaluated against.
#[derive(Debug, Clone)]
pub struct Binding {
    pub scope: Scope,
    /// Record payload, or the batch view for batch-scoped rules.
    pub root: Arc<Value>,
    pub prior: Arc<PriorOutcomes>,
}

impl Binding {
    /// Prior status of `rule` for this scope, falling back to its batch
    /// outcome.
    fn prior_status(&self, rule: &str) -> Option<CheckStatus> {
        self.prior
            .get(&(rule.to_string(), self.scope.clone()))
            .or_else(|| self.prior.get(&(rule.to_string(), Scope::Batch)))
            .copied()
    }
}

// ---------------------------------------------------------------------------
// RuleEvaluator
// ---------------------------------------------------------------------------

pub struct RuleEvaluator {
    run_id: RunId,
    plan: Arc<Plan>,
    tools: Arc<ToolOrchestrator>,
    judge: Option<Arc<dyn JudgmentService>>,
    evidence: Arc<EvidenceStore>,
    evidence_mode: EvidenceMode,
    events: Option<Arc<EventBus>>,
    judgment_calls: AtomicU64,
}

impl RuleEvaluator {
    pub fn new(
        run_id: impl Into<RunId>,
        plan: Arc<Plan>,
        tools: Arc<ToolOrchestrator>,
        evidence: Arc<EvidenceStore>,
        evidence_mode: EvidenceMode,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            plan,
            tools,
            judge: None,
            evidence,
            evidence_mode,
            events: None,
            judgment_calls: AtomicU64::new(0),
        }
    }

    pub fn with_judgment(mut self, judge: Option<Arc<dyn JudgmentService>>) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_events(mut self, events: Option<Arc<EventBus>>) -> Self {
        self.events = events;
        self
    }

    pub fn judgment_calls(&self) -> u64 {
        self.judgment_calls.load(Ordering::Relaxed)
    }

    /// Evaluate `rule` for the bound scope. Never fails: every failure mode
    /// surfaces as an INCOMPLETE outcome.
    pub async fn evaluate(&self, rule: &CompiledRule, binding: &Binding) -> CheckOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();
        self.emit(rule.id(), &binding.scope, EventKind::RuleCheckStarted, None, None);

        let limit = rule.rule_timeout(&self.plan.runtime);
        let resolution = match tokio::time::timeout(limit, self.decide(rule, binding)).await {
            Ok(resolution) => resolution,
            Err(_) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    rule_id = %rule.id(),
                    scope = %binding.scope,
                    timeout_ms = limit.as_millis() as u64,
                    "Rule timed out"
                );
                Resolution {
                    result: Err(EvalFailure::Timeout(limit)),
                    fallback_used: false,
                }
            }
        };

        let mut outcome = self.settle(rule, binding.scope.clone(), resolution).await;
        outcome.started_at = started_at;
        outcome.duration_ms = clock.elapsed().as_millis() as u64;
        self.emit(
            rule.id(),
            &outcome.scope,
            EventKind::RuleCheckCompleted,
            Some(outcome.status),
            Some(outcome.duration_ms),
        );
        outcome
    }

    /// Evaluate a `unique` rule over the whole batch, producing one outcome
    /// per record.
    pub async fn evaluate_unique(&self, rule: &CompiledRule, records: &[Record]) -> Vec<CheckOutcome> {
        let RuleKind::Unique { fields } = &rule.def.kind else {
            return Vec::new();
        };
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut outcomes = Vec::with_capacity(records.len());
        for (record_id, verdict) in checks::unique(fields, records) {
            let resolution = Resolution {
                result: Ok(verdict),
                fallback_used: false,
            };
            let mut outcome = self.settle(rule, Scope::Record(record_id), resolution).await;
            outcome.started_at = started_at;
            outcome.duration_ms = clock.elapsed().as_millis() as u64;
            self.emit(
                rule.id(),
                &outcome.scope,
                EventKind::RuleCheckCompleted,
                Some(outcome.status),
                Some(outcome.duration_ms),
            );
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn decide(&self, rule: &CompiledRule, binding: &Binding) -> Resolution {
        let mut step = Step::Select {
            kind: &rule.def.kind,
            fallback_used: false,
        };
        loop {
            step = match step {
                Step::Select { kind, fallback_used } => Step::Run { kind, fallback_used },
                Step::Run { kind, fallback_used } => {
                    tracing::trace!(
                        rule_id = %rule.id(),
                        scope = %binding.scope,
                        strategy = ?kind.strategy_class(),
                        fallback_used,
                        "Evaluating"
                    );
                    match self.run_kind(kind, binding, rule.id()).await {
                        Ok(verdict) => Step::Done(Resolution {
                            result: Ok(verdict),
                            fallback_used,
                        }),
                        Err(failure) if fallback_used => Step::Done(Resolution {
                            result: Err(failure),
                            fallback_used,
                        }),
                        Err(failure) => Step::Fallback { failure },
                    }
                }
                Step::Fallback { failure } => match &rule.def.fallback {
                    Some(kind) => {
                        tracing::info!(
                            rule_id = %rule.id(),
                            scope = %binding.scope,
                            cause = %failure.cause(),
                            "Primary strategy failed, using fallback"
                        );
                        Step::Select {
                            kind,
                            fallback_used: true,
                        }
                    }
                    None => Step::Done(Resolution {
                        result: Err(failure),
                        fallback_used: false,
                    }),
                },
                Step::Done(resolution) => return resolution,
            };
        }
    }

    fn run_kind<'a>(
        &'a self,
        kind: &'a RuleKind,
        binding: &'a Binding,
        rule_id: &'a str,
    ) -> BoxFuture<'a, Result<Verdict, EvalFailure>> {
        async move {
            let root = binding.root.as_ref();
            match kind {
                RuleKind::NotNull { field } => Ok(checks::not_null(field, root)),
                RuleKind::Pattern { field, pattern } => {
                    checks::pattern(field, pattern, self.plan.pattern(pattern), root)
                }
                RuleKind::Range { field, min, max } => Ok(checks::range(field, *min, *max, root)),
                RuleKind::Enum { field, values } => Ok(checks::enum_values(field, values, root)),
                RuleKind::TypeCheck { field, expected } => {
                    Ok(checks::type_check(field, *expected, root))
                }
                RuleKind::CrossField {
                    left,
                    operator,
                    right,
                    value,
                    tolerance,
                } => checks::cross_field(left, *operator, right.as_ref(), value.as_ref(), *tolerance, root),
                RuleKind::Unique { .. } => Err(EvalFailure::Malformed(
                    "unique is evaluated over the whole batch and cannot be nested".to_string(),
                )),
                RuleKind::Conditional { when, then } => {
                    if self.condition(when, binding, rule_id).await? {
                        self.run_kind(then, binding, rule_id).await
                    } else {
                        Ok(Verdict::skipped())
                    }
                }
                RuleKind::CrossSystem { lookup, assertion } => {
                    self.cross_system(lookup, assertion, binding, rule_id).await
                }
                RuleKind::Semantic(check) => self.semantic(check, binding).await,
            }
        }
        .boxed()
    }

    fn condition<'a>(
        &'a self,
        condition: &'a Condition,
        binding: &'a Binding,
        rule_id: &'a str,
    ) -> BoxFuture<'a, Result<bool, EvalFailure>> {
        async move {
            match condition {
                Condition::Outcome { rule, statuses } => Ok(binding
                    .prior_status(rule)
                    .is_some_and(|status| statuses.contains(&status))),
                Condition::Assert {
                    path,
                    operator,
                    value,
                    tolerance,
                } => checks::condition_assert(path, *operator, value, *tolerance, &binding.root),
                Condition::Check { check } => {
                    let verdict = self.run_kind(check, binding, rule_id).await?;
                    Ok(verdict.status == CheckStatus::Pass)
                }
                Condition::All { of } => {
                    for c in of {
                        if !self.condition(c, binding, rule_id).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Condition::Any { of } => {
                    for c in of {
                        if self.condition(c, binding, rule_id).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Condition::Not { of } => Ok(!self.condition(of, binding, rule_id).await?),
            }
        }
        .boxed()
    }

    // -- tool strategy -------------------------------------------------------

    async fn cross_system(
        &self,
        lookup: &Lookup,
        assertion: &Assertion,
        binding: &Binding,
        rule_id: &str,
    ) -> Result<Verdict, EvalFailure> {
        let root = binding.root.as_ref();
        let request = template::render(&lookup.request, root).map_err(template_failure)?;
        let expected = match (&assertion.compare_to, &assertion.value) {
            (Some(path), _) => path
                .select_one(root)
                .filter(|v| !v.is_null())
                .cloned()
                .ok_or_else(|| EvalFailure::MissingData(format!("Record has no value at '{path}'")))?,
            (None, Some(value)) => value.clone(),
            (None, None) => {
                return Err(EvalFailure::Malformed(
                    "Assertion needs 'compare_to' or 'value'".to_string(),
                ));
            }
        };

        let site = CallSite {
            rule_id: Some(rule_id),
            record_id: binding.scope.record_id(),
        };
        let response = self
            .tools
            .invoke(&lookup.tool, &request, site)
            .await
            .map_err(EvalFailure::Tool)?;

        let inputs = json!({
            "tool": lookup.tool,
            "request": request,
            "path": assertion.path.as_str(),
            "expected": expected,
        });
        let redacted = Some(response.redacted.as_ref().clone());

        let Some(actual) = assertion.path.select_one(&response.value) else {
            return Ok(Verdict::fail(
                Strategy::Tool,
                format!(
                    "Path '{}' not found in '{}' response",
                    assertion.path, lookup.tool
                ),
                EvidenceDraft {
                    inputs,
                    response: redacted,
                    diff: Some(json!({ "expected": expected, "actual": null })),
                },
            ));
        };

        checks::compare(
            assertion.operator,
            actual,
            &expected,
            assertion.tolerance,
            inputs,
            redacted,
            Strategy::Tool,
        )
    }

    // -- semantic strategy ---------------------------------------------------

    async fn semantic(&self, check: &SemanticCheck, binding: &Binding) -> Result<Verdict, EvalFailure> {
        let judge = self
            .judge
            .as_ref()
            .ok_or_else(|| EvalFailure::Judgment("No judgment service configured".to_string()))?;
        let root = binding.root.as_ref();
        let prompt = template::render_str(&check.prompt, root).map_err(template_failure)?;

        let context: serde_json::Map<String, Value> = check
            .context_fields
            .iter()
            .map(|f| {
                let value = f.select_one(root).cloned().unwrap_or(Value::Null);
                (f.as_str().to_string(), value)
            })
            .collect();
        let context = Value::Object(context);

        self.judgment_calls.fetch_add(1, Ordering::Relaxed);
        let judgment = judge
            .judge(&prompt, &context)
            .await
            .map_err(|e| EvalFailure::Judgment(e.to_string()))?;

        let threshold = check.threshold.unwrap_or(self.plan.runtime.judgment_threshold);
        let (status, explanation) = checks::judgment_status(check, &judgment, threshold);
        Ok(Verdict {
            status,
            strategy: Strategy::Semantic,
            explanation,
            evidence: Some(EvidenceDraft {
                inputs: json!({ "prompt": prompt, "context": context, "threshold": threshold }),
                response: serde_json::to_value(&judgment).ok(),
                diff: None,
            }),
        })
    }

    // -- outcome -------------------------------------------------------------

    fn captures(&self, status: CheckStatus) -> bool {
        match self.evidence_mode {
            EvidenceMode::All => true,
            EvidenceMode::NonPass => status != CheckStatus::Pass,
            EvidenceMode::Off => false,
        }
    }

    async fn settle(&self, rule: &CompiledRule, scope: Scope, resolution: Resolution) -> CheckOutcome {
        let severity = rule.effective_severity;
        match resolution.result {
            Ok(verdict) => {
                let mut evidence_ref = None;
                if let Some(draft) = verdict.evidence.filter(|_| self.captures(verdict.status)) {
                    match self.evidence.record(rule.id(), &scope, draft).await {
                        Ok(urn) => evidence_ref = Some(urn),
                        Err(e) => tracing::warn!(
                            rule_id = %rule.id(),
                            scope = %scope,
                            error = %e,
                            "Failed to record evidence"
                        ),
                    }
                }
                CheckOutcome {
                    rule_id: rule.id().to_string(),
                    scope,
                    status: verdict.status,
                    severity,
                    strategy: Some(verdict.strategy),
                    fallback_used: resolution.fallback_used,
                    evidence_ref,
                    explanation: verdict.explanation,
                    cause: None,
                    started_at: Utc::now(),
                    duration_ms: 0,
                }
            }
            Err(failure) => {
                let cause = failure.cause();
                tracing::debug!(
                    rule_id = %rule.id(),
                    scope = %scope,
                    cause = %cause,
                    "Check incomplete"
                );
                let mut outcome =
                    CheckOutcome::incomplete(rule.id(), scope, severity, cause, failure.explanation());
                outcome.fallback_used = resolution.fallback_used;
                outcome
            }
        }
    }

    fn emit(
        &self,
        rule_id: &str,
        scope: &Scope,
        kind: EventKind,
        status: Option<CheckStatus>,
        latency_ms: Option<u64>,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        let mut event = RunEvent::new(kind, self.run_id.as_str())
            .with_rule(rule_id)
            .with_record(scope.record_id());
        if let Some(status) = status {
            event = event.with_status(status);
        }
        if let Some(latency_ms) = latency_ms {
            event = event.with_latency_ms(latency_ms);
        }
        events.publish(event);
    }
}

/// True when neither the rule nor its fallback can await an external call.
pub(crate) fn runs_inline(rule: &CompiledRule) -> bool {
    !rule.def.kind.may_suspend() && !rule.def.fallback.as_ref().is_some_and(RuleKind::may_suspend)
}
