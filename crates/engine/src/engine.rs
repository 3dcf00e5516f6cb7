//! Run driver.
//!
//! Execution groups run strictly in order. Inside a group, rules that can
//! never await an external call are evaluated inline; the rest are spawned
//! onto a [`JoinSet`] and joined before the next group starts, so every
//! outcome a conditional rule reads is settled before it runs.
//!
//! On cancellation the in-flight tasks get `cancel_grace_ms` to finish, are
//! then aborted, and every `(rule, scope)` pair still missing is filled with
//! an INCOMPLETE `cancelled` outcome. A run therefore always reports exactly
//! one outcome per pair.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use attestor_core::aggregate::aggregate;
use attestor_core::outcome::{CheckOutcome, CheckStatus, FailureCause, Scope};
use attestor_core::record::{batch_view, ensure_unique_ids, Record};
use attestor_core::rule::Severity;
use attestor_core::types::{RecordId, RuleId, RunId};
use attestor_events::{EventBus, EventKind, RunEvent};
use attestor_tools::{
    CacheScope, DriverRegistry, PassThrough, Redactor, ToolOrchestrator, ToolStateRegistry,
};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::compile::compile;
use crate::config::OutputPrefs;
use crate::error::{EngineError, RunError};
use crate::evaluator::{runs_inline, Binding, PriorOutcomes, RuleEvaluator};
use crate::evidence::EvidenceStore;
use crate::judgment::JudgmentService;
use crate::plan::{CompiledRule, Fanout, Plan};
use crate::report::{report_urn, Artifacts, Metrics, RecordResult, RunResult};
use crate::request::ValidationRequest;

/// Per-run options that are not part of the plan.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<RunId>,
    pub output_prefs: OutputPrefs,
}

// ---------------------------------------------------------------------------
// Outcome ledger
// ---------------------------------------------------------------------------

/// Settled outcomes keyed by `(rule_id, scope)`; a key can be written once.
#[derive(Debug, Default)]
struct Ledger {
    outcomes: BTreeMap<(RuleId, Scope), CheckOutcome>,
}

impl Ledger {
    fn insert(&mut self, outcome: CheckOutcome) -> Result<(), RunError> {
        match self.outcomes.entry(outcome.key()) {
            Entry::Occupied(_) => Err(RunError::DuplicateOutcome {
                rule_id: outcome.rule_id,
                scope: outcome.scope.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(outcome);
                Ok(())
            }
        }
    }

    fn contains(&self, rule_id: &str, scope: &Scope) -> bool {
        self.outcomes.contains_key(&(rule_id.to_string(), scope.clone()))
    }

    fn statuses(&self) -> PriorOutcomes {
        self.outcomes
            .iter()
            .map(|(key, outcome)| (key.clone(), outcome.status))
            .collect()
    }
}

/// What a spawned task was evaluating, for filling its slot if it never
/// reports back.
struct Pending {
    rule_id: RuleId,
    scope: Scope,
    severity: Severity,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Long-lived engine. Breaker state in the [`ToolStateRegistry`] is shared by
/// every run and concurrency limits are per run. Response caches are per
/// run unless `runtime.cache_scope` is `shared`; shared entries past their
/// TTL are purged when a run finishes.
///
/// Each run's evidence store is retained until [`release`](Engine::release)
/// is called for its run id.
pub struct Engine {
    drivers: DriverRegistry,
    tool_state: Arc<ToolStateRegistry>,
    judge: Option<Arc<dyn JudgmentService>>,
    redactor: Arc<dyn Redactor>,
    events: Option<Arc<EventBus>>,
    evidence: RwLock<HashMap<RunId, Arc<EvidenceStore>>>,
}

impl Engine {
    pub fn new(drivers: DriverRegistry) -> Self {
        Self {
            drivers,
            tool_state: Arc::new(ToolStateRegistry::default()),
            judge: None,
            redactor: Arc::new(PassThrough),
            events: None,
            evidence: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_tool_state(mut self, tool_state: Arc<ToolStateRegistry>) -> Self {
        self.tool_state = tool_state;
        self
    }

    pub fn with_judgment(mut self, judge: Arc<dyn JudgmentService>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_redactor(mut self, redactor: Arc<dyn Redactor>) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn tool_state(&self) -> &Arc<ToolStateRegistry> {
        &self.tool_state
    }

    /// Evidence recorded by the run `run_id`, while retained.
    pub async fn evidence(&self, run_id: &str) -> Option<Arc<EvidenceStore>> {
        self.evidence.read().await.get(run_id).cloned()
    }

    /// Drop the retained evidence of `run_id`, returning it.
    pub async fn release(&self, run_id: &str) -> Option<Arc<EvidenceStore>> {
        self.evidence.write().await.remove(run_id)
    }

    /// Compile the request's rule set and run it over the request's data.
    pub async fn execute(
        &self,
        request: ValidationRequest,
        cancel: CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let plan = compile(&request.schema, &request.rules, &request.tools, &request.runtime)?;
        let options = RunOptions {
            run_id: request.run_id,
            output_prefs: request.output_prefs,
        };
        Ok(self.run(Arc::new(plan), request.data, options, cancel).await?)
    }

    /// Evaluate `plan` over `batch`.
    ///
    /// Fails only for an invalid batch or an internal invariant violation;
    /// every rule-level problem is reported as an INCOMPLETE outcome.
    pub async fn run(
        &self,
        plan: Arc<Plan>,
        batch: Vec<Record>,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunResult, RunError> {
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        match self.run_inner(&run_id, plan, batch, options, cancel).await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Run failed");
                self.publish(RunEvent::new(EventKind::RunFailed, run_id.as_str()).with_error_code(
                    match &e {
                        RunError::InvalidBatch(_) => "invalid_batch",
                        RunError::DuplicateOutcome { .. } => "duplicate_outcome",
                    },
                ));
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        run_id: &str,
        plan: Arc<Plan>,
        batch: Vec<Record>,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunResult, RunError> {
        ensure_unique_ids(&batch).map_err(|e| RunError::InvalidBatch(e.to_string()))?;

        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::info!(
            run_id,
            rule_set_version = %plan.rule_set_version,
            records = batch.len(),
            rules = plan.rule_count(),
            groups = plan.groups.len(),
            "Run started",
        );
        self.publish(RunEvent::new(EventKind::RunStarted, run_id));

        let mut tools = ToolOrchestrator::new(
            run_id,
            plan.tools.clone(),
            self.drivers.clone(),
            Arc::clone(&self.tool_state),
            plan.runtime.orchestrator_settings(),
        )
        .with_redactor(Arc::clone(&self.redactor));
        if let Some(events) = &self.events {
            tools = tools.with_events(Arc::clone(events));
        }
        let tools = Arc::new(tools);
        let evidence = Arc::new(EvidenceStore::new(run_id));
        self.evidence
            .write()
            .await
            .insert(run_id.to_string(), Arc::clone(&evidence));
        let evaluator = Arc::new(
            RuleEvaluator::new(
                run_id,
                Arc::clone(&plan),
                Arc::clone(&tools),
                Arc::clone(&evidence),
                options.output_prefs.evidence,
            )
            .with_judgment(self.judge.clone())
            .with_events(self.events.clone()),
        );

        let payloads: Vec<(RecordId, Arc<Value>)> = batch
            .iter()
            .map(|r| (r.record_id.clone(), Arc::new(r.payload.clone())))
            .collect();
        let view = Arc::new(batch_view(&batch));

        let mut ledger = Ledger::default();
        let mut cancelled = false;

        for group in &plan.groups {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            tracing::debug!(run_id, group = group.index, rules = group.rules.len(), "Group started");

            let prior = Arc::new(ledger.statuses());
            let mut tasks: JoinSet<CheckOutcome> = JoinSet::new();
            let mut pending: HashMap<task::Id, Pending> = HashMap::new();

            for rule_id in &group.rules {
                let Some(rule) = plan.rule(rule_id) else {
                    continue;
                };
                let bindings: Vec<Binding> = match rule.fanout {
                    Fanout::BatchToRecords => {
                        for outcome in evaluator.evaluate_unique(rule, &batch).await {
                            ledger.insert(outcome)?;
                        }
                        continue;
                    }
                    Fanout::Batch => vec![Binding {
                        scope: Scope::Batch,
                        root: Arc::clone(&view),
                        prior: Arc::clone(&prior),
                    }],
                    Fanout::PerRecord => payloads
                        .iter()
                        .map(|(id, payload)| Binding {
                            scope: Scope::Record(id.clone()),
                            root: Arc::clone(payload),
                            prior: Arc::clone(&prior),
                        })
                        .collect(),
                };

                if runs_inline(rule) {
                    for binding in &bindings {
                        ledger.insert(evaluator.evaluate(rule, binding).await)?;
                    }
                    continue;
                }
                for binding in bindings {
                    let slot = Pending {
                        rule_id: rule.id().to_string(),
                        scope: binding.scope.clone(),
                        severity: rule.effective_severity,
                    };
                    let evaluator = Arc::clone(&evaluator);
                    let rule = Arc::clone(rule);
                    let handle =
                        tasks.spawn(async move { evaluator.evaluate(&rule, &binding).await });
                    pending.insert(handle.id(), slot);
                }
            }

            let grace = plan.runtime.cancel_grace();
            if drain(&mut tasks, &mut pending, &mut ledger, &cancel, grace).await? {
                cancelled = true;
                break;
            }
        }

        fill_missing(&plan, &payloads, &mut ledger, cancelled)?;

        // Assemble the document.
        let record_ids: Vec<RecordId> = payloads.iter().map(|(id, _)| id.clone()).collect();
        let rollup = aggregate(&record_ids, ledger.outcomes.values());
        let total_checks = ledger.outcomes.len();

        let mut per_record: HashMap<RecordId, Vec<CheckOutcome>> = HashMap::new();
        let mut batch_checks = Vec::new();
        for ((_, scope), outcome) in ledger.outcomes {
            match scope {
                Scope::Record(id) => per_record.entry(id).or_default().push(outcome),
                Scope::Batch => batch_checks.push(outcome),
            }
        }
        let results: Vec<RecordResult> = record_ids
            .into_iter()
            .map(|record_id| RecordResult {
                status: rollup
                    .record_status
                    .get(&record_id)
                    .copied()
                    .unwrap_or(CheckStatus::Pass),
                checks: per_record.remove(&record_id).unwrap_or_default(),
                record_id,
            })
            .collect();

        let tool_metrics = tools.metrics();
        if plan.runtime.cache_scope == CacheScope::Shared {
            let purged = self.tool_state.purge_expired().await;
            if purged > 0 {
                tracing::debug!(run_id, purged, "Expired shared cache entries purged");
            }
        }
        let latency_ms = clock.elapsed().as_millis() as u64;
        let metrics = Metrics {
            latency_ms,
            checks: total_checks,
            tool_calls: tool_metrics.tool_calls,
            tool_retries: tool_metrics.tool_retries,
            cache_hits: tool_metrics.cache_hits,
            breaker_rejections: tool_metrics.breaker_rejections,
            judgment_calls: evaluator.judgment_calls(),
        };
        let status = rollup.summary.status;

        tracing::info!(
            run_id,
            status = %status,
            cancelled,
            checks = total_checks,
            tool_calls = metrics.tool_calls,
            latency_ms,
            "Run completed",
        );
        self.publish(
            RunEvent::new(EventKind::RunCompleted, run_id)
                .with_status(status)
                .with_latency_ms(latency_ms),
        );

        Ok(RunResult {
            run_id: run_id.to_string(),
            rule_set_version: plan.rule_set_version.clone(),
            status,
            cancelled,
            summary: rollup.summary,
            results,
            batch_checks,
            artifacts: Artifacts {
                report: report_urn(run_id),
                evidence: evidence.refs().await,
            },
            metrics,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn publish(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Group draining
// ---------------------------------------------------------------------------

/// Join every task in the group. Returns `true` when the run was cancelled
/// while tasks were still in flight.
async fn drain(
    tasks: &mut JoinSet<CheckOutcome>,
    pending: &mut HashMap<task::Id, Pending>,
    ledger: &mut Ledger,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<bool, RunError> {
    loop {
        tokio::select! {
            joined = tasks.join_next_with_id() => match joined {
                Some(joined) => settle_task(joined, pending, ledger)?,
                None => return Ok(false),
            },
            _ = cancel.cancelled() => break,
        }
    }

    tracing::warn!(
        in_flight = tasks.len(),
        grace_ms = grace.as_millis() as u64,
        "Run cancelled, waiting for in-flight checks",
    );
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            joined = tasks.join_next_with_id() => match joined {
                Some(joined) => settle_task(joined, pending, ledger)?,
                None => return Ok(true),
            },
            _ = &mut deadline => break,
        }
    }

    tasks.abort_all();
    while let Some(joined) = tasks.join_next_with_id().await {
        settle_task(joined, pending, ledger)?;
    }
    Ok(true)
}

fn settle_task(
    joined: Result<(task::Id, CheckOutcome), task::JoinError>,
    pending: &mut HashMap<task::Id, Pending>,
    ledger: &mut Ledger,
) -> Result<(), RunError> {
    match joined {
        Ok((id, outcome)) => {
            pending.remove(&id);
            ledger.insert(outcome)
        }
        Err(e) => {
            let Some(slot) = pending.remove(&e.id()) else {
                return Ok(());
            };
            let (cause, explanation) = if e.is_cancelled() {
                (FailureCause::Cancelled, "Run cancelled before the check finished".to_string())
            } else {
                tracing::error!(
                    rule_id = %slot.rule_id,
                    scope = %slot.scope,
                    error = %e,
                    "Evaluation task failed",
                );
                (FailureCause::TaskFailed, format!("Evaluation task failed: {e}"))
            };
            ledger.insert(CheckOutcome::incomplete(
                slot.rule_id,
                slot.scope,
                slot.severity,
                cause,
                explanation,
            ))
        }
    }
}

/// Fill every `(rule, scope)` pair without an outcome.
fn fill_missing(
    plan: &Plan,
    payloads: &[(RecordId, Arc<Value>)],
    ledger: &mut Ledger,
    cancelled: bool,
) -> Result<(), RunError> {
    let scopes = |rule: &CompiledRule| -> Vec<Scope> {
        match rule.fanout {
            Fanout::Batch => vec![Scope::Batch],
            Fanout::PerRecord | Fanout::BatchToRecords => payloads
                .iter()
                .map(|(id, _)| Scope::Record(id.clone()))
                .collect(),
        }
    };

    let mut missing = Vec::new();
    for rule in plan.ordered_rules() {
        for scope in scopes(rule) {
            if !ledger.contains(rule.id(), &scope) {
                missing.push((Arc::clone(rule), scope));
            }
        }
    }
    if missing.is_empty() {
        return Ok(());
    }

    let (cause, explanation) = if cancelled {
        (FailureCause::Cancelled, "Run cancelled before the check started")
    } else {
        tracing::error!(missing = missing.len(), "Checks settled without an outcome");
        (FailureCause::TaskFailed, "Check produced no outcome")
    };
    for (rule, scope) in missing {
        ledger.insert(CheckOutcome::incomplete(
            rule.id(),
            scope,
            rule.effective_severity,
            cause,
            explanation,
        ))?;
    }
    Ok(())
}
