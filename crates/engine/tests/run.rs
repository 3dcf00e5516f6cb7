//! End-to-end runs over the in-memory invoice system.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use attestor_core::outcome::{CheckOutcome, CheckStatus, FailureCause, Scope, Strategy};
use attestor_core::rule::Severity;
use attestor_engine::{CompilationError, EngineError, EvidenceMode, OutputPrefs, RunError, RunResult};
use attestor_events::{EventBus, EventKind};
use attestor_tools::{BreakerConfig, BreakerState, ToolStateRegistry, TransportError};
use common::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn record(id: &str) -> Scope {
    Scope::Record(id.to_string())
}

fn check<'a>(result: &'a RunResult, rule: &str, scope: &Scope) -> &'a CheckOutcome {
    result
        .check(rule, scope)
        .unwrap_or_else(|| panic!("no outcome for {rule} / {scope}"))
}

fn statuses(result: &RunResult) -> Vec<(String, Scope, CheckStatus)> {
    let mut all: Vec<_> = result
        .outcomes()
        .map(|c| (c.rule_id.clone(), c.scope.clone(), c.status))
        .collect();
    all.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    all
}

fn invoice_rules() -> serde_json::Value {
    json!([
        {"id": "invoice_id_unique", "type": "unique", "fields": ["invoice_id"]},
        {"id": "invoice_id_format", "type": "pattern", "field": "invoice_id", "pattern": "^INV-[0-9]+$"}
    ])
}

// ---------------------------------------------------------------------------
// Deterministic rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_and_malformed_invoice_ids_fail() {
    let engine = engine_with(Arc::new(InvoiceSystem::new(&[])));
    let data = json!([
        {"record_id": "r1", "payload": {"invoice_id": "INV-123"}},
        {"record_id": "r2", "payload": {"invoice_id": "INV-123"}},
        {"record_id": "r3", "payload": {"invoice_id": "123-INV"}}
    ]);
    let result = engine
        .execute(request(data, invoice_rules(), json!([]), json!({})), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, CheckStatus::Fail);
    assert_eq!(result.summary.total_checks, 6);
    assert_eq!(result.summary.records.fail, 3);

    let r1 = check(&result, "invoice_id_unique", &record("r1"));
    assert_eq!(r1.status, CheckStatus::Fail);
    assert!(r1.explanation.as_deref().unwrap().contains("2 times"));
    assert_eq!(check(&result, "invoice_id_unique", &record("r2")).status, CheckStatus::Fail);
    assert_eq!(check(&result, "invoice_id_format", &record("r1")).status, CheckStatus::Pass);

    assert_eq!(check(&result, "invoice_id_unique", &record("r3")).status, CheckStatus::Pass);
    assert_eq!(check(&result, "invoice_id_format", &record("r3")).status, CheckStatus::Fail);

    // Per-record checks are ordered by rule id.
    let ids: Vec<&str> = result.results[0].checks.iter().map(|c| c.rule_id.as_str()).collect();
    assert_eq!(ids, vec!["invoice_id_format", "invoice_id_unique"]);
}

#[tokio::test]
async fn batch_rules_produce_batch_scoped_outcomes() {
    let engine = engine_with(Arc::new(InvoiceSystem::new(&[])));
    let data = json!([
        {"record_id": "a", "payload": {"invoice_id": "INV-1", "amount": 10}},
        {"record_id": "b", "payload": {"invoice_id": "INV-2", "amount": -5}}
    ]);
    let rules = json!([
        {"id": "batch_not_empty", "level": "batch", "type": "range", "field": "count", "min": 1},
        {"id": "amounts_positive", "level": "batch", "type": "range", "field": "records[*].amount", "min": 0}
    ]);
    let result = engine
        .execute(request(data, rules, json!([]), json!({})), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.batch_checks.len(), 2);
    assert_eq!(check(&result, "batch_not_empty", &Scope::Batch).status, CheckStatus::Pass);
    assert_eq!(check(&result, "amounts_positive", &Scope::Batch).status, CheckStatus::Fail);
    assert_eq!(result.summary.batch_checks_status, CheckStatus::Fail);
    assert_eq!(result.status, CheckStatus::Fail);
    // Records themselves carry no checks and stay PASS.
    assert!(result.results.iter().all(|r| r.status == CheckStatus::Pass && r.checks.is_empty()));
}

#[tokio::test]
async fn false_condition_skips_the_check() {
    let engine = engine_with(Arc::new(InvoiceSystem::new(&[])));
    let data = json!([
        {"record_id": "small", "payload": {"invoice_id": "INV-1", "amount": 20}},
        {"record_id": "large_po", "payload": {"invoice_id": "INV-2", "amount": 5000, "po_number": "PO-9"}},
        {"record_id": "large", "payload": {"invoice_id": "INV-3", "amount": 5000}}
    ]);
    let rules = json!([{
        "id": "po_required_for_large",
        "type": "conditional",
        "when": {"kind": "assert", "path": "amount", "operator": "gt", "value": 1000},
        "then": {"type": "not_null", "field": "po_number"}
    }]);
    let result = engine
        .execute(request(data, rules, json!([]), json!({})), CancellationToken::new())
        .await
        .unwrap();

    let small = check(&result, "po_required_for_large", &record("small"));
    assert_eq!(small.status, CheckStatus::Pass);
    assert_eq!(small.strategy, Some(Strategy::Skipped));
    assert_eq!(small.explanation.as_deref(), Some("condition not met"));
    assert_eq!(small.evidence_ref, None);

    let with_po = check(&result, "po_required_for_large", &record("large_po"));
    assert_eq!(with_po.status, CheckStatus::Pass);
    assert_eq!(with_po.strategy, Some(Strategy::Deterministic));
    assert_eq!(check(&result, "po_required_for_large", &record("large")).status, CheckStatus::Fail);
}

#[tokio::test]
async fn condition_reads_outcome_of_earlier_group() {
    let engine = engine_with(Arc::new(InvoiceSystem::new(&[])));
    let data = json!([
        {"record_id": "a", "payload": {"invoice_id": "INV-1", "amount": 1, "currency": "GBP"}},
        {"record_id": "b", "payload": {"invoice_id": "INV-2", "currency": "GBP"}}
    ]);
    let rules = json!([
        {
            "id": "currency_supported",
            "type": "conditional",
            "when": {"kind": "outcome", "rule": "amount_present", "statuses": ["pass"]},
            "then": {"type": "enum", "field": "currency", "values": ["EUR", "USD"]}
        },
        {"id": "amount_present", "type": "not_null", "field": "amount"}
    ]);
    let result = engine
        .execute(request(data, rules, json!([]), json!({})), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(check(&result, "amount_present", &record("a")).status, CheckStatus::Pass);
    assert_eq!(check(&result, "currency_supported", &record("a")).status, CheckStatus::Fail);
    assert_eq!(check(&result, "amount_present", &record("b")).status, CheckStatus::Fail);
    let skipped = check(&result, "currency_supported", &record("b"));
    assert_eq!(skipped.status, CheckStatus::Pass);
    assert_eq!(skipped.strategy, Some(Strategy::Skipped));
}

// ---------------------------------------------------------------------------
// Cross-system rules
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn amount_mismatch_fails_with_diff_evidence() {
    let system = Arc::new(InvoiceSystem::new(&[
        ("INV-1", json!({"amount": 199.49, "vendor": "ACME"})),
        ("INV-2", json!({"amount": 50.004})),
    ]));
    let engine = engine_with(system.clone());
    let data = json!([
        {"record_id": "r1", "payload": {"invoice_id": "INV-1", "amount": 199.99}},
        {"record_id": "r2", "payload": {"invoice_id": "INV-2", "amount": 50.0}}
    ]);
    let result = engine
        .execute(
            request(data, json!([amount_matches_erp()]), json!([erp_tool()]), fast_runtime()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mismatch = check(&result, "amount_matches_erp", &record("r1"));
    assert_eq!(mismatch.status, CheckStatus::Fail);
    assert_eq!(mismatch.strategy, Some(Strategy::Tool));
    let urn = mismatch.evidence_ref.clone().unwrap();
    assert_eq!(urn, "urn:attestor:evidence:run-test:amount_matches_erp:record:r1");
    assert!(result.artifacts.evidence.contains(&urn));

    let store = engine.evidence("run-test").await.unwrap();
    let evidence = store.get(&urn).await.unwrap();
    assert_eq!(
        evidence.diff,
        Some(json!({"expected": 199.99, "actual": 199.49, "tolerance": 0.01}))
    );
    assert_eq!(evidence.response.as_ref().unwrap()["vendor"], json!("ACME"));

    assert_eq!(check(&result, "amount_matches_erp", &record("r2")).status, CheckStatus::Pass);
    assert_eq!(result.metrics.tool_calls, 2);
    assert_eq!(system.calls(), 2);
    assert_eq!(result.artifacts.report, "urn:attestor:report:run-test");
}

#[tokio::test(start_paused = true)]
async fn evidence_is_kept_only_for_non_pass_by_default() {
    let system = Arc::new(InvoiceSystem::new(&[
        ("INV-1", json!({"amount": 199.49})),
        ("INV-2", json!({"amount": 50.0})),
    ]));
    let engine = engine_with(system);
    let data = json!([
        {"record_id": "r1", "payload": {"invoice_id": "INV-1", "amount": 199.99}},
        {"record_id": "r2", "payload": {"invoice_id": "INV-2", "amount": 50.0}}
    ]);
    let req = request(data, json!([amount_matches_erp()]), json!([erp_tool()]), fast_runtime())
        .with_output_prefs(OutputPrefs {
            evidence: EvidenceMode::NonPass,
        });
    let result = engine.execute(req, CancellationToken::new()).await.unwrap();

    assert!(check(&result, "amount_matches_erp", &record("r1")).evidence_ref.is_some());
    assert!(check(&result, "amount_matches_erp", &record("r2")).evidence_ref.is_none());
    assert_eq!(result.artifacts.evidence.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let system = Arc::new(
        InvoiceSystem::new(&[("INV-1", json!({"amount": 10.0}))]).failing_first(2),
    );
    let engine = engine_with(system.clone());
    let data = json!([{"record_id": "r1", "payload": {"invoice_id": "INV-1", "amount": 10.0}}]);
    let result = engine
        .execute(
            request(data, json!([amount_matches_erp()]), json!([erp_tool()]), fast_runtime()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(check(&result, "amount_matches_erp", &record("r1")).status, CheckStatus::Pass);
    assert_eq!(system.calls(), 3);
    assert_eq!(result.metrics.tool_calls, 3);
    assert_eq!(result.metrics.tool_retries, 2);
}

#[tokio::test(start_paused = true)]
async fn identical_lookups_share_one_call() {
    let system = Arc::new(InvoiceSystem::new(&[("INV-1", json!({"amount": 199.49}))]));
    let engine = engine_with(system.clone());
    let data = json!([
        {"record_id": "r1", "payload": {"invoice_id": "INV-1", "amount": 199.99}},
        {"record_id": "r2", "payload": {"invoice_id": "INV-1", "amount": 199.99}}
    ]);
    let result = engine
        .execute(
            request(data, json!([amount_matches_erp()]), json!([erp_tool()]), fast_runtime()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(system.calls(), 1);
    assert_eq!(result.metrics.cache_hits, 1);
    assert!(result.results.iter().all(|r| r.status == CheckStatus::Fail));
}

#[tokio::test(start_paused = true)]
async fn unreachable_tool_is_incomplete_unless_fallback_declared() {
    let system = Arc::new(
        InvoiceSystem::new(&[]).always_failing(TransportError::Auth("token expired".into())),
    );
    let engine = engine_with(system);
    let data = json!([{"record_id": "r1", "payload": {"invoice_id": "INV-1", "amount": 12.5}}]);
    let mut with_fallback = amount_matches_erp();
    with_fallback["id"] = json!("amount_or_present");
    with_fallback["fallback"] = json!({"type": "not_null", "field": "amount"});
    let rules = json!([amount_matches_erp(), with_fallback]);

    let result = engine
        .execute(request(data, rules, json!([erp_tool()]), fast_runtime()), CancellationToken::new())
        .await
        .unwrap();

    let primary = check(&result, "amount_matches_erp", &record("r1"));
    assert_eq!(primary.status, CheckStatus::Incomplete);
    assert_eq!(primary.cause, Some(FailureCause::ToolAuth));
    assert!(!primary.fallback_used);

    let fallback = check(&result, "amount_or_present", &record("r1"));
    assert_eq!(fallback.status, CheckStatus::Pass);
    assert!(fallback.fallback_used);
    assert_eq!(fallback.strategy, Some(Strategy::Deterministic));

    assert_eq!(result.status, CheckStatus::Incomplete);
}

#[tokio::test(start_paused = true)]
async fn slow_rule_times_out() {
    let system = Arc::new(
        InvoiceSystem::new(&[("INV-1", json!({"amount": 1.0}))])
            .with_delay(Duration::from_secs(3600)),
    );
    let engine = engine_with(system);
    let data = json!([{"record_id": "r1", "payload": {"invoice_id": "INV-1", "amount": 1.0}}]);
    let mut rule = amount_matches_erp();
    rule["timeout_ms"] = json!(200);
    let runtime = json!({"tool_timeout_ms": 7_200_000, "rule_timeout_ms": 7_200_000});

    let result = engine
        .execute(request(data, json!([rule]), json!([erp_tool()]), runtime), CancellationToken::new())
        .await
        .unwrap();

    let outcome = check(&result, "amount_matches_erp", &record("r1"));
    assert_eq!(outcome.status, CheckStatus::Incomplete);
    assert_eq!(outcome.cause, Some(FailureCause::RuleTimeout));
}

#[tokio::test(start_paused = true)]
async fn rule_timeout_during_half_open_call_leaves_tool_usable() {
    let system = Arc::new(
        InvoiceSystem::new(&[("INV-1", json!({"amount": 10.0}))])
            .failing_first(2)
            .stalling(1),
    );
    let breaker = BreakerConfig {
        window_size: 2,
        min_calls: 2,
        error_rate_threshold: 0.5,
        cooldown_ms: 1_000,
    };
    let engine = engine_with(system.clone())
        .with_tool_state(Arc::new(ToolStateRegistry::new(breaker)));
    let runtime = json!({
        "tool_timeout_ms": 7_200_000,
        "rule_timeout_ms": 200,
        "retries": 0,
        "cache_ttl_ms": 0
    });
    let invoices = |ids: &[&str]| {
        json!(ids
            .iter()
            .map(|id| json!({"record_id": id, "payload": {"invoice_id": "INV-1", "amount": 10.0}}))
            .collect::<Vec<_>>())
    };
    let run = |ids: &[&str]| {
        request(invoices(ids), json!([amount_matches_erp()]), json!([erp_tool()]), runtime.clone())
    };

    // Two unavailable responses open the breaker.
    let first = engine.execute(run(&["r1", "r2"]), CancellationToken::new()).await.unwrap();
    assert!(first.outcomes().all(|c| c.cause == Some(FailureCause::ToolUnavailable)));
    assert_eq!(engine.tool_state().breaker_state("erp").await, Some(BreakerState::Open));

    tokio::time::advance(Duration::from_millis(1_500)).await;

    // The half-open trial call stalls past the rule timeout and is dropped.
    let second = engine.execute(run(&["r1"]), CancellationToken::new()).await.unwrap();
    let timed_out = check(&second, "amount_matches_erp", &record("r1"));
    assert_eq!(timed_out.cause, Some(FailureCause::RuleTimeout));
    assert_eq!(engine.tool_state().breaker_state("erp").await, Some(BreakerState::HalfOpen));

    // The tool has recovered, so the next run closes the breaker.
    let third = engine.execute(run(&["r1"]), CancellationToken::new()).await.unwrap();
    assert_eq!(check(&third, "amount_matches_erp", &record("r1")).status, CheckStatus::Pass);
    assert_eq!(engine.tool_state().breaker_state("erp").await, Some(BreakerState::Closed));
    assert_eq!(system.calls(), 4);
}

// ---------------------------------------------------------------------------
// Semantic rules
// ---------------------------------------------------------------------------

fn plausibility_rule() -> serde_json::Value {
    json!({
        "id": "description_plausible",
        "type": "semantic",
        "prompt": "Is '{{description}}' a plausible invoice line?",
        "context_fields": ["description", "amount"]
    })
}

#[tokio::test]
async fn advisory_semantic_failure_rolls_up_as_warn() {
    let judge = Arc::new(CannedJudge::new("no", Some(0.95)));
    let engine = engine_with(Arc::new(InvoiceSystem::new(&[]))).with_judgment(judge.clone());
    let data = json!([{"record_id": "r1", "payload": {"invoice_id": "INV-1", "description": "Unicorn rental", "amount": 3}}]);
    let result = engine
        .execute(request(data, json!([plausibility_rule()]), json!([]), json!({})), CancellationToken::new())
        .await
        .unwrap();

    let outcome = check(&result, "description_plausible", &record("r1"));
    assert_eq!(outcome.status, CheckStatus::Fail);
    assert_eq!(outcome.severity, Severity::Warn);
    assert_eq!(outcome.strategy, Some(Strategy::Semantic));
    assert_eq!(result.results[0].status, CheckStatus::Warn);
    assert_eq!(result.status, CheckStatus::Warn);
    assert_eq!(result.metrics.judgment_calls, 1);
    assert_eq!(judge.calls(), 1);
}

#[tokio::test]
async fn missing_judge_falls_back_or_is_incomplete() {
    let engine = engine_with(Arc::new(InvoiceSystem::new(&[])));
    let data = json!([{"record_id": "r1", "payload": {"invoice_id": "INV-1", "description": "Consulting"}}]);
    let mut with_fallback = plausibility_rule();
    with_fallback["id"] = json!("description_present");
    with_fallback["fallback"] = json!({"type": "not_null", "field": "description"});
    let rules = json!([plausibility_rule(), with_fallback]);

    let result = engine
        .execute(request(data, rules, json!([]), json!({})), CancellationToken::new())
        .await
        .unwrap();

    let primary = check(&result, "description_plausible", &record("r1"));
    assert_eq!(primary.status, CheckStatus::Incomplete);
    assert_eq!(primary.cause, Some(FailureCause::JudgmentUnavailable));
    let fallback = check(&result, "description_present", &record("r1"));
    assert_eq!(fallback.status, CheckStatus::Pass);
    assert!(fallback.fallback_used);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_before_start_reports_every_pair() {
    let engine = engine_with(Arc::new(InvoiceSystem::new(&[])));
    let data = json!([
        {"record_id": "r1", "payload": {"invoice_id": "INV-1"}},
        {"record_id": "r2", "payload": {"invoice_id": "INV-2"}}
    ]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = engine
        .execute(request(data, invoice_rules(), json!([]), json!({})), cancel)
        .await
        .unwrap();

    assert!(result.cancelled);
    assert_eq!(result.summary.total_checks, 4);
    assert!(result
        .outcomes()
        .all(|c| c.status == CheckStatus::Incomplete && c.cause == Some(FailureCause::Cancelled)));
    assert_eq!(result.status, CheckStatus::Incomplete);
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_in_flight_checks_after_grace() {
    let system = Arc::new(
        InvoiceSystem::new(&[("INV-1", json!({"amount": 1.0}))])
            .with_delay(Duration::from_secs(3600)),
    );
    let engine = engine_with(system);
    let data = json!([{"record_id": "r1", "payload": {"invoice_id": "INV-1", "amount": 1.0}}]);
    let rules = json!([
        amount_matches_erp(),
        {"id": "invoice_id_present", "type": "not_null", "field": "invoice_id"}
    ]);
    let runtime = json!({
        "tool_timeout_ms": 7_200_000,
        "rule_timeout_ms": 7_200_000,
        "cancel_grace_ms": 100
    });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let result = engine
        .execute(request(data, rules, json!([erp_tool()]), runtime), cancel)
        .await
        .unwrap();

    assert!(result.cancelled);
    assert_eq!(check(&result, "invoice_id_present", &record("r1")).status, CheckStatus::Pass);
    let aborted = check(&result, "amount_matches_erp", &record("r1"));
    assert_eq!(aborted.status, CheckStatus::Incomplete);
    assert_eq!(aborted.cause, Some(FailureCause::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn cancellation_with_queued_calls_fills_every_pair() {
    let system = Arc::new(
        InvoiceSystem::new(&[("INV-1", json!({"amount": 1.0}))]).with_delay(Duration::from_secs(10)),
    );
    let engine = engine_with(system.clone());
    let data = json!([
        {"record_id": "r1", "payload": {"invoice_id": "INV-1", "amount": 1.0}},
        {"record_id": "r2", "payload": {"invoice_id": "INV-1", "amount": 1.0}},
        {"record_id": "r3", "payload": {"invoice_id": "INV-1", "amount": 1.0}}
    ]);
    let runtime = json!({
        "tool_timeout_ms": 60_000,
        "rule_timeout_ms": 120_000,
        "max_inflight": 1,
        "queue_depth": 8,
        "cache_ttl_ms": 0,
        "cancel_grace_ms": 100
    });
    let run = || request(data.clone(), json!([amount_matches_erp()]), json!([erp_tool()]), runtime.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });
    let result = engine.execute(run(), cancel).await.unwrap();

    // One call was in flight, two were queued behind it.
    assert!(result.cancelled);
    assert_eq!(result.summary.total_checks, 3);
    assert!(result
        .outcomes()
        .all(|c| c.status == CheckStatus::Incomplete && c.cause == Some(FailureCause::Cancelled)));
    assert_eq!(result.metrics.tool_calls, 1);
    assert_eq!(system.calls(), 1);

    let rerun = engine.execute(run(), CancellationToken::new()).await.unwrap();
    assert!(!rerun.cancelled);
    assert!(rerun.outcomes().all(|c| c.status == CheckStatus::Pass));
    assert_eq!(system.calls(), 4);
}

// ---------------------------------------------------------------------------
// Run-level properties
// ---------------------------------------------------------------------------

fn mixed_batch() -> serde_json::Value {
    json!([
        {"record_id": "r1", "payload": {"invoice_id": "INV-1", "amount": 199.99}},
        {"record_id": "r2", "payload": {"invoice_id": "INV-1", "amount": 20.0}},
        {"record_id": "r3", "payload": {"invoice_id": "bad", "amount": 5.0}}
    ])
}

fn mixed_rules() -> serde_json::Value {
    let mut rules = invoice_rules();
    rules.as_array_mut().unwrap().push(amount_matches_erp());
    rules
}

fn erp_system() -> Arc<InvoiceSystem> {
    Arc::new(InvoiceSystem::new(&[
        ("INV-1", json!({"amount": 199.49})),
        ("bad", json!({"amount": 5.0})),
    ]))
}

#[tokio::test(start_paused = true)]
async fn every_rule_scope_pair_has_exactly_one_outcome() {
    let engine = engine_with(erp_system());
    let result = engine
        .execute(
            request(mixed_batch(), mixed_rules(), json!([erp_tool()]), fast_runtime()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let pairs = statuses(&result);
    assert_eq!(pairs.len(), 9);
    let mut keys: Vec<_> = pairs.iter().map(|(r, s, _)| (r.clone(), s.clone())).collect();
    keys.dedup();
    assert_eq!(keys.len(), 9);
    assert_eq!(result.summary.total_checks, 9);
    assert_eq!(result.metrics.checks, 9);
}

#[tokio::test(start_paused = true)]
async fn rerun_yields_identical_statuses() {
    let first = engine_with(erp_system())
        .execute(
            request(mixed_batch(), mixed_rules(), json!([erp_tool()]), fast_runtime()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let second = engine_with(erp_system())
        .execute(
            request(mixed_batch(), mixed_rules(), json!([erp_tool()]), fast_runtime()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(statuses(&first), statuses(&second));
    assert_eq!(first.summary, second.summary);
    assert_eq!(first.artifacts.evidence, second.artifacts.evidence);
}

#[tokio::test(start_paused = true)]
async fn record_order_does_not_change_verdicts() {
    let forward = engine_with(erp_system())
        .execute(
            request(mixed_batch(), mixed_rules(), json!([erp_tool()]), fast_runtime()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut reversed_batch = mixed_batch();
    reversed_batch.as_array_mut().unwrap().reverse();
    let reversed = engine_with(erp_system())
        .execute(
            request(reversed_batch, mixed_rules(), json!([erp_tool()]), fast_runtime()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(statuses(&forward), statuses(&reversed));
    assert_eq!(forward.summary, reversed.summary);
    let order: Vec<&str> = reversed.results.iter().map(|r| r.record_id.as_str()).collect();
    assert_eq!(order, vec!["r3", "r2", "r1"]);
}

#[tokio::test]
async fn run_events_bracket_the_checks() {
    let bus = Arc::new(EventBus::new(256));
    let mut rx = bus.subscribe();
    let engine = engine_with(Arc::new(InvoiceSystem::new(&[]))).with_events(bus);
    let data = json!([
        {"record_id": "r1", "payload": {"invoice_id": "INV-1"}},
        {"record_id": "r2", "payload": {"invoice_id": "INV-2"}}
    ]);
    let result = engine
        .execute(request(data, invoice_rules(), json!([]), json!({})), CancellationToken::new())
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    assert_eq!(kinds.first(), Some(&EventKind::RunStarted));
    assert_eq!(kinds.last(), Some(&EventKind::RunCompleted));
    let completed = kinds.iter().filter(|k| **k == EventKind::RuleCheckCompleted).count();
    assert_eq!(completed, result.summary.total_checks);
}

// ---------------------------------------------------------------------------
// Failures before evaluation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_record_ids_reject_the_batch() {
    let engine = engine_with(Arc::new(InvoiceSystem::new(&[])));
    let data = json!([
        {"record_id": "r1", "payload": {"invoice_id": "INV-1"}},
        {"record_id": "r1", "payload": {"invoice_id": "INV-2"}}
    ]);
    let err = engine
        .execute(request(data, invoice_rules(), json!([]), json!({})), CancellationToken::new())
        .await
        .unwrap_err();
    assert_matches!(err, EngineError::Run(RunError::InvalidBatch(_)));
}

#[tokio::test]
async fn dependency_cycle_fails_compilation() {
    let engine = engine_with(Arc::new(InvoiceSystem::new(&[])));
    let rules = json!([
        {"id": "a", "type": "not_null", "field": "invoice_id", "depends_on": ["b"]},
        {"id": "b", "type": "not_null", "field": "amount", "depends_on": ["a"]}
    ]);
    let err = engine
        .execute(
            request(json!([{"record_id": "r1", "payload": {}}]), rules, json!([]), json!({})),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_matches!(
        err,
        EngineError::Compilation(CompilationError::CyclicDependency { cycle }) if cycle.len() == 3
    );
}
