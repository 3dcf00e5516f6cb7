//! Deterministic checks: pure functions over a bound record or batch view.
//!
//! Value checks (`pattern`, `range`, `enum`, `type_check`) do not enforce
//! presence; a missing or null value passes and is left to `not_null`.

use std::collections::HashMap;

use attestor_core::hashing::canonical_json;
use attestor_core::operators::{self, Operator, OperatorError};
use attestor_core::outcome::{CheckStatus, Strategy};
use attestor_core::path::JsonPath;
use attestor_core::record::Record;
use attestor_core::rule::SemanticCheck;
use attestor_core::schema::FieldType;
use attestor_core::types::RecordId;
use regex::Regex;
use serde_json::{json, Value};

use crate::evaluator::{EvalFailure, Verdict};
use crate::evidence::EvidenceDraft;
use crate::judgment::Judgment;

fn inputs(field: &JsonPath, values: &[&Value]) -> Value {
    let value = match values {
        [single] => (*single).clone(),
        many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
    };
    json!({ "field": field.as_str(), "value": value })
}

fn present<'a>(field: &JsonPath, root: &'a Value) -> Vec<&'a Value> {
    field.select(root).into_iter().filter(|v| !v.is_null()).collect()
}

fn deterministic(passed: bool, explanation: impl FnOnce() -> String, evidence: EvidenceDraft) -> Verdict {
    if passed {
        Verdict::pass(Strategy::Deterministic, evidence)
    } else {
        Verdict::fail(Strategy::Deterministic, explanation(), evidence)
    }
}

// ---------------------------------------------------------------------------
// Field checks
// ---------------------------------------------------------------------------

pub(crate) fn not_null(field: &JsonPath, root: &Value) -> Verdict {
    let values = field.select(root);
    let blank = values.is_empty() || values.iter().any(|v| operators::is_blank(Some(v)));
    deterministic(
        !blank,
        || format!("Field '{field}' is missing, null or empty"),
        EvidenceDraft {
            inputs: inputs(field, &values),
            ..Default::default()
        },
    )
}

pub(crate) fn pattern(
    field: &JsonPath,
    pattern: &str,
    compiled: Option<&Result<Regex, String>>,
    root: &Value,
) -> Result<Verdict, EvalFailure> {
    let re = match compiled {
        Some(Ok(re)) => re,
        Some(Err(reason)) => {
            return Err(EvalFailure::Malformed(format!("Invalid pattern '{pattern}': {reason}")));
        }
        None => {
            return Err(EvalFailure::Malformed(format!("Pattern '{pattern}' was not compiled")));
        }
    };
    let values = present(field, root);
    let mut offender = None;
    for value in &values {
        match operators::matches_pattern(re, value) {
            Ok(true) => {}
            Ok(false) | Err(OperatorError::TypeMismatch { .. }) => {
                offender = Some(*value);
                break;
            }
            Err(e) => return Err(EvalFailure::Malformed(e.to_string())),
        }
    }
    let evidence = EvidenceDraft {
        inputs: inputs(field, &values),
        diff: offender.map(|v| json!({ "pattern": pattern, "actual": v })),
        ..Default::default()
    };
    Ok(deterministic(
        offender.is_none(),
        || format!("Field '{field}' does not match pattern '{pattern}'"),
        evidence,
    ))
}

pub(crate) fn range(field: &JsonPath, min: Option<f64>, max: Option<f64>, root: &Value) -> Verdict {
    let values = present(field, root);
    let offender = values.iter().copied().find(|v| match operators::as_number(v) {
        Some(n) => min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m),
        None => true,
    });
    let evidence = EvidenceDraft {
        inputs: inputs(field, &values),
        diff: offender.map(|v| json!({ "min": min, "max": max, "actual": v })),
        ..Default::default()
    };
    deterministic(
        offender.is_none(),
        || match offender.and_then(operators::as_number) {
            Some(_) => format!("Field '{field}' is outside the allowed range"),
            None => format!("Field '{field}' is not numeric"),
        },
        evidence,
    )
}

pub(crate) fn enum_values(field: &JsonPath, allowed: &[Value], root: &Value) -> Verdict {
    let values = present(field, root);
    let offender = values
        .iter()
        .copied()
        .find(|v| !allowed.iter().any(|a| operators::values_equal(v, a)));
    let evidence = EvidenceDraft {
        inputs: inputs(field, &values),
        diff: offender.map(|v| json!({ "allowed": allowed, "actual": v })),
        ..Default::default()
    };
    deterministic(
        offender.is_none(),
        || format!("Field '{field}' is not one of the allowed values"),
        evidence,
    )
}

pub(crate) fn type_check(field: &JsonPath, expected: FieldType, root: &Value) -> Verdict {
    let values = present(field, root);
    let offender = values.iter().copied().find(|v| !expected.matches(v));
    let evidence = EvidenceDraft {
        inputs: inputs(field, &values),
        diff: offender.map(|v| json!({ "expected": expected.as_str(), "actual": v })),
        ..Default::default()
    };
    deterministic(
        offender.is_none(),
        || {
            let found = offender.map(operators::type_name).unwrap_or("nothing");
            format!("Field '{field}' should be {}, found {found}", expected.as_str())
        },
        evidence,
    )
}

// ---------------------------------------------------------------------------
// Comparisons
// ---------------------------------------------------------------------------

pub(crate) fn cross_field(
    left: &JsonPath,
    operator: Operator,
    right: Option<&JsonPath>,
    value: Option<&Value>,
    tolerance: Option<f64>,
    root: &Value,
) -> Result<Verdict, EvalFailure> {
    let actual = left
        .select_one(root)
        .ok_or_else(|| EvalFailure::MissingData(format!("Record has no value at '{left}'")))?;
    let expected = match (right, value) {
        (Some(path), _) => path
            .select_one(root)
            .ok_or_else(|| EvalFailure::MissingData(format!("Record has no value at '{path}'")))?,
        (None, Some(value)) => value,
        (None, None) => {
            return Err(EvalFailure::Malformed(
                "cross_field needs 'right' or 'value'".to_string(),
            ));
        }
    };
    let evidence_inputs = json!({
        "left": left.as_str(),
        "right": right.map(JsonPath::as_str),
        "actual": actual,
        "expected": expected,
    });
    compare(operator, actual, expected, tolerance, evidence_inputs, None, Strategy::Deterministic)
}

/// Apply an operator and turn the comparison into a verdict.
///
/// A type mismatch between operands is a FAIL; an invalid operator argument
/// is a malformed rule.
pub(crate) fn compare(
    operator: Operator,
    actual: &Value,
    expected: &Value,
    tolerance: Option<f64>,
    inputs: Value,
    response: Option<Value>,
    strategy: Strategy,
) -> Result<Verdict, EvalFailure> {
    match operators::apply(operator, actual, expected, tolerance) {
        Ok(cmp) => {
            let evidence = EvidenceDraft {
                inputs,
                response,
                diff: Some(cmp.diff),
            };
            if cmp.passed {
                Ok(Verdict::pass(strategy, evidence))
            } else {
                Ok(Verdict::fail(
                    strategy,
                    format!("Expected {actual} {} {expected}", operator.as_str()),
                    evidence,
                ))
            }
        }
        Err(e @ OperatorError::TypeMismatch { .. }) => Ok(Verdict::fail(
            strategy,
            e.to_string(),
            EvidenceDraft {
                inputs,
                response,
                diff: None,
            },
        )),
        Err(e) => Err(EvalFailure::Malformed(e.to_string())),
    }
}

/// Evaluate an `assert` condition against the bound value.
pub(crate) fn condition_assert(
    path: &JsonPath,
    operator: Operator,
    expected: &Value,
    tolerance: Option<f64>,
    root: &Value,
) -> Result<bool, EvalFailure> {
    let actual = path.select_one(root).unwrap_or(&Value::Null);
    match operators::apply(operator, actual, expected, tolerance) {
        Ok(cmp) => Ok(cmp.passed),
        Err(OperatorError::TypeMismatch { .. }) => Ok(false),
        Err(e) => Err(EvalFailure::Malformed(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Batch uniqueness
// ---------------------------------------------------------------------------

/// One verdict per record. Records with a null or missing key component are
/// not compared.
pub(crate) fn unique(fields: &[JsonPath], records: &[Record]) -> Vec<(RecordId, Verdict)> {
    let keys: Vec<Option<Vec<Value>>> = records
        .iter()
        .map(|record| {
            fields
                .iter()
                .map(|f| f.select_one(&record.payload).filter(|v| !v.is_null()).cloned())
                .collect()
        })
        .collect();

    let mut occurrences: HashMap<String, Vec<&str>> = HashMap::new();
    for (record, key) in records.iter().zip(&keys) {
        if let Some(key) = key {
            occurrences
                .entry(canonical_json(&Value::Array(key.clone())))
                .or_default()
                .push(&record.record_id);
        }
    }

    let field_names: Vec<&str> = fields.iter().map(JsonPath::as_str).collect();
    records
        .iter()
        .zip(keys)
        .map(|(record, key)| {
            let verdict = match key {
                None => Verdict::pass(
                    Strategy::Deterministic,
                    EvidenceDraft {
                        inputs: json!({ "fields": field_names, "key": null }),
                        ..Default::default()
                    },
                ),
                Some(key) => {
                    let ids = occurrences
                        .get(&canonical_json(&Value::Array(key.clone())))
                        .cloned()
                        .unwrap_or_default();
                    let evidence = EvidenceDraft {
                        inputs: json!({ "fields": field_names, "key": key }),
                        diff: (ids.len() > 1)
                            .then(|| json!({ "occurrences": ids.len(), "records": ids })),
                        ..Default::default()
                    };
                    if ids.len() > 1 {
                        Verdict::fail(
                            Strategy::Deterministic,
                            format!(
                                "Duplicate key {} appears {} times in the batch",
                                describe_key(&field_names, &key),
                                ids.len()
                            ),
                            evidence,
                        )
                    } else {
                        Verdict::pass(Strategy::Deterministic, evidence)
                    }
                }
            };
            (record.record_id.clone(), verdict)
        })
        .collect()
}

fn describe_key(fields: &[&str], key: &[Value]) -> String {
    let parts: Vec<String> = fields
        .iter()
        .zip(key)
        .map(|(f, v)| match v {
            Value::String(s) => format!("{f}={s}"),
            other => format!("{f}={other}"),
        })
        .collect();
    format!("({})", parts.join(", "))
}

// ---------------------------------------------------------------------------
// Judgment mapping
// ---------------------------------------------------------------------------

/// Map a categorical answer to a status. Confidence below `threshold`
/// downgrades a definite answer to WARN.
pub(crate) fn judgment_status(
    check: &SemanticCheck,
    judgment: &Judgment,
    threshold: f64,
) -> (CheckStatus, Option<String>) {
    let answer = judgment.answer.trim().to_lowercase();
    let listed = |answers: &[String]| answers.iter().any(|a| a.trim().to_lowercase() == answer);

    let status = if listed(&check.pass_answers) {
        CheckStatus::Pass
    } else if listed(&check.fail_answers) {
        CheckStatus::Fail
    } else {
        return (
            CheckStatus::Warn,
            Some(format!("Unrecognised judgment answer '{}'", judgment.answer)),
        );
    };

    if let Some(confidence) = judgment.confidence {
        if confidence < threshold {
            return (
                CheckStatus::Warn,
                Some(format!(
                    "Judgment '{}' has confidence {confidence} below threshold {threshold}",
                    judgment.answer
                )),
            );
        }
    }

    match status {
        CheckStatus::Fail => {
            let mut explanation = format!("Judgment answered '{}'", judgment.answer);
            if let Some(rationale) = &judgment.rationale {
                explanation.push_str(": ");
                explanation.push_str(rationale);
            }
            (status, Some(explanation))
        }
        _ => (status, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> JsonPath {
        JsonPath::parse(raw).unwrap()
    }

    #[test]
    fn not_null_rejects_blank() {
        let root = json!({"a": "x", "b": "  ", "c": null});
        assert_eq!(not_null(&path("a"), &root).status, CheckStatus::Pass);
        assert_eq!(not_null(&path("b"), &root).status, CheckStatus::Fail);
        assert_eq!(not_null(&path("c"), &root).status, CheckStatus::Fail);
        assert_eq!(not_null(&path("d"), &root).status, CheckStatus::Fail);
    }

    #[test]
    fn pattern_skips_missing_and_reports_offender() {
        let re = Regex::new("^INV-[0-9]+$").unwrap();
        let compiled = Ok(re);
        let ok = pattern(&path("id"), "^INV-[0-9]+$", Some(&compiled), &json!({"id": "INV-123"})).unwrap();
        assert_eq!(ok.status, CheckStatus::Pass);
        let missing = pattern(&path("id"), "^INV-[0-9]+$", Some(&compiled), &json!({})).unwrap();
        assert_eq!(missing.status, CheckStatus::Pass);
        let bad = pattern(&path("id"), "^INV-[0-9]+$", Some(&compiled), &json!({"id": "X-1"})).unwrap();
        assert_eq!(bad.status, CheckStatus::Fail);
        assert_eq!(bad.evidence.unwrap().diff.unwrap()["actual"], json!("X-1"));
    }

    #[test]
    fn invalid_pattern_is_malformed() {
        let compiled = Err("unclosed group".to_string());
        let err = pattern(&path("id"), "([", Some(&compiled), &json!({"id": "x"})).unwrap_err();
        assert!(matches!(err, EvalFailure::Malformed(_)));
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let root = json!({"low": 0, "high": 100, "over": 100.5, "text": "abc"});
        let check = |f: &str| range(&path(f), Some(0.0), Some(100.0), &root).status;
        assert_eq!(check("low"), CheckStatus::Pass);
        assert_eq!(check("high"), CheckStatus::Pass);
        assert_eq!(check("over"), CheckStatus::Fail);
        assert_eq!(check("text"), CheckStatus::Fail);
    }

    #[test]
    fn enum_and_type_checks() {
        let root = json!({"currency": "EUR", "qty": "3"});
        let allowed = vec![json!("EUR"), json!("USD")];
        assert_eq!(enum_values(&path("currency"), &allowed, &root).status, CheckStatus::Pass);
        assert_eq!(
            type_check(&path("qty"), FieldType::Integer, &root).status,
            CheckStatus::Fail
        );
        assert_eq!(
            type_check(&path("missing"), FieldType::Integer, &root).status,
            CheckStatus::Pass
        );
    }

    #[test]
    fn cross_field_compares_two_paths() {
        let root = json!({"net": 100, "gross": 119});
        let v = cross_field(&path("gross"), Operator::Gte, Some(&path("net")), None, None, &root).unwrap();
        assert_eq!(v.status, CheckStatus::Pass);
        let err = cross_field(&path("tax"), Operator::Gte, Some(&path("net")), None, None, &root);
        assert!(matches!(err, Err(EvalFailure::MissingData(_))));
    }

    #[test]
    fn unique_flags_every_duplicate_occurrence() {
        let records = vec![
            Record::new("r1", json!({"invoice_id": "INV-123"})),
            Record::new("r2", json!({"invoice_id": "INV-123"})),
            Record::new("r3", json!({"invoice_id": "INV-124"})),
            Record::new("r4", json!({"invoice_id": null})),
        ];
        let verdicts = unique(&[path("invoice_id")], &records);
        let statuses: Vec<CheckStatus> = verdicts.iter().map(|(_, v)| v.status).collect();
        assert_eq!(
            statuses,
            vec![CheckStatus::Fail, CheckStatus::Fail, CheckStatus::Pass, CheckStatus::Pass]
        );
        let explanation = verdicts[0].1.explanation.as_deref().unwrap();
        assert!(explanation.contains("appears 2 times"), "{explanation}");
        assert!(explanation.contains("invoice_id=INV-123"), "{explanation}");
    }

    #[test]
    fn composite_unique_key() {
        let records = vec![
            Record::new("a", json!({"vendor": "V1", "number": 1})),
            Record::new("b", json!({"vendor": "V2", "number": 1})),
            Record::new("c", json!({"number": 1, "vendor": "V1"})),
        ];
        let verdicts = unique(&[path("vendor"), path("number")], &records);
        let failed: Vec<&str> = verdicts
            .iter()
            .filter(|(_, v)| v.status == CheckStatus::Fail)
            .map(|(id, _)| id.as_str())
            .collect();
        assert_eq!(failed, vec!["a", "c"]);
    }

    #[test]
    fn judgment_mapping_with_threshold() {
        let check = SemanticCheck {
            prompt: String::new(),
            context_fields: vec![],
            pass_answers: vec!["yes".into()],
            fail_answers: vec!["no".into()],
            threshold: None,
            advisory: true,
        };
        let status = |answer: &str, confidence| {
            judgment_status(&check, &Judgment::new(answer, confidence), 0.7).0
        };
        assert_eq!(status("Yes", Some(0.9)), CheckStatus::Pass);
        assert_eq!(status("no", None), CheckStatus::Fail);
        assert_eq!(status("yes", Some(0.4)), CheckStatus::Warn);
        assert_eq!(status("maybe", Some(0.99)), CheckStatus::Warn);
    }
}
