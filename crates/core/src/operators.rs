//! Operator library: pure comparison and matching functions.
//!
//! Every operator takes the `actual` value (from the record or a tool
//! response) and the `expected` value (a literal or a value selected from the
//! record) and returns a [`Comparison`] carrying the verdict and a diff
//! suitable for evidence. Numbers compare numerically, and numeric strings
//! (`"199.99"`) are accepted wherever a number is expected because external
//! systems frequently serialize amounts as text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Slack added to approx comparisons to absorb binary float rounding.
const FLOAT_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Approx,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    Regex,
    Contains,
    In,
    Subset,
    Superset,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Approx => "approx",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Between => "between",
            Operator::Regex => "regex",
            Operator::Contains => "contains",
            Operator::In => "in",
            Operator::Subset => "subset",
            Operator::Superset => "superset",
        }
    }
}

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// Verdict of a single operator application.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub passed: bool,
    pub diff: Value,
}

/// The operator could not be applied to the given operands.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OperatorError {
    #[error("Operator '{operator}' expects {expected}, found {found}")]
    TypeMismatch {
        operator: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("Invalid argument for '{operator}': {reason}")]
    InvalidArgument {
        operator: &'static str,
        reason: String,
    },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Apply `op` to `actual` against `expected`.
///
/// `tolerance` is only consulted by [`Operator::Approx`] and defaults to an
/// exact comparison. [`Operator::Regex`] compiles `expected` on every call;
/// callers evaluating the same pattern repeatedly should precompile and use
/// [`matches_pattern`].
pub fn apply(
    op: Operator,
    actual: &Value,
    expected: &Value,
    tolerance: Option<f64>,
) -> Result<Comparison, OperatorError> {
    let passed = match op {
        Operator::Eq => values_equal(actual, expected),
        Operator::Ne => !values_equal(actual, expected),
        Operator::Approx => {
            let tolerance = tolerance.unwrap_or(0.0);
            if tolerance < 0.0 {
                return Err(OperatorError::InvalidArgument {
                    operator: op.as_str(),
                    reason: "tolerance must not be negative".into(),
                });
            }
            let a = number(op, actual)?;
            let e = number(op, expected)?;
            let passed = (a - e).abs() <= tolerance + FLOAT_EPSILON;
            return Ok(Comparison {
                passed,
                diff: json!({
                    "expected": expected,
                    "actual": actual,
                    "tolerance": tolerance,
                }),
            });
        }
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let ordering = order(op, actual, expected)?;
            match op {
                Operator::Gt => ordering.is_gt(),
                Operator::Gte => ordering.is_ge(),
                Operator::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            }
        }
        Operator::Between => {
            let (min, max) = bounds(op, expected)?;
            let mut passed = true;
            if let Some(min) = min {
                passed &= order(op, actual, min)?.is_ge();
            }
            if let Some(max) = max {
                passed &= order(op, actual, max)?.is_le();
            }
            return Ok(Comparison {
                passed,
                diff: json!({
                    "min": min,
                    "max": max,
                    "actual": actual,
                }),
            });
        }
        Operator::Regex => {
            let pattern = expected.as_str().ok_or_else(|| OperatorError::TypeMismatch {
                operator: op.as_str(),
                expected: "a string pattern",
                found: type_name(expected).into(),
            })?;
            let re = compile_pattern(pattern)?;
            matches_pattern(&re, actual)?
        }
        Operator::Contains => match actual {
            Value::String(s) => {
                let needle = expected.as_str().ok_or_else(|| OperatorError::TypeMismatch {
                    operator: op.as_str(),
                    expected: "a string needle",
                    found: type_name(expected).into(),
                })?;
                s.contains(needle)
            }
            Value::Array(items) => items.iter().any(|v| values_equal(v, expected)),
            Value::Object(map) => expected.as_str().is_some_and(|k| map.contains_key(k)),
            other => {
                return Err(OperatorError::TypeMismatch {
                    operator: op.as_str(),
                    expected: "a string, array or object",
                    found: type_name(other).into(),
                })
            }
        },
        Operator::In => array(op, expected)?.iter().any(|v| values_equal(actual, v)),
        Operator::Subset => {
            let set = array(op, expected)?;
            array(op, actual)?
                .iter()
                .all(|a| set.iter().any(|e| values_equal(a, e)))
        }
        Operator::Superset => {
            let have = array(op, actual)?;
            array(op, expected)?
                .iter()
                .all(|e| have.iter().any(|a| values_equal(a, e)))
        }
    };

    Ok(Comparison {
        passed,
        diff: json!({
            "operator": op.as_str(),
            "expected": expected,
            "actual": actual,
        }),
    })
}

// ---------------------------------------------------------------------------
// Building blocks shared with the rule evaluator
// ---------------------------------------------------------------------------

/// Compile a regex pattern, mapping failures to [`OperatorError`].
pub fn compile_pattern(pattern: &str) -> Result<Regex, OperatorError> {
    Regex::new(pattern).map_err(|e| OperatorError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Match a string value against a precompiled pattern.
pub fn matches_pattern(re: &Regex, actual: &Value) -> Result<bool, OperatorError> {
    match actual {
        Value::String(s) => Ok(re.is_match(s)),
        Value::Number(n) => Ok(re.is_match(&n.to_string())),
        other => Err(OperatorError::TypeMismatch {
            operator: "regex",
            expected: "a string",
            found: type_name(other).into(),
        }),
    }
}

/// True when the value is absent, JSON null, or an empty / whitespace-only
/// string.
pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

/// JSON equality with numeric normalisation (`1 == 1.0`, `"5" != 5`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Coerce a value to `f64`, accepting numeric strings.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn number(op: Operator, value: &Value) -> Result<f64, OperatorError> {
    as_number(value).ok_or_else(|| OperatorError::TypeMismatch {
        operator: op.as_str(),
        expected: "a number",
        found: type_name(value).into(),
    })
}

fn array(op: Operator, value: &Value) -> Result<&Vec<Value>, OperatorError> {
    value.as_array().ok_or_else(|| OperatorError::TypeMismatch {
        operator: op.as_str(),
        expected: "an array",
        found: type_name(value).into(),
    })
}

/// Numbers compare numerically; two strings compare lexicographically, which
/// orders ISO-8601 dates correctly.
fn order(
    op: Operator,
    actual: &Value,
    expected: &Value,
) -> Result<std::cmp::Ordering, OperatorError> {
    if let (Value::String(a), Value::String(e)) = (actual, expected) {
        if let (Ok(a), Ok(e)) = (a.trim().parse::<f64>(), e.trim().parse::<f64>()) {
            return a.partial_cmp(&e).ok_or_else(|| not_comparable(op));
        }
        return Ok(a.cmp(e));
    }
    let a = number(op, actual)?;
    let e = number(op, expected)?;
    a.partial_cmp(&e).ok_or_else(|| not_comparable(op))
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn not_comparable(op: Operator) -> OperatorError {
    OperatorError::InvalidArgument {
        operator: op.as_str(),
        reason: "operands are not comparable".into(),
    }
}

/// Accept `[min, max]` or `{"min": .., "max": ..}`; either bound may be null.
fn bounds(
    op: Operator,
    expected: &Value,
) -> Result<(Option<&Value>, Option<&Value>), OperatorError> {
    match expected {
        Value::Array(items) if items.len() == 2 => {
            Ok((non_null(items.first()), non_null(items.get(1))))
        }
        Value::Object(map) => Ok((non_null(map.get("min")), non_null(map.get("max")))),
        _ => Err(OperatorError::InvalidArgument {
            operator: op.as_str(),
            reason: "expected [min, max] or {min, max}".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn check(op: Operator, actual: Value, expected: Value) -> bool {
        apply(op, &actual, &expected, None).unwrap().passed
    }

    #[test]
    fn eq_normalises_numbers() {
        assert!(check(Operator::Eq, json!(1), json!(1.0)));
        assert!(!check(Operator::Eq, json!("1"), json!(1)));
        assert!(check(Operator::Ne, json!("a"), json!("b")));
    }

    #[test]
    fn approx_outside_tolerance_reports_diff() {
        let got = apply(Operator::Approx, &json!(199.49), &json!(199.99), Some(0.01)).unwrap();
        assert!(!got.passed);
        assert_eq!(
            got.diff,
            json!({"expected": 199.99, "actual": 199.49, "tolerance": 0.01})
        );
    }

    #[test]
    fn approx_within_tolerance_and_numeric_strings() {
        let got = apply(Operator::Approx, &json!("10.005"), &json!(10.0), Some(0.01)).unwrap();
        assert!(got.passed);
        assert!(check(Operator::Approx, json!(0.3), json!(0.1 + 0.2)));
    }

    #[test]
    fn approx_rejects_negative_tolerance() {
        let err = apply(Operator::Approx, &json!(1), &json!(1), Some(-1.0)).unwrap_err();
        assert_matches!(err, OperatorError::InvalidArgument { .. });
    }

    #[test]
    fn ordering_operators() {
        assert!(check(Operator::Gt, json!(5), json!(3)));
        assert!(check(Operator::Gte, json!(3), json!(3)));
        assert!(check(Operator::Lt, json!("2024-01-01"), json!("2024-02-01")));
        assert!(!check(Operator::Lte, json!("10"), json!("9.5")));
        let err = apply(Operator::Gt, &json!(true), &json!(1), None).unwrap_err();
        assert_matches!(err, OperatorError::TypeMismatch { operator: "gt", .. });
    }

    #[test]
    fn between_accepts_both_bound_shapes() {
        assert!(check(Operator::Between, json!(5), json!([1, 10])));
        assert!(!check(Operator::Between, json!(11), json!({"min": 1, "max": 10})));
        assert!(check(Operator::Between, json!(1000), json!({"min": 1, "max": null})));
        let err = apply(Operator::Between, &json!(1), &json!(3), None).unwrap_err();
        assert_matches!(err, OperatorError::InvalidArgument { .. });
    }

    #[test]
    fn regex_and_invalid_pattern() {
        assert!(check(Operator::Regex, json!("INV-123"), json!("^INV-[0-9]+$")));
        assert!(!check(Operator::Regex, json!("INV-12a"), json!("^INV-[0-9]+$")));
        let err = apply(Operator::Regex, &json!("x"), &json!("(unclosed"), None).unwrap_err();
        assert_matches!(err, OperatorError::InvalidPattern { .. });
    }

    #[test]
    fn containment_and_sets() {
        assert!(check(Operator::Contains, json!("hello world"), json!("lo w")));
        assert!(check(Operator::Contains, json!([1, 2, 3]), json!(2.0)));
        assert!(check(Operator::Contains, json!({"k": 1}), json!("k")));
        assert!(check(Operator::In, json!("b"), json!(["a", "b"])));
        assert!(check(Operator::Subset, json!(["a"]), json!(["a", "b"])));
        assert!(!check(Operator::Subset, json!(["a", "c"]), json!(["a", "b"])));
        assert!(check(Operator::Superset, json!(["a", "b", "c"]), json!(["c", "a"])));
        assert!(check(Operator::Subset, json!([]), json!(["a"])));
    }

    #[test]
    fn blank_detection() {
        assert!(is_blank(None));
        assert!(is_blank(Some(&Value::Null)));
        assert!(is_blank(Some(&json!("  "))));
        assert!(!is_blank(Some(&json!(0))));
        assert!(!is_blank(Some(&json!(false))));
    }

    #[test]
    fn operator_serde_names() {
        assert_eq!(serde_json::to_value(Operator::Approx).unwrap(), json!("approx"));
        let op: Operator = serde_json::from_value(json!("superset")).unwrap();
        assert_eq!(op, Operator::Superset);
    }
}
