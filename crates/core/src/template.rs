//! `{{ path }}` placeholder rendering for lookup requests and prompts.
//!
//! A string that consists of exactly one placeholder is replaced by the
//! selected value with its JSON type intact, so `"{{amount}}"` renders to the
//! number `199.99`. Placeholders embedded in longer strings are interpolated
//! as text.

use serde_json::Value;

use crate::path::{JsonPath, PathError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("Template references '{0}' which is missing from the record")]
    Missing(String),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("Unterminated placeholder in '{0}'")]
    Unterminated(String),
}

/// Render every placeholder inside `template` against `root`.
pub fn render(template: &Value, root: &Value) -> Result<Value, TemplateError> {
    match template {
        Value::String(s) => render_string_value(s, root),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, root))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), render(value, root)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Render a text template, interpolating every placeholder as text.
pub fn render_str(template: &str, root: &Value) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(template.to_string()))?;
        let value = lookup(after[..end].trim(), root)?;
        match value {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// List the paths referenced by placeholders anywhere inside `template`.
pub fn placeholders(template: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_placeholders(template, &mut found);
    found
}

/// List the paths referenced by placeholders in a text template.
pub fn placeholders_in(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                found.push(after[..end].trim().to_string());
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    found
}

fn collect_placeholders(template: &Value, found: &mut Vec<String>) {
    match template {
        Value::String(s) => found.extend(placeholders_in(s)),
        Value::Array(items) => items.iter().for_each(|i| collect_placeholders(i, found)),
        Value::Object(map) => map.values().for_each(|v| collect_placeholders(v, found)),
        _ => {}
    }
}

fn render_string_value(s: &str, root: &Value) -> Result<Value, TemplateError> {
    let trimmed = s.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|r| r.strip_suffix("}}"))
    {
        if !inner.contains("{{") && !inner.contains("}}") {
            return lookup(inner.trim(), root).cloned();
        }
    }
    if s.contains("{{") {
        return render_str(s, root).map(Value::String);
    }
    Ok(Value::String(s.to_string()))
}

fn lookup<'a>(path: &str, root: &'a Value) -> Result<&'a Value, TemplateError> {
    JsonPath::parse(path)?
        .select_one(root)
        .ok_or_else(|| TemplateError::Missing(path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Value {
        json!({"invoice_id": "INV-1", "amount": 199.99, "customer": {"id": 7}})
    }

    #[test]
    fn whole_placeholder_keeps_type() {
        let t = json!({"id": "{{ invoice_id }}", "amt": "{{amount}}", "cust": "{{customer.id}}"});
        let got = render(&t, &record()).unwrap();
        assert_eq!(got, json!({"id": "INV-1", "amt": 199.99, "cust": 7}));
    }

    #[test]
    fn embedded_placeholders_interpolate() {
        let t = json!({"url": "https://erp/invoices/{{invoice_id}}?c={{customer.id}}"});
        let got = render(&t, &record()).unwrap();
        assert_eq!(got, json!({"url": "https://erp/invoices/INV-1?c=7"}));
    }

    #[test]
    fn missing_path_is_an_error() {
        let err = render(&json!(["{{nope}}"]), &record()).unwrap_err();
        assert_eq!(err, TemplateError::Missing("nope".into()));
    }

    #[test]
    fn unterminated_placeholder() {
        let err = render_str("id={{invoice_id", &record()).unwrap_err();
        assert!(matches!(err, TemplateError::Unterminated(_)));
    }

    #[test]
    fn collects_placeholders() {
        let t = json!({"a": "{{x}}", "b": ["pre {{ y.z }} post"], "c": 3});
        let mut got = placeholders(&t);
        got.sort();
        assert_eq!(got, vec!["x".to_string(), "y.z".to_string()]);
    }

    #[test]
    fn non_string_literals_pass_through() {
        let t = json!({"limit": 5, "flag": true, "plain": "text"});
        assert_eq!(render(&t, &record()).unwrap(), t);
    }
}
