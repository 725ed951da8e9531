//! `${path}` placeholder resolution for action parameters.
//!
//! A string that is exactly one placeholder is replaced by the typed value it
//! names. Placeholders embedded in longer text are interpolated as text.
//! A placeholder that cannot be resolved keeps its literal text.

use crate::condition::text;
use modlink_bus::Value;
use serde_json::Map;
use tracing::debug;

/// Resolve every parameter value against `lookup`.
pub fn resolve_parameters<F>(parameters: &Map<String, Value>, lookup: F) -> Map<String, Value>
where
    F: Fn(&str) -> Option<Value>,
{
    parameters
        .iter()
        .map(|(name, value)| (name.clone(), resolve_value(value, &lookup)))
        .collect()
}

/// Resolve placeholders in a single value. Arrays and objects are walked.
pub fn resolve_value<F>(value: &Value, lookup: &F) -> Value
where
    F: Fn(&str) -> Option<Value>,
{
    match value {
        Value::String(s) => resolve_string(s, lookup),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, lookup)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string<F>(s: &str, lookup: &F) -> Value
where
    F: Fn(&str) -> Option<Value>,
{
    if let Some(path) = exact_placeholder(s) {
        return match lookup(path) {
            Some(value) => value,
            None => {
                debug!(placeholder = %s, "Unresolved placeholder kept literally");
                Value::String(s.to_string())
            }
        };
    }

    if !s.contains("${") {
        return Value::String(s.to_string());
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let path = after[..end].trim();
                match lookup(path) {
                    Some(value) => out.push_str(&text(&value)),
                    None => {
                        debug!(placeholder = %path, "Unresolved placeholder kept literally");
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

/// `Some(path)` when `s` is exactly `${path}`.
fn exact_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains('}') || inner.contains("${") {
        return None;
    }
    let inner = inner.trim();
    (!inner.is_empty()).then_some(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup(path: &str) -> Option<Value> {
        match path {
            "ButtonId" => Some(json!("broadcast")),
            "ClickCount" => Some(json!(3)),
            "Parameters.amount" => Some(json!(150.5)),
            _ => None,
        }
    }

    #[test]
    fn test_exact_placeholder_keeps_type() {
        assert_eq!(resolve_value(&json!("${ClickCount}"), &lookup), json!(3));
        assert_eq!(resolve_value(&json!("${ButtonId}"), &lookup), json!("broadcast"));
        assert_eq!(resolve_value(&json!("${ Parameters.amount }"), &lookup), json!(150.5));
    }

    #[test]
    fn test_embedded_placeholders_interpolate() {
        assert_eq!(
            resolve_value(&json!("Hello! (clicks: ${ClickCount})"), &lookup),
            json!("Hello! (clicks: 3)")
        );
        assert_eq!(
            resolve_value(&json!("${ButtonId}/${ClickCount}"), &lookup),
            json!("broadcast/3")
        );
    }

    #[test]
    fn test_unresolved_kept_literally() {
        assert_eq!(resolve_value(&json!("${Missing}"), &lookup), json!("${Missing}"));
        assert_eq!(
            resolve_value(&json!("a ${Missing} b ${ClickCount}"), &lookup),
            json!("a ${Missing} b 3")
        );
        assert_eq!(resolve_value(&json!("open ${ButtonId"), &lookup), json!("open ${ButtonId"));
    }

    #[test]
    fn test_literals_pass_through() {
        let params = json!({ "n": 5, "flag": true, "list": ["${ButtonId}", 1] });
        let Value::Object(map) = params else { unreachable!() };
        let resolved = resolve_parameters(&map, lookup);
        assert_eq!(resolved["n"], json!(5));
        assert_eq!(resolved["flag"], json!(true));
        assert_eq!(resolved["list"], json!(["broadcast", 1]));
    }
}
