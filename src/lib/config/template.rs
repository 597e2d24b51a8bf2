//! Template expansion, restricted to pure variable substitution.
//!
//! The source this was distilled from falls back to building and evaluating a function over the
//! scope when a `${expr}` isn't a known key, which amounts to embedding an expression evaluator in
//! the runtime core. This port does not carry that fallback: an unknown expression is left exactly
//! as written, rather than evaluated.

use std::collections::BTreeMap;

use serde_json::Value;

/// `key → stringified-value`, built from every scalar (string/number/bool/null) reachable in the
/// resolved config, indexed by both its full dotted path and its bare leaf name.
pub type Scope = BTreeMap<String, String>;

pub fn build_scope(value: &Value) -> Scope {
    let mut scope = Scope::new();
    collect_scope(value, "", &mut scope);
    scope
}

fn collect_scope(value: &Value, prefix: &str, scope: &mut Scope) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let full = if prefix.is_empty() { key.clone() } else { format!("{}.{}", prefix, key) };
                collect_scope(child, &full, scope);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                let full = format!("{}.{}", prefix, i);
                collect_scope(child, &full, scope);
            }
        }
        scalar => {
            if !prefix.is_empty() {
                let stringified = match scalar {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                scope.insert(prefix.to_string(), stringified.clone());
                if let Some(leaf) = prefix.rsplit('.').next() {
                    scope.insert(leaf.to_string(), stringified);
                }
            }
        }
    }
}

/// Recursively substitutes `${...}` templates throughout `value` using `scope`.
pub fn expand_templates(value: &Value, scope: &Scope) -> Value {
    match value {
        Value::String(s) => expand_string(s, scope),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), expand_templates(v, scope))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| expand_templates(v, scope)).collect()),
        other => other.clone(),
    }
}

fn expand_string(s: &str, scope: &Scope) -> Value {
    if let Some(expr) = whole_string_template(s) {
        return match scope.get(expr) {
            Some(stringified) => serde_json::from_str(stringified)
                .unwrap_or_else(|_| Value::String(stringified.clone())),
            None => Value::String(s.to_string()),
        };
    }

    if !s.contains("${") {
        return Value::String(s.to_string());
    }

    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let expr = &after[..end];
                out.push_str(scope.get(expr).map(String::as_str).unwrap_or(""));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

/// `s` is a single `${expr}` template spanning the entire string (the `^${expr}$` case).
fn whole_string_template(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") {
        return None;
    }
    Some(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whole_string_template_substitutes_typed_value() {
        let mut scope = Scope::new();
        scope.insert("port".to_string(), "8080".to_string());
        let doc = json!({"value": "${port}"});
        let expanded = expand_templates(&doc, &scope);
        assert_eq!(expanded["value"], json!(8080));
    }

    #[test]
    fn unknown_whole_string_template_is_left_intact() {
        let scope = Scope::new();
        let doc = json!({"value": "${nonexistent}"});
        let expanded = expand_templates(&doc, &scope);
        assert_eq!(expanded["value"], json!("${nonexistent}"));
    }

    #[test]
    fn inline_template_substitutes_into_larger_string() {
        let mut scope = Scope::new();
        scope.insert("host".to_string(), "example.com".to_string());
        let doc = json!({"url": "https://${host}/api"});
        let expanded = expand_templates(&doc, &scope);
        assert_eq!(expanded["url"], json!("https://example.com/api"));
    }

    #[test]
    fn inline_template_with_unknown_key_becomes_empty() {
        let scope = Scope::new();
        let doc = json!({"url": "https://${host}/api"});
        let expanded = expand_templates(&doc, &scope);
        assert_eq!(expanded["url"], json!("https:///api"));
    }

    #[test]
    fn expansion_is_idempotent() {
        let mut scope = Scope::new();
        scope.insert("name".to_string(), "sample".to_string());
        let doc = json!({"greeting": "hello ${name}"});
        let once = expand_templates(&doc, &scope);
        let twice = expand_templates(&once, &scope);
        assert_eq!(once, twice);
    }
}
