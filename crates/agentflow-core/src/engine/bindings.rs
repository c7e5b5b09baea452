//! Input binding resolution and `${...}` template rendering.
//!
//! Before a step executes, each of its declared input bindings is
//! resolved from the runtime inputs or the recorded output of an earlier
//! completed step. A resolution failure is not a run failure: the engine
//! marks the step skipped, which cascades to its dependents because
//! their own bindings then fail to resolve.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::models::workflow::{BindingSource, Bindings};

/// Why a binding could not be resolved.
#[derive(Debug, Clone)]
pub struct BindingFailure {
    pub binding: String,
    pub reason: String,
}

impl std::fmt::Display for BindingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "input '{}': {}", self.binding, self.reason)
    }
}

/// Resolve all declared bindings into a flat input object.
pub fn resolve_bindings(
    bindings: &Bindings,
    runtime: &Map<String, Value>,
    outputs: &HashMap<String, Value>,
) -> Result<Map<String, Value>, BindingFailure> {
    let mut resolved = Map::new();
    for (name, source) in bindings {
        let value = match source {
            BindingSource::Runtime { key } => runtime.get(key).cloned().ok_or_else(|| {
                BindingFailure {
                    binding: name.clone(),
                    reason: format!("runtime input '{}' is not set", key),
                }
            })?,
            BindingSource::Step { step, path } => {
                let output = outputs.get(step).ok_or_else(|| BindingFailure {
                    binding: name.clone(),
                    reason: format!("step '{}' has no recorded output", step),
                })?;
                match path {
                    Some(p) => lookup_path(output, p).ok_or_else(|| BindingFailure {
                        binding: name.clone(),
                        reason: format!("path '{}' not found in output of step '{}'", p, step),
                    })?,
                    None => output.clone(),
                }
            }
            BindingSource::Literal { value } => value.clone(),
        };
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

/// Walk a dotted path (`a.b.0.c`) into a JSON value.
fn lookup_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Render `${name}` and `${name.path}` references against resolved inputs.
/// Unknown references are left in place so the gap is visible downstream.
pub fn render_template(template: &str, scope: &Map<String, Value>) -> String {
    static TEMPLATE_RE: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").unwrap());
    TEMPLATE_RE.replace_all(template, |caps: &regex::Captures| {
        let expr = &caps[1];
        let (name, path) = match expr.split_once('.') {
            Some((n, p)) => (n, Some(p)),
            None => (expr, None),
        };
        let value = scope.get(name).and_then(|v| match path {
            Some(p) => lookup_path(v, p),
            None => Some(v.clone()),
        });
        match value {
            Some(v) => value_to_string(&v),
            None => format!("${{{}}}", expr),
        }
    })
    .to_string()
}

/// Recursively render templates inside string leaves of a params object.
pub fn render_params(params: &Value, scope: &Map<String, Value>) -> Value {
    match params {
        Value::String(s) => Value::String(render_template(s, scope)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_params(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_params(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::BindingSource;
    use std::collections::BTreeMap;

    fn scope() -> Map<String, Value> {
        serde_json::json!({
            "who": "world",
            "msg": { "subject": "invoice", "tags": ["billing", "urgent"] }
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn test_resolve_runtime_and_step_bindings() {
        let mut bindings: Bindings = BTreeMap::new();
        bindings.insert(
            "greeting".into(),
            BindingSource::Runtime { key: "who".into() },
        );
        bindings.insert(
            "subject".into(),
            BindingSource::Step {
                step: "fetch".into(),
                path: Some("subject".into()),
            },
        );
        bindings.insert(
            "n".into(),
            BindingSource::Literal {
                value: serde_json::json!(3),
            },
        );

        let mut runtime = Map::new();
        runtime.insert("who".into(), serde_json::json!("world"));
        let mut outputs = HashMap::new();
        outputs.insert("fetch".to_string(), serde_json::json!({"subject": "invoice"}));

        let resolved = resolve_bindings(&bindings, &runtime, &outputs).unwrap();
        assert_eq!(resolved["greeting"], serde_json::json!("world"));
        assert_eq!(resolved["subject"], serde_json::json!("invoice"));
        assert_eq!(resolved["n"], serde_json::json!(3));
    }

    #[test]
    fn test_missing_step_output_fails_resolution() {
        let mut bindings: Bindings = BTreeMap::new();
        bindings.insert(
            "x".into(),
            BindingSource::Step {
                step: "absent".into(),
                path: None,
            },
        );
        let err = resolve_bindings(&bindings, &Map::new(), &HashMap::new()).unwrap_err();
        assert!(err.reason.contains("no recorded output"));
    }

    #[test]
    fn test_render_template_with_paths() {
        let s = scope();
        assert_eq!(render_template("hello ${who}", &s), "hello world");
        assert_eq!(
            render_template("re: ${msg.subject} (${msg.tags.1})", &s),
            "re: invoice (urgent)"
        );
        assert_eq!(render_template("${unknown}", &s), "${unknown}");
    }

    #[test]
    fn test_render_params_walks_structures() {
        let s = scope();
        let params = serde_json::json!({
            "text": "about ${msg.subject}",
            "nested": { "items": ["${who}", 7] }
        });
        let rendered = render_params(&params, &s);
        assert_eq!(rendered["text"], serde_json::json!("about invoice"));
        assert_eq!(rendered["nested"]["items"][0], serde_json::json!("world"));
        assert_eq!(rendered["nested"]["items"][1], serde_json::json!(7));
    }
}
