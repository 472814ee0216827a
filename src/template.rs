//! `${name}` substitution over state variables.
//!
//! Templates render to text, or walk a JSON value so structured bodies are
//! rebuilt with typed values instead of being stitched together as strings.

use serde_json::{Map, Value};

use crate::error::FlowError;
use crate::state::VariableSource;

/// Text form of a value when it is embedded in a string.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Replace every `${name}` in `template`. Unknown names and an unterminated
/// `${` are errors; text without tokens is returned unchanged.
pub fn render(template: &str, vars: &impl VariableSource) -> Result<String, FlowError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(FlowError::Template(format!(
                "unterminated `${{` in `{template}`"
            )));
        };
        let name = after[..end].trim();
        if name.is_empty() {
            return Err(FlowError::Template(format!("empty variable in `{template}`")));
        }
        let value = vars
            .lookup(name)
            .ok_or_else(|| FlowError::Template(format!("unknown variable `{name}`")))?;
        out.push_str(&value_to_text(&value));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Name of the variable when `s` is exactly one `${name}` token.
pub fn sole_variable(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains('}') || inner.contains("${") {
        return None;
    }
    let name = inner.trim();
    (!name.is_empty()).then_some(name)
}

/// Resolve a single parameter. A string that is exactly one token yields the
/// variable's typed value; any other string is rendered as text.
pub fn resolve(value: &Value, vars: &impl VariableSource) -> Result<Value, FlowError> {
    match value {
        Value::String(s) => match sole_variable(s) {
            Some(name) => vars
                .lookup(name)
                .ok_or_else(|| FlowError::Template(format!("unknown variable `{name}`"))),
            None => Ok(Value::String(render(s, vars)?)),
        },
        other => Ok(other.clone()),
    }
}

/// Walk `value`, resolving every string (object keys included).
pub fn render_value(value: &Value, vars: &impl VariableSource) -> Result<Value, FlowError> {
    match value {
        Value::String(_) => resolve(value, vars),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, vars))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(render(k, vars)?, render_value(v, vars)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Render a JSON template to serialized bytes.
pub fn render_json(value: &Value, vars: &impl VariableSource) -> Result<Vec<u8>, FlowError> {
    let rendered = render_value(value, vars)?;
    serde_json::to_vec(&rendered).map_err(|e| FlowError::Template(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn renders_known_variables() {
        let vars = vars(json!({"name": "Ada", "n": 3, "ok": true, "none": null}));
        assert_eq!(render("hi ${name}", &vars).unwrap(), "hi Ada");
        assert_eq!(render("${n}/${ok}/${none}", &vars).unwrap(), "3/true/null");
        assert_eq!(render("${ name }!", &vars).unwrap(), "Ada!");
    }

    #[test]
    fn text_without_tokens_is_unchanged() {
        let vars = vars(json!({}));
        let s = "plain $ text {with} braces";
        assert_eq!(render(s, &vars).unwrap(), s);
    }

    #[test]
    fn unknown_and_unterminated_are_errors() {
        let vars = vars(json!({"a": 1}));
        let err = render("${missing}", &vars).unwrap_err();
        assert_eq!(err.kind(), "template_error");
        assert!(err.to_string().contains("missing"));
        assert!(render("oops ${a", &vars).is_err());
        assert!(render("${}", &vars).is_err());
    }

    #[test]
    fn sole_token_keeps_type() {
        let vars = vars(json!({"x": 42, "big": 9007199254740993u64}));
        assert_eq!(resolve(&json!("${x}"), &vars).unwrap(), json!(42));
        assert_eq!(resolve(&json!("x=${x}"), &vars).unwrap(), json!("x=42"));
        assert_eq!(
            resolve(&json!("${big}"), &vars).unwrap(),
            json!(9007199254740993u64)
        );
        assert_eq!(sole_variable("${a}${b}"), None);
    }

    #[test]
    fn json_bodies_render_structurally() {
        let vars = vars(json!({"x": 42, "who": "a\"b", "k": "field"}));
        let body = json!({"a": "${x}", "msg": "hi ${who}", "${k}": [1, "${x}"]});
        let bytes = render_json(&body, &vars).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, json!({"a": 42, "msg": "hi a\"b", "field": [1, 42]}));
    }
}
