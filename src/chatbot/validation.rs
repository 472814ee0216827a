use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FlowError;

static EMAIL: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[^\s@<>()\[\],;:]+@[^\s@<>()\[\],;:]+\.[^\s@<>()\[\],;:.]+$").ok());

/// Compiled `regex` validations, keyed by pattern source.
static PATTERNS: Lazy<DashMap<String, Regex>> = Lazy::new(DashMap::new);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    MinLength,
    Email,
    Regex,
}

/// Check applied to a form answer before it is accepted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Validation {
    #[serde(rename = "type")]
    pub kind: ValidationKind,
    /// Threshold for `min_length`, pattern for `regex`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Validation {
    fn min_length(&self) -> Result<usize, FlowError> {
        let bad = || FlowError::Config(format!("min_length needs an integer value, got {:?}", self.value));
        match &self.value {
            Some(Value::Number(n)) => n.as_u64().map(|n| n as usize).ok_or_else(bad),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| bad()),
            _ => Err(bad()),
        }
    }

    fn pattern(&self) -> Result<Regex, FlowError> {
        match &self.value {
            Some(Value::String(p)) => {
                if let Some(re) = PATTERNS.get(p) {
                    return Ok(re.clone());
                }
                let re = Regex::new(p)
                    .map_err(|e| FlowError::Config(format!("invalid regex `{p}`: {e}")))?;
                PATTERNS.insert(p.clone(), re.clone());
                Ok(re)
            }
            other => Err(FlowError::Config(format!("regex needs a pattern, got {other:?}"))),
        }
    }

    /// Whether the validation itself is usable.
    pub fn check_config(&self) -> Result<(), FlowError> {
        match self.kind {
            ValidationKind::MinLength => self.min_length().map(|_| ()),
            ValidationKind::Regex => self.pattern().map(|_| ()),
            ValidationKind::Email => Ok(()),
        }
    }

    fn message(&self, default: impl FnOnce() -> String) -> FlowError {
        FlowError::Validation(
            self.error_message
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(default),
        )
    }

    /// `Err(FlowError::Validation)` carries the user-facing message; any other
    /// error means the validation is misconfigured.
    pub fn check(&self, input: &str) -> Result<(), FlowError> {
        let input = input.trim();
        match self.kind {
            ValidationKind::MinLength => {
                let min = self.min_length()?;
                if input.chars().count() < min {
                    return Err(self.message(|| format!("Please enter at least {min} characters.")));
                }
            }
            ValidationKind::Email => {
                let valid = EMAIL.as_ref().is_some_and(|re| re.is_match(input));
                if !valid {
                    return Err(self.message(|| "Please enter a valid email address.".to_string()));
                }
            }
            ValidationKind::Regex => {
                if !self.pattern()?.is_match(input) {
                    return Err(self.message(|| "That answer has an invalid format.".to_string()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validation(v: Value) -> Validation {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn email_addresses() {
        let v = validation(json!({"type": "email", "error_message": "Invalid."}));
        assert!(v.check("a@b.co").is_ok());
        assert!(v.check(" first.last+tag@example.org ").is_ok());
        for bad in ["bad", "a@b", "@b.co", "a b@c.de", "a@@b.co"] {
            let err = v.check(bad).unwrap_err();
            assert_eq!(err.to_string(), "Invalid.", "{bad} should be rejected");
        }
    }

    #[test]
    fn min_length_counts_characters() {
        let v = validation(json!({"type": "min_length", "value": 3}));
        assert!(v.check("äöü").is_ok());
        let err = v.check("ab").unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().contains("at least 3"));

        let v = validation(json!({"type": "min_length", "value": "2"}));
        assert!(v.check("ok").is_ok());
    }

    #[test]
    fn regex_patterns() {
        let v = validation(json!({"type": "regex", "value": "^[0-9]{4}$", "error_message": "4 digits"}));
        assert!(v.check("1234").is_ok());
        assert_eq!(v.check("12a4").unwrap_err().to_string(), "4 digits");
    }

    #[test]
    fn patterns_compile_once() {
        let pattern = "^cached-[a-z]+$";
        let v = validation(json!({"type": "regex", "value": pattern}));
        assert!(v.check("cached-abc").is_ok());
        let first = PATTERNS.get(pattern).map(|re| re.as_str().to_string());
        assert_eq!(first.as_deref(), Some(pattern));
        assert!(v.check("cached-1").is_err());
        assert_eq!(PATTERNS.iter().filter(|e| e.key() == pattern).count(), 1);

        let broken = validation(json!({"type": "regex", "value": "(unclosed"}));
        assert!(broken.check("x").is_err());
        assert!(!PATTERNS.contains_key("(unclosed"));
    }

    #[test]
    fn misconfigured_validations_are_config_errors() {
        let v = validation(json!({"type": "regex", "value": "("}));
        assert_eq!(v.check_config().unwrap_err().kind(), "config_error");
        assert_eq!(v.check("x").unwrap_err().kind(), "config_error");

        let v = validation(json!({"type": "min_length"}));
        assert!(v.check_config().is_err());
    }
}
