//! Step-based flow definitions and their execution.

pub mod engine;
pub mod http;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::Condition;
use crate::config::read_definition;
use crate::error::FlowError;

pub use engine::{ExecutionOutcome, FlowEngine};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Function,
    ApiCall,
    Conditional,
    Delay,
    Parallel,
    WaitInput,
}

/// One node of a flow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FlowStep {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_on_success: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_on_error: Option<String>,
}

impl FlowStep {
    pub fn new(name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            name: name.into(),
            step_type,
            function: None,
            params: Map::new(),
            next_on_success: None,
            next_on_error: None,
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Routing targets are optional; empty strings count as absent.
    pub fn on_success(&self) -> Option<&str> {
        self.next_on_success.as_deref().filter(|s| !s.is_empty())
    }

    pub fn on_error(&self) -> Option<&str> {
        self.next_on_error.as_deref().filter(|s| !s.is_empty())
    }

    /// Child step names of a parallel step.
    pub fn parallel_children(&self) -> Result<Vec<String>, FlowError> {
        match self.params.get("steps") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        FlowError::Config(format!(
                            "parallel step `{}` lists a non-string child",
                            self.name
                        ))
                    })
                })
                .collect(),
            Some(_) => Err(FlowError::Config(format!(
                "parallel step `{}` needs a `steps` list",
                self.name
            ))),
        }
    }

    /// Every step name this step can route to.
    fn references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self.on_success().into_iter().chain(self.on_error()).collect();
        match self.step_type {
            StepType::Conditional => {
                refs.extend(
                    ["true_step", "false_step"]
                        .iter()
                        .filter_map(|k| self.param_str(k))
                        .filter(|s| !s.is_empty()),
                );
            }
            StepType::Parallel => {
                if let Some(Value::Array(items)) = self.params.get("steps") {
                    refs.extend(items.iter().filter_map(Value::as_str));
                }
            }
            _ => {}
        }
        refs
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlowDocument {
    Steps(Vec<FlowStep>),
    Wrapped { steps: Vec<FlowStep> },
}

/// An ordered list of steps with a name index. The first step is the entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowDefinition {
    steps: Vec<FlowStep>,
    index: HashMap<String, usize>,
}

impl FlowDefinition {
    /// Build and validate a definition.
    pub fn new(steps: Vec<FlowStep>) -> Result<Self, FlowError> {
        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if step.name.is_empty() {
                return Err(FlowError::Config(format!("step #{i} has no name")));
            }
            if index.insert(step.name.clone(), i).is_some() {
                return Err(FlowError::Config(format!(
                    "duplicate step name `{}`",
                    step.name
                )));
            }
        }
        let definition = Self { steps, index };
        definition.validate()?;
        Ok(definition)
    }

    /// Accepts a JSON array of steps or an object with a `steps` array.
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        let doc: FlowDocument = serde_json::from_str(json)
            .map_err(|e| FlowError::Config(format!("invalid flow definition: {e}")))?;
        Self::from_document(doc)
    }

    pub fn from_path(path: &Path) -> Result<Self, FlowError> {
        Self::from_document(read_definition(path)?)
    }

    fn from_document(doc: FlowDocument) -> Result<Self, FlowError> {
        match doc {
            FlowDocument::Steps(steps) | FlowDocument::Wrapped { steps } => Self::new(steps),
        }
    }

    pub fn steps(&self) -> &[FlowStep] {
        &self.steps
    }

    pub fn first(&self) -> Option<&FlowStep> {
        self.steps.first()
    }

    pub fn get(&self, name: &str) -> Option<&FlowStep> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Structural checks: required parameters, parsable conditions and
    /// durations, and that every routing target names a step.
    pub fn validate(&self) -> Result<(), FlowError> {
        let mut problems = Vec::new();
        let names: HashSet<&str> = self.steps.iter().map(|s| s.name.as_str()).collect();

        for step in &self.steps {
            match step.step_type {
                StepType::Function => {
                    if step.function.as_deref().is_none_or(str::is_empty) {
                        problems.push(format!("function step `{}` names no function", step.name));
                    }
                }
                StepType::ApiCall => {
                    if step.param_str("url").is_none_or(str::is_empty) {
                        problems.push(format!("api_call step `{}` has no url", step.name));
                    }
                    if step.params.contains_key("timeout") {
                        if let Err(e) = duration_param(step, "timeout") {
                            problems.push(e.to_string());
                        }
                    }
                }
                StepType::Conditional => match step.param_str("condition") {
                    Some(expr) => {
                        if let Err(e) = Condition::parse(expr) {
                            problems.push(format!("step `{}`: {e}", step.name));
                        }
                    }
                    None => problems.push(format!(
                        "conditional step `{}` has no condition",
                        step.name
                    )),
                },
                StepType::Delay => {
                    if let Err(e) = duration_param(step, "duration") {
                        problems.push(e.to_string());
                    }
                }
                StepType::Parallel => {
                    if let Err(e) = step.parallel_children() {
                        problems.push(e.to_string());
                    }
                }
                StepType::WaitInput => {}
            }
            for target in step.references() {
                if !names.contains(target) {
                    problems.push(format!(
                        "step `{}` references unknown step `{target}`",
                        step.name
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(FlowError::Config(problems.join("; ")))
        }
    }
}

/// Read a duration parameter given as a string (`"1m30s"`) or as seconds.
pub fn duration_param(step: &FlowStep, key: &str) -> Result<Duration, FlowError> {
    match step.params.get(key) {
        Some(Value::String(s)) => parse_duration(s),
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .ok_or_else(|| FlowError::Config(format!("step `{}`: bad {key} `{n}`", step.name))),
        Some(other) => Err(FlowError::Config(format!(
            "step `{}`: bad {key} `{other}`",
            step.name
        ))),
        None => Err(FlowError::Config(format!(
            "step `{}` has no {key}",
            step.name
        ))),
    }
}

/// Parse durations such as `250ms`, `5s`, `2m`, `1h` or `1m30s`. A bare
/// number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, FlowError> {
    let s = raw.trim();
    let bad = || FlowError::Config(format!("invalid duration `{raw}`"));
    if s.is_empty() {
        return Err(bad());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|_| bad());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(bad)?;
        if digits == 0 {
            return Err(bad());
        }
        let amount: f64 = rest[..digits].parse().map_err(|_| bad())?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(bad()),
        };
        let part = Duration::try_from_secs_f64(amount * scale).map_err(|_| bad())?;
        total = total.checked_add(part).ok_or_else(bad)?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_step_list_and_wrapped_document() {
        let steps = r#"[{"name": "a", "type": "function", "function": "log", "params": {"arg0": "hi"}}]"#;
        let def = FlowDefinition::from_json(steps).unwrap();
        assert_eq!(def.steps().len(), 1);
        assert_eq!(def.first().map(|s| s.step_type), Some(StepType::Function));

        let wrapped = r#"{"steps": [{"name": "w", "type": "wait_input"}]}"#;
        let def = FlowDefinition::from_json(wrapped).unwrap();
        assert!(def.get("w").is_some());
    }

    #[test]
    fn unknown_step_type_is_rejected() {
        let err = FlowDefinition::from_json(r#"[{"name": "a", "type": "teleport"}]"#).unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn duplicate_and_dangling_names_are_rejected() {
        let dup = json!([
            {"name": "a", "type": "wait_input"},
            {"name": "a", "type": "wait_input"}
        ]);
        let err = FlowDefinition::from_json(&dup.to_string()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));

        let dangling = json!([
            {"name": "a", "type": "conditional",
             "params": {"condition": "x > 1", "true_step": "ghost"}}
        ]);
        let err = FlowDefinition::from_json(&dangling.to_string()).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn required_parameters_are_checked() {
        let bad = json!([
            {"name": "f", "type": "function"},
            {"name": "c", "type": "conditional", "params": {"condition": "x = 1"}},
            {"name": "d", "type": "delay", "params": {"duration": "soon"}},
            {"name": "p", "type": "parallel", "params": {"steps": "f"}}
        ]);
        let err = FlowDefinition::from_json(&bad.to_string()).unwrap_err().to_string();
        for name in ["`f`", "`c`", "`d`", "`p`"] {
            assert!(err.contains(name), "{err} should mention {name}");
        }
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1.5").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("-1").is_err());
    }

    #[test]
    fn oversized_durations_are_errors() {
        assert_eq!(parse_duration("1e30").unwrap_err().kind(), "config_error");
        assert!(parse_duration("99999999999999999999h").is_err());
        assert!(parse_duration("10000000000000000000s10000000000000000000s").is_err());
        assert!(parse_duration("NaN").is_err());
        assert!(parse_duration("inf").is_err());

        let mut step = FlowStep::new("d", StepType::Delay);
        step.params.insert("duration".into(), json!(1e30));
        assert_eq!(duration_param(&step, "duration").unwrap_err().kind(), "config_error");
        step.params.insert("duration".into(), json!(-2));
        assert!(duration_param(&step, "duration").is_err());
        step.params.insert("duration".into(), json!(2));
        assert_eq!(duration_param(&step, "duration").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn loading_rejects_unusable_durations() {
        let delay = json!([{"name": "d", "type": "delay", "params": {"duration": 1e30}}]);
        let err = FlowDefinition::from_json(&delay.to_string()).unwrap_err();
        assert_eq!(err.kind(), "config_error");
        assert!(err.to_string().contains("`d`"), "{err}");

        let call = json!([{"name": "c", "type": "api_call",
                           "params": {"url": "http://localhost/", "timeout": "1e30"}}]);
        let err = FlowDefinition::from_json(&call.to_string()).unwrap_err();
        assert_eq!(err.kind(), "config_error");

        let call = json!([{"name": "c", "type": "api_call",
                           "params": {"url": "http://localhost/", "timeout": "later"}}]);
        assert!(FlowDefinition::from_json(&call.to_string()).is_err());

        let ok = json!([{"name": "c", "type": "api_call",
                         "params": {"url": "http://localhost/", "timeout": "250ms"}}]);
        assert!(FlowDefinition::from_json(&ok.to_string()).is_ok());
    }
}
