//! Declarative chat bots: keyword-triggered menus, forms and agent hand-offs.

pub mod driver;
pub mod frame;
pub mod validation;

use std::collections::BTreeMap;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::agent::AgentDirectory;
use crate::config::read_definition;
use crate::error::FlowError;

pub use driver::{AiHandoff, HandoffRequest, ReplySink, SessionDriver, submit_handler_name};
pub use frame::{ConversationFrame, FrameStatus};
pub use validation::{Validation, ValidationKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackType {
    #[default]
    Text,
    Flow,
}

/// A bot: trigger keywords, named flows and what to do when nothing matches.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct ChatbotFlow {
    /// Trigger text to flow key. Matched case-insensitively after trimming.
    #[serde(default)]
    pub keywords: BTreeMap<String, String>,
    #[serde(default)]
    pub flows: BTreeMap<String, BotFlow>,
    #[serde(default)]
    pub fallback_response_type: FallbackType,
    #[serde(default)]
    pub fallback_response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BotFlow {
    Menu(MenuFlow),
    Form(FormFlow),
    Agent(AgentFlow),
}

impl BotFlow {
    pub fn kind(&self) -> &'static str {
        match self {
            BotFlow::Menu(_) => "menu",
            BotFlow::Form(_) => "form",
            BotFlow::Agent(_) => "agent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MenuFlow {
    pub text: String,
    #[serde(default)]
    pub options: Vec<MenuOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MenuOption {
    pub input: String,
    #[serde(default)]
    pub display: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub next_flow: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FormFlow {
    #[serde(default)]
    pub steps: Vec<FormStep>,
    #[serde(default)]
    pub completion_message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub back_to_flow: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FormStep {
    pub field: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AgentFlow {
    pub agent_id: String,
}

impl MenuFlow {
    /// `text`, then one `[input] display` line per option, blank-line separated.
    pub fn render(&self) -> String {
        let mut out = self.text.clone();
        for option in &self.options {
            out.push_str("\n\n");
            out.push_str(&format!("[{}] {}", option.input, option.display));
        }
        out
    }

    pub fn option_for(&self, user_text: &str) -> Option<&MenuOption> {
        let input = user_text.trim();
        self.options.iter().find(|o| o.input.trim() == input)
    }
}

impl ChatbotFlow {
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        serde_json::from_str(json)
            .map_err(|e| FlowError::Config(format!("invalid chatbot flow: {e}")))
    }

    pub fn from_path(path: &Path) -> Result<Self, FlowError> {
        read_definition(path)
    }

    /// Flow key triggered by `user_text`, if it is a keyword.
    pub fn keyword_target(&self, user_text: &str) -> Option<&str> {
        let trigger = user_text.trim().to_lowercase();
        if trigger.is_empty() {
            return None;
        }
        self.keywords
            .iter()
            .find(|(keyword, _)| keyword.trim().to_lowercase() == trigger)
            .map(|(_, target)| target.as_str())
    }

    /// Every flow reference resolves, validations are well formed and, when a
    /// directory is given, every agent flow names a configured agent.
    pub fn validate(&self, agents: Option<&AgentDirectory>) -> Result<(), FlowError> {
        let mut problems = Vec::new();
        let mut check = |what: String, target: &str| {
            if !self.flows.contains_key(target) {
                problems.push(format!("{what} references unknown flow `{target}`"));
            }
        };

        for (keyword, target) in &self.keywords {
            check(format!("keyword `{keyword}`"), target);
        }
        if self.fallback_response_type == FallbackType::Flow {
            check("fallback".to_string(), &self.fallback_response);
        }
        for (key, flow) in &self.flows {
            match flow {
                BotFlow::Menu(menu) => {
                    for option in menu.options.iter().filter(|o| !o.next_flow.is_empty()) {
                        check(format!("option `{}` of `{key}`", option.input), &option.next_flow);
                    }
                }
                BotFlow::Form(form) => {
                    if !form.back_to_flow.is_empty() {
                        check(format!("back_to_flow of `{key}`"), &form.back_to_flow);
                    }
                }
                BotFlow::Agent(_) => {}
            }
        }

        for (key, flow) in &self.flows {
            match flow {
                BotFlow::Form(form) => {
                    for step in &form.steps {
                        if step.field.is_empty() {
                            problems.push(format!("form `{key}` has a step without a field"));
                        }
                        if let Some(validation) = &step.validation {
                            if let Err(e) = validation.check_config() {
                                problems.push(format!("form `{key}` field `{}`: {e}", step.field));
                            }
                        }
                    }
                }
                BotFlow::Agent(agent) => {
                    if let Some(directory) = agents {
                        if directory.get(&agent.agent_id).is_none() {
                            problems.push(format!(
                                "agent flow `{key}` names unknown agent `{}`",
                                agent.agent_id
                            ));
                        }
                    }
                }
                BotFlow::Menu(_) => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(FlowError::Config(problems.join("; ")))
        }
    }
}
