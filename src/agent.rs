//! AI agents: vendor configuration, the generator interface and the factory
//! that turns one into the other.

pub mod gemini;
pub mod handoff;
pub mod history;
pub mod ollama;
pub mod openai;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::read_definition;
use crate::error::FlowError;

pub use gemini::GeminiGenerator;
pub use handoff::GeneratorHandoff;
pub use history::HistoryStore;
pub use ollama::OllamaGenerator;
pub use openai::OpenAiGenerator;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Gemini,
    Deepseek,
    Openai,
    Ollama,
    /// Any OpenAI-compatible endpoint; `host` is required.
    Other,
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentType::Gemini => "gemini",
            AgentType::Deepseek => "deepseek",
            AgentType::Openai => "openai",
            AgentType::Ollama => "ollama",
            AgentType::Other => "other",
        };
        f.write_str(name)
    }
}

/// Sampling and output settings, passed to the vendor where it supports them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ContentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    /// `text/plain` or `application/json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
}

impl ContentConfig {
    pub fn wants_json(&self) -> bool {
        self.response_mime_type
            .as_deref()
            .is_some_and(|m| m.to_ascii_lowercase().contains("json"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AgentConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub content_config: ContentConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    System,
}

/// Binary input sent alongside a prompt. Bytes travel as base64 when serialized.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    #[schemars(with = "String")]
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AiMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub total_token_count: u64,
}

impl AiMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachment: None,
            total_token_count: 0,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self::new(Role::Model, content)
    }

    pub fn with_attachment(mut self, attachment: Option<Attachment>) -> Self {
        self.attachment = attachment;
        self
    }
}

/// Settings every generator carries; vendors read what they understand.
#[derive(Debug, Clone, Default)]
pub struct GeneratorSettings {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub system_instruction: Option<String>,
    pub host: Option<String>,
    pub content: ContentConfig,
}

impl GeneratorSettings {
    pub(crate) fn model(&self, vendor: AgentType) -> Result<&str, FlowError> {
        self.model
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| FlowError::Agent(format!("{vendor}: model is not set")))
    }

    pub(crate) fn api_key(&self, vendor: AgentType) -> Result<&str, FlowError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| FlowError::Agent(format!("{vendor}: api key is not set")))
    }

    pub(crate) fn system_instruction(&self) -> Option<&str> {
        self.system_instruction.as_deref().filter(|s| !s.is_empty())
    }
}

/// One AI vendor behind a uniform text-generation call.
#[async_trait]
pub trait AiGenerator: Send + Sync {
    fn vendor(&self) -> AgentType;

    fn settings(&self) -> &GeneratorSettings;

    fn settings_mut(&mut self) -> &mut GeneratorSettings;

    fn set_api_key(&mut self, key: String) {
        self.settings_mut().api_key = Some(key);
    }

    fn set_system_instruction(&mut self, instruction: String) {
        self.settings_mut().system_instruction = Some(instruction);
    }

    fn set_model(&mut self, model: String) {
        self.settings_mut().model = Some(model);
    }

    fn set_host(&mut self, host: String) {
        self.settings_mut().host = Some(host);
    }

    fn set_content_config(&mut self, content: ContentConfig) {
        self.settings_mut().content = content;
    }

    /// Reply to `prompt` given the earlier turns in `history`.
    async fn generate(
        &self,
        prompt: &str,
        attachment: Option<&Attachment>,
        history: &[AiMessage],
    ) -> Result<AiMessage, FlowError>;
}

/// Reject non-JSON replies when the caller asked for JSON output.
pub(crate) fn ensure_json(
    vendor: AgentType,
    content: &ContentConfig,
    reply: &str,
) -> Result<(), FlowError> {
    if content.wants_json() && serde_json::from_str::<serde_json::Value>(reply).is_err() {
        return Err(FlowError::Agent(format!(
            "{vendor}: expected a JSON reply, got `{reply}`"
        )));
    }
    Ok(())
}

/// Build the generator for `config`, sharing `client` for HTTP vendors.
pub fn create_generator(
    config: &AgentConfig,
    client: &reqwest::Client,
) -> Result<Box<dyn AiGenerator>, FlowError> {
    let mut generator: Box<dyn AiGenerator> = match config.agent_type {
        AgentType::Gemini => Box::new(GeminiGenerator::new(client.clone())),
        AgentType::Openai => Box::new(OpenAiGenerator::new(AgentType::Openai, client.clone())),
        AgentType::Deepseek => Box::new(OpenAiGenerator::new(AgentType::Deepseek, client.clone())),
        AgentType::Other => {
            if config.host.as_deref().is_none_or(str::is_empty) {
                return Err(FlowError::Agent(format!(
                    "agent `{}` of type other needs a host",
                    config.id
                )));
            }
            Box::new(OpenAiGenerator::new(AgentType::Other, client.clone()))
        }
        AgentType::Ollama => Box::new(OllamaGenerator::new(client.clone())),
    };
    if let Some(key) = &config.api_key {
        generator.set_api_key(key.clone());
    }
    if let Some(model) = &config.model {
        generator.set_model(model.clone());
    }
    if let Some(instruction) = &config.system_instruction {
        generator.set_system_instruction(instruction.clone());
    }
    if let Some(host) = &config.host {
        generator.set_host(host.clone());
    }
    generator.set_content_config(config.content_config.clone());
    Ok(generator)
}

/// Agent configurations by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentDirectory {
    agents: BTreeMap<String, AgentConfig>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AgentList {
    List(Vec<AgentConfig>),
    Wrapped { agents: Vec<AgentConfig> },
}

impl AgentDirectory {
    pub fn new(agents: impl IntoIterator<Item = AgentConfig>) -> Self {
        Self {
            agents: agents.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }

    fn from_list(list: AgentList) -> Result<Self, FlowError> {
        let agents = match list {
            AgentList::List(agents) | AgentList::Wrapped { agents } => agents,
        };
        let mut directory = Self::default();
        for agent in agents {
            if directory.agents.contains_key(&agent.id) {
                return Err(FlowError::Config(format!("duplicate agent id `{}`", agent.id)));
            }
            directory.insert(agent);
        }
        Ok(directory)
    }

    /// A list of agents, bare or under an `agents` key.
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        let list = serde_json::from_str(json)
            .map_err(|e| FlowError::Config(format!("invalid agent list: {e}")))?;
        Self::from_list(list)
    }

    pub fn from_path(path: &Path) -> Result<Self, FlowError> {
        Self::from_list(read_definition(path)?)
    }

    pub fn get(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.get(id)
    }

    pub fn insert(&mut self, agent: AgentConfig) {
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attachment_bytes_serialize_as_base64() {
        let attachment = Attachment::new("image/png", vec![1, 2, 3]);
        let value = serde_json::to_value(&attachment).unwrap();
        assert_eq!(value, json!({"mime_type": "image/png", "bytes": "AQID"}));
        let back: Attachment = serde_json::from_value(value).unwrap();
        assert_eq!(back, attachment);
    }

    #[test]
    fn directory_accepts_plain_and_wrapped_lists() {
        let plain = json!([{"id": "helper", "type": "gemini", "model": "gemini-2.0-flash"}]);
        let directory = AgentDirectory::from_json(&plain.to_string()).unwrap();
        assert_eq!(directory.get("helper").unwrap().agent_type, AgentType::Gemini);

        let wrapped = json!({"agents": [{"id": "local", "type": "ollama"}]});
        let directory = AgentDirectory::from_json(&wrapped.to_string()).unwrap();
        assert_eq!(directory.ids().collect::<Vec<_>>(), vec!["local"]);
    }

    #[test]
    fn duplicate_agent_ids_are_rejected() {
        let list = json!([{"id": "a", "type": "openai"}, {"id": "a", "type": "ollama"}]);
        let err = AgentDirectory::from_json(&list.to_string()).unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn factory_applies_config() {
        let config: AgentConfig = serde_json::from_value(json!({
            "id": "ds", "type": "deepseek", "api_key": "k", "model": "deepseek-chat",
            "content_config": {"temperature": 0.2, "response_mime_type": "application/json"}
        }))
        .unwrap();
        let generator = create_generator(&config, &reqwest::Client::new()).unwrap();
        assert_eq!(generator.vendor(), AgentType::Deepseek);
        assert_eq!(generator.settings().model.as_deref(), Some("deepseek-chat"));
        assert!(generator.settings().content.wants_json());
    }

    #[test]
    fn other_vendor_requires_a_host() {
        let config: AgentConfig =
            serde_json::from_value(json!({"id": "x", "type": "other", "model": "m"})).unwrap();
        let err = create_generator(&config, &reqwest::Client::new()).err().unwrap();
        assert_eq!(err.kind(), "agent_error");
    }

    #[test]
    fn json_replies_are_enforced_only_when_requested() {
        let mut content = ContentConfig::default();
        assert!(ensure_json(AgentType::Gemini, &content, "plain").is_ok());
        content.response_mime_type = Some("application/json".into());
        assert!(ensure_json(AgentType::Gemini, &content, "{\"a\":1}").is_ok());
        assert!(ensure_json(AgentType::Gemini, &content, "plain").is_err());
    }
}
