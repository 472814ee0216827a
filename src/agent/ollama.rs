use async_trait::async_trait;
use ollama_rs::Ollama;
use ollama_rs::generation::chat::ChatMessage;
use ollama_rs::generation::chat::request::ChatMessageRequest;
use ollama_rs::generation::images::Image;
use ollama_rs::generation::parameters::FormatType;
use ollama_rs::models::ModelOptions;
use reqwest::Client;
use tracing::{error, info};
use url::Url;

use super::{AgentType, AiGenerator, AiMessage, Attachment, GeneratorSettings, Role, ensure_json};
use crate::error::FlowError;

const DEFAULT_HOST: &str = "http://localhost:11434";
const DEFAULT_PORT: u16 = 11434;

/// A local or remote Ollama server, driven through `ollama_rs`.
#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    client: Client,
    settings: GeneratorSettings,
}

impl OllamaGenerator {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            settings: GeneratorSettings::default(),
        }
    }

    fn build_ollama_client(&self) -> Result<Ollama, FlowError> {
        let host = self
            .settings
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_HOST);
        let url = Url::parse(host)
            .map_err(|e| FlowError::Agent(format!("ollama: invalid host `{host}`: {e}")))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);
        Ok(Ollama::new_with_client(url, port, self.client.clone()))
    }

    fn options(&self) -> Option<ModelOptions> {
        let content = &self.settings.content;
        let mut options = ModelOptions::default();
        let mut any = false;
        if let Some(t) = content.temperature {
            options = options.temperature(t);
            any = true;
        }
        if let Some(p) = content.top_p {
            options = options.top_p(p);
            any = true;
        }
        if let Some(k) = content.top_k {
            options = options.top_k(k);
            any = true;
        }
        if let Some(max) = content.max_output_tokens {
            options = options.num_predict(max as i32);
            any = true;
        }
        if !content.stop_sequences.is_empty() {
            options = options.stop(content.stop_sequences.clone());
            any = true;
        }
        any.then_some(options)
    }

    fn build_messages(
        &self,
        prompt: &str,
        attachment: Option<&Attachment>,
        history: &[AiMessage],
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(instruction) = self.settings.system_instruction() {
            messages.push(ChatMessage::system(instruction.to_string()));
        }
        for message in history {
            messages.push(chat_message(
                message.role,
                &message.content,
                message.attachment.as_ref(),
            ));
        }
        messages.push(chat_message(Role::User, prompt, attachment));
        messages
    }
}

fn chat_message(role: Role, text: &str, attachment: Option<&Attachment>) -> ChatMessage {
    let message = match role {
        Role::User => ChatMessage::user(text.to_string()),
        Role::Model => ChatMessage::assistant(text.to_string()),
        Role::System => ChatMessage::system(text.to_string()),
    };
    match attachment {
        Some(attachment) => message.with_images(vec![Image::from_base64(&attachment.to_base64())]),
        None => message,
    }
}

#[async_trait]
impl AiGenerator for OllamaGenerator {
    fn vendor(&self) -> AgentType {
        AgentType::Ollama
    }

    fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut GeneratorSettings {
        &mut self.settings
    }

    #[tracing::instrument(name = "ollama_generate", skip_all)]
    async fn generate(
        &self,
        prompt: &str,
        attachment: Option<&Attachment>,
        history: &[AiMessage],
    ) -> Result<AiMessage, FlowError> {
        let model = self.settings.model(AgentType::Ollama)?.to_string();
        let ollama = self.build_ollama_client()?;

        let mut request =
            ChatMessageRequest::new(model, self.build_messages(prompt, attachment, history));
        if self.settings.content.wants_json() {
            request = request.format(FormatType::Json);
        }
        if let Some(options) = self.options() {
            request = request.options(options);
        }

        let resp = ollama.send_chat_messages(request).await.map_err(|e| {
            error!("ollama gave error: {e:?}");
            FlowError::Agent(format!("ollama request failed: {e}"))
        })?;
        info!(chars = resp.message.content.len(), "ollama replied");

        let content = resp.message.content;
        ensure_json(AgentType::Ollama, &self.settings.content, &content)?;

        let mut reply = AiMessage::model(content);
        reply.total_token_count = resp
            .final_data
            .map(|d| d.prompt_eval_count as u64 + d.eval_count as u64)
            .unwrap_or_default();
        Ok(reply)
    }
}
