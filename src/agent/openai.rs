use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::error;

use super::{AgentType, AiGenerator, AiMessage, Attachment, GeneratorSettings, Role, ensure_json};
use crate::error::FlowError;

/// Chat Completions API, shared by OpenAI, DeepSeek and compatible servers.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    vendor: AgentType,
    client: Client,
    settings: GeneratorSettings,
}

impl OpenAiGenerator {
    pub fn new(vendor: AgentType, client: Client) -> Self {
        Self {
            vendor,
            client,
            settings: GeneratorSettings::default(),
        }
    }

    fn base_url(&self) -> Result<&str, FlowError> {
        if let Some(host) = self.settings.host.as_deref().filter(|h| !h.is_empty()) {
            return Ok(host);
        }
        match self.vendor {
            AgentType::Deepseek => Ok("https://api.deepseek.com"),
            AgentType::Openai => Ok("https://api.openai.com/v1"),
            other => Err(FlowError::Agent(format!("{other}: host is not set"))),
        }
    }

    fn request_body(
        &self,
        model: &str,
        prompt: &str,
        attachment: Option<&Attachment>,
        history: &[AiMessage],
    ) -> Value {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(instruction) = self.settings.system_instruction() {
            messages.push(json!({"role": "system", "content": instruction}));
        }
        for message in history {
            messages.push(chat_message(
                message.role,
                &message.content,
                message.attachment.as_ref(),
            ));
        }
        messages.push(chat_message(Role::User, prompt, attachment));

        let content = &self.settings.content;
        let mut body = json!({ "model": model, "messages": messages });
        if let Some(t) = content.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = content.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(max) = content.max_output_tokens {
            body["max_tokens"] = json!(max);
        }
        if !content.stop_sequences.is_empty() {
            body["stop"] = json!(content.stop_sequences);
        }
        if content.wants_json() {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "assistant",
        Role::System => "system",
    }
}

fn chat_message(role: Role, text: &str, attachment: Option<&Attachment>) -> Value {
    match attachment {
        None => json!({"role": role_name(role), "content": text}),
        Some(attachment) => {
            let data_url = format!("data:{};base64,{}", attachment.mime_type, attachment.to_base64());
            json!({
                "role": role_name(role),
                "content": [
                    {"type": "text", "text": text},
                    {"type": "image_url", "image_url": {"url": data_url}}
                ]
            })
        }
    }
}

fn choice_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str).or_else(|| p.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl AiGenerator for OpenAiGenerator {
    fn vendor(&self) -> AgentType {
        self.vendor
    }

    fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut GeneratorSettings {
        &mut self.settings
    }

    #[tracing::instrument(name = "openai_generate", skip_all, fields(vendor = %self.vendor))]
    async fn generate(
        &self,
        prompt: &str,
        attachment: Option<&Attachment>,
        history: &[AiMessage],
    ) -> Result<AiMessage, FlowError> {
        let vendor = self.vendor;
        let model = self.settings.model(vendor)?;
        let body = self.request_body(model, prompt, attachment, history);
        let url = format!("{}/chat/completions", self.base_url()?.trim_end_matches('/'));

        let mut request = self.client.post(url).json(&body);
        // Self-hosted compatible servers often run without a key.
        match (vendor, self.settings.api_key.as_deref()) {
            (_, Some(key)) if !key.is_empty() => request = request.bearer_auth(key),
            (AgentType::Other, _) => {}
            _ => {
                self.settings.api_key(vendor)?;
            }
        }

        let resp = request
            .send()
            .await
            .map_err(|e| FlowError::Agent(format!("{vendor} request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!(status = status.as_u16(), "{vendor} error: {text}");
            return Err(FlowError::Agent(format!(
                "{vendor} returned {}: {text}",
                status.as_u16()
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| FlowError::Agent(format!("invalid {vendor} response: {e}")))?;

        let content = json
            .pointer("/choices/0/message/content")
            .map(choice_text)
            .ok_or_else(|| FlowError::Agent(format!("{vendor} response missing message content")))?;
        ensure_json(vendor, &self.settings.content, &content)?;

        let mut reply = AiMessage::model(content);
        reply.total_token_count = json
            .pointer("/usage/total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ContentConfig;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    async fn mock(reply: Value) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route(
                "/chat/completions",
                post(
                    |State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        seen.lock().unwrap().push((auth, body));
                        Json(reply)
                    },
                ),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    fn completion(content: &str) -> Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"total_tokens": 9}
        })
    }

    #[tokio::test]
    async fn roles_and_system_prompt_map_to_chat_messages() {
        let (host, seen) = mock(completion("sure")).await;
        let mut g = OpenAiGenerator::new(AgentType::Openai, Client::new());
        g.set_host(host);
        g.set_api_key("sk-test".into());
        g.set_model("gpt-4o-mini".into());
        g.set_system_instruction("You help.".into());

        let history = vec![AiMessage::user("hi"), AiMessage::model("hello")];
        let reply = g.generate("and now?", None, &history).await.unwrap();
        assert_eq!(reply.content, "sure");
        assert_eq!(reply.total_token_count, 9);

        let calls = seen.lock().unwrap();
        let (auth, body) = &calls[0];
        assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
        let roles: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
    }

    #[tokio::test]
    async fn attachments_become_data_urls() {
        let (host, seen) = mock(completion("{\"label\":\"cat\"}")).await;
        let mut g = OpenAiGenerator::new(AgentType::Other, Client::new());
        g.set_host(host);
        g.set_model("local".into());
        g.set_content_config(ContentConfig {
            response_mime_type: Some("application/json".into()),
            ..Default::default()
        });
        let attachment = Attachment::new("image/jpeg", vec![255]);
        let reply = g.generate("what is it", Some(&attachment), &[]).await.unwrap();
        assert_eq!(reply.content, "{\"label\":\"cat\"}");

        let calls = seen.lock().unwrap();
        let (auth, body) = &calls[0];
        assert!(auth.is_none());
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,/w=="
        );
    }

    #[tokio::test]
    async fn missing_key_fails_before_sending() {
        let mut g = OpenAiGenerator::new(AgentType::Openai, Client::new());
        g.set_host("http://127.0.0.1:9".into());
        g.set_model("gpt".into());
        let err = g.generate("q", None, &[]).await.unwrap_err();
        assert!(err.to_string().contains("api key is not set"));
    }
}
