use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value, json};
use tracing::error;

use super::{AgentType, AiGenerator, AiMessage, Attachment, GeneratorSettings, Role, ensure_json};
use crate::error::FlowError;

const DEFAULT_HOST: &str = "https://generativelanguage.googleapis.com";

/// Google Gemini through the `generateContent` REST endpoint.
#[derive(Debug, Clone)]
pub struct GeminiGenerator {
    client: Client,
    settings: GeneratorSettings,
}

impl GeminiGenerator {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            settings: GeneratorSettings::default(),
        }
    }

    fn url(&self, model: &str) -> String {
        let host = self.settings.host.as_deref().unwrap_or(DEFAULT_HOST);
        format!(
            "{}/v1beta/models/{model}:generateContent",
            host.trim_end_matches('/')
        )
    }

    fn request_body(
        &self,
        prompt: &str,
        attachment: Option<&Attachment>,
        history: &[AiMessage],
    ) -> Value {
        let mut system: Vec<Value> = self
            .settings
            .system_instruction()
            .map(|s| vec![json!({"text": s})])
            .unwrap_or_default();

        let mut contents = Vec::with_capacity(history.len() + 1);
        for message in history {
            let parts = parts(&message.content, message.attachment.as_ref());
            match message.role {
                Role::System => system.extend(parts),
                Role::User => contents.push(json!({"role": "user", "parts": parts})),
                Role::Model => contents.push(json!({"role": "model", "parts": parts})),
            }
        }
        contents.push(json!({"role": "user", "parts": parts(prompt, attachment)}));

        let mut body = json!({ "contents": contents });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": system });
        }
        let config = generation_config(&self.settings);
        if !config.is_empty() {
            body["generationConfig"] = Value::Object(config);
        }
        body
    }
}

fn parts(text: &str, attachment: Option<&Attachment>) -> Vec<Value> {
    let mut parts = Vec::with_capacity(2);
    if !text.is_empty() {
        parts.push(json!({"text": text}));
    }
    if let Some(attachment) = attachment {
        parts.push(json!({
            "inline_data": {"mime_type": attachment.mime_type, "data": attachment.to_base64()}
        }));
    }
    parts
}

fn generation_config(settings: &GeneratorSettings) -> Map<String, Value> {
    let content = &settings.content;
    let mut config = Map::new();
    if let Some(t) = content.temperature {
        config.insert("temperature".into(), json!(t));
    }
    if let Some(p) = content.top_p {
        config.insert("topP".into(), json!(p));
    }
    if let Some(k) = content.top_k {
        config.insert("topK".into(), json!(k));
    }
    if let Some(max) = content.max_output_tokens {
        config.insert("maxOutputTokens".into(), json!(max));
    }
    if !content.stop_sequences.is_empty() {
        config.insert("stopSequences".into(), json!(content.stop_sequences));
    }
    if content.wants_json() {
        config.insert("responseMimeType".into(), json!("application/json"));
    } else if let Some(mime) = &content.response_mime_type {
        config.insert("responseMimeType".into(), json!(mime));
    }
    config
}

#[async_trait]
impl AiGenerator for GeminiGenerator {
    fn vendor(&self) -> AgentType {
        AgentType::Gemini
    }

    fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut GeneratorSettings {
        &mut self.settings
    }

    #[tracing::instrument(name = "gemini_generate", skip_all)]
    async fn generate(
        &self,
        prompt: &str,
        attachment: Option<&Attachment>,
        history: &[AiMessage],
    ) -> Result<AiMessage, FlowError> {
        let model = self.settings.model(AgentType::Gemini)?;
        let api_key = self.settings.api_key(AgentType::Gemini)?;
        let body = self.request_body(prompt, attachment, history);

        let resp = self
            .client
            .post(self.url(model))
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| FlowError::Agent(format!("gemini request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!(status = status.as_u16(), "gemini error: {text}");
            return Err(FlowError::Agent(format!(
                "gemini returned {}: {text}",
                status.as_u16()
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| FlowError::Agent(format!("invalid gemini response: {e}")))?;

        let parts = json
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .ok_or_else(|| FlowError::Agent("gemini response has no candidates".into()))?;
        let content = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("");
        ensure_json(AgentType::Gemini, &self.settings.content, &content)?;

        let mut reply = AiMessage::model(content);
        reply.total_token_count = json
            .pointer("/usageMetadata/totalTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Seen(Arc<Mutex<Vec<(String, Option<String>, Value)>>>);

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn mock(reply: Value) -> (String, Seen) {
        let seen = Seen::default();
        let app = Router::new()
            .route(
                "/v1beta/models/{call}",
                post(
                    |State(seen): State<Seen>,
                     Path(call): Path<String>,
                     headers: HeaderMap,
                     Json(body): Json<Value>| async move {
                        let key = headers
                            .get("x-goog-api-key")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        seen.0.lock().unwrap().push((call, key, body));
                        Json(reply)
                    },
                ),
            )
            .with_state(seen.clone());
        (spawn(app).await, seen)
    }

    fn generator(host: &str) -> GeminiGenerator {
        let mut g = GeminiGenerator::new(Client::new());
        g.set_host(host.to_string());
        g.set_api_key("secret".into());
        g.set_model("gemini-2.0-flash".into());
        g
    }

    #[tokio::test]
    async fn history_and_system_instruction_are_replayed() {
        let (host, seen) = mock(json!({
            "candidates": [{"content": {"parts": [{"text": "Hello "}, {"text": "there"}]}}],
            "usageMetadata": {"totalTokenCount": 17}
        }))
        .await;
        let mut g = generator(&host);
        g.set_system_instruction("Be brief.".into());
        let history = vec![AiMessage::user("hi"), AiMessage::model("hey")];
        let attachment = Attachment::new("image/png", vec![0, 1]);

        let reply = g.generate("look", Some(&attachment), &history).await.unwrap();
        assert_eq!(reply.role, Role::Model);
        assert_eq!(reply.content, "Hello there");
        assert_eq!(reply.total_token_count, 17);

        let calls = seen.0.lock().unwrap();
        let (call, key, body) = &calls[0];
        assert_eq!(call, "gemini-2.0-flash:generateContent");
        assert_eq!(key.as_deref(), Some("secret"));
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be brief.");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["parts"][1]["inline_data"]["data"], "AAE=");
    }

    #[tokio::test]
    async fn json_mode_rejects_plain_text() {
        let (host, seen) = mock(json!({
            "candidates": [{"content": {"parts": [{"text": "not json"}]}}]
        }))
        .await;
        let mut g = generator(&host);
        g.set_content_config(super::super::ContentConfig {
            response_mime_type: Some("application/json".into()),
            temperature: Some(0.5),
            ..Default::default()
        });
        let err = g.generate("q", None, &[]).await.unwrap_err();
        assert_eq!(err.kind(), "agent_error");
        let calls = seen.0.lock().unwrap();
        let config = &calls[0].2["generationConfig"];
        assert_eq!(config["responseMimeType"], "application/json");
        assert_eq!(config["temperature"], 0.5);
    }

    #[tokio::test]
    async fn vendor_errors_and_missing_model_are_agent_errors() {
        let app = Router::new().route(
            "/v1beta/models/{call}",
            post(|| async { (axum::http::StatusCode::FORBIDDEN, "denied") }),
        );
        let host = spawn(app).await;
        let err = generator(&host).generate("q", None, &[]).await.unwrap_err();
        assert!(err.to_string().contains("403"));

        let mut g = GeminiGenerator::new(Client::new());
        g.set_api_key("k".into());
        let err = g.generate("q", None, &[]).await.unwrap_err();
        assert!(err.to_string().contains("model is not set"));
    }
}
