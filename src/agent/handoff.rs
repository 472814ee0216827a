use std::sync::Arc;

use async_trait::async_trait;
use channel_transport::ChannelTransport;
use tracing::{info, warn};

use super::{AiMessage, Attachment, HistoryStore, create_generator};
use crate::chatbot::{AiHandoff, HandoffRequest, ReplySink};
use crate::error::FlowError;

/// Default agent hand-off: build the configured generator, replay the
/// conversation's history, reply with the generated text and remember both turns.
pub struct GeneratorHandoff {
    client: reqwest::Client,
    history: Arc<HistoryStore>,
    transport: Option<Arc<dyn ChannelTransport>>,
}

impl GeneratorHandoff {
    pub fn new(client: reqwest::Client, history: Arc<HistoryStore>) -> Self {
        Self {
            client,
            history,
            transport: None,
        }
    }

    /// Transport used to fetch media attached to inbound messages.
    pub fn with_transport(mut self, transport: Arc<dyn ChannelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    async fn attachment(&self, request: &HandoffRequest<'_>) -> Option<Attachment> {
        let media = request.message.media.as_ref()?;
        let Some(transport) = &self.transport else {
            warn!(media = %media.id, "no transport to download media from");
            return None;
        };
        match transport.download_media(media).await {
            Ok(content) => Some(Attachment::new(content.mime_type, content.bytes)),
            Err(e) => {
                warn!(media = %media.id, error = %e, "media download failed, continuing without it");
                None
            }
        }
    }
}

#[async_trait]
impl AiHandoff for GeneratorHandoff {
    #[tracing::instrument(
        name = "agent_handoff",
        skip_all,
        fields(agent = %request.agent.id, conversation = %request.conversation_key)
    )]
    async fn generate(
        &self,
        request: HandoffRequest<'_>,
        on_reply: &dyn ReplySink,
    ) -> Result<(), FlowError> {
        let generator = create_generator(request.agent, &self.client)?;
        let attachment = self.attachment(&request).await;
        let history = self.history.get(request.conversation_key).await;

        let reply = generator
            .generate(request.user_text, attachment.as_ref(), &history)
            .await?;
        info!(tokens = reply.total_token_count, "agent replied");
        on_reply.reply(&reply.content).await?;

        let asked = AiMessage::user(request.user_text).with_attachment(attachment);
        self.history.push(request.conversation_key, [asked, reply]).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, AgentType, Role};
    use axum::routing::post;
    use axum::{Json, Router};
    use channel_transport::{MediaContent, MediaRef, MockTransport, NormalizedMessage};
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl ReplySink for Collect {
        async fn reply(&self, text: &str) -> Result<(), FlowError> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    async fn mock_openai() -> (String, Arc<Mutex<Vec<Value>>>) {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
        let record = seen.clone();
        let app = Router::new().route(
            "/chat/completions",
            post(move |Json(body): Json<Value>| {
                let record = record.clone();
                async move {
                    let turn = body["messages"].as_array().map(Vec::len).unwrap_or(0);
                    record.lock().unwrap().push(body);
                    Json(json!({
                        "choices": [{"message": {"content": format!("reply {turn}")}}],
                        "usage": {"total_tokens": 3}
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    fn agent(host: &str) -> AgentConfig {
        serde_json::from_value(json!({
            "id": "helper", "type": "other", "model": "local", "host": host
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn replies_and_accumulates_history() {
        let (host, seen) = mock_openai().await;
        let agent = agent(&host);
        assert_eq!(agent.agent_type, AgentType::Other);
        let handoff = GeneratorHandoff::new(
            reqwest::Client::new(),
            HistoryStore::new(10, Duration::from_secs(60)),
        );
        let sink = Collect::default();

        for text in ["hello", "again"] {
            let message = NormalizedMessage::text("test", "u1", text);
            let request = HandoffRequest {
                agent: &agent,
                conversation_key: "u1@test",
                user_text: text,
                message: &message,
            };
            handoff.generate(request, &sink).await.unwrap();
        }

        assert_eq!(*sink.0.lock().unwrap(), vec!["reply 1", "reply 3"]);
        let history = handoff.history().get("u1@test").await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[3].content, "reply 3");
        assert_eq!(seen.lock().unwrap()[1]["messages"][1]["content"], "reply 1");
    }

    #[tokio::test]
    async fn inbound_media_is_attached() {
        let (host, seen) = mock_openai().await;
        let agent = agent(&host);
        let transport = MockTransport::new("test");
        transport.add_media(
            "m1",
            MediaContent {
                mime_type: "image/png".into(),
                bytes: vec![1, 2, 3],
            },
        );
        let handoff = GeneratorHandoff::new(
            reqwest::Client::new(),
            HistoryStore::new(10, Duration::from_secs(60)),
        )
        .with_transport(Arc::new(transport));

        let message = NormalizedMessage::text("test", "u1", "what is this").with_media(MediaRef {
            id: "m1".into(),
            mime_type: Some("image/png".into()),
            url: None,
            file_name: None,
        });
        let request = HandoffRequest {
            agent: &agent,
            conversation_key: "u1@test",
            user_text: "what is this",
            message: &message,
        };
        handoff.generate(request, &Collect::default()).await.unwrap();

        let body = &seen.lock().unwrap()[0];
        assert_eq!(
            body["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AQID"
        );
        let history = handoff.history().get("u1@test").await;
        assert!(history[0].attachment.is_some());
    }
}
