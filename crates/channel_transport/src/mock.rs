use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::TransportError;
use crate::message::{DeliveryAck, MediaContent, MediaRef, NormalizedMessage, OutboundMedia};
use crate::transport::ChannelTransport;

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub recipient: String,
    pub text: String,
    pub media: Option<OutboundMedia>,
}

#[derive(Deserialize)]
struct MockInbound {
    sender_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    media: Option<MediaRef>,
}

/// In-memory transport for tests. Inbound payloads are `{"sender_id", "text"}`
/// JSON documents; outbound messages are recorded.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    channel: String,
    sent: Arc<Mutex<Vec<SentMessage>>>,
    media: Arc<Mutex<HashMap<String, MediaContent>>>,
    failures: Arc<Mutex<Vec<TransportError>>>,
}

impl MockTransport {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent_messages().into_iter().map(|m| m.text).collect()
    }

    pub fn clear_sent(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }

    pub fn add_media(&self, id: &str, content: MediaContent) {
        if let Ok(mut media) = self.media.lock() {
            media.insert(id.to_string(), content);
        }
    }

    /// The next send fails with `err` instead of being recorded.
    pub fn fail_next_send(&self, err: TransportError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(err);
        }
    }

    pub fn inbound(sender_id: &str, text: &str) -> Vec<u8> {
        serde_json::json!({ "sender_id": sender_id, "text": text })
            .to_string()
            .into_bytes()
    }
}

#[async_trait]
impl ChannelTransport for MockTransport {
    fn name(&self) -> &str {
        &self.channel
    }

    async fn decode_inbound(&self, raw: &[u8]) -> Result<Option<NormalizedMessage>, TransportError> {
        let inbound: MockInbound = serde_json::from_slice(raw)
            .map_err(|e| TransportError::Permanent(format!("invalid mock payload: {e}")))?;
        let mut message = NormalizedMessage::text(&self.channel, &inbound.sender_id, inbound.text);
        message.media = inbound.media;
        Ok(Some(message))
    }

    async fn send_outbound(
        &self,
        recipient: &str,
        text: &str,
        media: Option<OutboundMedia>,
    ) -> Result<DeliveryAck, TransportError> {
        if let Some(err) = self.failures.lock().ok().and_then(|mut f| f.pop()) {
            return Err(err);
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| TransportError::Permanent("mock transport poisoned".into()))?;
        sent.push(SentMessage {
            recipient: recipient.to_string(),
            text: text.to_string(),
            media,
        });
        Ok(DeliveryAck::new(&self.channel, recipient, format!("mock-{}", sent.len())))
    }

    async fn download_media(&self, media: &MediaRef) -> Result<MediaContent, TransportError> {
        self.media
            .lock()
            .ok()
            .and_then(|m| m.get(&media.id).cloned())
            .ok_or_else(|| TransportError::Permanent(format!("unknown media `{}`", media.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_outbound_and_decodes_inbound() {
        let mock = MockTransport::new("mock");
        let msg = mock
            .decode_inbound(&MockTransport::inbound("u1", "hi"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.conversation_key, "u1@mock");
        assert_eq!(msg.text, "hi");

        mock.send_outbound("u1", "hello back", None).await.unwrap();
        assert_eq!(mock.sent_texts(), vec!["hello back".to_string()]);
    }

    #[tokio::test]
    async fn injected_failure_is_returned_once() {
        let mock = MockTransport::new("mock");
        mock.fail_next_send(TransportError::Transient("down".into()));
        assert!(mock.send_outbound("u1", "x", None).await.is_err());
        assert!(mock.send_outbound("u1", "y", None).await.is_ok());
        assert_eq!(mock.sent_texts(), vec!["y".to_string()]);
    }

    #[tokio::test]
    async fn rejects_garbage_payloads() {
        let mock = MockTransport::new("mock");
        let err = mock.decode_inbound(b"not json").await.unwrap_err();
        assert!(matches!(err, TransportError::Permanent(_)));
    }
}
