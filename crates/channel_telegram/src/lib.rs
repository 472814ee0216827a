use std::collections::HashMap;

use async_trait::async_trait;
use channel_transport::{
    ChannelTransport, DeliveryAck, MediaContent, MediaRef, NormalizedMessage, OutboundMedia,
    TransportError, make_session_key,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{FileId, FileMeta, InputFile, Message as TelegramMessage, UpdateKind, User};
use teloxide::{ApiError, RequestError};
use tracing::{debug, warn};
use url::Url;

pub const CHANNEL: &str = "telegram";

/// Pick the media a message carries; photos come in several sizes and the
/// last one is the largest.
fn extract_media(msg: &TelegramMessage) -> Option<MediaRef> {
    let media = |file: &FileMeta, mime: Option<String>, default_mime: &str, name: Option<String>| MediaRef {
        id: file.id.to_string(),
        mime_type: Some(mime.unwrap_or_else(|| default_mime.to_string())),
        url: None,
        file_name: name,
    };
    if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
        return Some(media(&photo.file, None, "image/jpeg", None));
    }
    if let Some(doc) = msg.document() {
        let mime = doc.mime_type.as_ref().map(|m| m.to_string());
        return Some(media(&doc.file, mime, "application/octet-stream", doc.file_name.clone()));
    }
    if let Some(voice) = msg.voice() {
        let mime = voice.mime_type.as_ref().map(|m| m.to_string());
        return Some(media(&voice.file, mime, "audio/ogg", None));
    }
    if let Some(audio) = msg.audio() {
        let mime = audio.mime_type.as_ref().map(|m| m.to_string());
        return Some(media(&audio.file, mime, "audio/mpeg", audio.file_name.clone()));
    }
    if let Some(video) = msg.video() {
        let mime = video.mime_type.as_ref().map(|m| m.to_string());
        return Some(media(&video.file, mime, "video/mp4", video.file_name.clone()));
    }
    None
}

fn normalize(
    chat_id: i64,
    id: String,
    from: Option<&User>,
    text: String,
    timestamp: DateTime<Utc>,
) -> NormalizedMessage {
    let chat_id = chat_id.to_string();
    let mut metadata = HashMap::new();
    if let Some(user) = from {
        metadata.insert("user_id".to_string(), json!(user.id.0));
        if let Some(username) = &user.username {
            metadata.insert("username".to_string(), json!(username));
        }
    }
    NormalizedMessage {
        id,
        channel: CHANNEL.to_string(),
        conversation_key: make_session_key(CHANNEL, &chat_id),
        sender_id: chat_id,
        sender_name: from.map(|u| u.first_name.clone()),
        text,
        media: None,
        timestamp,
        metadata,
    }
}

fn from_message(msg: &TelegramMessage) -> NormalizedMessage {
    let text = msg.text().or_else(|| msg.caption()).unwrap_or_default();
    let mut normalized = normalize(
        msg.chat.id.0,
        format!("{}:{}", msg.chat.id.0, msg.id.0),
        msg.from.as_ref(),
        text.to_string(),
        msg.date,
    );
    normalized
        .metadata
        .insert("message_id".to_string(), json!(msg.id.0));
    normalized.media = extract_media(msg);
    normalized
}

fn request_error(err: RequestError) -> TransportError {
    match err {
        RequestError::RetryAfter(wait) => TransportError::RateLimited {
            message: "telegram rate limit".into(),
            retry_after: Some(wait.duration()),
        },
        RequestError::Api(ApiError::InvalidToken) => {
            TransportError::NotAuthorized("telegram rejected the bot token".into())
        }
        RequestError::Network(e) => TransportError::Transient(e.to_string()),
        RequestError::Io(e) => TransportError::Transient(e.to_string()),
        other => TransportError::Permanent(other.to_string()),
    }
}

/// Telegram Bot API transport on `teloxide`. Replies are addressed by chat id.
#[derive(Debug, Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            bot: Bot::new(token),
        }
    }

    /// Point the transport at another Bot API server (local bot API, test doubles).
    pub fn with_api_url(token: impl Into<String>, api_url: Url) -> Self {
        Self {
            bot: Bot::new(token).set_api_url(api_url),
        }
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }
}

#[async_trait]
impl ChannelTransport for TelegramTransport {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn decode_inbound(&self, raw: &[u8]) -> Result<Option<NormalizedMessage>, TransportError> {
        let update: Update = serde_json::from_slice(raw)
            .map_err(|e| TransportError::Permanent(format!("invalid telegram update: {e}")))?;

        match &update.kind {
            UpdateKind::Message(msg) | UpdateKind::EditedMessage(msg) => Ok(Some(from_message(msg))),
            UpdateKind::CallbackQuery(query) => {
                let Some(chat) = update.chat() else {
                    debug!("callback query without message ignored");
                    return Ok(None);
                };
                let normalized = normalize(
                    chat.id.0,
                    format!("{}:callback:{}", chat.id.0, update.id.0),
                    Some(&query.from),
                    query.data.clone().unwrap_or_default(),
                    Utc::now(),
                );
                Ok(Some(normalized))
            }
            _ => {
                debug!("telegram update carries no message");
                Ok(None)
            }
        }
    }

    async fn send_outbound(
        &self,
        recipient: &str,
        text: &str,
        media: Option<OutboundMedia>,
    ) -> Result<DeliveryAck, TransportError> {
        let chat = recipient.to_string();
        let sent = match media {
            None => self.bot.send_message(chat, text).send().await,
            Some(media) => {
                let input = InputFile::memory(media.bytes).file_name(media.file_name);
                if media.mime_type.starts_with("image/") {
                    let mut request = self.bot.send_photo(chat, input);
                    if !text.is_empty() {
                        request = request.caption(text);
                    }
                    request.send().await
                } else {
                    let mut request = self.bot.send_document(chat, input);
                    if !text.is_empty() {
                        request = request.caption(text);
                    }
                    request.send().await
                }
            }
        };
        let sent = sent.map_err(|e| {
            warn!(recipient, error = %e, "telegram send failed");
            request_error(e)
        })?;
        Ok(DeliveryAck::new(CHANNEL, recipient, sent.id.0.to_string()))
    }

    async fn download_media(&self, media: &MediaRef) -> Result<MediaContent, TransportError> {
        let file = self
            .bot
            .get_file(FileId(media.id.clone()))
            .send()
            .await
            .map_err(request_error)?;
        let mut bytes = Vec::new();
        self.bot
            .download_file(&file.path, &mut bytes)
            .await
            .map_err(|e| TransportError::Transient(format!("downloading `{}`: {e}", media.id)))?;
        Ok(MediaContent {
            mime_type: media
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".into()),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Bytes, http::Uri};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Calls = Arc<Mutex<Vec<(String, Value)>>>;

    /// Bot API double: records `(method, body)` per call and answers with `reply`.
    async fn spawn_api(reply: impl Fn(&str) -> (u16, Value) + Send + Sync + 'static) -> (Url, Calls) {
        let calls: Calls = Arc::default();
        let seen = calls.clone();
        let reply = Arc::new(reply);
        let app = Router::new().fallback(move |uri: Uri, body: Bytes| {
            let seen = seen.clone();
            let reply = reply.clone();
            async move {
                let path = uri.path().to_string();
                if path.starts_with("/file/") {
                    return (axum::http::StatusCode::OK, Bytes::from_static(&[1, 2, 3]));
                }
                let method = path.rsplit('/').next().unwrap_or_default().to_lowercase();
                let parsed = serde_json::from_slice(&body).unwrap_or(Value::Null);
                seen.lock().unwrap().push((method.clone(), parsed));
                let (status, json) = reply(&method);
                (
                    axum::http::StatusCode::from_u16(status).unwrap(),
                    Bytes::from(json.to_string()),
                )
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (Url::parse(&format!("http://{addr}/")).unwrap(), calls)
    }

    fn sent_message(id: i64) -> Value {
        json!({
            "ok": true,
            "result": {
                "message_id": id,
                "date": 1700000000,
                "chat": {"id": 42, "type": "private", "first_name": "Ada"},
                "text": "hi there"
            }
        })
    }

    #[tokio::test]
    async fn decodes_text_update() {
        let transport = TelegramTransport::new("T");
        let raw = json!({
            "update_id": 1,
            "message": {
                "message_id": 5,
                "from": {"id": 42, "is_bot": false, "first_name": "Ada", "username": "ada"},
                "chat": {"id": 42, "type": "private", "first_name": "Ada"},
                "date": 1700000000,
                "text": "hello"
            }
        });
        let msg = transport
            .decode_inbound(raw.to_string().as_bytes())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.conversation_key, "42@telegram");
        assert_eq!(msg.sender_id, "42");
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.sender_name.as_deref(), Some("Ada"));
        assert_eq!(msg.metadata["username"], json!("ada"));
        assert_eq!(msg.timestamp.timestamp(), 1700000000);
        assert!(msg.media.is_none());
    }

    #[tokio::test]
    async fn photo_caption_becomes_text_and_largest_photo_is_used() {
        let transport = TelegramTransport::new("T");
        let raw = json!({
            "update_id": 2,
            "message": {
                "message_id": 6,
                "chat": {"id": 7, "type": "private", "first_name": "Bo"},
                "date": 1700000000,
                "caption": "look",
                "photo": [
                    {"file_id": "small", "file_unique_id": "s", "width": 90, "height": 90, "file_size": 10},
                    {"file_id": "large", "file_unique_id": "l", "width": 800, "height": 800, "file_size": 900}
                ]
            }
        });
        let msg = transport
            .decode_inbound(raw.to_string().as_bytes())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.text, "look");
        let media = msg.media.unwrap();
        assert_eq!(media.id, "large");
        assert_eq!(media.mime_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn update_without_message_is_ignored() {
        let transport = TelegramTransport::new("T");
        let out = transport
            .decode_inbound(br#"{"update_id": 3, "poll": {}}"#)
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(transport.decode_inbound(b"not json").await.is_err());
    }

    #[tokio::test]
    async fn send_message_posts_chat_id_and_text() {
        let (url, calls) = spawn_api(|_| (200, sent_message(99))).await;
        let transport = TelegramTransport::with_api_url("T", url);

        let ack = transport.send_outbound("42", "hi there", None).await.unwrap();
        assert_eq!(ack.message_id, "99");
        assert_eq!(ack.recipient, "42");
        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "sendmessage");
        assert_eq!(calls[0].1["text"], "hi there");
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let (url, _) = spawn_api(|_| {
            (
                429,
                json!({
                    "ok": false,
                    "error_code": 429,
                    "description": "Too Many Requests: retry after 3",
                    "parameters": {"retry_after": 3}
                }),
            )
        })
        .await;
        let transport = TelegramTransport::with_api_url("T", url);

        let err = transport.send_outbound("42", "hi", None).await.unwrap_err();
        let TransportError::RateLimited { retry_after, .. } = err else {
            panic!("expected rate limit, got {err:?}");
        };
        assert_eq!(retry_after, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn unauthorized_token_maps_to_not_authorized() {
        let (url, _) = spawn_api(|_| {
            (
                401,
                json!({"ok": false, "error_code": 401, "description": "Unauthorized"}),
            )
        })
        .await;
        let transport = TelegramTransport::with_api_url("T", url);
        let err = transport.send_outbound("42", "hi", None).await.unwrap_err();
        assert!(matches!(err, TransportError::NotAuthorized(_)), "{err:?}");
    }

    #[tokio::test]
    async fn downloads_media_through_get_file() {
        let (url, calls) = spawn_api(|method| match method {
            "getfile" => (
                200,
                json!({"ok": true, "result": {
                    "file_id": "F1", "file_unique_id": "U1", "file_size": 3,
                    "file_path": "photos/a.jpg"
                }}),
            ),
            _ => (404, json!({"ok": false, "error_code": 404, "description": "Not Found"})),
        })
        .await;
        let transport = TelegramTransport::with_api_url("T", url);

        let media = MediaRef {
            id: "F1".into(),
            mime_type: Some("image/jpeg".into()),
            url: None,
            file_name: None,
        };
        let content = transport.download_media(&media).await.unwrap();
        assert_eq!(content.bytes, vec![1, 2, 3]);
        assert_eq!(content.mime_type, "image/jpeg");
        assert_eq!(calls.lock().unwrap()[0].1["file_id"], "F1");
    }
}
