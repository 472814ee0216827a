pub mod webhook;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use channel_transport::{
    ChannelTransport, DeliveryAck, MediaContent, MediaRef, NormalizedMessage, OutboundMedia,
    TransportError, make_session_key,
};
use chrono::{TimeZone, Utc};
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use webhook::{WaMessage, WebhookPayload};

pub use webhook::{verify_signature, verify_subscription};

pub const CHANNEL: &str = "whatsapp";
const DEFAULT_GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";

/// App credentials used to exchange the access token for a fresh one.
#[derive(Debug, Clone)]
pub struct AppCredentials {
    pub app_id: String,
    pub app_secret: String,
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub access_token: String,
    pub phone_number_id: String,
    pub verify_token: String,
    pub credentials: Option<AppCredentials>,
    /// Phone-number-id to session id; unmapped numbers use their own id.
    pub sessions: HashMap<String, String>,
    pub graph_base: String,
}

impl WhatsAppConfig {
    pub fn new(
        access_token: impl Into<String>,
        phone_number_id: impl Into<String>,
        verify_token: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            phone_number_id: phone_number_id.into(),
            verify_token: verify_token.into(),
            credentials: None,
            sessions: HashMap::new(),
            graph_base: DEFAULT_GRAPH_BASE.to_string(),
        }
    }
}

fn request_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() || err.is_connect() {
        TransportError::Transient(err.to_string())
    } else {
        TransportError::Permanent(err.to_string())
    }
}

/// Graph API errors carry their own codes next to the HTTP status.
fn graph_error(status: u16, body: &str) -> TransportError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let message = parsed
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or(body)
        .to_string();
    match parsed.pointer("/error/code").and_then(Value::as_i64) {
        Some(190) => TransportError::NotAuthorized(message),
        Some(4 | 80007 | 130429 | 131048 | 131056) => TransportError::RateLimited {
            message,
            retry_after: None,
        },
        Some(1 | 2 | 131000) => TransportError::Transient(message),
        _ => TransportError::from_status(status, message),
    }
}

fn media_kind(mime: &str) -> &'static str {
    if mime.starts_with("image/") {
        "image"
    } else if mime.starts_with("audio/") {
        "audio"
    } else if mime.starts_with("video/") {
        "video"
    } else {
        "document"
    }
}

/// WhatsApp Cloud API transport bound to one business phone number.
#[derive(Debug)]
pub struct WhatsAppTransport {
    client: reqwest::Client,
    config: WhatsAppConfig,
    access_token: RwLock<String>,
}

impl WhatsAppTransport {
    pub fn new(config: WhatsAppConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        let access_token = RwLock::new(config.access_token.clone());
        Self {
            client,
            config,
            access_token,
        }
    }

    pub fn verify_subscription(
        &self,
        mode: Option<&str>,
        token: Option<&str>,
        challenge: Option<&str>,
    ) -> Result<String, TransportError> {
        verify_subscription(mode, token, challenge, &self.config.verify_token)
    }

    /// Session id for a business phone number.
    pub fn session_for(&self, phone_number_id: &str) -> String {
        self.config
            .sessions
            .get(phone_number_id)
            .cloned()
            .unwrap_or_else(|| phone_number_id.to_string())
    }

    pub async fn access_token(&self) -> String {
        self.access_token.read().await.clone()
    }

    /// Exchange the current token for a long-lived one.
    pub async fn refresh_access_token(&self) -> Result<(), TransportError> {
        let Some(creds) = &self.config.credentials else {
            return Err(TransportError::NotAuthorized(
                "no app credentials configured for token refresh".into(),
            ));
        };
        let current = self.access_token().await;
        let resp = self
            .client
            .get(format!("{}/oauth/access_token", self.config.graph_base))
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", creds.app_id.as_str()),
                ("client_secret", creds.app_secret.as_str()),
                ("fb_exchange_token", current.as_str()),
            ])
            .send()
            .await
            .map_err(request_error)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(request_error)?;
        if !(200..300).contains(&status) {
            return Err(graph_error(status, &body));
        }
        let token = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("access_token").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| TransportError::Permanent("token exchange returned no token".into()))?;
        *self.access_token.write().await = token;
        info!("whatsapp access token refreshed");
        Ok(())
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, TransportError> {
        let token = self.access_token().await;
        let resp = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(request_error)?;
        if !(200..300).contains(&status) {
            return Err(graph_error(status, &text));
        }
        serde_json::from_str(&text).map_err(|e| TransportError::Permanent(e.to_string()))
    }

    /// Retry once after a token refresh when the token was rejected.
    async fn post_json_refreshing(&self, url: &str, body: &Value) -> Result<Value, TransportError> {
        match self.post_json(url, body).await {
            Err(TransportError::NotAuthorized(msg)) if self.config.credentials.is_some() => {
                warn!(%msg, "whatsapp token rejected, refreshing");
                self.refresh_access_token().await?;
                self.post_json(url, body).await
            }
            other => other,
        }
    }

    async fn upload_media(&self, media: OutboundMedia) -> Result<String, TransportError> {
        let part = Part::bytes(media.bytes)
            .file_name(media.file_name)
            .mime_str(&media.mime_type)
            .map_err(|e| TransportError::Permanent(e.to_string()))?;
        let form = Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", media.mime_type.clone())
            .part("file", part);
        let resp = self
            .client
            .post(format!("{}/{}/media", self.config.graph_base, self.config.phone_number_id))
            .bearer_auth(self.access_token().await)
            .multipart(form)
            .send()
            .await
            .map_err(request_error)?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(request_error)?;
        if !(200..300).contains(&status) {
            return Err(graph_error(status, &text));
        }
        serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| TransportError::Permanent("media upload returned no id".into()))
    }

    fn normalize(&self, phone_number_id: &str, name: Option<String>, msg: WaMessage) -> NormalizedMessage {
        let session = self.session_for(phone_number_id);
        let (text, media) = match msg.kind.as_str() {
            "text" => (msg.text.map(|t| t.body).unwrap_or_default(), None),
            "interactive" => {
                let reply = msg
                    .interactive
                    .and_then(|i| i.button_reply.or(i.list_reply))
                    .map(|r| r.id);
                (reply.unwrap_or_default(), None)
            }
            "button" => {
                let text = msg.button.and_then(|b| b.payload.or(b.text));
                (text.unwrap_or_default(), None)
            }
            _ => {
                let media = msg.image.or(msg.document).or(msg.audio).or(msg.video);
                match media {
                    Some(m) => (
                        m.caption.clone().unwrap_or_default(),
                        Some(MediaRef {
                            id: m.id,
                            mime_type: m.mime_type,
                            url: None,
                            file_name: m.filename,
                        }),
                    ),
                    None => (String::new(), None),
                }
            }
        };
        let timestamp = msg
            .timestamp
            .as_deref()
            .and_then(|t| t.parse::<i64>().ok())
            .and_then(|t| Utc.timestamp_opt(t, 0).single())
            .unwrap_or_else(Utc::now);

        let mut metadata = HashMap::new();
        metadata.insert("phone_number_id".to_string(), json!(phone_number_id));
        metadata.insert("session_id".to_string(), json!(session));
        metadata.insert("message_type".to_string(), json!(msg.kind));

        NormalizedMessage {
            id: msg.id,
            channel: CHANNEL.to_string(),
            conversation_key: make_session_key(&format!("{CHANNEL}:{session}"), &msg.from),
            sender_id: msg.from,
            sender_name: name,
            text,
            media,
            timestamp,
            metadata,
        }
    }
}

#[async_trait]
impl ChannelTransport for WhatsAppTransport {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn decode_inbound(&self, raw: &[u8]) -> Result<Option<NormalizedMessage>, TransportError> {
        let payload: WebhookPayload = serde_json::from_slice(raw)
            .map_err(|e| TransportError::Permanent(format!("invalid whatsapp webhook: {e}")))?;

        for change in payload.entry.into_iter().flat_map(|e| e.changes) {
            let value = change.value;
            let phone_number_id = value
                .metadata
                .map(|m| m.phone_number_id)
                .unwrap_or_else(|| self.config.phone_number_id.clone());
            let contacts = value.contacts;
            if let Some(msg) = value.messages.into_iter().next() {
                let name = contacts
                    .iter()
                    .find(|c| c.wa_id == msg.from)
                    .and_then(|c| c.profile.as_ref())
                    .and_then(|p| p.name.clone());
                return Ok(Some(self.normalize(&phone_number_id, name, msg)));
            }
        }
        debug!("whatsapp webhook carries no message");
        Ok(None)
    }

    async fn send_outbound(
        &self,
        recipient: &str,
        text: &str,
        media: Option<OutboundMedia>,
    ) -> Result<DeliveryAck, TransportError> {
        let body = match media {
            None => json!({
                "messaging_product": "whatsapp",
                "to": recipient,
                "type": "text",
                "text": { "body": text },
            }),
            Some(media) => {
                let kind = media_kind(&media.mime_type);
                let file_name = media.file_name.clone();
                let id = self.upload_media(media).await?;
                let mut object = json!({ "id": id });
                if !text.is_empty() && kind != "audio" {
                    object["caption"] = json!(text);
                }
                if kind == "document" {
                    object["filename"] = json!(file_name);
                }
                let mut body = json!({
                    "messaging_product": "whatsapp",
                    "to": recipient,
                    "type": kind,
                });
                body[kind] = object;
                body
            }
        };
        let url = format!("{}/{}/messages", self.config.graph_base, self.config.phone_number_id);
        let resp = self.post_json_refreshing(&url, &body).await?;
        let message_id = resp
            .pointer("/messages/0/id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(DeliveryAck::new(CHANNEL, recipient, message_id))
    }

    async fn download_media(&self, media: &MediaRef) -> Result<MediaContent, TransportError> {
        let token = self.access_token().await;
        let resp = self
            .client
            .get(format!("{}/{}", self.config.graph_base, media.id))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(request_error)?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(request_error)?;
        if !(200..300).contains(&status) {
            return Err(graph_error(status, &text));
        }
        let info: Value =
            serde_json::from_str(&text).map_err(|e| TransportError::Permanent(e.to_string()))?;
        let url = info
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Permanent(format!("media `{}` has no url", media.id)))?;
        let mime_type = info
            .get("mime_type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| media.mime_type.clone())
            .unwrap_or_else(|| "application/octet-stream".into());

        let resp = self
            .client
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(request_error)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(graph_error(status, &body));
        }
        let bytes = resp.bytes().await.map_err(request_error)?;
        Ok(MediaContent {
            mime_type,
            bytes: bytes.to_vec(),
        })
    }
}
