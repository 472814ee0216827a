use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound message after a transport stripped away its vendor framing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct NormalizedMessage {
    pub id: String,
    pub channel: String,
    /// Vendor id of the sender, also the address replies go back to.
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Stable key identifying the conversation (`sender@channel`).
    pub conversation_key: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl NormalizedMessage {
    pub fn text(channel: &str, sender_id: &str, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: None,
            conversation_key: make_session_key(channel, sender_id),
            text: text.into(),
            media: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media = Some(media);
        self
    }
}

/// Reference to vendor-hosted media that can be fetched with `download_media`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MediaRef {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaContent {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMedia {
    pub mime_type: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DeliveryAck {
    pub message_id: String,
    pub recipient: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryAck {
    pub fn new(channel: &str, recipient: &str, message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            recipient: recipient.to_string(),
            channel: channel.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

pub fn make_session_key(channel: &str, sender_id: &str) -> String {
    format!("{sender_id}@{channel}")
}

/// Inverse of [`make_session_key`]; sender ids may themselves contain `@`.
pub fn split_session_key(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once('@')
        .filter(|(sender, channel)| !sender.is_empty() && !channel.is_empty())
}
