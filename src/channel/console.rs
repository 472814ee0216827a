use async_trait::async_trait;
use channel_transport::{
    ChannelTransport, DeliveryAck, MediaContent, MediaRef, NormalizedMessage, OutboundMedia,
    TransportError,
};
use tokio::io::{AsyncWriteExt, stdout};

pub const CONSOLE_CHANNEL: &str = "console";

/// Terminal transport for `chatflow chat`: stdin lines in, stdout lines out.
#[derive(Debug, Clone)]
pub struct ConsoleTransport {
    user: String,
}

impl ConsoleTransport {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

impl Default for ConsoleTransport {
    fn default() -> Self {
        Self::new("local")
    }
}

#[async_trait]
impl ChannelTransport for ConsoleTransport {
    fn name(&self) -> &str {
        CONSOLE_CHANNEL
    }

    async fn decode_inbound(&self, raw: &[u8]) -> Result<Option<NormalizedMessage>, TransportError> {
        let line = std::str::from_utf8(raw)
            .map_err(|e| TransportError::Permanent(format!("console input is not utf-8: {e}")))?
            .trim();
        if line.is_empty() {
            return Ok(None);
        }
        Ok(Some(NormalizedMessage::text(CONSOLE_CHANNEL, &self.user, line)))
    }

    async fn send_outbound(
        &self,
        recipient: &str,
        text: &str,
        media: Option<OutboundMedia>,
    ) -> Result<DeliveryAck, TransportError> {
        let mut out = format!("bot> {}\n", text.replace('\n', "\n     "));
        if let Some(media) = media {
            out.push_str(&format!("     [{} {} bytes]\n", media.file_name, media.bytes.len()));
        }
        let mut stdout = stdout();
        stdout
            .write_all(out.as_bytes())
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        Ok(DeliveryAck::new(
            CONSOLE_CHANNEL,
            recipient,
            uuid::Uuid::new_v4().to_string(),
        ))
    }

    async fn download_media(&self, media: &MediaRef) -> Result<MediaContent, TransportError> {
        Err(TransportError::Permanent(format!(
            "console has no media `{}`",
            media.id
        )))
    }
}
