use async_trait::async_trait;

use crate::error::TransportError;
use crate::message::{DeliveryAck, MediaContent, MediaRef, NormalizedMessage, OutboundMedia};

/// A messaging channel the conversation router can receive from and reply through.
///
/// Implementations own their vendor quirks: payload shapes, authentication,
/// media hosting and the mapping from vendor ids onto conversation keys.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Decode one raw inbound payload. `Ok(None)` means the payload carried
    /// no user message (delivery receipts, status callbacks).
    async fn decode_inbound(&self, raw: &[u8]) -> Result<Option<NormalizedMessage>, TransportError>;

    async fn send_outbound(
        &self,
        recipient: &str,
        text: &str,
        media: Option<OutboundMedia>,
    ) -> Result<DeliveryAck, TransportError>;

    async fn download_media(&self, media: &MediaRef) -> Result<MediaContent, TransportError>;
}
