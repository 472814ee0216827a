pub mod error;
pub mod message;
pub mod mock;
pub mod transport;

pub use error::TransportError;
pub use message::{
    DeliveryAck, LogLevel, MediaContent, MediaRef, NormalizedMessage, OutboundMedia,
    make_session_key, split_session_key,
};
pub use mock::MockTransport;
pub use transport::ChannelTransport;
