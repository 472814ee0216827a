//! Glue between channel transports and the session driver.

pub mod console;
pub mod router;

pub use console::ConsoleTransport;
pub use router::{ConversationRouter, TransportReply};
