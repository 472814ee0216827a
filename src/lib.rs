//! Conversational flow engine.
//!
//! Two ways to script a conversation live side by side:
//!
//! * [`flow::FlowEngine`] runs JSON step flows (function calls, HTTP calls,
//!   conditionals, delays, parallel fan-out) over a shared state bag.
//! * [`chatbot::SessionDriver`] drives keyword-triggered menu, form and agent
//!   flows, persisting one [`chatbot::ConversationFrame`] per turn in a
//!   [`store::ConversationStore`].
//!
//! Channels plug in through `channel_transport::ChannelTransport`;
//! [`channel::ConversationRouter`] connects a transport to the driver.

pub mod agent;
pub mod channel;
pub mod chatbot;
pub mod condition;
pub mod config;
pub mod error;
pub mod flow;
pub mod logger;
pub mod registry;
pub mod schema;
pub mod state;
pub mod store;
pub mod template;

pub use error::FlowError;
