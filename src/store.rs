//! Append-only per-conversation frame storage.

pub mod file;
pub mod memory;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::chatbot::ConversationFrame;
use crate::config::EngineConfig;
use crate::error::FlowError;

pub use file::FileConversationStore;
pub use memory::InMemoryConversationStore;

/// Frames are appended per conversation key; `latest` returns the most recent.
///
/// Appends for one key are atomic and totally ordered. Frames that cannot be
/// decoded are logged and treated as absent.
#[async_trait]
pub trait ConversationStore: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    async fn append(&self, key: &str, frame: &ConversationFrame) -> Result<(), FlowError>;

    async fn latest(&self, key: &str) -> Result<Option<ConversationFrame>, FlowError>;

    /// All readable frames for `key`, oldest first.
    async fn history(&self, key: &str) -> Result<Vec<ConversationFrame>, FlowError>;

    async fn clear(&self, key: &str) -> Result<(), FlowError>;
}

pub(crate) fn encode(frame: &ConversationFrame) -> Result<String, FlowError> {
    serde_json::to_string(frame).map_err(|e| FlowError::State {
        message: format!("cannot encode frame: {e}"),
        retryable: false,
    })
}

pub(crate) fn decode(key: &str, line: &str) -> Option<ConversationFrame> {
    match serde_json::from_str(line) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(conversation = key, error = %e, "malformed frame ignored");
            None
        }
    }
}

/// File-backed store when a state directory is configured, in-memory otherwise.
pub fn from_config(config: &EngineConfig) -> Result<Arc<dyn ConversationStore>, FlowError> {
    Ok(match &config.state_dir {
        Some(dir) => FileConversationStore::open(dir, config.state_ttl, config.max_frames_per_key)?,
        None => InMemoryConversationStore::new(config.state_ttl, config.max_frames_per_key),
    })
}
