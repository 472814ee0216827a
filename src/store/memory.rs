use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use moka::notification::RemovalCause;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ConversationStore, decode, encode};
use crate::chatbot::ConversationFrame;
use crate::error::FlowError;

type Frames = Arc<Mutex<VecDeque<String>>>;

/// Frames kept as encoded JSON in a cache that forgets idle conversations.
#[derive(Debug, Clone)]
pub struct InMemoryConversationStore {
    conversations: Cache<String, Frames>,
    max_frames: usize,
}

impl InMemoryConversationStore {
    pub fn new(ttl: Duration, max_frames: usize) -> Arc<Self> {
        let listener = |key: Arc<String>, _frames: Frames, cause: RemovalCause| {
            if cause == RemovalCause::Expired {
                debug!(conversation = %key, "conversation expired");
            }
        };
        let conversations = Cache::builder()
            .time_to_idle(ttl)
            .eviction_listener(listener)
            .build();
        Arc::new(Self {
            conversations,
            max_frames: max_frames.max(1),
        })
    }

    async fn frames(&self, key: &str) -> Frames {
        self.conversations
            .get_with(key.to_string(), async { Arc::new(Mutex::new(VecDeque::new())) })
            .await
    }

    /// Store an already encoded line, bypassing serialization.
    pub async fn append_raw(&self, key: &str, line: impl Into<String>) {
        let frames = self.frames(key).await;
        let mut frames = frames.lock().await;
        frames.push_back(line.into());
        while frames.len() > self.max_frames {
            frames.pop_front();
        }
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, key: &str, frame: &ConversationFrame) -> Result<(), FlowError> {
        self.append_raw(key, encode(frame)?).await;
        Ok(())
    }

    async fn latest(&self, key: &str) -> Result<Option<ConversationFrame>, FlowError> {
        let Some(frames) = self.conversations.get(key).await else {
            return Ok(None);
        };
        let frames = frames.lock().await;
        Ok(frames.back().and_then(|line| decode(key, line)))
    }

    async fn history(&self, key: &str) -> Result<Vec<ConversationFrame>, FlowError> {
        let Some(frames) = self.conversations.get(key).await else {
            return Ok(Vec::new());
        };
        let frames = frames.lock().await;
        Ok(frames.iter().filter_map(|line| decode(key, line)).collect())
    }

    async fn clear(&self, key: &str) -> Result<(), FlowError> {
        self.conversations.invalidate(key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatbot::FrameStatus;

    fn store() -> Arc<InMemoryConversationStore> {
        InMemoryConversationStore::new(Duration::from_secs(60), 10)
    }

    #[tokio::test]
    async fn latest_returns_last_append() {
        let store = store();
        assert!(store.latest("k").await.unwrap().is_none());

        store.append("k", &ConversationFrame::new("main", "menu")).await.unwrap();
        let second = ConversationFrame::new("form", "1").at_step(0, FrameStatus::WaitingInput);
        store.append("k", &second).await.unwrap();

        assert_eq!(store.latest("k").await.unwrap(), Some(second));
        assert_eq!(store.history("k").await.unwrap().len(), 2);
        assert!(store.latest("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_latest_frame_reads_as_none() {
        let store = store();
        store.append("k", &ConversationFrame::new("main", "menu")).await.unwrap();
        store.append_raw("k", "{not json").await;
        assert!(store.latest("k").await.unwrap().is_none());
        assert_eq!(store.history("k").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retention_keeps_newest_frames() {
        let store = InMemoryConversationStore::new(Duration::from_secs(60), 2);
        for i in 0..5 {
            store
                .append("k", &ConversationFrame::new(format!("f{i}"), ""))
                .await
                .unwrap();
        }
        let keys: Vec<String> = store
            .history("k")
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.flow_key)
            .collect();
        assert_eq!(keys, vec!["f3", "f4"]);
    }

    #[tokio::test]
    async fn clear_forgets_the_conversation() {
        let store = store();
        store.append("k", &ConversationFrame::new("main", "")).await.unwrap();
        store.clear("k").await.unwrap();
        assert!(store.latest("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_kept() {
        let store = InMemoryConversationStore::new(Duration::from_secs(60), 100);
        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .append("k", &ConversationFrame::new(format!("f{i}"), ""))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.history("k").await.unwrap().len(), 20);
    }
}
