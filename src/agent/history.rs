use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio::sync::Mutex;

use super::AiMessage;

/// Recent AI turns per conversation, bounded to a window of messages and
/// forgotten once the conversation idles past the TTL.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    histories: Cache<String, Arc<Mutex<VecDeque<AiMessage>>>>,
    window: usize,
}

impl HistoryStore {
    pub fn new(window: usize, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            histories: Cache::builder().time_to_idle(ttl).build(),
            window,
        })
    }

    pub async fn get(&self, key: &str) -> Vec<AiMessage> {
        match self.histories.get(key).await {
            Some(history) => history.lock().await.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Append `messages` in order, dropping the oldest beyond the window.
    pub async fn push(&self, key: &str, messages: impl IntoIterator<Item = AiMessage>) {
        if self.window == 0 {
            return;
        }
        let history = self
            .histories
            .get_with(key.to_string(), async { Arc::new(Mutex::new(VecDeque::new())) })
            .await;
        let mut history = history.lock().await;
        for message in messages {
            history.push_back(message);
        }
        while history.len() > self.window {
            history.pop_front();
        }
    }

    pub async fn clear(&self, key: &str) {
        self.histories.invalidate(key).await;
    }
}
