use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use super::{ConversationStore, decode, encode};
use crate::chatbot::ConversationFrame;
use crate::error::FlowError;

/// One JSON-lines file per conversation under a state directory.
#[derive(Debug)]
pub struct FileConversationStore {
    dir: PathBuf,
    ttl: Duration,
    max_frames: usize,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Holds one conversation's lock. The map entry is dropped with the last
/// holder, so the lock table only covers conversations in use.
struct KeyGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Keys become file names; anything outside a safe set is percent-encoded.
fn file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 6);
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'@' => {
                name.push(byte as char)
            }
            other => name.push_str(&format!("%{other:02X}")),
        }
    }
    name.push_str(".jsonl");
    name
}

fn io_error(path: &Path, err: std::io::Error) -> FlowError {
    FlowError::State {
        message: format!("{}: {err}", path.display()),
        retryable: true,
    }
}

impl FileConversationStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        ttl: Duration,
        max_frames: usize,
    ) -> Result<Arc<Self>, FlowError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        info!(dir = %dir.display(), "file conversation store opened");
        Ok(Arc::new(Self {
            dir,
            ttl,
            max_frames: max_frames.max(1),
            locks: DashMap::new(),
        }))
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(file_name(key))
    }

    async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            locks: &self.locks,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Lines of the conversation file; expired or missing files read as empty.
    async fn read_lines(&self, key: &str) -> Result<Vec<String>, FlowError> {
        let path = self.path(key);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&path, e)),
        };
        let idle = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default();
        if idle > self.ttl {
            debug!(conversation = key, "conversation file expired");
            let _ = fs::remove_file(&path).await;
            return Ok(Vec::new());
        }
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&path, e)),
        };
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Store an already encoded line, bypassing serialization.
    pub async fn append_raw(&self, key: &str, line: &str) -> Result<(), FlowError> {
        let _guard = self.lock(key).await;
        let path = self.path(key);

        let mut lines = self.read_lines(key).await?;
        if lines.len() + 1 > self.max_frames {
            lines.push(line.to_string());
            let keep = lines.split_off(lines.len() - self.max_frames);
            let mut content = keep.join("\n");
            content.push('\n');
            return fs::write(&path, content).await.map_err(|e| io_error(&path, e));
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| io_error(&path, e))?;
        file.flush().await.map_err(|e| io_error(&path, e))
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn append(&self, key: &str, frame: &ConversationFrame) -> Result<(), FlowError> {
        self.append_raw(key, &encode(frame)?).await
    }

    async fn latest(&self, key: &str) -> Result<Option<ConversationFrame>, FlowError> {
        let _guard = self.lock(key).await;
        let lines = self.read_lines(key).await?;
        Ok(lines.last().and_then(|line| decode(key, line)))
    }

    async fn history(&self, key: &str) -> Result<Vec<ConversationFrame>, FlowError> {
        let _guard = self.lock(key).await;
        let lines = self.read_lines(key).await?;
        Ok(lines.iter().filter_map(|line| decode(key, line)).collect())
    }

    async fn clear(&self, key: &str) -> Result<(), FlowError> {
        let _guard = self.lock(key).await;
        let path = self.path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatbot::FrameStatus;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn keys_map_to_safe_file_names() {
        assert_eq!(file_name("42@telegram"), "42@telegram.jsonl");
        assert_eq!(file_name("a/b"), "a%2Fb.jsonl");
        assert_ne!(file_name("a/b"), file_name("a_b"));
    }

    #[tokio::test]
    async fn frames_survive_reopening() {
        let dir = tempdir().unwrap();
        let frame = ConversationFrame::new("order_form", "a@b.co")
            .at_step(1, FrameStatus::Idle)
            .with_data(json!({"email": "a@b.co"}).as_object().cloned().unwrap());
        {
            let store = FileConversationStore::open(dir.path(), Duration::from_secs(60), 10).unwrap();
            store.append("u1@test", &ConversationFrame::new("main", "menu")).await.unwrap();
            store.append("u1@test", &frame).await.unwrap();
        }
        let store = FileConversationStore::open(dir.path(), Duration::from_secs(60), 10).unwrap();
        assert_eq!(store.latest("u1@test").await.unwrap(), Some(frame));
        assert_eq!(store.history("u1@test").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_conversation_reads_as_none() {
        let dir = tempdir().unwrap();
        let store = FileConversationStore::open(dir.path(), Duration::from_secs(60), 10).unwrap();
        assert!(store.latest("nobody").await.unwrap().is_none());
        store.clear("nobody").await.unwrap();
    }

    #[tokio::test]
    async fn malformed_trailing_line_reads_as_none() {
        let dir = tempdir().unwrap();
        let store = FileConversationStore::open(dir.path(), Duration::from_secs(60), 10).unwrap();
        store.append("k", &ConversationFrame::new("main", "")).await.unwrap();
        store.append_raw("k", "garbage").await.unwrap();
        assert!(store.latest("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retention_rewrites_the_file() {
        let dir = tempdir().unwrap();
        let store = FileConversationStore::open(dir.path(), Duration::from_secs(60), 3).unwrap();
        for i in 0..6 {
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
        assert_eq!(keys, vec!["f3", "f4", "f5"]);
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let dir = tempdir().unwrap();
        let store = FileConversationStore::open(dir.path(), Duration::ZERO, 10).unwrap();
        store.append("k", &ConversationFrame::new("main", "")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.latest("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_table_empties_after_use() {
        let dir = tempdir().unwrap();
        let store = FileConversationStore::open(dir.path(), Duration::from_secs(60), 100).unwrap();
        let writers: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let key = format!("u{}@test", i % 4);
                    store
                        .append(&key, &ConversationFrame::new(format!("f{i}"), ""))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        for i in 0..4 {
            let key = format!("u{i}@test");
            assert_eq!(store.history(&key).await.unwrap().len(), 5);
            store.clear(&key).await.unwrap();
        }
        assert!(store.locks.is_empty());
    }

    #[tokio::test]
    async fn clear_removes_the_file() {
        let dir = tempdir().unwrap();
        let store = FileConversationStore::open(dir.path(), Duration::from_secs(60), 10).unwrap();
        store.append("k", &ConversationFrame::new("main", "")).await.unwrap();
        store.clear("k").await.unwrap();
        assert!(store.latest("k").await.unwrap().is_none());
    }
}
