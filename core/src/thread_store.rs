use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tabulon_protocol::ThreadMessage;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// Pluggable append-only log of thread messages, keyed by `thread_id`.
/// Reading a thread always returns messages in commit order.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn append(&self, message: ThreadMessage) -> Result<()>;

    /// The last `limit` messages of `thread_id`, oldest first.
    async fn recent(&self, thread_id: Uuid, limit: usize) -> Result<Vec<ThreadMessage>>;
}

#[derive(Default)]
pub struct InMemoryThreadStore {
    by_thread: Mutex<HashMap<Uuid, Vec<ThreadMessage>>>,
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn append(&self, message: ThreadMessage) -> Result<()> {
        self.by_thread
            .lock()
            .expect("thread store mutex poisoned")
            .entry(message.thread_id)
            .or_default()
            .push(message);
        Ok(())
    }

    async fn recent(&self, thread_id: Uuid, limit: usize) -> Result<Vec<ThreadMessage>> {
        let guard = self.by_thread.lock().expect("thread store mutex poisoned");
        let Some(messages) = guard.get(&thread_id) else {
            return Ok(Vec::new());
        };
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }
}

/// JSONL-backed thread store. Writes go through a single writer task (same
/// pattern as the capsule store) so concurrent appends from different
/// requests are serialized without a blocking file lock; reads are served
/// from an in-memory mirror kept current by every successful append.
pub struct JsonlThreadStore {
    tx: mpsc::Sender<String>,
    by_thread: Arc<Mutex<HashMap<Uuid, Vec<ThreadMessage>>>>,
}

impl JsonlThreadStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut by_thread: HashMap<Uuid, Vec<ThreadMessage>> = HashMap::new();
        if let Ok(existing) = tokio::fs::read_to_string(path).await {
            for line in existing.lines() {
                if let Ok(message) = serde_json::from_str::<ThreadMessage>(line) {
                    by_thread.entry(message.thread_id).or_default().push(message);
                }
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await?;

        let (tx, mut rx) = mpsc::channel::<String>(256);
        tokio::task::spawn(async move {
            let mut file = file;
            while let Some(line) = rx.recv().await {
                if file.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if file.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = file.flush().await;
            }
        });

        Ok(Self {
            tx,
            by_thread: Arc::new(Mutex::new(by_thread)),
        })
    }
}

#[async_trait]
impl ThreadStore for JsonlThreadStore {
    async fn append(&self, message: ThreadMessage) -> Result<()> {
        let line = serde_json::to_string(&message)?;
        self.by_thread
            .lock()
            .expect("thread store mutex poisoned")
            .entry(message.thread_id)
            .or_default()
            .push(message);
        let _ = self.tx.send(line).await;
        Ok(())
    }

    async fn recent(&self, thread_id: Uuid, limit: usize) -> Result<Vec<ThreadMessage>> {
        let guard = self.by_thread.lock().expect("thread store mutex poisoned");
        let Some(messages) = guard.get(&thread_id) else {
            return Ok(Vec::new());
        };
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabulon_protocol::Role;

    fn msg(thread_id: Uuid, content: &str) -> ThreadMessage {
        ThreadMessage {
            thread_id,
            ts: chrono::Utc::now(),
            role: Role::User,
            content: content.to_string(),
            dataset_id: "support".to_string(),
            run_id: None,
        }
    }

    #[tokio::test]
    async fn messages_are_returned_in_commit_order() {
        let store = InMemoryThreadStore::default();
        let thread_id = Uuid::new_v4();
        store.append(msg(thread_id, "first")).await.unwrap();
        store.append(msg(thread_id, "second")).await.unwrap();
        let recent = store.recent(thread_id, 10).await.unwrap();
        assert_eq!(recent.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn recent_respects_window() {
        let store = InMemoryThreadStore::default();
        let thread_id = Uuid::new_v4();
        for i in 0..5 {
            store.append(msg(thread_id, &i.to_string())).await.unwrap();
        }
        let recent = store.recent(thread_id, 2).await.unwrap();
        assert_eq!(recent.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec!["3", "4"]);
    }
}
