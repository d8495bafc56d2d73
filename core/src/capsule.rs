use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tabulon_protocol::RunCapsule;
use tabulon_protocol::RunOutcome;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::error::GatewayErr;
use crate::error::Result;

/// Append-only store of run capsules, keyed by `run_id`. Capsules are never
/// updated or deleted once written.
#[async_trait]
pub trait CapsuleStore: Send + Sync {
    /// Durably persist `capsule` before returning.
    async fn put(&self, capsule: RunCapsule) -> Result<()>;

    async fn get(&self, run_id: Uuid) -> Result<Option<RunCapsule>>;

    /// The most recent succeeded capsule among `candidate_run_ids` whose
    /// `dataset_id` matches. Candidates typically come from a thread's
    /// recent message history (`ThreadMessage::run_id`); the capsule store
    /// itself has no notion of threads.
    async fn latest_successful(
        &self,
        candidate_run_ids: &[Uuid],
        dataset_id: &str,
    ) -> Result<Option<RunCapsule>>;
}

fn pick_latest_successful<'a>(
    capsules: impl Iterator<Item = &'a RunCapsule>,
    candidate_run_ids: &[Uuid],
    dataset_id: &str,
) -> Option<RunCapsule> {
    capsules
        .filter(|c| candidate_run_ids.contains(&c.run_id))
        .filter(|c| c.dataset_id == dataset_id)
        .filter(|c| c.status == RunOutcome::Succeeded)
        .max_by_key(|c| c.created_at)
        .cloned()
}

/// In-memory capsule store, primarily for tests and short-lived processes.
#[derive(Default)]
pub struct InMemoryCapsuleStore {
    capsules: Mutex<HashMap<Uuid, RunCapsule>>,
}

#[async_trait]
impl CapsuleStore for InMemoryCapsuleStore {
    async fn put(&self, capsule: RunCapsule) -> Result<()> {
        let mut guard = self.capsules.lock().expect("capsule store mutex poisoned");
        guard.insert(capsule.run_id, capsule);
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<RunCapsule>> {
        let guard = self.capsules.lock().expect("capsule store mutex poisoned");
        Ok(guard.get(&run_id).cloned())
    }

    async fn latest_successful(
        &self,
        candidate_run_ids: &[Uuid],
        dataset_id: &str,
    ) -> Result<Option<RunCapsule>> {
        let guard = self.capsules.lock().expect("capsule store mutex poisoned");
        Ok(pick_latest_successful(
            guard.values(),
            candidate_run_ids,
            dataset_id,
        ))
    }
}

struct WriteRequest {
    line: String,
    ack: oneshot::Sender<std::io::Result<()>>,
}

/// JSONL-backed, append-only capsule store. A dedicated writer task owns the
/// file handle; `put` blocks until that task has written and flushed the
/// line, so a successful `put` really does mean the capsule is durable.
pub struct JsonlCapsuleStore {
    tx: mpsc::Sender<WriteRequest>,
    index: Arc<Mutex<HashMap<Uuid, RunCapsule>>>,
}

impl JsonlCapsuleStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut index = HashMap::new();
        if let Ok(existing) = tokio::fs::read_to_string(path).await {
            for line in existing.lines() {
                if let Ok(capsule) = serde_json::from_str::<RunCapsule>(line) {
                    index.insert(capsule.run_id, capsule);
                }
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await?;

        let (tx, mut rx) = mpsc::channel::<WriteRequest>(256);

        tokio::task::spawn(async move {
            let mut file = file;
            while let Some(req) = rx.recv().await {
                let result = async {
                    file.write_all(req.line.as_bytes()).await?;
                    file.write_all(b"\n").await?;
                    file.flush().await
                }
                .await;
                if req.ack.send(result).is_err() {
                    warn!("capsule writer: caller dropped before ack");
                }
            }
        });

        Ok(Self {
            tx,
            index: Arc::new(Mutex::new(index)),
        })
    }
}

#[async_trait]
impl CapsuleStore for JsonlCapsuleStore {
    async fn put(&self, capsule: RunCapsule) -> Result<()> {
        let line = serde_json::to_string(&capsule)?;
        let (ack_tx, ack_rx) = oneshot::channel();

        self.tx
            .send(WriteRequest { line, ack: ack_tx })
            .await
            .map_err(|_| GatewayErr::RunnerProtocol("capsule writer task is gone".to_string()))?;

        ack_rx
            .await
            .map_err(|_| GatewayErr::RunnerProtocol("capsule writer task dropped ack".to_string()))??;

        self.index
            .lock()
            .expect("capsule index mutex poisoned")
            .insert(capsule.run_id, capsule);
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<RunCapsule>> {
        Ok(self
            .index
            .lock()
            .expect("capsule index mutex poisoned")
            .get(&run_id)
            .cloned())
    }

    async fn latest_successful(
        &self,
        candidate_run_ids: &[Uuid],
        dataset_id: &str,
    ) -> Result<Option<RunCapsule>> {
        let guard = self.index.lock().expect("capsule index mutex poisoned");
        Ok(pick_latest_successful(
            guard.values(),
            candidate_run_ids,
            dataset_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabulon_protocol::QueryMode;

    fn sample(run_id: Uuid, dataset_id: &str, status: RunOutcome) -> RunCapsule {
        RunCapsule {
            run_id,
            created_at: chrono::Utc::now(),
            dataset_id: dataset_id.to_string(),
            question: "how many rows?".to_string(),
            query_mode: QueryMode::Sql,
            compiled_sql: Some("SELECT 1".to_string()),
            plan_json: None,
            python_code: None,
            status,
            result_json: None,
            error_json: None,
            exec_time_ms: 5,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips_field_for_field() {
        let store = InMemoryCapsuleStore::default();
        let run_id = Uuid::new_v4();
        let capsule = sample(run_id, "support", RunOutcome::Succeeded);
        store.put(capsule.clone()).await.unwrap();
        let fetched = store.get(run_id).await.unwrap().unwrap();
        assert_eq!(fetched, capsule);
    }

    #[tokio::test]
    async fn latest_successful_ignores_other_datasets_and_failures() {
        let store = InMemoryCapsuleStore::default();
        let ok_id = Uuid::new_v4();
        let failed_id = Uuid::new_v4();
        let other_dataset_id = Uuid::new_v4();

        store.put(sample(ok_id, "support", RunOutcome::Succeeded)).await.unwrap();
        store.put(sample(failed_id, "support", RunOutcome::Failed)).await.unwrap();
        store
            .put(sample(other_dataset_id, "ecommerce", RunOutcome::Succeeded))
            .await
            .unwrap();

        let candidates = [ok_id, failed_id, other_dataset_id];
        let latest = store
            .latest_successful(&candidates, "support")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.run_id, ok_id);
    }

    #[tokio::test]
    async fn jsonl_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capsules.jsonl");
        let run_id = Uuid::new_v4();

        {
            let store = JsonlCapsuleStore::open(&path).await.unwrap();
            store
                .put(sample(run_id, "support", RunOutcome::Succeeded))
                .await
                .unwrap();
        }

        let reopened = JsonlCapsuleStore::open(&path).await.unwrap();
        assert!(reopened.get(run_id).await.unwrap().is_some());
    }
}
