pub mod cluster;
pub mod local;
pub mod remote;
pub mod sandboxing;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tabulon_protocol::RunnerRequest;
use tabulon_protocol::RunnerResponse;
use tokio::sync::Mutex;
use tokio::sync::Semaphore;

use crate::error::Result;

/// Terminal/non-terminal lifecycle states of a submitted run, uniform across
/// every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::TimedOut
        )
    }
}

/// Uniform contract implemented by every sandbox backend. Every backend
/// normalizes whatever it observes (container exit, RPC reply, job log) into
/// a [`RunnerResponse`] internally; callers never branch on backend type.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `request` to completion (or timeout/cancellation) and return the
    /// normalized response. Synchronous with respect to completion: this
    /// call does not return until the run reaches a terminal state. Also
    /// records `run_id`'s status and result in the backend's run cache, so a
    /// caller that lost the return value (e.g. across a task boundary) can
    /// still retrieve it via [`Executor::status`]/[`Executor::result`].
    async fn submit(&self, run_id: &str, request: &RunnerRequest) -> Result<RunnerResponse>;

    /// Last known lifecycle state of `run_id`, or `None` if nothing has been
    /// recorded for it (never submitted, or already cleaned up).
    async fn status(&self, run_id: &str) -> Option<RunStatus>;

    /// Cached terminal response for `run_id`, or `None` if the run hasn't
    /// reached a terminal state yet or nothing has been recorded for it.
    async fn result(&self, run_id: &str) -> Option<RunnerResponse>;

    /// Best-effort, idempotent termination of an in-flight run.
    async fn cancel(&self, run_id: &str) -> Result<()>;

    /// Idempotent release of any residual backend resources for `run_id`,
    /// including its entry in the run cache.
    async fn cleanup(&self, run_id: &str) -> Result<()>;
}

/// Per-run status/result cache keyed by `run_id`, shared by the three
/// `Executor` implementations. A run's entry lives from `submit` through
/// `cleanup`; nothing prunes it automatically.
#[derive(Default)]
pub struct RunCache {
    entries: Mutex<HashMap<String, (RunStatus, Option<RunnerResponse>)>>,
}

impl RunCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, run_id: &str, status: RunStatus, response: Option<RunnerResponse>) {
        self.entries
            .lock()
            .await
            .insert(run_id.to_string(), (status, response));
    }

    pub async fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.entries.lock().await.get(run_id).map(|(status, _)| *status)
    }

    pub async fn result(&self, run_id: &str) -> Option<RunnerResponse> {
        self.entries
            .lock()
            .await
            .get(run_id)
            .and_then(|(_, response)| response.clone())
    }

    pub async fn remove(&self, run_id: &str) {
        self.entries.lock().await.remove(run_id);
    }
}

/// Bounds concurrent sandbox submissions across every backend with a
/// counting semaphore, per the global concurrency cap in the concurrency
/// model: submissions beyond the cap wait in FIFO order until a slot frees.
/// `status`/`result`/`cancel`/`cleanup` pass straight through, since only
/// `submit` consumes a sandbox slot.
pub struct SemaphoreExecutor {
    inner: Arc<dyn Executor>,
    permits: Arc<Semaphore>,
}

impl SemaphoreExecutor {
    pub fn new(inner: Arc<dyn Executor>, max_concurrent: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

#[async_trait]
impl Executor for SemaphoreExecutor {
    async fn submit(&self, run_id: &str, request: &RunnerRequest) -> Result<RunnerResponse> {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return Err(crate::error::GatewayErr::from(crate::error::SandboxErr::BackendUnavailable(
                    "sandbox concurrency semaphore closed".to_string(),
                )));
            }
        };
        self.inner.submit(run_id, request).await
    }

    async fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.inner.status(run_id).await
    }

    async fn result(&self, run_id: &str) -> Option<RunnerResponse> {
        self.inner.result(run_id).await
    }

    async fn cancel(&self, run_id: &str) -> Result<()> {
        self.inner.cancel(run_id).await
    }

    async fn cleanup(&self, run_id: &str) -> Result<()> {
        self.inner.cleanup(run_id).await
    }
}
