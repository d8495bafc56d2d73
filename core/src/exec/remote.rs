use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tabulon_protocol::ErrorKind;
use tabulon_protocol::RunnerRequest;
use tabulon_protocol::RunnerResponse;
use tabulon_protocol::RunnerStatus as WireRunnerStatus;
use tracing::debug;
use tracing::warn;

use crate::error::GatewayErr;
use crate::error::Result;
use crate::exec::Executor;
use crate::exec::RunCache;
use crate::exec::RunStatus;
use crate::exec::local::LocalExecutor;
use crate::util::backoff;

/// Classification of a single `start` attempt's outcome.
enum AttemptOutcome {
    Ready(String),
    /// Transient failure: transport error, 5xx, or 429.
    Retryable(GatewayErr),
    /// Non-transient failure (4xx other than 429): retrying or falling back
    /// would not help.
    Fatal(GatewayErr),
}

/// Whether a fully-retried `start` failed in a way worth falling back to a
/// local CLI execution, or should be surfaced immediately.
enum StartFailure {
    Retryable(GatewayErr),
    Fatal(GatewayErr),
}

/// `true` for HTTP statuses worth retrying a sandbox `start` call against:
/// server errors and rate-limiting. Any other 4xx is a config/auth/request
/// problem that retrying would not fix.
fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[derive(Debug, Serialize)]
struct StartSandboxRequest<'a> {
    run_id: &'a str,
    dataset_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct StartSandboxResponse {
    sandbox_id: String,
}

/// RPC client for a remote sandbox service implementing the three-call
/// `start`/`exec`/`stop` lifecycle described in the component design.
pub struct RemoteExecutor {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    max_attempts: u32,
    /// Invoked in place of the remote round trip when `start` exhausts
    /// retries on a classified retryable failure.
    cli_fallback: Option<LocalExecutor>,
    runs: RunCache,
}

impl RemoteExecutor {
    pub fn new(endpoint: String, token: String, cli_fallback: Option<LocalExecutor>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            token,
            max_attempts: 3,
            cli_fallback,
            runs: RunCache::new(),
        }
    }

    /// Classifies a single start attempt's outcome as ready, retryable, or
    /// fatal. Transport errors and 5xx/429 responses are retryable; any
    /// other 4xx is fatal.
    async fn attempt_start(&self, run_id: &str, dataset_id: &str) -> AttemptOutcome {
        let result = self
            .client
            .post(format!("{}/sandboxes", self.endpoint))
            .bearer_auth(&self.token)
            .json(&StartSandboxRequest { run_id, dataset_id })
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<StartSandboxResponse>().await {
                Ok(parsed) => AttemptOutcome::Ready(parsed.sandbox_id),
                Err(e) => AttemptOutcome::Retryable(GatewayErr::Reqwest(e)),
            },
            Ok(resp) => {
                let status = resp.status();
                let err = GatewayErr::from(crate::error::SandboxErr::BackendUnavailable(format!(
                    "start returned {status}"
                )));
                if is_retryable_status(status.as_u16()) {
                    AttemptOutcome::Retryable(err)
                } else {
                    AttemptOutcome::Fatal(err)
                }
            }
            Err(e) => AttemptOutcome::Retryable(GatewayErr::Reqwest(e)),
        }
    }

    /// Retries `attempt_start` up to `max_attempts` times for retryable
    /// failures; a fatal failure short-circuits immediately.
    async fn start(&self, run_id: &str, dataset_id: &str) -> std::result::Result<String, StartFailure> {
        let mut last_retryable = None;
        for attempt in 1..=self.max_attempts {
            match self.attempt_start(run_id, dataset_id).await {
                AttemptOutcome::Ready(sandbox_id) => return Ok(sandbox_id),
                AttemptOutcome::Fatal(e) => {
                    warn!(run_id, attempt, "sandbox start failed with a non-retryable error");
                    return Err(StartFailure::Fatal(e));
                }
                AttemptOutcome::Retryable(e) => {
                    warn!(run_id, attempt, error = %e, "sandbox start attempt failed, retrying");
                    last_retryable = Some(e);
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(backoff(attempt as u64)).await;
            }
        }

        Err(StartFailure::Retryable(last_retryable.unwrap_or_else(|| {
            GatewayErr::from(crate::error::SandboxErr::BackendUnavailable(
                "sandbox start failed".to_string(),
            ))
        })))
    }

    async fn exec(&self, sandbox_id: &str, request: &RunnerRequest) -> Result<RunnerResponse> {
        let deadline = Duration::from_secs(request.timeout_seconds.max(1) as u64);
        let call = self
            .client
            .post(format!("{}/sandboxes/{sandbox_id}/exec", self.endpoint))
            .bearer_auth(&self.token)
            .json(request)
            .timeout(deadline)
            .send();

        match call.await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<RunnerResponse>().await {
                    Ok(r) => Ok(r),
                    Err(_) => Ok(RunnerResponse::error(
                        ErrorKind::RunnerInternalError,
                        "remote sandbox returned a non-conforming response body",
                    )),
                }
            }
            Ok(resp) if resp.status().as_u16() == 408 => Ok(RunnerResponse::error(
                ErrorKind::RunnerTimeout,
                "remote sandbox reported exec timeout",
            )),
            Ok(resp) => Ok(RunnerResponse::error(
                ErrorKind::RunnerInternalError,
                format!("remote sandbox exec returned {}", resp.status()),
            )),
            Err(e) if e.is_timeout() => Ok(RunnerResponse::error(
                ErrorKind::RunnerTimeout,
                "exec call exceeded the run's wall-clock budget",
            )),
            Err(e) => Ok(RunnerResponse::error(
                ErrorKind::RunnerInternalError,
                format!("transport error talking to remote sandbox: {e}"),
            )),
        }
    }

    async fn stop(&self, run_id: &str, sandbox_id: &str) {
        for attempt in 1..=self.max_attempts {
            let result = self
                .client
                .delete(format!("{}/sandboxes/{sandbox_id}", self.endpoint))
                .bearer_auth(&self.token)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => return,
                _ if attempt < self.max_attempts => {
                    tokio::time::sleep(backoff(attempt as u64)).await;
                }
                _ => {
                    warn!(run_id, sandbox_id, "failed to stop remote sandbox after retries");
                }
            }
        }
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn submit(&self, run_id: &str, request: &RunnerRequest) -> Result<RunnerResponse> {
        self.runs.record(run_id, RunStatus::Running, None).await;

        let outcome = match self.start(run_id, &request.dataset_id).await {
            Ok(sandbox_id) => {
                debug!(run_id, sandbox_id, "remote sandbox started");
                let response = self.exec(&sandbox_id, request).await;
                self.stop(run_id, &sandbox_id).await;
                response
            }
            Err(StartFailure::Retryable(e)) => match &self.cli_fallback {
                Some(local) => {
                    warn!(run_id, "remote start exhausted retries, falling back to local CLI execution");
                    local.submit(run_id, request).await
                }
                None => Err(e),
            },
            Err(StartFailure::Fatal(e)) => Err(e),
        };

        match &outcome {
            Ok(response) => {
                let status = match response.status {
                    WireRunnerStatus::Success => RunStatus::Succeeded,
                    WireRunnerStatus::Error => RunStatus::Failed,
                    WireRunnerStatus::Timeout => RunStatus::TimedOut,
                };
                self.runs.record(run_id, status, Some(response.clone())).await;
            }
            Err(_) => {
                self.runs.record(run_id, RunStatus::Failed, None).await;
            }
        }

        outcome
    }

    async fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.runs.status(run_id).await
    }

    async fn result(&self, run_id: &str) -> Option<RunnerResponse> {
        self.runs.result(run_id).await
    }

    async fn cancel(&self, run_id: &str) -> Result<()> {
        debug!(run_id, "cancel on the remote backend terminates via stop on the exec path");
        Ok(())
    }

    async fn cleanup(&self, run_id: &str) -> Result<()> {
        self.runs.remove(run_id).await;
        debug!(run_id, "cleanup releases the run cache entry; stop already ran in submit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_rate_limit_are_retryable() {
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
    }

    #[test]
    fn other_client_errors_are_fatal() {
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(403));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn cli_fallback_only_engages_on_retryable_start_failure() {
        let fatal = StartFailure::Fatal(GatewayErr::from(crate::error::SandboxErr::BackendUnavailable(
            "start returned 401".to_string(),
        )));
        let retryable = StartFailure::Retryable(GatewayErr::from(crate::error::SandboxErr::BackendUnavailable(
            "start returned 503".to_string(),
        )));
        assert!(matches!(fatal, StartFailure::Fatal(_)));
        assert!(matches!(retryable, StartFailure::Retryable(_)));
    }

    #[tokio::test]
    async fn cleanup_removes_the_run_cache_entry() {
        let executor = RemoteExecutor::new("http://example.invalid".to_string(), "token".to_string(), None);
        executor.runs.record("run-x", RunStatus::Running, None).await;
        assert_eq!(executor.status("run-x").await, Some(RunStatus::Running));
        executor.cleanup("run-x").await.unwrap();
        assert_eq!(executor.status("run-x").await, None);
    }
}
