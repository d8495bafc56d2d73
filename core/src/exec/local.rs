use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tabulon_protocol::ErrorKind;
use tabulon_protocol::RunnerRequest;
use tabulon_protocol::RunnerResponse;
use tabulon_protocol::RunnerStatus as WireRunnerStatus;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

use crate::error::GatewayErr;
use crate::error::Result;
use crate::exec::Executor;
use crate::exec::RunCache;
use crate::exec::RunStatus;

/// Grace period added on top of the request's own `timeout_seconds` before
/// the orchestrator gives up waiting on the child and synthesizes a timeout
/// response.
const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

/// If `status` shows the child was killed by a signal a resource limit set in
/// [`crate::exec::sandboxing`] raises -- `SIGKILL` (cgroup/OOM or a hard
/// `RLIMIT_AS` enforcement), `SIGXCPU` (`RLIMIT_CPU`), or `SIGSEGV` (typical
/// `RLIMIT_AS` allocation failure) -- returns that signal number.
#[cfg(target_os = "linux")]
fn resource_limit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal @ (libc::SIGKILL | libc::SIGXCPU | libc::SIGSEGV)) => Some(signal),
        _ => None,
    }
}

#[cfg(not(target_os = "linux"))]
fn resource_limit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Spawns a short-lived, per-request sandboxed process for each submission:
/// the `linux-sandbox` helper applies Landlock + seccomp hardening to itself
/// and then execs into the runner binary, which speaks the stdin/stdout
/// runner protocol directly.
pub struct LocalExecutor {
    linux_sandbox_path: PathBuf,
    runner_path: PathBuf,
    datasets_dir: PathBuf,
    memory_limit_bytes: u64,
    cpu_limit_seconds: u64,
    max_processes: u64,
    runs: RunCache,
}

impl LocalExecutor {
    pub fn new(
        linux_sandbox_path: PathBuf,
        runner_path: PathBuf,
        datasets_dir: PathBuf,
        memory_limit_bytes: u64,
        cpu_limit_seconds: u64,
        max_processes: u64,
    ) -> Self {
        Self {
            linux_sandbox_path,
            runner_path,
            datasets_dir,
            memory_limit_bytes,
            cpu_limit_seconds,
            max_processes,
            runs: RunCache::new(),
        }
    }

    fn build_command(&self, scratch_dir: &Path) -> Command {
        let mut cmd = if cfg!(target_os = "linux") {
            let mut c = Command::new(&self.linux_sandbox_path);
            c.arg(&self.datasets_dir)
                .arg(scratch_dir)
                .arg(&self.runner_path)
                .arg(self.memory_limit_bytes.to_string())
                .arg(self.cpu_limit_seconds.to_string())
                .arg(self.max_processes.to_string());
            c
        } else {
            warn!("linux sandbox hardening unavailable on this platform; running unsandboxed");
            Command::new(&self.runner_path)
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn submit(&self, run_id: &str, request: &RunnerRequest) -> Result<RunnerResponse> {
        self.runs.record(run_id, RunStatus::Running, None).await;
        let scratch = TempDir::new()?;
        let mut cmd = self.build_command(scratch.path());
        let started = Instant::now();

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayErr::from(crate::error::SandboxErr::BackendUnavailable(e.to_string())))?;

        let payload = serde_json::to_vec(request)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }

        let deadline = Duration::from_secs(request.timeout_seconds.max(1) as u64) + TIMEOUT_GRACE;
        let wait_result = timeout(deadline, async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(mut out) = child.stdout.take() {
                out.read_to_end(&mut stdout).await?;
            }
            if let Some(mut err) = child.stderr.take() {
                err.read_to_end(&mut stderr).await?;
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout, stderr))
        })
        .await;

        let elapsed = started.elapsed();
        debug!(run_id, elapsed_ms = elapsed.as_millis() as u64, "local run finished");

        let outcome = match wait_result {
            Err(_elapsed) => {
                warn!(run_id, "local run timed out, killing child");
                let _ = child.kill().await;
                Ok(RunnerResponse::error(
                    ErrorKind::RunnerTimeout,
                    "runner did not respond within the allotted time",
                ))
            }
            Ok(Err(io_err)) => Err(GatewayErr::Io(io_err)),
            Ok(Ok((status, stdout, _stderr))) => {
                if !status.success() {
                    warn!(run_id, code = status.code(), "runner exited non-zero");
                }
                match resource_limit_signal(&status) {
                    Some(signal) => {
                        warn!(run_id, signal, "runner killed by a resource-limit signal");
                        Ok(RunnerResponse::error(
                            ErrorKind::RunnerResourceExceeded,
                            format!("runner exceeded a resource limit (signal {signal})"),
                        ))
                    }
                    None => match serde_json::from_slice::<RunnerResponse>(&stdout) {
                        Ok(response) => Ok(response),
                        Err(_) => Ok(RunnerResponse::error(
                            ErrorKind::RunnerInternalError,
                            "runner produced no valid JSON document on stdout",
                        )),
                    },
                }
            }
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
        // Local runs are awaited synchronously inside `submit`; by the time
        // a caller could observe a run_id to cancel, the child is gone.
        debug!(run_id, "cancel is a no-op for already-terminal local runs");
        Ok(())
    }

    async fn cleanup(&self, run_id: &str) -> Result<()> {
        self.runs.remove(run_id).await;
        debug!(run_id, "cleanup releases the run cache entry; scratch dir already dropped with its TempDir guard");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> LocalExecutor {
        LocalExecutor::new(
            PathBuf::from("/opt/tabulon/tabulon-linux-sandbox"),
            PathBuf::from("/opt/tabulon/tabulon-runner"),
            PathBuf::from("/srv/datasets"),
            536_870_912,
            30,
            64,
        )
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn build_command_wraps_runner_with_sandbox_helper_on_linux() {
        let exec = executor();
        let scratch = PathBuf::from("/tmp/scratch-run-1");
        let cmd = exec.build_command(&scratch);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), exec.linux_sandbox_path.as_os_str());
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(
            args,
            vec![
                exec.datasets_dir.as_os_str(),
                scratch.as_os_str(),
                exec.runner_path.as_os_str(),
                "536870912",
                "30",
                "64",
            ]
        );
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn resource_limit_signal_recognizes_oom_and_cpu_kills() {
        use std::os::unix::process::ExitStatusExt;
        let killed = std::process::ExitStatus::from_raw(libc::SIGKILL);
        let cpu_killed = std::process::ExitStatus::from_raw(libc::SIGXCPU);
        let normal_exit = std::process::ExitStatus::from_raw(0);
        assert_eq!(resource_limit_signal(&killed), Some(libc::SIGKILL));
        assert_eq!(resource_limit_signal(&cpu_killed), Some(libc::SIGXCPU));
        assert_eq!(resource_limit_signal(&normal_exit), None);
    }

    #[tokio::test]
    async fn cleanup_removes_the_run_cache_entry() {
        let exec = executor();
        exec.runs.record("run-x", RunStatus::Running, None).await;
        assert_eq!(exec.status("run-x").await, Some(RunStatus::Running));
        exec.cleanup("run-x").await.unwrap();
        assert_eq!(exec.status("run-x").await, None);
    }
}
