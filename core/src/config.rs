use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::GatewayErr;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxProvider {
    Local,
    Remote,
    Cluster,
}

impl std::str::FromStr for SandboxProvider {
    type Err = GatewayErr;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "cluster" => Ok(Self::Cluster),
            other => Err(GatewayErr::Validation(format!(
                "unknown SANDBOX_PROVIDER {other:?}, expected local|remote|cluster"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Auto,
    A,
    B,
}

impl std::str::FromStr for LlmProvider {
    type Err = GatewayErr;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "a" => Ok(Self::A),
            "b" => Ok(Self::B),
            other => Err(GatewayErr::Validation(format!(
                "unknown LLM_PROVIDER {other:?}, expected auto|a|b"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub token: String,
    pub allow_cli_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub namespace: String,
    pub service_account: String,
    pub cpu_limit: String,
    pub memory_limit: String,
    /// Name of the `ReadWriteMany`/`ReadOnlyMany` PVC holding the dataset
    /// directory, mounted read-only into every runner job at `/data`.
    pub dataset_pvc_claim: String,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

/// Process-wide configuration, assembled once at startup from the
/// environment variables enumerated in the external-interfaces section of
/// the system's design document.
#[derive(Debug, Clone)]
pub struct Config {
    pub sandbox_provider: SandboxProvider,
    pub runner_image: String,
    pub datasets_dir: PathBuf,
    pub run_timeout: Duration,
    pub max_rows: usize,
    pub max_output_bytes: usize,
    pub enable_python_execution: bool,
    pub thread_history_window: usize,
    pub capsule_store_path: PathBuf,
    pub llm: LlmConfig,
    pub remote: Option<RemoteConfig>,
    pub cluster: Option<ClusterConfig>,
    pub exfil_column_threshold: usize,
    pub max_tool_calls_per_turn: usize,
    pub agent_wall_clock_budget: Duration,
    pub global_sandbox_concurrency: usize,
    /// `RLIMIT_AS` applied to the local sandbox child before it execs into
    /// the runner.
    pub sandbox_memory_limit_bytes: u64,
    /// `RLIMIT_NPROC` applied to the local sandbox child.
    pub sandbox_max_processes: u64,
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_opt(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| GatewayErr::Validation(format!("invalid value for {key}: {v:?}"))),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let sandbox_provider: SandboxProvider = env_or("SANDBOX_PROVIDER", "local").parse()?;

        let remote = if sandbox_provider == SandboxProvider::Remote {
            Some(RemoteConfig {
                endpoint: env_opt("REMOTE_SANDBOX_ENDPOINT").ok_or_else(|| {
                    GatewayErr::Validation("REMOTE_SANDBOX_ENDPOINT is required".into())
                })?,
                token: env_opt("REMOTE_SANDBOX_TOKEN").ok_or_else(|| {
                    GatewayErr::Validation("REMOTE_SANDBOX_TOKEN is required".into())
                })?,
                allow_cli_fallback: env_parse("ALLOW_REMOTE_CLI_FALLBACK", false)?,
            })
        } else {
            None
        };

        let cluster = if sandbox_provider == SandboxProvider::Cluster {
            Some(ClusterConfig {
                namespace: env_or("CLUSTER_NAMESPACE", "default"),
                service_account: env_or("CLUSTER_SERVICE_ACCOUNT", "tabulon-runner"),
                cpu_limit: env_or("CLUSTER_JOB_CPU_LIMIT", "500m"),
                memory_limit: env_or("CLUSTER_JOB_MEMORY_LIMIT", "512Mi"),
                dataset_pvc_claim: env_or("CLUSTER_DATASET_PVC_CLAIM", "tabulon-datasets"),
            })
        } else {
            None
        };

        Ok(Self {
            sandbox_provider,
            runner_image: env_or("RUNNER_IMAGE", "tabulon-runner:latest"),
            datasets_dir: PathBuf::from(env_or("DATASETS_DIR", "./datasets")),
            run_timeout: Duration::from_secs(env_parse("RUN_TIMEOUT_SECONDS", 30)?),
            max_rows: env_parse("MAX_ROWS", 1000)?,
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", 1_048_576)?,
            enable_python_execution: env_parse("ENABLE_PYTHON_EXECUTION", false)?,
            thread_history_window: env_parse("THREAD_HISTORY_WINDOW", 20)?,
            capsule_store_path: PathBuf::from(env_or("CAPSULE_STORE_PATH", "./capsules.jsonl")),
            llm: LlmConfig {
                provider: env_or("LLM_PROVIDER", "auto").parse()?,
                api_key: env_opt("LLM_API_KEY"),
                model: env_opt("LLM_MODEL"),
                base_url: env_opt("LLM_BASE_URL"),
            },
            remote,
            cluster,
            exfil_column_threshold: env_parse("EXFIL_COLUMN_THRESHOLD", 6)?,
            max_tool_calls_per_turn: env_parse("MAX_TOOL_CALLS_PER_TURN", 8)?,
            agent_wall_clock_budget: Duration::from_secs(env_parse(
                "AGENT_WALL_CLOCK_BUDGET_SECONDS",
                60,
            )?),
            global_sandbox_concurrency: env_parse("GLOBAL_SANDBOX_CONCURRENCY", 4)?,
            sandbox_memory_limit_bytes: env_parse("SANDBOX_MEMORY_LIMIT_BYTES", 536_870_912)?,
            sandbox_max_processes: env_parse("SANDBOX_MAX_PROCESSES", 64)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_provider_parses_case_insensitively() {
        assert_eq!("Local".parse::<SandboxProvider>().unwrap(), SandboxProvider::Local);
        assert_eq!("CLUSTER".parse::<SandboxProvider>().unwrap(), SandboxProvider::Cluster);
        assert!("bogus".parse::<SandboxProvider>().is_err());
    }

    #[test]
    fn llm_provider_rejects_unknown() {
        assert!("chatgpt".parse::<LlmProvider>().is_err());
    }
}
