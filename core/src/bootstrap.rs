//! Turns a loaded [`Config`] into ready-to-use [`AgentDeps`]: one function,
//! called once at process startup by every binary that needs to drive the
//! agent loop (`tabulon-exec`, `tabulon-cli`).

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use kube::Client;

use crate::agent::AgentDeps;
use crate::capsule::CapsuleStore;
use crate::capsule::JsonlCapsuleStore;
use crate::config::Config;
use crate::config::LlmProvider;
use crate::config::SandboxProvider;
use crate::error::GatewayErr;
use crate::error::Result;
use crate::exec::Executor;
use crate::exec::SemaphoreExecutor;
use crate::exec::cluster::ClusterExecutor;
use crate::exec::local::LocalExecutor;
use crate::exec::remote::RemoteExecutor;
use crate::llm::HttpPlannerClient;
use crate::llm::PlannerClient;
use crate::llm::StubPlannerClient;
use crate::registry::DatasetRegistry;
use crate::thread_store::JsonlThreadStore;
use crate::thread_store::ThreadStore;
use crate::tools::ToolContext;

fn sibling_binary(env_var: &str, file_name: &str) -> Result<PathBuf> {
    if let Ok(path) = env::var(env_var) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let exe = env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| GatewayErr::Validation(format!("cannot locate sibling {file_name}")))?;
    Ok(dir.join(file_name))
}

async fn build_executor(config: &Config) -> Result<Arc<dyn Executor>> {
    let inner: Arc<dyn Executor> = match config.sandbox_provider {
        SandboxProvider::Local => {
            let linux_sandbox_path = sibling_binary("LINUX_SANDBOX_PATH", "tabulon-linux-sandbox")?;
            let runner_path = sibling_binary("RUNNER_PATH", "tabulon-runner")?;
            Arc::new(LocalExecutor::new(
                linux_sandbox_path,
                runner_path,
                config.datasets_dir.clone(),
                config.sandbox_memory_limit_bytes,
                config.run_timeout.as_secs(),
                config.sandbox_max_processes,
            ))
        }
        SandboxProvider::Remote => {
            let remote = config
                .remote
                .as_ref()
                .ok_or_else(|| GatewayErr::Validation("SANDBOX_PROVIDER=remote requires remote config".into()))?;
            let cli_fallback = if remote.allow_cli_fallback {
                let linux_sandbox_path = sibling_binary("LINUX_SANDBOX_PATH", "tabulon-linux-sandbox")?;
                let runner_path = sibling_binary("RUNNER_PATH", "tabulon-runner")?;
                Some(LocalExecutor::new(
                    linux_sandbox_path,
                    runner_path,
                    config.datasets_dir.clone(),
                    config.sandbox_memory_limit_bytes,
                    config.run_timeout.as_secs(),
                    config.sandbox_max_processes,
                ))
            } else {
                None
            };
            Arc::new(RemoteExecutor::new(
                remote.endpoint.clone(),
                remote.token.clone(),
                cli_fallback,
            ))
        }
        SandboxProvider::Cluster => {
            let cluster = config
                .cluster
                .as_ref()
                .ok_or_else(|| GatewayErr::Validation("SANDBOX_PROVIDER=cluster requires cluster config".into()))?;
            let client = Client::try_default()
                .await
                .map_err(|e| GatewayErr::Validation(format!("failed to build Kubernetes client: {e}")))?;
            Arc::new(ClusterExecutor::new(
                client,
                cluster.namespace.clone(),
                cluster.service_account.clone(),
                config.runner_image.clone(),
                cluster.cpu_limit.clone(),
                cluster.memory_limit.clone(),
                cluster.dataset_pvc_claim.clone(),
            ))
        }
    };
    Ok(Arc::new(SemaphoreExecutor::new(inner, config.global_sandbox_concurrency)))
}

fn build_planner(config: &Config) -> Arc<dyn PlannerClient> {
    match config.llm.provider {
        LlmProvider::Auto | LlmProvider::A | LlmProvider::B => {
            match (&config.llm.api_key, &config.llm.base_url, &config.llm.model) {
                (Some(api_key), Some(base_url), Some(model)) => Arc::new(HttpPlannerClient::new(
                    base_url.clone(),
                    api_key.clone(),
                    model.clone(),
                )),
                _ => Arc::new(StubPlannerClient),
            }
        }
    }
}

/// Assembles every dependency the agent loop needs from one [`Config`],
/// including the dataset registry loaded from `DATASETS_DIR/registry.json`
/// and the JSONL-backed thread/capsule stores rooted where `Config` says.
pub async fn build_deps(config: Config) -> Result<AgentDeps> {
    let registry_path = config.datasets_dir.join("registry.json");
    let registry = Arc::new(DatasetRegistry::load(&registry_path)?);
    let executor = build_executor(&config).await?;
    let planner = build_planner(&config);

    let thread_store_path = config.capsule_store_path.with_file_name("threads.jsonl");
    let thread_store: Arc<dyn ThreadStore> = Arc::new(JsonlThreadStore::open(&thread_store_path).await?);
    let capsule_store: Arc<dyn CapsuleStore> = Arc::new(JsonlCapsuleStore::open(&config.capsule_store_path).await?);

    let config = Arc::new(config);
    Ok(AgentDeps {
        tools: ToolContext {
            registry,
            executor,
            config,
        },
        thread_store,
        capsule_store,
        planner,
        cancel: crate::util::notify_on_sigint(),
    })
}
