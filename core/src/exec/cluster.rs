use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::ConfigMapKeySelector;
use k8s_openapi::api::core::v1::ConfigMapVolumeSource;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::EnvVarSource;
use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::SecurityContext;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::Client;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::LogParams;
use kube::api::PostParams;
use tabulon_protocol::ErrorKind;
use tabulon_protocol::RunnerRequest;
use tabulon_protocol::RunnerResponse;
use tabulon_protocol::RunnerStatus as WireRunnerStatus;
use tokio::time::Instant;
use tokio::time::sleep;
use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::exec::Executor;
use crate::exec::RunCache;
use crate::exec::RunStatus;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long a completed job's pod is left behind so a capsule reader can
/// still fetch its logs after the fact.
const RETENTION_GRACE: Duration = Duration::from_secs(30);

/// Payloads at or above this size are delivered via a mounted `ConfigMap`
/// instead of the job's env var, keeping well clear of the ~32KiB etcd
/// object-size pressure an inline env var of arbitrary size would add.
const ENV_VAR_PAYLOAD_LIMIT: usize = 16 * 1024;

const DATASETS_VOLUME_NAME: &str = "datasets";
const DATASETS_MOUNT_PATH: &str = "/data";
const PAYLOAD_VOLUME_NAME: &str = "payload";
const PAYLOAD_CONFIGMAP_KEY: &str = "request.json";

/// How the serialized `RunnerRequest` is delivered to the job's container.
enum PayloadDelivery {
    EnvVar(String),
    ConfigMap { name: String },
}

/// Pure request-to-manifest mapping logic, kept free of the `kube::Client`
/// so it's exercisable without a live cluster.
struct JobSpecBuilder {
    namespace: String,
    service_account: String,
    runner_image: String,
    cpu_limit: String,
    memory_limit: String,
    dataset_pvc_claim: String,
}

impl JobSpecBuilder {
    fn choose_delivery(run_id: &str, payload: &str) -> PayloadDelivery {
        if payload.len() < ENV_VAR_PAYLOAD_LIMIT {
            PayloadDelivery::EnvVar(payload.to_string())
        } else {
            PayloadDelivery::ConfigMap {
                name: format!("tabulon-run-{run_id}-payload"),
            }
        }
    }

    fn payload_configmap(&self, name: &str, payload: &str) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert(PAYLOAD_CONFIGMAP_KEY.to_string(), payload.to_string());
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    fn job_spec(&self, run_id: &str, delivery: &PayloadDelivery) -> Job {
        let mut limits = BTreeMap::new();
        limits.insert("cpu".to_string(), Quantity(self.cpu_limit.clone()));
        limits.insert("memory".to_string(), Quantity(self.memory_limit.clone()));

        let (env, extra_volumes, extra_mounts) = match delivery {
            PayloadDelivery::EnvVar(payload) => (
                vec![EnvVar {
                    name: "TABULON_RUNNER_REQUEST".to_string(),
                    value: Some(payload.clone()),
                    ..Default::default()
                }],
                vec![],
                vec![],
            ),
            PayloadDelivery::ConfigMap { name } => (
                vec![EnvVar {
                    name: "TABULON_RUNNER_REQUEST".to_string(),
                    value_from: Some(EnvVarSource {
                        config_map_key_ref: Some(ConfigMapKeySelector {
                            name: name.clone(),
                            key: PAYLOAD_CONFIGMAP_KEY.to_string(),
                            optional: Some(false),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                vec![Volume {
                    name: PAYLOAD_VOLUME_NAME.to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: name.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                vec![VolumeMount {
                    name: PAYLOAD_VOLUME_NAME.to_string(),
                    mount_path: "/payload".to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }],
            ),
        };

        let mut volumes = vec![Volume {
            name: DATASETS_VOLUME_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: self.dataset_pvc_claim.clone(),
                read_only: Some(true),
            }),
            ..Default::default()
        }];
        volumes.extend(extra_volumes);

        let mut volume_mounts = vec![VolumeMount {
            name: DATASETS_VOLUME_NAME.to_string(),
            mount_path: DATASETS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }];
        volume_mounts.extend(extra_mounts);

        let container = Container {
            name: "runner".to_string(),
            image: Some(self.runner_image.clone()),
            env: Some(env),
            volume_mounts: Some(volume_mounts),
            resources: Some(ResourceRequirements {
                limits: Some(limits),
                ..Default::default()
            }),
            security_context: Some(SecurityContext {
                run_as_non_root: Some(true),
                read_only_root_filesystem: Some(true),
                allow_privilege_escalation: Some(false),
                capabilities: Some(k8s_openapi::api::core::v1::Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    add: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "tabulon-runner".to_string());
        labels.insert("run-id".to_string(), run_id.to_string());

        Job {
            metadata: ObjectMeta {
                generate_name: Some(format!("tabulon-run-{run_id}-")),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(volumes),
                        restart_policy: Some("Never".to_string()),
                        service_account_name: Some(self.service_account.clone()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}

pub struct ClusterExecutor {
    client: Client,
    namespace: String,
    spec: JobSpecBuilder,
    runs: RunCache,
}

impl ClusterExecutor {
    pub fn new(
        client: Client,
        namespace: String,
        service_account: String,
        runner_image: String,
        cpu_limit: String,
        memory_limit: String,
        dataset_pvc_claim: String,
    ) -> Self {
        Self {
            client,
            namespace: namespace.clone(),
            spec: JobSpecBuilder {
                namespace,
                service_account,
                runner_image,
                cpu_limit,
                memory_limit,
                dataset_pvc_claim,
            },
            runs: RunCache::new(),
        }
    }

    async fn fetch_pod_logs(&self, run_id: &str) -> Option<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(&format!("run-id={run_id}")))
            .await
            .ok()?;
        let pod = list.items.first()?;
        let name = pod.metadata.name.as_ref()?;
        pods.logs(name, &LogParams::default()).await.ok()
    }
}

fn extract_last_json_document(logs: &str) -> Option<RunnerResponse> {
    for line in logs.lines().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(response) = serde_json::from_str::<RunnerResponse>(trimmed) {
            return Some(response);
        }
    }
    None
}

#[async_trait]
impl Executor for ClusterExecutor {
    async fn submit(&self, run_id: &str, request: &RunnerRequest) -> Result<RunnerResponse> {
        self.runs.record(run_id, RunStatus::Running, None).await;

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        let payload = serde_json::to_string(request)?;
        let delivery = JobSpecBuilder::choose_delivery(run_id, &payload);

        if let PayloadDelivery::ConfigMap { name } = &delivery {
            let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
            configmaps
                .create(&PostParams::default(), &self.spec.payload_configmap(name, &payload))
                .await?;
        }

        let job = self.spec.job_spec(run_id, &delivery);

        let created = jobs.create(&PostParams::default(), &job).await?;
        let job_name = created
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| format!("tabulon-run-{run_id}"));
        debug!(run_id, job_name, "cluster job created");

        let deadline = Instant::now() + Duration::from_secs(request.timeout_seconds.max(1) as u64);
        let outcome = loop {
            let current = jobs.get(&job_name).await?;
            let status = current.status.unwrap_or_default();
            if status.succeeded.unwrap_or(0) > 0 {
                break Ok(());
            }
            if status.failed.unwrap_or(0) > 0 {
                break Err("job reported failure");
            }
            if Instant::now() >= deadline {
                break Err("timeout");
            }
            sleep(POLL_INTERVAL).await;
        };

        let response = match outcome {
            Ok(()) => match self.fetch_pod_logs(run_id).await.and_then(|l| extract_last_json_document(&l)) {
                Some(r) => r,
                None => RunnerResponse::error(
                    ErrorKind::RunnerInternalError,
                    "job succeeded but produced no parsable JSON document in its logs",
                ),
            },
            Err("timeout") => {
                warn!(run_id, job_name, "cluster job timed out");
                RunnerResponse::error(ErrorKind::RunnerTimeout, "cluster job exceeded its deadline")
            }
            Err(_) => RunnerResponse::error(
                ErrorKind::RunnerInternalError,
                "cluster job reported failure",
            ),
        };

        let status = match response.status {
            WireRunnerStatus::Success => RunStatus::Succeeded,
            WireRunnerStatus::Error => RunStatus::Failed,
            WireRunnerStatus::Timeout => RunStatus::TimedOut,
        };
        self.runs.record(run_id, status, Some(response.clone())).await;

        let jobs_for_cleanup = jobs.clone();
        let job_name_for_cleanup = job_name.clone();
        let configmap_for_cleanup = match &delivery {
            PayloadDelivery::ConfigMap { name } => Some((
                Api::<ConfigMap>::namespaced(self.client.clone(), &self.namespace),
                name.clone(),
            )),
            PayloadDelivery::EnvVar(_) => None,
        };
        tokio::spawn(async move {
            sleep(RETENTION_GRACE).await;
            let dp = DeleteParams::background();
            if let Err(e) = jobs_for_cleanup.delete(&job_name_for_cleanup, &dp).await {
                warn!(job_name = job_name_for_cleanup, error = %e, "failed to delete cluster job");
            }
            if let Some((configmaps, name)) = configmap_for_cleanup {
                if let Err(e) = configmaps.delete(&name, &dp).await {
                    warn!(name, error = %e, "failed to delete payload configmap");
                }
            }
        });

        Ok(response)
    }

    async fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.runs.status(run_id).await
    }

    async fn result(&self, run_id: &str) -> Option<RunnerResponse> {
        self.runs.result(run_id).await
    }

    async fn cancel(&self, run_id: &str) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = jobs
            .list(&ListParams::default().labels(&format!("run-id={run_id}")))
            .await?;
        for job in list.items {
            if let Some(name) = job.metadata.name {
                let _ = jobs.delete(&name, &DeleteParams::background()).await;
            }
        }
        Ok(())
    }

    async fn cleanup(&self, run_id: &str) -> Result<()> {
        self.runs.remove(run_id).await;
        self.cancel(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> JobSpecBuilder {
        JobSpecBuilder {
            namespace: "default".to_string(),
            service_account: "tabulon-runner".to_string(),
            runner_image: "tabulon-runner:latest".to_string(),
            cpu_limit: "500m".to_string(),
            memory_limit: "512Mi".to_string(),
            dataset_pvc_claim: "tabulon-datasets".to_string(),
        }
    }

    #[test]
    fn small_payload_uses_env_var() {
        let delivery = JobSpecBuilder::choose_delivery("run-1", "{\"a\":1}");
        assert!(matches!(delivery, PayloadDelivery::EnvVar(_)));
    }

    #[test]
    fn oversized_payload_uses_configmap() {
        let payload = "x".repeat(ENV_VAR_PAYLOAD_LIMIT + 1);
        let delivery = JobSpecBuilder::choose_delivery("run-2", &payload);
        assert!(matches!(delivery, PayloadDelivery::ConfigMap { .. }));
    }

    #[test]
    fn job_spec_mounts_dataset_volume_read_only() {
        let b = builder();
        let job = b.job_spec("run-3", &PayloadDelivery::EnvVar("{}".to_string()));
        let spec = job.spec.unwrap().template.spec.unwrap();
        let volume = spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == DATASETS_VOLUME_NAME)
            .expect("dataset volume present");
        let pvc = volume.persistent_volume_claim.as_ref().expect("pvc source");
        assert_eq!(pvc.claim_name, "tabulon-datasets");
        assert_eq!(pvc.read_only, Some(true));

        let container = &spec.containers[0];
        let mount = container
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == DATASETS_VOLUME_NAME)
            .expect("dataset mount present");
        assert_eq!(mount.mount_path, "/data");
        assert_eq!(mount.read_only, Some(true));
    }

    #[test]
    fn job_spec_drops_all_capabilities_and_runs_non_root() {
        let b = builder();
        let job = b.job_spec("run-4", &PayloadDelivery::EnvVar("{}".to_string()));
        let spec = job.spec.unwrap().template.spec.unwrap();
        let sc = spec.containers[0].security_context.as_ref().unwrap();
        assert_eq!(sc.run_as_non_root, Some(true));
        assert_eq!(sc.allow_privilege_escalation, Some(false));
        assert_eq!(sc.capabilities.as_ref().unwrap().drop.as_deref(), Some(&["ALL".to_string()][..]));
    }

    #[test]
    fn job_spec_configmap_delivery_mounts_payload_and_sets_env_from() {
        let b = builder();
        let delivery = PayloadDelivery::ConfigMap { name: "tabulon-run-run-5-payload".to_string() };
        let job = b.job_spec("run-5", &delivery);
        let spec = job.spec.unwrap().template.spec.unwrap();
        let container = &spec.containers[0];
        let env = container.env.as_ref().unwrap();
        let request_env = env.iter().find(|e| e.name == "TABULON_RUNNER_REQUEST").unwrap();
        assert!(request_env.value.is_none());
        assert!(request_env.value_from.is_some());

        let has_payload_volume = spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .any(|v| v.name == PAYLOAD_VOLUME_NAME);
        assert!(has_payload_volume);
    }

    #[test]
    fn extract_last_json_document_finds_trailing_response() {
        let logs = "starting up\n{\"status\":\"success\",\"columns\":[],\"rows\":[],\"row_count\":0,\"exec_time_ms\":1,\"stdout_trunc\":\"\",\"stderr_trunc\":\"\",\"truncated\":false}";
        let response = extract_last_json_document(logs);
        assert!(response.is_some());
    }

    #[test]
    fn extract_last_json_document_returns_none_without_json() {
        assert!(extract_last_json_document("no json here\nor here").is_none());
    }
}
