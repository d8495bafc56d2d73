use tabulon_protocol::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayErr>;

#[derive(Error, Debug)]
pub enum SandboxErr {
    #[error("sandbox denied exec, exit code {0}, stderr: {1}")]
    Denied(i32, String),

    #[error("sandbox timed out")]
    Timeout,

    #[error("sandbox process was killed by signal {0}")]
    Signal(i32),

    #[cfg(target_os = "linux")]
    #[error("seccomp setup error")]
    SeccompInstall(#[from] seccompiler::Error),

    #[cfg(target_os = "linux")]
    #[error("seccomp backend error")]
    SeccompBackend(#[from] seccompiler::BackendError),

    #[cfg(target_os = "linux")]
    #[error("landlock ruleset error")]
    Landlock(#[from] landlock::RulesetError),

    #[error("landlock was not able to fully enforce sandbox rules")]
    LandlockRestrict,

    #[error("backend could not be started: {0}")]
    BackendUnavailable(String),

    #[error("failed to apply resource limits or drop privileges: {0}")]
    PrivilegeSetup(String),
}

/// Top-level error type for the orchestrator. Every variant maps onto
/// exactly one [`ErrorKind`] via [`GatewayErr::kind`] so that policy,
/// execution, and transport failures share one taxonomy end to end.
#[derive(Error, Debug)]
pub enum GatewayErr {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("plan validation error: {0}")]
    PlanValidation(String),

    #[error("SQL policy violation: {0}")]
    SqlPolicy(String),

    #[error("python policy violation: {0}")]
    PythonPolicy(String),

    #[error("exfiltration heuristic triggered: {0}")]
    ExfilHeuristic(String),

    #[error("python execution error: {0}")]
    PythonExecution(String),

    #[error("feature disabled: {0}")]
    FeatureDisabled(String),

    #[error("agent budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxErr),

    #[error("runner protocol error: {0}")]
    RunnerProtocol(String),

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    TokioJoin(#[from] tokio::task::JoinError),
}

impl GatewayErr {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayErr::Validation(_) => ErrorKind::ValidationError,
            GatewayErr::PlanValidation(_) => ErrorKind::PlanValidationError,
            GatewayErr::SqlPolicy(_) => ErrorKind::SqlPolicyViolation,
            GatewayErr::PythonPolicy(_) => ErrorKind::PythonPolicyViolation,
            GatewayErr::ExfilHeuristic(_) => ErrorKind::ExfilHeuristic,
            GatewayErr::PythonExecution(_) => ErrorKind::PythonExecutionError,
            GatewayErr::FeatureDisabled(_) => ErrorKind::FeatureDisabled,
            GatewayErr::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            GatewayErr::Sandbox(SandboxErr::Timeout) => ErrorKind::RunnerTimeout,
            GatewayErr::Sandbox(SandboxErr::BackendUnavailable(_)) => {
                ErrorKind::BackendUnavailable
            }
            GatewayErr::Sandbox(_) => ErrorKind::RunnerInternalError,
            GatewayErr::RunnerProtocol(_) => ErrorKind::RunnerInternalError,
            GatewayErr::DatasetNotFound(_) => ErrorKind::ValidationError,
            GatewayErr::Io(_) | GatewayErr::Reqwest(_) | GatewayErr::Kube(_) => {
                ErrorKind::BackendUnavailable
            }
            GatewayErr::Json(_) | GatewayErr::TokioJoin(_) => ErrorKind::RunnerInternalError,
        }
    }
}
