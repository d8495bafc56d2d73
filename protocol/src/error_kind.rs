use serde::Deserialize;
use serde::Serialize;

/// The error taxonomy from the gateway's error handling design: every
/// rejection or failure in the system is tagged with exactly one of these,
/// independent of the human-readable message attached to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    PlanValidationError,
    SqlPolicyViolation,
    PythonPolicyViolation,
    ExfilHeuristic,
    RunnerTimeout,
    RunnerResourceExceeded,
    PythonExecutionError,
    RunnerInternalError,
    FeatureDisabled,
    BudgetExceeded,
    BackendUnavailable,
}
