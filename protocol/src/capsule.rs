use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error_kind::ErrorKind;
use crate::plan::QueryPlan;

/// Which code path produced (or will produce) a capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    Sql,
    Plan,
    Python,
    Chat,
}

/// Terminal outcome recorded in a capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Rejected,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offending_fragment: Option<String>,
}

impl CapsuleError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            offending_fragment: None,
        }
    }

    pub fn with_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.offending_fragment = Some(fragment.into());
        self
    }
}

/// Bounded preview of a runner result, as stored in a capsule or returned at
/// the Request Surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPreview {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub row_count: usize,
    #[serde(default)]
    pub exec_time_ms: u64,
}

/// Immutable audit record of a single submission. Created exactly once per
/// accepted submission, regardless of outcome, and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCapsule {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub dataset_id: String,
    pub question: String,
    pub query_mode: QueryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_json: Option<QueryPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_code: Option<String>,
    pub status: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_json: Option<ResultPreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_json: Option<CapsuleError>,
    pub exec_time_ms: u64,
}
