use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::capsule::CapsuleError;
use crate::capsule::QueryMode;
use crate::plan::QueryPlan;

/// Exit/error taxonomy at the Request Surface boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceStatus {
    Succeeded,
    Rejected,
    TimedOut,
    Failed,
    NotFound,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResult {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub row_count: usize,
    #[serde(default)]
    pub exec_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CapsuleError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDetails {
    pub dataset_id: String,
    pub query_mode: QueryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_json: Option<QueryPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_code: Option<String>,
}

/// The response shape returned by the Request Surface's `run()` entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub assistant_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub thread_id: Uuid,
    pub status: SurfaceStatus,
    pub result: ChatResult,
    pub details: ChatDetails,
}
