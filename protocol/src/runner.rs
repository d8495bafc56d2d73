use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error_kind::ErrorKind;

/// Which interpreter entry point the runner should invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Sql,
    Python,
}

/// A dataset file as seen from inside the sandbox: always rooted at `/data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerFile {
    pub name: String,
    pub path: PathBuf,
}

/// The exact JSON document written to the runner's stdin.
///
/// Exactly one of `sql` / `python_code` is set, matching `query_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerRequest {
    pub dataset_id: String,
    pub files: Vec<RunnerFile>,
    pub query_type: QueryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_code: Option<String>,
    pub timeout_seconds: u64,
    pub max_rows: usize,
    pub max_output_bytes: usize,
}

impl RunnerRequest {
    pub fn validate_shape(&self) -> Result<(), String> {
        match self.query_type {
            QueryType::Sql if self.sql.is_none() => {
                Err("query_type=sql requires `sql`".to_string())
            }
            QueryType::Python if self.python_code.is_none() => {
                Err("query_type=python requires `python_code`".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Terminal status reported by the runner for a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Success,
    Error,
    Timeout,
}

/// Machine-readable error payload embedded in a runner response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

/// The exact JSON document the runner writes to stdout. The orchestrator
/// treats absence of a well-formed document on stdout as a transport
/// failure, not as this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerResponse {
    pub status: RunnerStatus,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub exec_time_ms: u64,
    pub stdout_trunc: String,
    pub stderr_trunc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunnerError>,
    /// Set when `rows` had to be shrunk post-serialization to respect
    /// `max_output_bytes`. `status` stays `success` and `error` stays `None`
    /// whenever this is set.
    #[serde(default)]
    pub truncated: bool,
}

impl RunnerResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = if kind == ErrorKind::RunnerTimeout {
            RunnerStatus::Timeout
        } else {
            RunnerStatus::Error
        };
        Self {
            status,
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            exec_time_ms: 0,
            stdout_trunc: String::new(),
            stderr_trunc: String::new(),
            error: Some(RunnerError {
                kind,
                message: message.into(),
            }),
            truncated: false,
        }
    }
}
