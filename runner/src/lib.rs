//! The runner process: reads one [`RunnerRequest`] from stdin, dispatches it
//! to the DuckDB-backed SQL engine or the Python harness, shapes the result
//! to the request's row/byte budget, and returns one [`RunnerResponse`].
//!
//! This crate is the binary that `linux-sandbox` execs into once it has
//! hardened the process; it never runs un-sandboxed in production, but it
//! has no dependency on sandboxing itself so it stays testable on its own.

mod python;
mod sql;
mod truncate;

use std::time::Duration;
use std::time::Instant;

use tabulon_protocol::ErrorKind;
use tabulon_protocol::QueryType;
use tabulon_protocol::RunnerRequest;
use tabulon_protocol::RunnerResponse;

/// Runs a well-formed request end to end: dispatch, time, shape.
pub fn execute(request: &RunnerRequest) -> RunnerResponse {
    if let Err(message) = request.validate_shape() {
        return RunnerResponse::error(ErrorKind::RunnerInternalError, message);
    }

    let started = Instant::now();
    let raw = match request.query_type {
        QueryType::Sql => {
            let Some(sql) = request.sql.as_deref() else {
                return RunnerResponse::error(ErrorKind::RunnerInternalError, "missing sql");
            };
            sql::run(&request.files, sql, request.max_rows)
        }
        QueryType::Python => {
            let Some(code) = request.python_code.as_deref() else {
                return RunnerResponse::error(ErrorKind::RunnerInternalError, "missing python_code");
            };
            let timeout = Duration::from_secs(request.timeout_seconds.max(1));
            python::run(code, request.max_rows, timeout)
        }
    };

    let mut shaped = truncate::shape(raw, request.max_output_bytes);
    shaped.exec_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    shaped
}

/// Response for a request document that failed to parse at all. Distinct
/// from `execute` because there is no `RunnerRequest` to inspect.
pub fn malformed_request_response(detail: &str) -> RunnerResponse {
    RunnerResponse::error(
        ErrorKind::RunnerInternalError,
        format!("malformed runner request: {detail}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tabulon_protocol::RunnerFile;
    use tabulon_protocol::RunnerStatus;

    fn write_csv(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).expect("write fixture csv");
        path
    }

    #[test]
    fn runs_a_select_against_a_csv_view() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_csv(&dir, "orders.csv", "id,amount\n1,10\n2,20\n3,30\n");

        let request = RunnerRequest {
            dataset_id: "shop".to_string(),
            files: vec![RunnerFile {
                name: "orders".to_string(),
                path,
            }],
            query_type: QueryType::Sql,
            sql: Some("SELECT COUNT(*) AS n FROM orders".to_string()),
            python_code: None,
            timeout_seconds: 5,
            max_rows: 200,
            max_output_bytes: 1_000_000,
        };

        let response = execute(&request);
        assert_eq!(response.status, RunnerStatus::Success);
        assert_eq!(response.row_count, 1);
        assert_eq!(response.rows[0][0], serde_json::json!(3));
    }

    #[test]
    fn rejects_a_request_shape_mismatch() {
        let request = RunnerRequest {
            dataset_id: "shop".to_string(),
            files: Vec::new(),
            query_type: QueryType::Sql,
            sql: None,
            python_code: None,
            timeout_seconds: 5,
            max_rows: 200,
            max_output_bytes: 1_000_000,
        };
        let response = execute(&request);
        assert_eq!(response.status, RunnerStatus::Error);
        assert!(response.error.is_some());
    }

    #[test]
    fn malformed_json_produces_an_internal_error_response() {
        let response = malformed_request_response("unexpected end of input");
        assert_eq!(response.status, RunnerStatus::Error);
        assert_eq!(
            response.error.expect("error present").kind,
            ErrorKind::RunnerInternalError
        );
    }
}
