//! Python execution backend: shells out to a `python3` interpreter running a
//! small harness that executes the (already AST-policy-approved) submission
//! and serializes whichever of `result_df` / `result_rows` / `result` it
//! assigned back to the runner as JSON on a delimited section of stdout.
//!
//! The AST policy has already run upstream before this code is reached; this
//! module trusts the source it is given and only worries about capturing its
//! declared result and respecting the wall-clock budget.

use std::io::Read;
use std::io::Write;
use std::process::Command;
use std::process::Stdio;
use std::thread;
use std::time::Duration;

use tabulon_protocol::ErrorKind;
use tabulon_protocol::RunnerResponse;
use tabulon_protocol::RunnerStatus;
use tempfile::NamedTempFile;
use wait_timeout::ChildExt;

const RESULT_BEGIN: &str = "__tabulon_result_begin__";
const RESULT_END: &str = "__tabulon_result_end__";

fn harness_source() -> String {
    format!(
        r#"
import json
import sys

user_path = sys.argv[1]
ns = {{}}
with open(user_path, "r", encoding="utf-8") as f:
    source = f.read()

exec(compile(source, "<submission>", "exec"), ns)

columns = None
rows = None

if "result_df" in ns:
    df = ns["result_df"]
    columns = [str(c) for c in df.columns]
    rows = df.astype(object).where(df.notnull(), None).values.tolist()
elif "result_rows" in ns:
    raw_rows = ns["result_rows"]
    columns = ns.get("result_columns")
    if raw_rows and isinstance(raw_rows[0], dict):
        if columns is None:
            columns = list(raw_rows[0].keys())
        rows = [[r.get(c) for c in columns] for r in raw_rows]
    else:
        if columns is None:
            columns = ["value"]
        rows = [[r] for r in raw_rows]
elif "result" in ns:
    columns = ["result"]
    rows = [[ns["result"]]]
else:
    sys.stderr.write("no_result\n")
    sys.exit(3)

print("{RESULT_BEGIN}")
print(json.dumps({{"columns": columns, "rows": rows}}, default=str))
print("{RESULT_END}")
"#
    )
}

#[derive(Debug, thiserror::Error)]
enum PyError {
    #[error("failed to prepare python harness: {0}")]
    Setup(#[from] std::io::Error),
    #[error("python3 interpreter is unavailable: {0}")]
    Spawn(std::io::Error),
    #[error("python execution timed out")]
    Timeout,
    #[error("no_result")]
    NoResult,
    #[error("python process exited with an error: {0}")]
    NonZero(String),
    #[error("python produced no parseable result block")]
    NoResultBlock,
    #[error("result block was not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

struct RunOutput {
    stdout: String,
    stderr: String,
}

fn spawn_and_wait(harness_path: &std::path::Path, user_path: &std::path::Path, timeout: Duration) -> Result<RunOutput, PyError> {
    let mut child = Command::new("python3")
        .arg(harness_path)
        .arg(user_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(PyError::Spawn)?;

    let missing_pipe = || PyError::Spawn(std::io::Error::other("child pipe unexpectedly missing"));
    let mut stdout_pipe = child.stdout.take().ok_or_else(missing_pipe)?;
    let mut stderr_pipe = child.stderr.take().ok_or_else(missing_pipe)?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = String::new();
        let _ = stdout_pipe.read_to_string(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = String::new();
        let _ = stderr_pipe.read_to_string(&mut buf);
        buf
    });

    let status = match child.wait_timeout(timeout).map_err(PyError::Spawn)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PyError::Timeout);
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    if status.code() == Some(3) {
        return Err(PyError::NoResult);
    }
    if !status.success() {
        return Err(PyError::NonZero(stderr.clone()));
    }

    Ok(RunOutput { stdout, stderr })
}

fn parse_result(stdout: &str) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>), PyError> {
    let start = stdout.find(RESULT_BEGIN).ok_or(PyError::NoResultBlock)?;
    let body_start = start + RESULT_BEGIN.len();
    let end = stdout[body_start..].find(RESULT_END).ok_or(PyError::NoResultBlock)?;
    let body = stdout[body_start..body_start + end].trim();

    #[derive(serde::Deserialize)]
    struct Payload {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    }
    let payload: Payload = serde_json::from_str(body)?;
    Ok((payload.columns, payload.rows))
}

fn write_harness() -> std::io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(harness_source().as_bytes())?;
    Ok(file)
}

/// Runs `python_code` through the harness, capped to `max_rows` rows and
/// `timeout`. The AST policy gate that bounds imports/attribute-access/calls
/// has already been applied before this request reached the runner.
pub fn run(python_code: &str, max_rows: usize, timeout: Duration) -> RunnerResponse {
    let result = (|| -> Result<RunnerResponse, PyError> {
        let harness = write_harness()?;
        let mut user_file = NamedTempFile::new()?;
        user_file.write_all(python_code.as_bytes())?;

        let output = spawn_and_wait(harness.path(), user_file.path(), timeout)?;
        let (columns, mut rows) = parse_result(&output.stdout)?;
        let total = rows.len();
        let truncated = total > max_rows;
        rows.truncate(max_rows);

        Ok(RunnerResponse {
            status: RunnerStatus::Success,
            columns,
            row_count: rows.len(),
            rows,
            exec_time_ms: 0,
            stdout_trunc: String::new(),
            stderr_trunc: output.stderr,
            error: None,
            truncated,
        })
    })();

    match result {
        Ok(response) => response,
        Err(PyError::Timeout) => RunnerResponse::error(ErrorKind::RunnerTimeout, "python execution timed out"),
        Err(PyError::NoResult) => RunnerResponse::error(
            ErrorKind::PythonExecutionError,
            "no_result: submission must assign result_df, result_rows, or result",
        ),
        Err(other) => RunnerResponse::error(ErrorKind::PythonExecutionError, other.to_string()),
    }
}
