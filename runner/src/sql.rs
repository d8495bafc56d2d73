//! SQL execution backend: an in-memory DuckDB connection with one view per
//! dataset file, queried with the submitted statement.

use duckdb::Connection;
use duckdb::types::ValueRef;
use tabulon_protocol::ErrorKind;
use tabulon_protocol::RunnerFile;
use tabulon_protocol::RunnerResponse;
use tabulon_protocol::RunnerStatus;

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Boolean(b) => serde_json::Value::Bool(b),
        ValueRef::TinyInt(i) => serde_json::Value::from(i),
        ValueRef::SmallInt(i) => serde_json::Value::from(i),
        ValueRef::Int(i) => serde_json::Value::from(i),
        ValueRef::BigInt(i) => serde_json::Value::from(i),
        ValueRef::HugeInt(i) => serde_json::Value::String(i.to_string()),
        ValueRef::UTinyInt(i) => serde_json::Value::from(i),
        ValueRef::USmallInt(i) => serde_json::Value::from(i),
        ValueRef::UInt(i) => serde_json::Value::from(i),
        ValueRef::UBigInt(i) => serde_json::Value::from(i),
        ValueRef::Float(f) => serde_json::Number::from_f64(f64::from(f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        ValueRef::Double(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        ValueRef::Decimal(d) => serde_json::Value::String(d.to_string()),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("0x{}", hex_encode(bytes))),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(path: &str) -> String {
    format!("'{}'", path.replace('\'', "''"))
}

fn open_session(files: &[RunnerFile]) -> duckdb::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    for file in files {
        let sql = format!(
            "CREATE VIEW {} AS SELECT * FROM read_csv_auto({}, header=true)",
            quote_ident(&file.name),
            quote_literal(&file.path.to_string_lossy()),
        );
        conn.execute_batch(&sql)?;
    }
    Ok(conn)
}

/// Runs `sql` against views created from `files`, returning up to `max_rows`
/// rows. Column names and cell values come straight from the executed
/// statement; no result shaping (truncation) happens here.
pub fn run(files: &[RunnerFile], sql: &str, max_rows: usize) -> RunnerResponse {
    let conn = match open_session(files) {
        Ok(conn) => conn,
        Err(e) => return RunnerResponse::error(ErrorKind::RunnerInternalError, e.to_string()),
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => return RunnerResponse::error(ErrorKind::RunnerInternalError, e.to_string()),
    };

    let mut rows_iter = match stmt.query([]) {
        Ok(rows) => rows,
        Err(e) => return RunnerResponse::error(ErrorKind::RunnerInternalError, e.to_string()),
    };

    let column_count = rows_iter.as_ref().map_or(0, duckdb::Statement::column_count);
    let columns: Vec<String> = (0..column_count)
        .map(|i| {
            rows_iter
                .as_ref()
                .and_then(|s| s.column_name(i).ok())
                .map_or_else(|| "?".to_string(), String::clone)
        })
        .collect();

    let mut rows = Vec::new();
    let mut total_rows = 0usize;
    loop {
        let row = match rows_iter.next() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) => return RunnerResponse::error(ErrorKind::RunnerInternalError, e.to_string()),
        };
        total_rows += 1;
        if rows.len() >= max_rows {
            continue;
        }
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let cell = match row.get_ref(i) {
                Ok(v) => value_to_json(v),
                Err(e) => return RunnerResponse::error(ErrorKind::RunnerInternalError, e.to_string()),
            };
            values.push(cell);
        }
        rows.push(values);
    }

    RunnerResponse {
        status: RunnerStatus::Success,
        columns,
        row_count: rows.len(),
        rows,
        exec_time_ms: 0,
        stdout_trunc: String::new(),
        stderr_trunc: String::new(),
        error: None,
        truncated: total_rows > max_rows,
    }
}
