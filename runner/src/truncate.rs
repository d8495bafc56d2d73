//! Output shaping applied after a backend produces a response: halve the row
//! set from the tail until the serialized document fits `max_output_bytes`,
//! and cap `stdout_trunc`/`stderr_trunc` to the same byte budget.

use tabulon_protocol::RunnerResponse;

fn truncate_str_tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Repeatedly halves `response.rows` from the tail until the serialized
/// response fits `max_output_bytes`, setting `truncated` when it does.
/// `stdout_trunc`/`stderr_trunc` are capped to the same budget independently.
pub fn shape(mut response: RunnerResponse, max_output_bytes: usize) -> RunnerResponse {
    response.stdout_trunc = truncate_str_tail(&response.stdout_trunc, max_output_bytes);
    response.stderr_trunc = truncate_str_tail(&response.stderr_trunc, max_output_bytes);

    if response.error.is_some() {
        return response;
    }

    loop {
        let size = serde_json::to_vec(&response).map(|v| v.len()).unwrap_or(usize::MAX);
        if size <= max_output_bytes || response.rows.is_empty() {
            break;
        }
        let keep = (response.rows.len() / 2).max(1);
        if keep == response.rows.len() {
            break;
        }
        response.rows.truncate(keep);
        response.row_count = response.rows.len();
        response.truncated = true;
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabulon_protocol::RunnerStatus;

    fn response_with_rows(n: usize) -> RunnerResponse {
        RunnerResponse {
            status: RunnerStatus::Success,
            columns: vec!["a".to_string()],
            rows: (0..n).map(|i| vec![serde_json::json!(i)]).collect(),
            row_count: n,
            exec_time_ms: 0,
            stdout_trunc: String::new(),
            stderr_trunc: String::new(),
            error: None,
            truncated: false,
        }
    }

    #[test]
    fn leaves_small_responses_untouched() {
        let response = response_with_rows(5);
        let shaped = shape(response.clone(), 1_000_000);
        assert_eq!(shaped, response);
    }

    #[test]
    fn halves_rows_until_it_fits() {
        let response = response_with_rows(10_000);
        let full_size = serde_json::to_vec(&response).unwrap_or_default().len();
        let shaped = shape(response, full_size / 8);
        assert!(shaped.truncated);
        assert!(shaped.rows.len() < 10_000);
        let shaped_size = serde_json::to_vec(&shaped).unwrap_or_default().len();
        assert!(shaped_size <= full_size / 8 || shaped.rows.len() == 1);
    }

    #[test]
    fn caps_stdout_and_stderr_independently() {
        let mut response = response_with_rows(0);
        response.stdout_trunc = "x".repeat(100);
        response.stderr_trunc = "y".repeat(50);
        let shaped = shape(response, 10);
        assert_eq!(shaped.stdout_trunc.len(), 10);
        assert_eq!(shaped.stderr_trunc.len(), 10);
    }
}
