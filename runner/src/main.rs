use std::io::Read;
use std::io::Write;

use tabulon_protocol::RunnerRequest;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_logging();

    let mut raw = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
        tracing::error!("failed to read request from stdin: {e}");
        std::process::exit(0);
    }

    let response = match serde_json::from_str::<RunnerRequest>(&raw) {
        Ok(request) => tabulon_runner::execute(&request),
        Err(e) => tabulon_runner::malformed_request_response(&e.to_string()),
    };

    let body = serde_json::to_vec(&response).unwrap_or_else(|_| {
        b"{\"status\":\"error\",\"columns\":[],\"rows\":[],\"row_count\":0,\"exec_time_ms\":0,\"stdout_trunc\":\"\",\"stderr_trunc\":\"\",\"error\":{\"type\":\"runner_internal_error\",\"message\":\"failed to serialize response\"}}".to_vec()
    });
    let _ = std::io::stdout().write_all(&body);
    // Exit code is always 0; the orchestrator infers transport failure from
    // the absence of a well-formed document on stdout, never from the code.
    std::process::exit(0);
}
