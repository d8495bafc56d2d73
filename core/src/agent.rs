use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::Instant;

use tabulon_protocol::AgentEvent;
use tabulon_protocol::CapsuleError;
use tabulon_protocol::ChatDetails;
use tabulon_protocol::ChatResponse;
use tabulon_protocol::ChatResult;
use tabulon_protocol::ErrorKind;
use tabulon_protocol::QueryMode;
use tabulon_protocol::ResultPreview;
use tabulon_protocol::Role;
use tabulon_protocol::RunCapsule;
use tabulon_protocol::RunnerStatus;
use tabulon_protocol::RunOutcome;
use tabulon_protocol::SurfaceStatus;
use tabulon_protocol::ThreadMessage;
use tracing::warn;
use uuid::Uuid;

use crate::capsule::CapsuleStore;
use crate::llm::PlannerClient;
use crate::llm::PlannerMessage;
use crate::llm::PlannerTurn;
use crate::thread_store::ThreadStore;
use crate::tools;
use crate::tools::ExecutionOutcome;
use crate::tools::ExecutionRecord;
use crate::tools::ToolContext;

/// Everything the agent loop needs beyond the per-call dataset/message: the
/// tool-handler dependencies plus the two append-only stores and the
/// pluggable planner.
pub struct AgentDeps {
    pub tools: ToolContext,
    pub thread_store: Arc<dyn ThreadStore>,
    pub capsule_store: Arc<dyn CapsuleStore>,
    pub planner: Arc<dyn PlannerClient>,
    /// Fires on process shutdown (see [`crate::util::notify_on_sigint`]).
    /// Client-disconnect cancellation is a transport-layer concern outside
    /// this crate; this signal covers graceful-shutdown cancellation of
    /// every in-flight turn.
    pub cancel: Arc<Notify>,
}

/// Why an in-flight suspension point was interrupted before its future
/// resolved.
enum Interrupted {
    Deadline,
    Cancelled,
}

/// Races `fut` against the turn's wall-clock deadline and the process-wide
/// cancellation signal. Covers suspension points (a) and (b) from the
/// concurrency model: awaiting the planner and awaiting a sandbox
/// submission. Capsule/thread-store writes are deliberately excluded from
/// this race — always run to completion, preserving the invariant that
/// every accepted submission produces exactly one capsule.
async fn race<T>(fut: impl std::future::Future<Output = T>, deadline: Instant, cancel: &Notify) -> Result<T, Interrupted> {
    tokio::select! {
        result = fut => Ok(result),
        () = tokio::time::sleep_until(deadline) => Err(Interrupted::Deadline),
        () = cancel.notified() => Err(Interrupted::Cancelled),
    }
}

/// Builds the terminal (capsule, message) pair for a turn interrupted by
/// [`race`]'s cancellation branch. The budget-exceeded case reuses
/// [`budget_exceeded`].
fn cancelled(dataset_id: &str, run_id: Uuid, question: &str, last_execution: Option<ExecutionRecord>) -> (RunCapsule, String) {
    let message = "This request was cancelled before it finished.".to_string();
    let capsule = match last_execution {
        Some(record) => {
            let mut capsule = capsule_from_execution(run_id, dataset_id, question, record);
            capsule.status = RunOutcome::TimedOut;
            capsule.error_json = Some(CapsuleError::new(ErrorKind::RunnerTimeout, "request cancelled"));
            capsule
        }
        None => chat_capsule(
            run_id,
            dataset_id,
            question,
            RunOutcome::TimedOut,
            Some(CapsuleError::new(ErrorKind::RunnerTimeout, "request cancelled")),
        ),
    };
    (capsule, message)
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

enum FastPath<'a> {
    Sql(&'a str),
    Python(&'a str),
}

fn detect_fast_path(message: &str) -> Option<FastPath<'_>> {
    let trimmed = message.trim();
    if let Some(rest) = strip_prefix_ci(trimmed, "SQL:") {
        Some(FastPath::Sql(rest.trim()))
    } else if let Some(rest) = strip_prefix_ci(trimmed, "PYTHON:") {
        Some(FastPath::Python(rest.trim()))
    } else {
        None
    }
}

fn system_prompt(dataset_id: &str, python_enabled: bool) -> String {
    let python_line = if python_enabled {
        "5. execute_python(dataset_id, python_code) — run a short pandas/numpy script; assign result_df, result_rows, or result."
    } else {
        "5. execute_python is disabled on this deployment."
    };
    format!(
        "You are a careful data analyst answering questions about the dataset `{dataset_id}`.\n\
         Use the available tools to inspect the schema before writing a query, and prefer the \
         most restrictive tool that answers the question. Never attempt to read or write files \
         outside this dataset, and never ask for write/DDL access — it will be rejected.\n\
         Tools:\n\
         1. list_datasets() — list every dataset this gateway can query.\n\
         2. get_dataset_schema(dataset_id) — columns and a few sample rows per file.\n\
         3. execute_sql(dataset_id, sql) — run a read-only SELECT/WITH statement.\n\
         4. execute_query_plan(dataset_id, plan) — run a structured query plan.\n\
         {python_line}"
    )
}

fn role_to_planner_message(msg: &ThreadMessage) -> PlannerMessage {
    match msg.role {
        Role::User => PlannerMessage::User(msg.content.clone()),
        Role::Assistant => PlannerMessage::Assistant(msg.content.clone()),
    }
}

/// Splits a [`ExecutionOutcome`] into the pieces a capsule needs: terminal
/// status, bounded result preview, structured error, and the sandbox's own
/// reported execution time (zero when the request never reached a sandbox).
fn outcome_parts(outcome: &ExecutionOutcome) -> (RunOutcome, Option<ResultPreview>, Option<CapsuleError>, u64) {
    match outcome {
        ExecutionOutcome::Ran(response) => {
            let status = match response.status {
                RunnerStatus::Success => RunOutcome::Succeeded,
                RunnerStatus::Error => RunOutcome::Failed,
                RunnerStatus::Timeout => RunOutcome::TimedOut,
            };
            let result = Some(ResultPreview {
                columns: response.columns.clone(),
                rows: response.rows.clone(),
                row_count: response.row_count,
                exec_time_ms: response.exec_time_ms,
            });
            let error = response
                .error
                .as_ref()
                .map(|e| CapsuleError::new(e.kind, e.message.clone()));
            (status, result, error, response.exec_time_ms)
        }
        ExecutionOutcome::Rejected(err) => (
            RunOutcome::Rejected,
            None,
            Some(CapsuleError::new(err.kind(), err.to_string())),
            0,
        ),
    }
}

fn capsule_from_execution(run_id: Uuid, dataset_id: &str, question: &str, record: ExecutionRecord) -> RunCapsule {
    let (status, result_json, error_json, exec_time_ms) = outcome_parts(&record.outcome);
    RunCapsule {
        run_id,
        created_at: chrono::Utc::now(),
        dataset_id: dataset_id.to_string(),
        question: question.to_string(),
        query_mode: record.query_mode,
        compiled_sql: record.compiled_sql,
        plan_json: record.plan_json,
        python_code: record.python_code,
        status,
        result_json,
        error_json,
        exec_time_ms,
    }
}

fn chat_capsule(run_id: Uuid, dataset_id: &str, question: &str, status: RunOutcome, error_json: Option<CapsuleError>) -> RunCapsule {
    RunCapsule {
        run_id,
        created_at: chrono::Utc::now(),
        dataset_id: dataset_id.to_string(),
        question: question.to_string(),
        query_mode: QueryMode::Chat,
        compiled_sql: None,
        plan_json: None,
        python_code: None,
        status,
        result_json: None,
        error_json,
        exec_time_ms: 0,
    }
}

fn surface_status(status: RunOutcome) -> SurfaceStatus {
    match status {
        RunOutcome::Succeeded => SurfaceStatus::Succeeded,
        RunOutcome::Rejected => SurfaceStatus::Rejected,
        RunOutcome::TimedOut => SurfaceStatus::TimedOut,
        RunOutcome::Failed => SurfaceStatus::Failed,
    }
}

fn response_from_capsule(capsule: &RunCapsule, thread_id: Uuid, assistant_message: String) -> ChatResponse {
    let result = ChatResult {
        columns: capsule.result_json.as_ref().map(|r| r.columns.clone()).unwrap_or_default(),
        rows: capsule.result_json.as_ref().map(|r| r.rows.clone()).unwrap_or_default(),
        row_count: capsule.result_json.as_ref().map(|r| r.row_count).unwrap_or(0),
        exec_time_ms: capsule.exec_time_ms,
        error: capsule.error_json.clone(),
    };
    let details = ChatDetails {
        dataset_id: capsule.dataset_id.clone(),
        query_mode: capsule.query_mode,
        plan_json: capsule.plan_json.clone(),
        compiled_sql: capsule.compiled_sql.clone(),
        python_code: capsule.python_code.clone(),
    };
    ChatResponse {
        assistant_message,
        run_id: Some(capsule.run_id),
        thread_id,
        status: surface_status(capsule.status),
        result,
        details,
    }
}

async fn emit(sink: Option<&async_channel::Sender<AgentEvent>>, event: AgentEvent) {
    if let Some(tx) = sink {
        let _ = tx.send(event).await;
    }
}

/// Drives one turn of the agent loop: fast-path bypass or ReAct planner
/// loop, always ending with exactly one capsule durably written (per the
/// "no response without a capsule" invariant) and, if `sink` is set, the
/// matching sequence of streaming events.
async fn drive(
    deps: &AgentDeps,
    dataset_id: &str,
    thread_id: Uuid,
    message: &str,
    sink: Option<&async_channel::Sender<AgentEvent>>,
) -> ChatResponse {
    if deps.tools.registry.get(dataset_id).is_err() {
        let response = ChatResponse {
            assistant_message: format!("unknown dataset `{dataset_id}`"),
            run_id: None,
            thread_id,
            status: SurfaceStatus::NotFound,
            result: ChatResult::default(),
            details: ChatDetails {
                dataset_id: dataset_id.to_string(),
                query_mode: QueryMode::Chat,
                plan_json: None,
                compiled_sql: None,
                python_code: None,
            },
        };
        emit(sink, AgentEvent::Result { response: Box::new(response.clone()) }).await;
        emit(sink, AgentEvent::Done).await;
        return response;
    }

    let run_id = Uuid::new_v4();

    let (capsule, assistant_message) = if let Some(fast_path) = detect_fast_path(message) {
        run_fast_path(deps, dataset_id, run_id, message, fast_path, sink).await
    } else {
        run_planner_path(deps, dataset_id, thread_id, run_id, message, sink).await
    };

    if let Err(e) = deps.capsule_store.put(capsule.clone()).await {
        warn!(run_id = %run_id, error = %e, "failed to persist run capsule");
    }

    let response = response_from_capsule(&capsule, thread_id, assistant_message);
    emit(sink, AgentEvent::Result { response: Box::new(response.clone()) }).await;
    emit(sink, AgentEvent::Done).await;
    response
}

async fn run_fast_path(
    deps: &AgentDeps,
    dataset_id: &str,
    run_id: Uuid,
    question: &str,
    fast_path: FastPath<'_>,
    sink: Option<&async_channel::Sender<AgentEvent>>,
) -> (RunCapsule, String) {
    let deadline = Instant::now() + deps.tools.config.agent_wall_clock_budget;
    let call_id = "fast_path".to_string();
    let (name, input, result) = match fast_path {
        FastPath::Sql(sql) => {
            emit(
                sink,
                AgentEvent::ToolCall {
                    call_id: call_id.clone(),
                    name: "execute_sql".to_string(),
                    input: serde_json::json!({ "dataset_id": dataset_id, "sql": sql }),
                },
            )
            .await;
            let result = match race(tools::execute_sql(&deps.tools, dataset_id, sql), deadline, &deps.cancel).await {
                Ok(r) => r,
                Err(Interrupted::Deadline) => return budget_exceeded(dataset_id, run_id, question, None),
                Err(Interrupted::Cancelled) => return cancelled(dataset_id, run_id, question, None),
            };
            ("execute_sql", sql.to_string(), result)
        }
        FastPath::Python(code) => {
            emit(
                sink,
                AgentEvent::ToolCall {
                    call_id: call_id.clone(),
                    name: "execute_python".to_string(),
                    input: serde_json::json!({ "dataset_id": dataset_id, "python_code": code }),
                },
            )
            .await;
            let result = match race(tools::execute_python(&deps.tools, dataset_id, code), deadline, &deps.cancel).await {
                Ok(r) => r,
                Err(Interrupted::Deadline) => return budget_exceeded(dataset_id, run_id, question, None),
                Err(Interrupted::Cancelled) => return cancelled(dataset_id, run_id, question, None),
            };
            ("execute_python", code.to_string(), result)
        }
    };
    let _ = input;

    emit(
        sink,
        AgentEvent::ToolResult {
            call_id,
            name: name.to_string(),
            output: result.tool_text.clone(),
        },
    )
    .await;

    let capsule = match result.execution {
        Some(record) => capsule_from_execution(run_id, dataset_id, question, record),
        None => chat_capsule(
            run_id,
            dataset_id,
            question,
            RunOutcome::Failed,
            Some(CapsuleError::new(
                ErrorKind::RunnerInternalError,
                "fast path produced no execution record",
            )),
        ),
    };

    let assistant_message = match capsule.status {
        RunOutcome::Succeeded => "Ran your request.".to_string(),
        _ => format!("Your request was not run: {}", result.tool_text),
    };
    (capsule, assistant_message)
}

async fn run_planner_path(
    deps: &AgentDeps,
    dataset_id: &str,
    thread_id: Uuid,
    run_id: Uuid,
    message: &str,
    sink: Option<&async_channel::Sender<AgentEvent>>,
) -> (RunCapsule, String) {
    let config = &deps.tools.config;
    let history = deps
        .thread_store
        .recent(thread_id, config.thread_history_window)
        .await
        .unwrap_or_default();

    let candidate_run_ids: Vec<Uuid> = history.iter().filter_map(|m| m.run_id).collect();
    let mut messages = vec![PlannerMessage::System(system_prompt(
        dataset_id,
        config.enable_python_execution,
    ))];

    if let Ok(Some(previous)) = deps
        .capsule_store
        .latest_successful(&candidate_run_ids, dataset_id)
        .await
    {
        let rows = previous.result_json.as_ref().map(|r| r.row_count).unwrap_or(0);
        let columns = previous
            .result_json
            .as_ref()
            .map(|r| r.columns.join(", "))
            .unwrap_or_default();
        messages.push(PlannerMessage::System(format!(
            "Context: the previous successful run against this dataset returned {rows} row(s) with columns [{columns}]."
        )));
    }

    messages.extend(history.iter().map(role_to_planner_message));
    messages.push(PlannerMessage::User(format!("[dataset: {dataset_id}] {message}")));

    let tool_schemas = tools::tool_schemas(config.enable_python_execution);
    let deadline = Instant::now() + config.agent_wall_clock_budget;
    let mut last_execution: Option<ExecutionRecord> = None;
    let mut tool_calls_made = 0usize;

    loop {
        if Instant::now() >= deadline {
            return budget_exceeded(dataset_id, run_id, message, last_execution);
        }

        let turn = match race(deps.planner.complete(&messages, &tool_schemas), deadline, &deps.cancel).await {
            Err(Interrupted::Deadline) => return budget_exceeded(dataset_id, run_id, message, last_execution),
            Err(Interrupted::Cancelled) => return cancelled(dataset_id, run_id, message, last_execution),
            Ok(Ok(t)) => t,
            Ok(Err(e)) => {
                warn!(error = %e, "planner call failed");
                return (
                    match last_execution {
                        Some(record) => capsule_from_execution(run_id, dataset_id, message, record),
                        None => chat_capsule(
                            run_id,
                            dataset_id,
                            message,
                            RunOutcome::Failed,
                            Some(CapsuleError::new(e.kind(), e.to_string())),
                        ),
                    },
                    "the planner is currently unavailable".to_string(),
                );
            }
        };

        match turn {
            PlannerTurn::Text(text) => {
                emit(sink, AgentEvent::Token { text: text.clone() }).await;
                let capsule = match last_execution {
                    Some(record) => capsule_from_execution(run_id, dataset_id, message, record),
                    None => chat_capsule(run_id, dataset_id, message, RunOutcome::Succeeded, None),
                };
                return (capsule, text);
            }
            PlannerTurn::ToolCalls(calls) => {
                for call in calls {
                    if tool_calls_made >= config.max_tool_calls_per_turn {
                        return budget_exceeded(dataset_id, run_id, message, last_execution);
                    }
                    tool_calls_made += 1;

                    emit(
                        sink,
                        AgentEvent::ToolCall {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.arguments.clone(),
                        },
                    )
                    .await;

                    let result = match race(
                        tools::dispatch(&deps.tools, &call.name, &call.arguments),
                        deadline,
                        &deps.cancel,
                    )
                    .await
                    {
                        Ok(r) => r,
                        Err(Interrupted::Deadline) => {
                            return budget_exceeded(dataset_id, run_id, message, last_execution);
                        }
                        Err(Interrupted::Cancelled) => {
                            return cancelled(dataset_id, run_id, message, last_execution);
                        }
                    };

                    emit(
                        sink,
                        AgentEvent::ToolResult {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            output: result.tool_text.clone(),
                        },
                    )
                    .await;

                    if let Some(record) = result.execution {
                        last_execution = Some(record);
                    }

                    messages.push(PlannerMessage::ToolResult {
                        call_id: call.id,
                        name: call.name,
                        content: result.tool_text,
                    });
                }
            }
        }
    }
}

fn budget_exceeded(
    dataset_id: &str,
    run_id: Uuid,
    question: &str,
    last_execution: Option<ExecutionRecord>,
) -> (RunCapsule, String) {
    let message = "I ran out of tool-call budget before finishing this request.".to_string();
    let capsule = match last_execution {
        Some(record) => {
            let mut capsule = capsule_from_execution(run_id, dataset_id, question, record);
            capsule.status = RunOutcome::Failed;
            capsule.error_json = Some(CapsuleError::new(
                ErrorKind::BudgetExceeded,
                "agent loop exceeded its tool-call or wall-clock budget",
            ));
            capsule
        }
        None => chat_capsule(
            run_id,
            dataset_id,
            question,
            RunOutcome::Failed,
            Some(CapsuleError::new(
                ErrorKind::BudgetExceeded,
                "agent loop exceeded its tool-call or wall-clock budget",
            )),
        ),
    };
    (capsule, message)
}

/// Runs one turn to completion and returns the final response, without
/// emitting a live event stream.
pub async fn run(deps: &AgentDeps, dataset_id: &str, thread_id: Uuid, message: &str) -> ChatResponse {
    drive(deps, dataset_id, thread_id, message, None).await
}

/// Runs one turn, emitting [`AgentEvent`]s as the turn progresses. The
/// returned receiver yields events in real-time progression order and closes
/// after `Done`.
pub fn stream(
    deps: Arc<AgentDeps>,
    dataset_id: String,
    thread_id: Uuid,
    message: String,
) -> async_channel::Receiver<AgentEvent> {
    let (tx, rx) = async_channel::bounded(32);
    tokio::spawn(async move {
        drive(&deps, &dataset_id, thread_id, &message, Some(&tx)).await;
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_path_detects_sql_case_insensitively() {
        assert!(matches!(detect_fast_path("sql: select 1"), Some(FastPath::Sql(_))));
        assert!(matches!(detect_fast_path("  SQL:  select 1  "), Some(FastPath::Sql(s)) if s == "select 1"));
    }

    #[test]
    fn fast_path_detects_python() {
        assert!(matches!(detect_fast_path("PYTHON: result = 1"), Some(FastPath::Python(_))));
    }

    #[test]
    fn fast_path_is_none_for_natural_language() {
        assert!(detect_fast_path("how many rows are there?").is_none());
    }
}
