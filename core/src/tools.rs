use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tabulon_protocol::QueryMode;
use tabulon_protocol::QueryPlan;
use tabulon_protocol::QueryType;
use tabulon_protocol::RunnerFile;
use tabulon_protocol::RunnerRequest;
use tabulon_protocol::RunnerResponse;
use uuid::Uuid;

use crate::config::Config;
use crate::error::GatewayErr;
use crate::error::Result;
use crate::exec::Executor;
use crate::llm::ToolSchema;
use crate::policy;
use crate::registry::DatasetRegistry;

/// Runtime dependencies every tool handler closes over, passed explicitly
/// rather than reached for through a process-wide singleton.
pub struct ToolContext {
    pub registry: Arc<DatasetRegistry>,
    pub executor: Arc<dyn Executor>,
    pub config: Arc<Config>,
}

/// Either the runner actually ran (successfully, with an error, or timed
/// out) or the request never reached a sandbox because policy rejected it
/// first.
pub enum ExecutionOutcome {
    Ran(RunnerResponse),
    Rejected(GatewayErr),
}

/// Everything the agent loop needs to fold the last execution tool call into
/// a capsule once the turn ends. Produced by every call to one of the three
/// execution tools, whether or not the sandbox was ever reached.
pub struct ExecutionRecord {
    pub dataset_id: String,
    pub query_mode: QueryMode,
    pub compiled_sql: Option<String>,
    pub plan_json: Option<QueryPlan>,
    pub python_code: Option<String>,
    pub outcome: ExecutionOutcome,
}

/// The text returned to the planner plus, for execution tools, the record
/// the agent loop threads through to capsule construction.
pub struct ToolInvocationResult {
    pub tool_text: String,
    pub execution: Option<ExecutionRecord>,
}

impl ToolInvocationResult {
    fn text(tool_text: impl Into<String>) -> Self {
        Self {
            tool_text: tool_text.into(),
            execution: None,
        }
    }
}

pub fn tool_schemas(python_enabled: bool) -> Vec<ToolSchema> {
    let mut tools = vec![
        ToolSchema {
            name: "list_datasets".to_string(),
            description: "List every dataset this gateway can query.".to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        },
        ToolSchema {
            name: "get_dataset_schema".to_string(),
            description: "Get the column schema and a few sample rows for a dataset's files."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "dataset_id": { "type": "string" } },
                "required": ["dataset_id"],
            }),
        },
        ToolSchema {
            name: "execute_sql".to_string(),
            description: "Run a read-only SELECT/WITH statement against a dataset.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "dataset_id": { "type": "string" },
                    "sql": { "type": "string" },
                },
                "required": ["dataset_id", "sql"],
            }),
        },
        ToolSchema {
            name: "execute_query_plan".to_string(),
            description: "Run a structured query plan against a dataset.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "dataset_id": { "type": "string" },
                    "plan": { "type": "object" },
                },
                "required": ["dataset_id", "plan"],
            }),
        },
    ];

    if python_enabled {
        tools.push(ToolSchema {
            name: "execute_python".to_string(),
            description:
                "Run a short pandas/numpy analysis script against a dataset, assigning `result_df`, `result_rows`, or `result`."
                    .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "dataset_id": { "type": "string" },
                    "python_code": { "type": "string" },
                },
                "required": ["dataset_id", "python_code"],
            }),
        });
    }

    tools
}

#[derive(Debug, Serialize)]
struct DatasetSummary {
    id: String,
    name: String,
    example_prompts: Vec<String>,
}

pub async fn list_datasets(ctx: &ToolContext) -> ToolInvocationResult {
    let summaries: Vec<DatasetSummary> = ctx
        .registry
        .list()
        .map(|d| DatasetSummary {
            id: d.id.clone(),
            name: d.name.clone(),
            example_prompts: d.example_prompts.clone(),
        })
        .collect();
    ToolInvocationResult::text(serde_json::to_string(&summaries).unwrap_or_default())
}

#[derive(Debug, Serialize)]
struct FileSchemaView {
    name: String,
    columns: Vec<String>,
    sample_rows: Vec<Vec<String>>,
}

fn sample_rows(path: &std::path::Path, max_rows: usize) -> Vec<Vec<String>> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .skip(1)
        .take(max_rows)
        .map(|line| line.split(',').map(|cell| cell.trim().to_string()).collect())
        .collect()
}

pub async fn get_dataset_schema(ctx: &ToolContext, dataset_id: &str) -> ToolInvocationResult {
    let dataset = match ctx.registry.get(dataset_id) {
        Ok(d) => d,
        Err(e) => return ToolInvocationResult::text(error_text(&e)),
    };

    let files: Vec<FileSchemaView> = dataset
        .files
        .iter()
        .map(|f| FileSchemaView {
            name: f.name.clone(),
            columns: f.schema.iter().map(|c| c.column.clone()).collect(),
            sample_rows: sample_rows(&f.path, 3),
        })
        .collect();

    ToolInvocationResult::text(serde_json::to_string(&files).unwrap_or_default())
}

fn error_text(err: &GatewayErr) -> String {
    json!({ "error": { "type": err.kind(), "message": err.to_string() } }).to_string()
}

fn runner_request(
    dataset: &tabulon_protocol::DatasetDescriptor,
    config: &Config,
    query_type: QueryType,
    sql: Option<String>,
    python_code: Option<String>,
) -> RunnerRequest {
    RunnerRequest {
        dataset_id: dataset.id.clone(),
        files: dataset
            .files
            .iter()
            .map(|f| RunnerFile {
                name: f.name.clone(),
                path: std::path::PathBuf::from("/data")
                    .join(f.path.file_name().unwrap_or_else(|| std::ffi::OsStr::new(&f.name))),
            })
            .collect(),
        query_type,
        sql,
        python_code,
        timeout_seconds: config.run_timeout.as_secs(),
        max_rows: config.max_rows,
        max_output_bytes: config.max_output_bytes,
    }
}

fn rejected(
    dataset_id: &str,
    query_mode: QueryMode,
    compiled_sql: Option<String>,
    plan_json: Option<QueryPlan>,
    python_code: Option<String>,
    err: GatewayErr,
) -> ToolInvocationResult {
    let tool_text = error_text(&err);
    ToolInvocationResult {
        tool_text,
        execution: Some(ExecutionRecord {
            dataset_id: dataset_id.to_string(),
            query_mode,
            compiled_sql,
            plan_json,
            python_code,
            outcome: ExecutionOutcome::Rejected(err),
        }),
    }
}

pub async fn execute_sql(ctx: &ToolContext, dataset_id: &str, sql: &str) -> ToolInvocationResult {
    let dataset = match ctx.registry.get(dataset_id) {
        Ok(d) => d,
        Err(e) => return rejected(dataset_id, QueryMode::Sql, None, None, None, e),
    };

    let normalized = match policy::normalize_and_check_sql(sql, dataset_id) {
        Ok(s) => s,
        Err(e) => return rejected(dataset_id, QueryMode::Sql, None, None, None, e),
    };

    let request = runner_request(dataset, &ctx.config, QueryType::Sql, Some(normalized.clone()), None);
    let run_id = Uuid::new_v4().to_string();
    let response = match ctx.executor.submit(&run_id, &request).await {
        Ok(r) => r,
        Err(e) => {
            return rejected(
                dataset_id,
                QueryMode::Sql,
                Some(normalized),
                None,
                None,
                e,
            );
        }
    };

    ToolInvocationResult {
        tool_text: serde_json::to_string(&response).unwrap_or_default(),
        execution: Some(ExecutionRecord {
            dataset_id: dataset_id.to_string(),
            query_mode: QueryMode::Sql,
            compiled_sql: Some(normalized),
            plan_json: None,
            python_code: None,
            outcome: ExecutionOutcome::Ran(response),
        }),
    }
}

pub async fn execute_query_plan(
    ctx: &ToolContext,
    dataset_id: &str,
    plan: &QueryPlan,
) -> ToolInvocationResult {
    let dataset = match ctx.registry.get(dataset_id) {
        Ok(d) => d,
        Err(e) => return rejected(dataset_id, QueryMode::Plan, None, Some(plan.clone()), None, e),
    };

    let compiled = match policy::compile_plan(
        plan,
        dataset,
        ctx.config.max_rows as u32,
        ctx.config.exfil_column_threshold,
    ) {
        Ok(sql) => sql,
        Err(e) => return rejected(dataset_id, QueryMode::Plan, None, Some(plan.clone()), None, e),
    };

    let request = runner_request(dataset, &ctx.config, QueryType::Sql, Some(compiled.clone()), None);
    let run_id = Uuid::new_v4().to_string();
    let response = match ctx.executor.submit(&run_id, &request).await {
        Ok(r) => r,
        Err(e) => {
            return rejected(
                dataset_id,
                QueryMode::Plan,
                Some(compiled),
                Some(plan.clone()),
                None,
                e,
            );
        }
    };

    ToolInvocationResult {
        tool_text: serde_json::to_string(&response).unwrap_or_default(),
        execution: Some(ExecutionRecord {
            dataset_id: dataset_id.to_string(),
            query_mode: QueryMode::Plan,
            compiled_sql: Some(compiled),
            plan_json: Some(plan.clone()),
            python_code: None,
            outcome: ExecutionOutcome::Ran(response),
        }),
    }
}

pub async fn execute_python(
    ctx: &ToolContext,
    dataset_id: &str,
    python_code: &str,
) -> ToolInvocationResult {
    if !ctx.config.enable_python_execution {
        return rejected(
            dataset_id,
            QueryMode::Python,
            None,
            None,
            Some(python_code.to_string()),
            GatewayErr::FeatureDisabled("python execution is disabled on this deployment".to_string()),
        );
    }

    let dataset = match ctx.registry.get(dataset_id) {
        Ok(d) => d,
        Err(e) => {
            return rejected(
                dataset_id,
                QueryMode::Python,
                None,
                None,
                Some(python_code.to_string()),
                e,
            );
        }
    };

    if let Err(e) = policy::check_python(python_code) {
        return rejected(
            dataset_id,
            QueryMode::Python,
            None,
            None,
            Some(python_code.to_string()),
            e,
        );
    }

    let request = runner_request(
        dataset,
        &ctx.config,
        QueryType::Python,
        None,
        Some(python_code.to_string()),
    );
    let run_id = Uuid::new_v4().to_string();
    let response = match ctx.executor.submit(&run_id, &request).await {
        Ok(r) => r,
        Err(e) => {
            return rejected(
                dataset_id,
                QueryMode::Python,
                None,
                None,
                Some(python_code.to_string()),
                e,
            );
        }
    };

    ToolInvocationResult {
        tool_text: serde_json::to_string(&response).unwrap_or_default(),
        execution: Some(ExecutionRecord {
            dataset_id: dataset_id.to_string(),
            query_mode: QueryMode::Python,
            compiled_sql: None,
            plan_json: None,
            python_code: Some(python_code.to_string()),
            outcome: ExecutionOutcome::Ran(response),
        }),
    }
}

/// Dispatch a planner tool call by name with raw JSON arguments.
pub async fn dispatch(ctx: &ToolContext, name: &str, arguments: &Value) -> ToolInvocationResult {
    let dataset_id = arguments
        .get("dataset_id")
        .and_then(Value::as_str)
        .unwrap_or_default();

    match name {
        "list_datasets" => list_datasets(ctx).await,
        "get_dataset_schema" => get_dataset_schema(ctx, dataset_id).await,
        "execute_sql" => {
            let sql = arguments.get("sql").and_then(Value::as_str).unwrap_or_default();
            execute_sql(ctx, dataset_id, sql).await
        }
        "execute_query_plan" => {
            let plan = match arguments
                .get("plan")
                .cloned()
                .map(serde_json::from_value::<QueryPlan>)
            {
                Some(Ok(p)) => p,
                _ => {
                    return ToolInvocationResult::text(error_text(&GatewayErr::PlanValidation(
                        "missing or malformed `plan` argument".to_string(),
                    )));
                }
            };
            execute_query_plan(ctx, dataset_id, &plan).await
        }
        "execute_python" => {
            let code = arguments
                .get("python_code")
                .and_then(Value::as_str)
                .unwrap_or_default();
            execute_python(ctx, dataset_id, code).await
        }
        other => ToolInvocationResult::text(error_text(&GatewayErr::Validation(format!(
            "unknown tool `{other}`"
        )))),
    }
}
