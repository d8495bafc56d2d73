use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::error::GatewayErr;
use crate::error::Result;

/// A schema-typed tool the planner may invoke, passed alongside every
/// completion request. Mirrors the shape a chat-completions-style API
/// expects: name, human-readable description, JSON Schema for arguments.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct PlannerToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One exchanged turn in the conversation sent to the planner.
#[derive(Debug, Clone)]
pub enum PlannerMessage {
    System(String),
    User(String),
    Assistant(String),
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

/// What the planner produced for one invocation: either it is done talking
/// (final text) or it wants one or more tools invoked before continuing.
#[derive(Debug, Clone)]
pub enum PlannerTurn {
    Text(String),
    ToolCalls(Vec<PlannerToolCall>),
}

/// Pluggable language-model collaborator: takes the running conversation
/// plus the tool schemas available this turn, returns either text or a set
/// of tool calls to dispatch. The core treats every provider uniformly
/// through this trait; no vendor SDK is a hard dependency of the
/// orchestrator itself.
#[async_trait]
pub trait PlannerClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[PlannerMessage],
        tools: &[ToolSchema],
    ) -> Result<PlannerTurn>;
}

/// Deterministic planner used for tests and offline demos: always asks for
/// the dataset schema once, then emits a final text summarizing that it has
/// no live model backing it. Never calls an execution tool on its own, so it
/// cannot be mistaken for a safety bypass.
pub struct StubPlannerClient;

#[async_trait]
impl PlannerClient for StubPlannerClient {
    async fn complete(
        &self,
        messages: &[PlannerMessage],
        tools: &[ToolSchema],
    ) -> Result<PlannerTurn> {
        let already_called_schema = messages.iter().any(|m| {
            matches!(m, PlannerMessage::ToolResult { name, .. } if name == "get_dataset_schema")
        });

        if !already_called_schema {
            if let Some(schema_tool) = tools.iter().find(|t| t.name == "get_dataset_schema") {
                let dataset_id = messages
                    .iter()
                    .rev()
                    .find_map(|m| match m {
                        PlannerMessage::User(text) => Some(text.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                return Ok(PlannerTurn::ToolCalls(vec![PlannerToolCall {
                    id: "call_0".to_string(),
                    name: schema_tool.name.clone(),
                    arguments: json!({ "dataset_id": dataset_id, "question": dataset_id }),
                }]));
            }
        }

        Ok(PlannerTurn::Text(
            "no live planner is configured for this deployment".to_string(),
        ))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageWire>,
    tools: Vec<ChatToolWire<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessageWire {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatToolWire<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolSchema,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCallWire>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCallWire {
    id: String,
    function: ChatFunctionCallWire,
}

#[derive(Debug, Deserialize)]
struct ChatFunctionCallWire {
    name: String,
    arguments: String,
}

/// Generic OpenAI-compatible chat-completions client. Works against any
/// provider exposing the same `/chat/completions` tool-calling shape;
/// provider-specific SDKs are explicitly out of scope.
pub struct HttpPlannerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpPlannerClient {
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl PlannerClient for HttpPlannerClient {
    async fn complete(
        &self,
        messages: &[PlannerMessage],
        tools: &[ToolSchema],
    ) -> Result<PlannerTurn> {
        let wire_messages = messages
            .iter()
            .map(|m| match m {
                PlannerMessage::System(c) => ChatMessageWire {
                    role: "system",
                    content: Some(c.clone()),
                    tool_call_id: None,
                },
                PlannerMessage::User(c) => ChatMessageWire {
                    role: "user",
                    content: Some(c.clone()),
                    tool_call_id: None,
                },
                PlannerMessage::Assistant(c) => ChatMessageWire {
                    role: "assistant",
                    content: Some(c.clone()),
                    tool_call_id: None,
                },
                PlannerMessage::ToolResult { call_id, content, .. } => ChatMessageWire {
                    role: "tool",
                    content: Some(content.clone()),
                    tool_call_id: Some(call_id.clone()),
                },
            })
            .collect();

        let wire_tools = tools
            .iter()
            .map(|t| ChatToolWire {
                kind: "function",
                function: t,
            })
            .collect();

        let request = ChatCompletionRequest {
            model: &self.model,
            messages: wire_messages,
            tools: wire_tools,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<ChatCompletionResponse>()
            .await?;

        let Some(choice) = response.choices.into_iter().next() else {
            return Err(GatewayErr::RunnerProtocol(
                "planner response had no choices".to_string(),
            ));
        };

        if !choice.message.tool_calls.is_empty() {
            let calls = choice
                .message
                .tool_calls
                .into_iter()
                .map(|c| PlannerToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: serde_json::from_str(&c.function.arguments)
                        .unwrap_or(Value::Null),
                })
                .collect();
            return Ok(PlannerTurn::ToolCalls(calls));
        }

        Ok(PlannerTurn::Text(choice.message.content.unwrap_or_default()))
    }
}
