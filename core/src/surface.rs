use std::sync::Arc;

use tabulon_protocol::AgentEvent;
use tabulon_protocol::ChatResponse;
use tabulon_protocol::Role;
use tabulon_protocol::ThreadMessage;
use uuid::Uuid;

use crate::agent;
use crate::agent::AgentDeps;

/// Thin adapter a transport (HTTP/SSE, CLI, …) sits behind. Normalizes
/// `thread_id`, appends the user message before the turn and the assistant
/// message after, and otherwise just forwards to the agent loop.
pub struct Surface {
    deps: Arc<AgentDeps>,
}

impl Surface {
    pub fn new(deps: Arc<AgentDeps>) -> Self {
        Self { deps }
    }

    fn resolve_thread_id(thread_id: Option<Uuid>) -> Uuid {
        thread_id.unwrap_or_else(Uuid::new_v4)
    }

    async fn append_user_message(&self, thread_id: Uuid, dataset_id: &str, message: &str) {
        let _ = self
            .deps
            .thread_store
            .append(ThreadMessage {
                thread_id,
                ts: chrono::Utc::now(),
                role: Role::User,
                content: message.to_string(),
                dataset_id: dataset_id.to_string(),
                run_id: None,
            })
            .await;
    }

    async fn append_assistant_message(&self, thread_id: Uuid, dataset_id: &str, response: &ChatResponse) {
        let _ = self
            .deps
            .thread_store
            .append(ThreadMessage {
                thread_id,
                ts: chrono::Utc::now(),
                role: Role::Assistant,
                content: response.assistant_message.clone(),
                dataset_id: dataset_id.to_string(),
                run_id: response.run_id,
            })
            .await;
    }

    /// Runs a single turn to completion.
    pub async fn run(&self, dataset_id: &str, message: &str, thread_id: Option<Uuid>) -> ChatResponse {
        let thread_id = Self::resolve_thread_id(thread_id);
        self.append_user_message(thread_id, dataset_id, message).await;
        let response = agent::run(&self.deps, dataset_id, thread_id, message).await;
        self.append_assistant_message(thread_id, dataset_id, &response).await;
        response
    }

    /// Runs a single turn, forwarding the agent loop's event stream and
    /// appending the assistant message once the turn's `Result` event is
    /// observed.
    pub fn stream(
        &self,
        dataset_id: String,
        message: String,
        thread_id: Option<Uuid>,
    ) -> async_channel::Receiver<AgentEvent> {
        let thread_id = Self::resolve_thread_id(thread_id);
        let deps = Arc::clone(&self.deps);
        let (tx, rx) = async_channel::bounded(32);

        tokio::spawn(async move {
            let _ = deps
                .thread_store
                .append(ThreadMessage {
                    thread_id,
                    ts: chrono::Utc::now(),
                    role: Role::User,
                    content: message.clone(),
                    dataset_id: dataset_id.clone(),
                    run_id: None,
                })
                .await;

            let inner = agent::stream(Arc::clone(&deps), dataset_id.clone(), thread_id, message);
            let mut final_response: Option<ChatResponse> = None;

            while let Ok(event) = inner.recv().await {
                if let AgentEvent::Result { response } = &event {
                    final_response = Some((**response).clone());
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }

            if let Some(response) = final_response {
                let _ = deps
                    .thread_store
                    .append(ThreadMessage {
                        thread_id,
                        ts: chrono::Utc::now(),
                        role: Role::Assistant,
                        content: response.assistant_message,
                        dataset_id,
                        run_id: response.run_id,
                    })
                    .await;
            }
        });

        rx
    }
}
