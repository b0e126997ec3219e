//! Agent executor contract and the built-in echo graph.
//!
//! The run controller treats an executor as an opaque, possibly slow and
//! possibly failing computation: it hands over the initial state, listens on
//! an event channel and signals cancellation through a token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything an executor needs to run one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub run_id: String,
    pub thread_id: Option<String>,
    pub assistant_id: String,
    /// Thread values with the run input merged in.
    pub state: Value,
    pub config: Value,
    pub interrupt_before: Vec<String>,
    pub interrupt_after: Vec<String>,
}

/// Incremental output emitted while a run executes.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// A new generation step started.
    MessageMetadata { message_id: String, metadata: Value },
    /// The message produced so far by the current generation step.
    MessagePartial { message: Value },
    /// A node finished; `state` is the full state after applying `delta`.
    Update {
        node: String,
        delta: Value,
        state: Value,
    },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("{message}")]
    Failed { message: String },
    #[error("Run was cancelled")]
    Cancelled,
}

impl ExecutorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

pub type ExecutionResult = Result<Value, ExecutorError>;

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run to completion and return the final state.
    ///
    /// Implementations should check `cancel` at every yield point and return
    /// [`ExecutorError::Cancelled`] once it fires.
    async fn execute(
        &self,
        request: ExecutionRequest,
        events: mpsc::UnboundedSender<ExecutionEvent>,
        cancel: CancellationToken,
    ) -> ExecutionResult;
}

pub type SharedExecutor = Arc<dyn AgentExecutor>;

const AGENT_NODE: &str = "agent";

/// Single-node graph that answers with the last input message, word by word.
pub struct EchoExecutor {
    chunk_delay: Duration,
}

impl EchoExecutor {
    #[must_use]
    pub fn new(chunk_delay: Duration) -> Self {
        Self { chunk_delay }
    }
}

impl Default for EchoExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

fn last_message_text(state: &Value) -> String {
    let Some(last) = state
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.last())
    else {
        return String::new();
    };
    match last {
        Value::String(text) => text.clone(),
        other => other
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn append_message(state: &Value, message: Value) -> Value {
    let mut next = match state {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    let mut messages = next
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    messages.push(message);
    next.insert("messages".to_string(), Value::Array(messages));
    Value::Object(next)
}

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        events: mpsc::UnboundedSender<ExecutionEvent>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        if request.interrupt_before.iter().any(|node| node == AGENT_NODE) {
            return Ok(request.state);
        }

        let message_id = format!("msg-{}", Uuid::new_v4());
        let _ = events.send(ExecutionEvent::MessageMetadata {
            message_id: message_id.clone(),
            metadata: json!({
                "run_id": request.run_id,
                "thread_id": request.thread_id,
                "assistant_id": request.assistant_id,
                "node": AGENT_NODE,
                "tags": request.config.get("tags").cloned().unwrap_or_else(|| json!([])),
            }),
        });

        let text = last_message_text(&request.state);
        let mut content = String::new();
        for word in text.split_whitespace() {
            tokio::select! {
                () = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                () = tokio::time::sleep(self.chunk_delay) => {}
            }
            if !content.is_empty() {
                content.push(' ');
            }
            content.push_str(word);
            let _ = events.send(ExecutionEvent::MessagePartial {
                message: json!({ "id": message_id, "type": "ai", "content": content }),
            });
        }
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }

        let reply = json!({ "id": message_id, "type": "ai", "content": content });
        let state = append_message(&request.state, reply.clone());
        let _ = events.send(ExecutionEvent::Update {
            node: AGENT_NODE.to_string(),
            delta: json!({ "messages": [reply] }),
            state: state.clone(),
        });
        if request.interrupt_after.iter().any(|node| node == AGENT_NODE) {
            tracing::debug!(run_id = %request.run_id, "pausing after {AGENT_NODE}");
        }
        Ok(state)
    }
}
