//! Executor seam towards the LLM provider.
//!
//! The kernel never talks to a model directly; it hands an agent record to
//! an [`AgentExecutor`] and takes back the final outcome. Streaming
//! providers forward chunks through an mpsc sink, but the kernel itself only
//! cares about `(output, tokens_used, finish_reason)`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::AgentRecord;
use crate::KernelError;

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Aborted,
}

/// Final result of executing one agent's task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub output: serde_json::Value,
    pub tokens_used: i64,
    pub finish_reason: FinishReason,
}

/// One incremental chunk of streamed output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionChunk {
    pub content: String,
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Execute the agent's task to completion.
    async fn execute(&self, agent: &AgentRecord) -> Result<ExecutionOutcome, KernelError>;

    /// Execute while forwarding incremental chunks into `sink`. The default
    /// implementation ignores the sink and delegates to
    /// [`execute`](Self::execute); streaming providers override it.
    async fn execute_streaming(
        &self,
        agent: &AgentRecord,
        sink: mpsc::Sender<ExecutionChunk>,
    ) -> Result<ExecutionOutcome, KernelError> {
        drop(sink);
        self.execute(agent).await
    }
}
