use crate::types::{Task, Worker};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taskforce_core::TaskforceResult;
use uuid::Uuid;

/// What an execution produced, as reported by the capability backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Result payload for the task.
    pub output: String,
    /// Prompt-side tokens consumed.
    pub tokens_in: u64,
    /// Completion-side tokens consumed.
    pub tokens_out: u64,
}

impl ExecutionOutcome {
    /// Total tokens consumed by the execution.
    pub fn tokens_used(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

/// The capability boundary between the scheduler and whatever actually
/// performs a task (an LLM-backed agent, a subprocess, a remote service).
///
/// The orchestrator holds an `Arc<dyn TaskExecutor>` and knows nothing
/// about providers; concrete implementations are injected at construction.
/// Completion is the future resolving — no polling — so the orchestrator
/// can compose it with `tokio::time::timeout` and cancellation.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task` on `worker`, returning the outcome or a failure.
    async fn execute(&self, worker: &Worker, task: &Task) -> TaskforceResult<ExecutionOutcome>;
}

/// Result callback consumed from external execution surfaces
/// (`Orchestrator::handle_report`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub task_id: Uuid,
    /// Status string validated against the closed task-status set.
    pub status: String,
    pub output: Option<String>,
    pub tokens_used: u64,
    pub cost: f64,
    pub error: Option<String>,
}
