use thiserror::Error;
use uuid::Uuid;

/// Convenience alias used across all Taskforce crates.
pub type TaskforceResult<T> = Result<T, TaskforceError>;

/// Error taxonomy for the orchestration core.
///
/// Variants map to distinct recovery paths: `Graph` is fatal to workflow
/// creation, `ResourceExhausted` is recoverable by deferral, the task-level
/// variants trigger release-and-reassign, and `Workflow` surfaces to the
/// caller with whatever partial results were produced.
#[derive(Error, Debug)]
pub enum TaskforceError {
    #[error("Dependency graph error: {0}")]
    Graph(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Task {0} timed out")]
    TaskTimeout(Uuid),

    #[error("Task execution failed: {0}")]
    TaskFailure(String),

    #[error("Negotiation {0} timed out")]
    NegotiationTimeout(Uuid),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
