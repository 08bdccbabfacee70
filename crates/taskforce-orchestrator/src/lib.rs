//! Workforce orchestration core: dependency-graph scheduling, resource
//! reservation, multi-criteria worker matching, and contention negotiation.
//!
//! A caller submits a workflow (tasks with dependency references), the
//! [`Orchestrator`] builds the dependency graph, picks a sequential,
//! parallel, or adaptive strategy, matches each runnable task to the best
//! worker, reserves capacity in the [`ResourceLedger`] before dispatching
//! through the injected [`TaskExecutor`], and reports any capacity
//! contention to the [`NegotiationManager`].
//!
//! # Main types
//!
//! - [`Orchestrator`] — top-level coordinator driving workflow execution.
//! - [`ResourceLedger`] — single source of truth for shared capacity.
//! - [`NegotiationManager`] — single source of truth for resource disputes.
//! - [`TaskMonitor`] — registry of all known tasks and their statuses.
//! - [`TaskExecutor`] — the injected capability that actually runs a task.
//! - [`OrchestratorConfig`] — every tunable policy knob, TOML-loadable.

/// Policy knobs and tunables.
pub mod config;
/// Orchestration engine and workflow drivers.
pub mod engine;
/// Task-execution capability boundary.
pub mod executor;
/// Dependency-graph algorithms (topological order, level grouping).
pub mod graph;
/// Capacity bookkeeping for shared resources.
pub mod ledger;
/// Worker scoring and allocation.
pub mod matcher;
/// Task registry and status fan-in.
pub mod monitor;
/// Resource-dispute registry and resolution heuristics.
pub mod negotiation;
/// Shared orchestration value types.
pub mod types;

pub use config::{
    AdaptivePolicy, CostPolicy, MatcherPolicy, ModelRates, OrchestratorConfig, TokenEstimatePolicy,
};
pub use engine::{
    Orchestrator, TaskSpec, TaskStatusReport, WorkflowReport, WorkflowRequest,
    WorkflowStatusReport, WorkflowSubmission, MEMORY_POOL_ID, TOKEN_BUDGET_ID,
};
pub use executor::{ExecutionOutcome, ExecutionReport, TaskExecutor};
pub use ledger::{estimate_tokens, ResourceLedger};
pub use matcher::{allocate, score};
pub use monitor::TaskMonitor;
pub use negotiation::{NegotiationManager, NegotiationMetrics, NegotiationState, NegotiationStatus};
pub use types::{
    ExecutionMode, ResourceEntry, ResourceKind, SubTask, Task, TaskStatus, Worker, WorkerStatus,
    WorkflowExecution, WorkflowStatus,
};
