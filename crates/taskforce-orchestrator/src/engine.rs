use crate::config::OrchestratorConfig;
use crate::executor::{ExecutionReport, TaskExecutor};
use crate::graph;
use crate::ledger::{estimate_tokens, ResourceLedger};
use crate::matcher;
use crate::monitor::TaskMonitor;
use crate::negotiation::{NegotiationManager, NegotiationMetrics};
use crate::types::{
    ExecutionMode, ResourceEntry, ResourceKind, Task, TaskStatus, Worker, WorkerStatus,
    WorkflowExecution, WorkflowStatus,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskforce_core::{Envelope, Payload, TaskforceError, TaskforceResult};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Ledger id of the shared token-budget pool.
pub const TOKEN_BUDGET_ID: &str = "token-budget";
/// Ledger id of the shared memory pool.
pub const MEMORY_POOL_ID: &str = "memory-pool";

/// Ledger id of a worker's execution slot.
fn worker_slot_id(worker_id: &str) -> String {
    format!("worker:{worker_id}")
}

/// One task in a workflow submission. Dependencies reference sibling tasks
/// by title or by zero-based index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A workflow submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub name: String,
    pub tasks: Vec<TaskSpec>,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub max_parallel_tasks: Option<usize>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Identifier and up-front estimates returned from a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSubmission {
    pub workflow_id: Uuid,
    pub estimated_duration_secs: u64,
    pub estimated_cost: f64,
}

/// Result of driving a workflow to quiescence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub pending_tasks: usize,
    pub total_cost: f64,
    pub elapsed_ms: u64,
}

/// Point-in-time view of a workflow, for API/UI consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub id: Uuid,
    pub status: WorkflowStatus,
    /// Completed fraction in `[0, 1]`.
    pub progress: f64,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub running_tasks: usize,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub id: Uuid,
    pub status: TaskStatus,
    pub assigned_worker: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub cost: Option<f64>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Outcome of one pass through the per-task execution wrapper.
enum TaskRun {
    Completed,
    /// Could not start (no eligible worker, capacity exhausted); the task
    /// stays `Pending` and may run on a later pass.
    Deferred(String),
    /// Execution failed or timed out on every allowed attempt.
    Failed(String),
}

/// The workforce orchestration engine.
///
/// Builds the dependency graph for each submitted workflow, picks an
/// execution strategy, matches tasks to workers, reserves capacity in the
/// resource ledger before dispatch, and reports contention to the
/// negotiation manager. All collaborators are owned per instance; nothing
/// is process-global.
pub struct Orchestrator {
    config: OrchestratorConfig,
    executor: Arc<dyn TaskExecutor>,
    /// Registered workers, in first-seen order (ties in matching are
    /// broken by this order).
    workers: RwLock<Vec<Worker>>,
    monitor: Arc<TaskMonitor>,
    ledger: Arc<ResourceLedger>,
    negotiations: Arc<NegotiationManager>,
    workflows: RwLock<HashMap<Uuid, WorkflowExecution>>,
    /// Outstanding reservations per task, so cancellation can release
    /// exactly what is held.
    reservations: Mutex<HashMap<Uuid, HashMap<String, f64>>>,
    /// Workflows currently being driven, so a tick rescan can never race a
    /// caller-driven run into double-executing a task.
    driving: Mutex<HashSet<Uuid>>,
}

impl Orchestrator {
    /// Create an orchestrator with the default configuration.
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self::with_config(executor, OrchestratorConfig::default())
    }

    /// Create an orchestrator with an explicit configuration.
    pub fn with_config(executor: Arc<dyn TaskExecutor>, config: OrchestratorConfig) -> Self {
        let ledger = ResourceLedger::with_entries(vec![
            ResourceEntry::new(TOKEN_BUDGET_ID, ResourceKind::TokenBudget, config.token_budget),
            ResourceEntry::new(MEMORY_POOL_ID, ResourceKind::Memory, config.memory_pool_mb),
        ]);
        let negotiations = NegotiationManager::new(
            config.negotiation_timeout_secs,
            config.retention_secs,
        );
        Self {
            config,
            executor,
            workers: RwLock::new(Vec::new()),
            monitor: Arc::new(TaskMonitor::new()),
            ledger: Arc::new(ledger),
            negotiations: Arc::new(negotiations),
            workflows: RwLock::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
            driving: Mutex::new(HashSet::new()),
        }
    }

    /// The task registry.
    pub fn monitor(&self) -> &Arc<TaskMonitor> {
        &self.monitor
    }

    /// The capacity ledger.
    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    /// The dispute registry.
    pub fn negotiations(&self) -> &Arc<NegotiationManager> {
        &self.negotiations
    }

    /// Negotiation counters, re-exported for observability consumers.
    pub async fn negotiation_metrics(&self) -> NegotiationMetrics {
        self.negotiations.metrics().await
    }

    // ── Worker registry ──────────────────────────────────────────────────

    /// Register a worker and create its single-capacity execution slot in
    /// the ledger.
    pub async fn register_worker(&self, worker: Worker) {
        let slot = ResourceEntry::new(worker_slot_id(&worker.id), ResourceKind::Worker, 1.0);
        self.ledger.register(slot).await;

        let mut workers = self.workers.write().await;
        if workers.iter().any(|w| w.id == worker.id) {
            warn!(worker_id = %worker.id, "worker already registered, ignoring duplicate");
            return;
        }
        info!(worker_id = %worker.id, role = %worker.role, "worker registered");
        workers.push(worker);
    }

    /// Remove a worker and its ledger slot.
    pub async fn deregister_worker(&self, worker_id: &str) -> bool {
        self.ledger.deregister(&worker_slot_id(worker_id)).await;
        let mut workers = self.workers.write().await;
        let before = workers.len();
        workers.retain(|w| w.id != worker_id);
        before != workers.len()
    }

    async fn adjust_worker_load(&self, worker_id: &str, delta: i64) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
            let load = i64::from(worker.workload) + delta;
            worker.workload = load.max(0) as u32;
            if worker.status != WorkerStatus::Offline {
                worker.status = if worker.workload > 0 {
                    WorkerStatus::Busy
                } else {
                    WorkerStatus::Idle
                };
            }
        }
    }

    // ── Submission ───────────────────────────────────────────────────────

    /// Submit a workflow: resolve dependency references, validate the
    /// graph, register the tasks, and return up-front estimates.
    ///
    /// A cyclic graph or a dependency naming no sibling task fails here
    /// with [`TaskforceError::Graph`] — nothing is registered.
    pub async fn submit(&self, request: WorkflowRequest) -> TaskforceResult<WorkflowSubmission> {
        if request.tasks.is_empty() {
            return Err(TaskforceError::Workflow(
                "workflow contains no tasks".to_string(),
            ));
        }

        let mut tasks: Vec<Task> = request
            .tasks
            .iter()
            .map(|spec| {
                let mut task = Task::new(&spec.title, &spec.description)
                    .with_required_tools(spec.required_tools.clone());
                task.metadata = spec.metadata.clone();
                if let Some(secs) = spec.estimated_duration_secs {
                    task.metadata.insert(
                        "estimated_duration_secs".to_string(),
                        serde_json::Value::from(secs),
                    );
                }
                task
            })
            .collect();

        // Resolve title|index dependency references to task ids.
        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        for (i, spec) in request.tasks.iter().enumerate() {
            let mut deps = Vec::with_capacity(spec.dependencies.len());
            for reference in &spec.dependencies {
                let target = if let Ok(index) = reference.parse::<usize>() {
                    ids.get(index).copied()
                } else {
                    request
                        .tasks
                        .iter()
                        .position(|t| t.title == *reference)
                        .and_then(|pos| ids.get(pos).copied())
                };
                let target = target.ok_or_else(|| {
                    TaskforceError::Graph(format!(
                        "task '{}' references unknown dependency '{reference}'",
                        spec.title
                    ))
                })?;
                if target == ids[i] {
                    return Err(TaskforceError::Graph(format!(
                        "task '{}' depends on itself",
                        spec.title
                    )));
                }
                deps.push(target);
            }
            tasks[i].dependencies = deps;
        }

        // Validate before anything is registered.
        let levels = graph::levels(&tasks)?;

        let estimated_duration_secs = self.estimate_duration(&request, &tasks, &levels);
        let estimated_cost: f64 = tasks
            .iter()
            .map(|t| {
                let tokens = estimate_tokens(t, &self.config.token_estimate);
                let half = (tokens / 2.0) as u64;
                self.config.cost.cost("", half, half, 0.0)
            })
            .sum();

        let mut workflow =
            WorkflowExecution::new(&request.name, ids.clone(), request.mode);
        workflow.max_parallel_tasks = request.max_parallel_tasks;
        let workflow_id = workflow.id;

        for task in tasks {
            self.monitor.register(task).await;
        }
        {
            let mut workflows = self.workflows.write().await;
            workflows.insert(workflow_id, workflow);
        }

        info!(
            workflow_id = %workflow_id,
            name = %request.name,
            tasks = ids.len(),
            mode = ?request.mode,
            "workflow submitted"
        );

        Ok(WorkflowSubmission {
            workflow_id,
            estimated_duration_secs,
            estimated_cost,
        })
    }

    /// Duration estimate: sequential sums every task; parallel and
    /// adaptive sum the slowest task of each dependency level.
    fn estimate_duration(
        &self,
        request: &WorkflowRequest,
        tasks: &[Task],
        levels: &[Vec<Uuid>],
    ) -> u64 {
        let per_task: HashMap<Uuid, u64> = tasks
            .iter()
            .map(|t| {
                let secs = t
                    .metadata
                    .get("estimated_duration_secs")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(self.config.task_duration_estimate_secs);
                (t.id, secs)
            })
            .collect();

        match request.mode {
            ExecutionMode::Sequential => per_task.values().sum(),
            ExecutionMode::Parallel | ExecutionMode::Adaptive => levels
                .iter()
                .map(|level| {
                    level
                        .iter()
                        .map(|id| per_task.get(id).copied().unwrap_or(0))
                        .max()
                        .unwrap_or(0)
                })
                .sum(),
        }
    }

    // ── Execution ────────────────────────────────────────────────────────

    /// Drive a workflow until no more tasks can make progress.
    ///
    /// Returns a report carrying the partial result set even when tasks
    /// fail; only workflow-creation problems (unknown id, re-run of a
    /// terminal workflow) are errors.
    pub async fn run(&self, workflow_id: Uuid) -> TaskforceResult<WorkflowReport> {
        let start = Instant::now();

        {
            let mut driving = self.driving.lock().await;
            if !driving.insert(workflow_id) {
                return Err(TaskforceError::Workflow(format!(
                    "workflow {workflow_id} is already being driven"
                )));
            }
        }
        let result = self.run_inner(workflow_id, start).await;
        {
            let mut driving = self.driving.lock().await;
            driving.remove(&workflow_id);
        }
        result
    }

    async fn run_inner(
        &self,
        workflow_id: Uuid,
        start: Instant,
    ) -> TaskforceResult<WorkflowReport> {
        let (task_ids, requested_mode, max_parallel) = {
            let mut workflows = self.workflows.write().await;
            let workflow = workflows
                .get_mut(&workflow_id)
                .ok_or_else(|| TaskforceError::Workflow(format!("unknown workflow {workflow_id}")))?;
            if workflow.status.is_terminal() {
                return Err(TaskforceError::Workflow(format!(
                    "workflow {workflow_id} is already {:?}",
                    workflow.status
                )));
            }
            workflow.status = WorkflowStatus::InProgress;
            workflow.started_at.get_or_insert_with(Utc::now);
            (
                workflow.task_ids.clone(),
                workflow.mode,
                workflow.max_parallel_tasks,
            )
        };

        let tasks = self.monitor.get_all(&task_ids).await;
        let mode = self.choose_mode(requested_mode, &tasks).await;
        info!(workflow_id = %workflow_id, mode = ?mode, "workflow starting");

        let run_result = match mode {
            ExecutionMode::Sequential => self.run_sequential(workflow_id, &tasks).await,
            ExecutionMode::Parallel | ExecutionMode::Adaptive => {
                self.run_parallel(workflow_id, &tasks, max_parallel).await
            }
        };
        if let Err(e) = &run_result {
            error!(workflow_id = %workflow_id, error = %e, "workflow execution error");
        }

        let report = self.finalize(workflow_id, &task_ids, start).await;
        info!(
            workflow_id = %workflow_id,
            status = ?report.status,
            completed = report.completed_tasks,
            failed = report.failed_tasks,
            cost = report.total_cost,
            "workflow finished"
        );
        Ok(report)
    }

    /// Resolve `Adaptive` into a concrete strategy: parallel when enough
    /// workers are on hand and more than the configured number of tasks
    /// are immediately independent.
    async fn choose_mode(&self, requested: ExecutionMode, tasks: &[Task]) -> ExecutionMode {
        if requested != ExecutionMode::Adaptive {
            return requested;
        }
        let available = {
            let workers = self.workers.read().await;
            workers
                .iter()
                .filter(|w| w.status != WorkerStatus::Offline)
                .count()
        };
        let independent = tasks.iter().filter(|t| t.dependencies.is_empty()).count();
        let enough_workers =
            available as f64 >= tasks.len() as f64 * self.config.adaptive.min_worker_ratio;
        if enough_workers && independent > self.config.adaptive.min_independent_tasks {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        }
    }

    /// Sequential driver: Kahn order with a re-check loop. A task whose
    /// dependencies are not yet satisfied is re-attempted on the next pass
    /// rather than dropped; the loop ends when a full pass makes no
    /// progress. A task failure in this blocking path fails the workflow.
    async fn run_sequential(&self, workflow_id: Uuid, tasks: &[Task]) -> TaskforceResult<()> {
        let order = graph::topo_order(tasks)?;

        loop {
            let mut progressed = false;
            let mut remaining = false;

            for id in &order {
                let Some(task) = self.monitor.get(*id).await else {
                    continue;
                };
                if task.status != TaskStatus::Pending {
                    continue;
                }
                remaining = true;
                if !self.monitor.dependencies_met(&task).await {
                    continue;
                }

                match self.execute_task(workflow_id, *id).await {
                    TaskRun::Completed => progressed = true,
                    TaskRun::Deferred(reason) => {
                        info!(task_id = %id, reason = %reason, "task deferred");
                    }
                    TaskRun::Failed(reason) => {
                        self.fail_workflow(workflow_id, *id, &reason).await;
                        return Err(TaskforceError::Workflow(format!(
                            "task '{}' exhausted retries: {reason}",
                            task.title
                        )));
                    }
                }
            }

            if !remaining || !progressed {
                return Ok(());
            }
        }
    }

    /// Parallel driver: dependency levels executed with fan-out/fan-in.
    /// Failures never abort siblings; tasks deferred by capacity are
    /// retried after the rest of their level releases it.
    async fn run_parallel(
        &self,
        workflow_id: Uuid,
        tasks: &[Task],
        max_parallel: Option<usize>,
    ) -> TaskforceResult<()> {
        let levels = graph::levels(tasks)?;
        let batch_cap = max_parallel.unwrap_or(usize::MAX).max(1);

        for level in levels {
            let mut queue: Vec<Uuid> = Vec::new();
            for id in level {
                let Some(task) = self.monitor.get(id).await else {
                    continue;
                };
                if task.status == TaskStatus::Pending
                    && self.monitor.dependencies_met(&task).await
                {
                    queue.push(id);
                }
            }

            while !queue.is_empty() {
                let batch: Vec<Uuid> = queue.drain(..queue.len().min(batch_cap)).collect();
                let results = join_all(
                    batch
                        .iter()
                        .map(|id| self.execute_task(workflow_id, *id)),
                )
                .await;

                let mut any_completed = false;
                let mut deferred = Vec::new();
                for (id, result) in batch.into_iter().zip(results) {
                    match result {
                        TaskRun::Completed => any_completed = true,
                        TaskRun::Deferred(reason) => {
                            info!(task_id = %id, reason = %reason, "task deferred");
                            deferred.push(id);
                        }
                        TaskRun::Failed(reason) => {
                            warn!(task_id = %id, reason = %reason, "task failed, siblings continue");
                        }
                    }
                }

                // Deferred tasks get another chance once siblings have
                // released capacity; stop when a round frees nothing.
                if !any_completed && queue.is_empty() {
                    break;
                }
                queue.extend(deferred);
            }
        }
        Ok(())
    }

    /// The per-task execution wrapper: match a worker, reserve capacity,
    /// dispatch under the timeout, release, record timing and cost. A
    /// failed or timed-out execution is retried on a different worker, up
    /// to the configured reassignment cap.
    async fn execute_task(&self, workflow_id: Uuid, task_id: Uuid) -> TaskRun {
        let Some(task) = self.monitor.get(task_id).await else {
            return TaskRun::Deferred("task not registered".to_string());
        };

        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_failure: Option<String> = None;

        for attempt in 0..=self.config.max_reassignments {
            // Pick a worker among those not yet tried.
            let candidate = {
                let workers = self.workers.read().await;
                let eligible: Vec<Worker> = workers
                    .iter()
                    .filter(|w| !excluded.contains(&w.id))
                    .cloned()
                    .collect();
                matcher::allocate(&eligible, &task, &self.config.matcher).cloned()
            };
            let Some(worker) = candidate else {
                return match last_failure {
                    // A failure happened and no alternate worker exists:
                    // leave the task pending with the reason recorded.
                    Some(reason) => {
                        self.record_defer(task_id, &reason).await;
                        TaskRun::Failed(reason)
                    }
                    None => {
                        let reason = "no eligible worker".to_string();
                        self.record_defer(task_id, &reason).await;
                        TaskRun::Deferred(reason)
                    }
                };
            };

            // Reserve the worker's execution slot.
            let slot = worker_slot_id(&worker.id);
            if !self.ledger.reserve(&slot, 1.0, task_id).await {
                self.report_contention(&slot, &worker.id, Some(task_id)).await;
                let reason = format!("worker slot {slot} unavailable");
                self.record_defer(task_id, &reason).await;
                return TaskRun::Deferred(reason);
            }

            // Reserve the token budget.
            let estimate = estimate_tokens(&task, &self.config.token_estimate);
            if !self.ledger.reserve(TOKEN_BUDGET_ID, estimate, task_id).await {
                self.ledger.release(&slot, 1.0, task_id).await;
                self.report_contention(TOKEN_BUDGET_ID, &worker.id, Some(task_id)).await;
                let reason = format!("token budget exhausted ({estimate} tokens requested)");
                self.record_defer(task_id, &reason).await;
                return TaskRun::Deferred(reason);
            }
            {
                let mut reservations = self.reservations.lock().await;
                reservations.insert(
                    task_id,
                    HashMap::from([(slot.clone(), 1.0), (TOKEN_BUDGET_ID.to_string(), estimate)]),
                );
            }

            // Dispatch.
            self.monitor
                .update(task_id, |t| {
                    t.set_status(TaskStatus::InProgress);
                    t.assigned_worker = Some(worker.id.clone());
                })
                .await;
            self.adjust_worker_load(&worker.id, 1).await;
            {
                let mut workflows = self.workflows.write().await;
                if let Some(workflow) = workflows.get_mut(&workflow_id) {
                    workflow.participating_workers.insert(worker.id.clone());
                }
            }
            info!(
                task_id = %task_id,
                worker_id = %worker.id,
                attempt,
                "task dispatched"
            );

            let started = Instant::now();
            let timeout = Duration::from_secs(self.config.task_timeout_secs);
            let result =
                tokio::time::timeout(timeout, self.executor.execute(&worker, &task)).await;
            let elapsed = started.elapsed();

            self.ledger.release(&slot, 1.0, task_id).await;
            self.adjust_worker_load(&worker.id, -1).await;

            match result {
                Ok(Ok(outcome)) => {
                    let actual = outcome.tokens_used() as f64;
                    self.ledger.release(TOKEN_BUDGET_ID, actual, task_id).await;
                    self.clear_reservations(task_id).await;

                    let cost = self.config.cost.cost(
                        &worker.model,
                        outcome.tokens_in,
                        outcome.tokens_out,
                        elapsed.as_secs_f64(),
                    );
                    self.monitor
                        .update(task_id, |t| {
                            t.set_status(TaskStatus::Completed);
                            t.result = Some(outcome.output.clone());
                            t.metadata.remove("defer_reason");
                            t.metadata
                                .insert("exec_ms".into(), serde_json::Value::from(elapsed.as_millis() as u64));
                            t.metadata.insert("cost".into(), serde_json::Value::from(cost));
                            t.metadata.insert(
                                "tokens_used".into(),
                                serde_json::Value::from(outcome.tokens_used()),
                            );
                        })
                        .await;
                    {
                        let mut workflows = self.workflows.write().await;
                        if let Some(workflow) = workflows.get_mut(&workflow_id) {
                            workflow.total_cost += cost;
                        }
                    }
                    info!(
                        task_id = %task_id,
                        worker_id = %worker.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        cost,
                        "task completed"
                    );
                    return TaskRun::Completed;
                }
                Ok(Err(e)) => {
                    self.ledger.release(TOKEN_BUDGET_ID, estimate, task_id).await;
                    self.clear_reservations(task_id).await;
                    warn!(
                        task_id = %task_id,
                        worker_id = %worker.id,
                        attempt,
                        error = %e,
                        "task execution failed"
                    );
                    last_failure = Some(e.to_string());
                }
                Err(_) => {
                    self.ledger.release(TOKEN_BUDGET_ID, estimate, task_id).await;
                    self.clear_reservations(task_id).await;
                    let e = TaskforceError::TaskTimeout(task_id);
                    warn!(
                        task_id = %task_id,
                        worker_id = %worker.id,
                        attempt,
                        timeout_secs = self.config.task_timeout_secs,
                        "task timed out"
                    );
                    last_failure = Some(e.to_string());
                }
            }

            // Try once more on a different worker.
            excluded.insert(worker.id.clone());
            self.monitor
                .update(task_id, |t| {
                    t.set_status(TaskStatus::Pending);
                    t.assigned_worker = None;
                })
                .await;
        }

        let reason = last_failure.unwrap_or_else(|| "execution failed".to_string());
        self.record_defer(task_id, &reason).await;
        TaskRun::Failed(reason)
    }

    /// Record why a task could not run; it stays `Pending` for a later
    /// pass or manual intervention.
    async fn record_defer(&self, task_id: Uuid, reason: &str) {
        self.monitor
            .update(task_id, |t| {
                if t.status == TaskStatus::InProgress {
                    t.set_status(TaskStatus::Pending);
                }
                t.metadata.insert(
                    "defer_reason".to_string(),
                    serde_json::Value::String(reason.to_string()),
                );
            })
            .await;
    }

    async fn clear_reservations(&self, task_id: Uuid) {
        let mut reservations = self.reservations.lock().await;
        reservations.remove(&task_id);
    }

    /// Report contention over a ledger entry to the negotiation manager.
    /// The engine only detects and reports; resolution belongs to the
    /// manager.
    async fn report_contention(&self, resource_id: &str, initiator: &str, task_id: Option<Uuid>) {
        let holders = self.ledger.reserving_tasks(resource_id).await;
        if holders.is_empty() {
            return;
        }
        let mut involved: Vec<String> = Vec::new();
        for holder in &holders {
            if let Some(task) = self.monitor.get(*holder).await {
                if let Some(worker) = task.assigned_worker {
                    involved.push(worker);
                }
            }
        }

        let state = self
            .negotiations
            .start(resource_id, initiator, involved)
            .await;
        let mut task_ids = holders;
        task_ids.extend(task_id);
        self.negotiations
            .add_message(
                state.id,
                Envelope::new(
                    "orchestrator",
                    initiator,
                    Payload::ConflictDetected {
                        resource_id: resource_id.to_string(),
                        task_ids,
                    },
                ),
            )
            .await;
    }

    /// Workflow failure path: the blocking task and every in-progress
    /// sibling become `Failed`, their reservations are released, and the
    /// workflow terminates.
    async fn fail_workflow(&self, workflow_id: Uuid, blocking_task: Uuid, reason: &str) {
        let task_ids = {
            let mut workflows = self.workflows.write().await;
            let Some(workflow) = workflows.get_mut(&workflow_id) else {
                return;
            };
            workflow.status = WorkflowStatus::Failed;
            workflow.completed_at = Some(Utc::now());
            workflow.task_ids.clone()
        };

        for id in task_ids {
            let Some(task) = self.monitor.get(id).await else {
                continue;
            };
            if id == blocking_task || task.status == TaskStatus::InProgress {
                self.monitor
                    .update(id, |t| {
                        t.set_status(TaskStatus::Failed);
                        t.metadata.insert(
                            "failure_reason".to_string(),
                            serde_json::Value::String(reason.to_string()),
                        );
                    })
                    .await;
                let amounts = {
                    let mut reservations = self.reservations.lock().await;
                    reservations.remove(&id).unwrap_or_default()
                };
                self.ledger.release_all_for(id, &amounts).await;
            }
        }
        error!(workflow_id = %workflow_id, reason = %reason, "workflow failed");
    }

    /// Compute the workflow's terminal (or still-open) status from its
    /// tasks and update the stored record.
    async fn finalize(&self, workflow_id: Uuid, task_ids: &[Uuid], start: Instant) -> WorkflowReport {
        let tasks = self.monitor.get_all(task_ids).await;
        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
        let pending = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Paused))
            .count();

        let mut workflows = self.workflows.write().await;
        let status = if let Some(workflow) = workflows.get_mut(&workflow_id) {
            if workflow.status == WorkflowStatus::Cancelled {
                // cancelled mid-run; leave as is
            } else if failed > 0 {
                workflow.status = WorkflowStatus::Failed;
                workflow.completed_at = Some(Utc::now());
            } else if completed == tasks.len() {
                workflow.status = WorkflowStatus::Completed;
                workflow.completed_at = Some(Utc::now());
            } else {
                // Unrunnable tasks remain; the workflow stays open rather
                // than falsely reporting completion.
                workflow.status = WorkflowStatus::InProgress;
            }
            workflow.status
        } else {
            WorkflowStatus::Failed
        };
        let total_cost = workflows
            .get(&workflow_id)
            .map_or(0.0, |w| w.total_cost);

        WorkflowReport {
            workflow_id,
            status,
            total_tasks: tasks.len(),
            completed_tasks: completed,
            failed_tasks: failed,
            pending_tasks: pending,
            total_cost,
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }

    // ── Lifecycle operations ─────────────────────────────────────────────

    /// Cancel a workflow. Irreversible: the workflow and its pending,
    /// paused, and in-progress tasks become `Cancelled`, and every
    /// reservation those tasks still hold is released.
    pub async fn cancel(&self, workflow_id: Uuid) -> TaskforceResult<()> {
        let task_ids = {
            let mut workflows = self.workflows.write().await;
            let workflow = workflows
                .get_mut(&workflow_id)
                .ok_or_else(|| TaskforceError::Workflow(format!("unknown workflow {workflow_id}")))?;
            if workflow.status.is_terminal() {
                return Err(TaskforceError::Workflow(format!(
                    "workflow {workflow_id} is already {:?}",
                    workflow.status
                )));
            }
            workflow.status = WorkflowStatus::Cancelled;
            workflow.completed_at = Some(Utc::now());
            workflow.task_ids.clone()
        };

        for id in task_ids {
            let Some(task) = self.monitor.get(id).await else {
                continue;
            };
            if matches!(
                task.status,
                TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Paused
            ) {
                self.monitor
                    .update(id, |t| t.set_status(TaskStatus::Cancelled))
                    .await;
                let amounts = {
                    let mut reservations = self.reservations.lock().await;
                    reservations.remove(&id).unwrap_or_default()
                };
                self.ledger.release_all_for(id, &amounts).await;
            }
        }
        info!(workflow_id = %workflow_id, "workflow cancelled");
        Ok(())
    }

    /// Pause a workflow's pending tasks. Running tasks finish normally.
    pub async fn pause(&self, workflow_id: Uuid) -> TaskforceResult<()> {
        self.flip_tasks(workflow_id, TaskStatus::Pending, TaskStatus::Paused)
            .await
    }

    /// Resume a paused workflow's tasks.
    pub async fn resume(&self, workflow_id: Uuid) -> TaskforceResult<()> {
        self.flip_tasks(workflow_id, TaskStatus::Paused, TaskStatus::Pending)
            .await
    }

    async fn flip_tasks(
        &self,
        workflow_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> TaskforceResult<()> {
        let task_ids = {
            let workflows = self.workflows.read().await;
            let workflow = workflows
                .get(&workflow_id)
                .ok_or_else(|| TaskforceError::Workflow(format!("unknown workflow {workflow_id}")))?;
            if workflow.status.is_terminal() {
                return Err(TaskforceError::Workflow(format!(
                    "workflow {workflow_id} is already {:?}",
                    workflow.status
                )));
            }
            workflow.task_ids.clone()
        };
        for id in task_ids {
            self.monitor
                .update(id, |t| {
                    if t.status == from {
                        t.set_status(to);
                    }
                })
                .await;
        }
        Ok(())
    }

    // ── Status reporting ─────────────────────────────────────────────────

    /// Point-in-time workflow view for API/UI consumers.
    pub async fn workflow_status(&self, workflow_id: Uuid) -> TaskforceResult<WorkflowStatusReport> {
        let workflow = {
            let workflows = self.workflows.read().await;
            workflows
                .get(&workflow_id)
                .cloned()
                .ok_or_else(|| TaskforceError::Workflow(format!("unknown workflow {workflow_id}")))?
        };
        let tasks = self.monitor.get_all(&workflow.task_ids).await;
        let total = tasks.len();
        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
        let running = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count();

        Ok(WorkflowStatusReport {
            id: workflow.id,
            status: workflow.status,
            progress: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64
            },
            total_tasks: total,
            completed_tasks: completed,
            failed_tasks: failed,
            running_tasks: running,
            total_cost: workflow.total_cost,
            created_at: workflow.created_at,
            started_at: workflow.started_at,
            completed_at: workflow.completed_at,
        })
    }

    /// Per-task views for every task in a workflow, in submission order.
    pub async fn workflow_tasks(
        &self,
        workflow_id: Uuid,
    ) -> TaskforceResult<Vec<TaskStatusReport>> {
        let task_ids = {
            let workflows = self.workflows.read().await;
            workflows
                .get(&workflow_id)
                .map(|w| w.task_ids.clone())
                .ok_or_else(|| TaskforceError::Workflow(format!("unknown workflow {workflow_id}")))?
        };
        let mut reports = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            reports.push(self.task_status(id).await?);
        }
        Ok(reports)
    }

    /// Point-in-time task view.
    pub async fn task_status(&self, task_id: Uuid) -> TaskforceResult<TaskStatusReport> {
        let task = self
            .monitor
            .get(task_id)
            .await
            .ok_or_else(|| TaskforceError::Workflow(format!("unknown task {task_id}")))?;
        Ok(TaskStatusReport {
            id: task.id,
            status: task.status,
            assigned_worker: task.assigned_worker.clone(),
            elapsed_ms: task.metadata.get("exec_ms").and_then(serde_json::Value::as_u64),
            cost: task.metadata.get("cost").and_then(serde_json::Value::as_f64),
            result: task.result.clone(),
            error: task
                .metadata
                .get("defer_reason")
                .or_else(|| task.metadata.get("failure_reason"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        })
    }

    /// Consume an external task-execution result callback, updating the
    /// task registry, the owning workflow's cost, and the token budget.
    pub async fn handle_report(&self, report: ExecutionReport) -> TaskforceResult<()> {
        // Validate the status before touching anything.
        TaskStatus::from_str(&report.status)
            .map_err(|e| TaskforceError::Workflow(format!("invalid execution report: {e}")))?;

        let details = report.error.as_deref().or(report.output.as_deref());
        self.monitor
            .apply_status_update(report.task_id, &report.status, details)
            .await?;
        if let Some(output) = &report.output {
            let output = output.clone();
            self.monitor
                .update(report.task_id, |t| t.result = Some(output))
                .await;
        }

        self.ledger
            .release(TOKEN_BUDGET_ID, report.tokens_used as f64, report.task_id)
            .await;

        let mut workflows = self.workflows.write().await;
        if let Some(workflow) = workflows
            .values_mut()
            .find(|w| w.task_ids.contains(&report.task_id))
        {
            workflow.total_cost += report.cost;
        }
        Ok(())
    }

    /// Route an inbound worker message. The match is exhaustive over every
    /// message kind, so adding a payload variant without handling it here
    /// fails to compile.
    pub async fn handle_envelope(&self, envelope: Envelope) -> TaskforceResult<()> {
        match &envelope.payload {
            Payload::StatusUpdate {
                task_id,
                status,
                details,
            } => {
                self.monitor
                    .apply_status_update(*task_id, status, details.as_deref())
                    .await
            }
            Payload::NegotiationRequest { negotiation_id, .. }
            | Payload::NegotiationResponse { negotiation_id, .. } => {
                let id = *negotiation_id;
                self.negotiations.add_message(id, envelope).await;
                Ok(())
            }
            Payload::ResolutionFound {
                negotiation_id,
                resolution,
            } => {
                self.negotiations
                    .resolve(*negotiation_id, resolution.clone())
                    .await;
                Ok(())
            }
            Payload::ConflictDetected { resource_id, .. } => {
                let resource_id = resource_id.clone();
                self.report_contention(&resource_id, &envelope.header.sender_id, None)
                    .await;
                Ok(())
            }
            Payload::TaskDecompositionResponse {
                task_id,
                subtask_titles,
            } => {
                let titles = subtask_titles.clone();
                let known = self
                    .monitor
                    .update(*task_id, |t| {
                        t.subtasks
                            .extend(titles.iter().map(crate::types::SubTask::new));
                    })
                    .await;
                if !known {
                    return Err(TaskforceError::Workflow(format!(
                        "decomposition response for unknown task {task_id}"
                    )));
                }
                Ok(())
            }
            Payload::Feedback { task_id, content } => {
                let content = content.clone();
                self.monitor
                    .update(*task_id, |t| {
                        t.metadata
                            .insert("feedback".to_string(), serde_json::Value::String(content));
                    })
                    .await;
                Ok(())
            }
            Payload::DataRequest { .. } | Payload::DataResponse { .. } => {
                // Data exchange flows between workers; the orchestrator
                // only observes it.
                info!(
                    kind = %envelope.header.kind,
                    sender = %envelope.header.sender_id,
                    "data message observed"
                );
                Ok(())
            }
            Payload::TaskAssignment { .. } | Payload::TaskDecompositionRequest { .. } => {
                // Orchestrator-originated kinds are never valid inbound.
                warn!(
                    kind = %envelope.header.kind,
                    sender = %envelope.header.sender_id,
                    "unexpected inbound message kind"
                );
                Err(TaskforceError::Workflow(format!(
                    "message kind {} is not accepted by the orchestrator",
                    envelope.header.kind
                )))
            }
        }
    }

    // ── Background tick ──────────────────────────────────────────────────

    /// Spawn the periodic orchestration tick: sweeps negotiation timeouts,
    /// prunes terminal negotiations and retention-expired workflows, and
    /// warns on high resource utilization.
    pub fn spawn_tick_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.tick_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    /// One orchestration tick. Public so embedders with their own loop can
    /// drive it directly.
    pub async fn tick(&self) {
        self.negotiations.sweep_timeouts().await;
        self.negotiations.prune().await;
        self.prune_workflows().await;
        self.rescan_stalled().await;

        for entry in self.ledger.snapshot().await {
            let utilization = entry.utilization();
            if utilization >= self.config.utilization_warn_threshold {
                warn!(
                    resource = %entry.id,
                    utilization,
                    "resource utilization above threshold"
                );
            }
        }
    }

    /// Re-drive open workflows that still have pending tasks but nothing
    /// running — tasks deferred by capacity or a missing worker get
    /// re-attempted on the next tick instead of being dropped.
    async fn rescan_stalled(&self) {
        let open: Vec<Uuid> = {
            let workflows = self.workflows.read().await;
            workflows
                .values()
                .filter(|w| w.status == WorkflowStatus::InProgress)
                .map(|w| w.id)
                .collect()
        };
        for id in open {
            let task_ids = {
                let workflows = self.workflows.read().await;
                match workflows.get(&id) {
                    Some(w) => w.task_ids.clone(),
                    None => continue,
                }
            };
            let tasks = self.monitor.get_all(&task_ids).await;
            let has_pending = tasks.iter().any(|t| t.status == TaskStatus::Pending);
            let has_running = tasks.iter().any(|t| t.status == TaskStatus::InProgress);
            if has_pending && !has_running {
                // Errors here mean a concurrent caller picked the workflow
                // up first; that is exactly the desired outcome.
                if let Err(e) = self.run(id).await {
                    info!(workflow_id = %id, reason = %e, "tick rescan skipped workflow");
                }
            }
        }
    }

    /// Drop terminal workflows older than the retention window, together
    /// with their tasks.
    async fn prune_workflows(&self) {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.retention_secs as i64);
        let expired: Vec<(Uuid, Vec<Uuid>)> = {
            let workflows = self.workflows.read().await;
            workflows
                .values()
                .filter(|w| {
                    w.status.is_terminal()
                        && w.completed_at.is_some_and(|done| done < cutoff)
                })
                .map(|w| (w.id, w.task_ids.clone()))
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        let mut workflows = self.workflows.write().await;
        for (id, task_ids) in expired {
            workflows.remove(&id);
            self.monitor.remove_all(&task_ids).await;
            info!(workflow_id = %id, "workflow pruned after retention window");
        }
    }
}
