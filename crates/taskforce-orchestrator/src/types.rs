use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task has reached a state it will never leave.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Paused => "paused",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "paused" => Ok(TaskStatus::Paused),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// A unit of work owned by exactly one parent [`Task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub result: Option<String>,
}

impl SubTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: None,
            status: TaskStatus::Pending,
            result: None,
        }
    }
}

/// A schedulable unit of work.
///
/// Mutated only through the orchestrator and task monitor; `set_status` is
/// the single transition path so `completed_at` is set exactly when the
/// task reaches `Completed` or `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Tasks that must reach `Completed` before this one may start.
    pub dependencies: Vec<Uuid>,
    /// Tool names the assigned worker must provide.
    pub required_tools: Vec<String>,
    pub subtasks: Vec<SubTask>,
    pub assigned_worker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub result: Option<String>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            required_tools: Vec::new(),
            subtasks: Vec::new(),
            assigned_worker: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata: HashMap::new(),
            result: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_required_tools(mut self, tools: Vec<String>) -> Self {
        self.required_tools = tools;
        self
    }

    /// Transition to `status`, maintaining the timestamp invariant:
    /// `completed_at` is `Some` iff the task is `Completed` or `Failed`.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        self.completed_at = match status {
            TaskStatus::Completed | TaskStatus::Failed => Some(self.updated_at),
            _ => None,
        };
    }

    /// A task is runnable when it is `Pending` and every dependency is in
    /// `completed_ids`.
    pub fn is_ready(&self, completed_ids: &HashSet<Uuid>) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|dep| completed_ids.contains(dep))
    }
}

/// Availability of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

/// An entity capable of executing tasks, registered with the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub name: String,
    /// Role tag, e.g. "researcher" or "coder".
    pub role: String,
    /// Free-form capability description scored against task text.
    pub description: String,
    pub status: WorkerStatus,
    /// Declared tool capabilities.
    pub tools: Vec<String>,
    /// Declared reasoning-model identifier.
    pub model: String,
    /// Number of tasks currently queued on this worker.
    pub workload: u32,
}

impl Worker {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            description: String::new(),
            status: WorkerStatus::Idle,
            tools: Vec::new(),
            model: String::new(),
            workload: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// Strategy used to drive a workflow's tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
    Adaptive,
}

/// Aggregate lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// A named collection of tasks executed under one scheduling strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub name: String,
    /// Submission order of the member tasks.
    pub task_ids: Vec<Uuid>,
    pub status: WorkflowStatus,
    pub mode: ExecutionMode,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_cost: f64,
    pub participating_workers: HashSet<String>,
    /// Cap on concurrently dispatched tasks in parallel execution.
    #[serde(default)]
    pub max_parallel_tasks: Option<usize>,
}

impl WorkflowExecution {
    pub fn new(name: impl Into<String>, task_ids: Vec<Uuid>, mode: ExecutionMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task_ids,
            status: WorkflowStatus::Pending,
            mode,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_cost: 0.0,
            participating_workers: HashSet::new(),
            max_parallel_tasks: None,
        }
    }
}

/// Kind of capacity tracked by a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Worker,
    Computational,
    Memory,
    TokenBudget,
    ExternalApi,
}

/// One row of the resource ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub id: String,
    pub kind: ResourceKind,
    pub capacity: f64,
    pub allocated: f64,
    /// Tasks currently holding a reservation on this entry.
    pub reserved_by: HashSet<Uuid>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ResourceEntry {
    pub fn new(id: impl Into<String>, kind: ResourceKind, capacity: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            capacity,
            allocated: 0.0,
            reserved_by: HashSet::new(),
            metadata: HashMap::new(),
        }
    }

    /// Fraction of capacity currently allocated.
    pub fn utilization(&self) -> f64 {
        if self.capacity <= 0.0 {
            0.0
        } else {
            self.allocated / self.capacity
        }
    }
}
