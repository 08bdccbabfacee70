use crate::types::{Task, TaskStatus};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::warn;
use taskforce_core::{TaskforceError, TaskforceResult};
use uuid::Uuid;

/// Registry of every known task, used by the scheduler to check dependency
/// satisfaction and by status callbacks as the fan-in point.
pub struct TaskMonitor {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl TaskMonitor {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a task. Idempotent: a duplicate id warns and leaves the
    /// existing record untouched.
    pub async fn register(&self, task: Task) {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            warn!(task_id = %task.id, "task already registered, ignoring duplicate");
            return;
        }
        tasks.insert(task.id, task);
    }

    /// Apply an externally-reported status update.
    ///
    /// The status string is validated against the closed [`TaskStatus`]
    /// set before anything mutates; unknown task ids and invalid statuses
    /// are reported as errors, never dropped.
    pub async fn apply_status_update(
        &self,
        task_id: Uuid,
        status: &str,
        details: Option<&str>,
    ) -> TaskforceResult<()> {
        let parsed = TaskStatus::from_str(status)
            .map_err(|e| TaskforceError::Workflow(format!("invalid status update: {e}")))?;

        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| TaskforceError::Workflow(format!("unknown task {task_id}")))?;

        task.set_status(parsed);
        if let Some(details) = details {
            task.metadata.insert(
                "status_details".to_string(),
                serde_json::Value::String(details.to_string()),
            );
        }
        Ok(())
    }

    /// Mutate a task in place through `f`. Returns false for unknown ids.
    pub async fn update<F>(&self, task_id: Uuid, f: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task_id) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        }
    }

    /// Snapshot of one task.
    pub async fn get(&self, task_id: Uuid) -> Option<Task> {
        let tasks = self.tasks.read().await;
        tasks.get(&task_id).cloned()
    }

    /// Snapshot of the given tasks, in id order.
    pub async fn get_all(&self, ids: &[Uuid]) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        ids.iter().filter_map(|id| tasks.get(id).cloned()).collect()
    }

    /// Ids of every completed task.
    pub async fn completed_ids(&self) -> HashSet<Uuid> {
        let tasks = self.tasks.read().await;
        tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect()
    }

    /// Whether every dependency of `task` is completed.
    pub async fn dependencies_met(&self, task: &Task) -> bool {
        let tasks = self.tasks.read().await;
        task.dependencies.iter().all(|dep| {
            tasks
                .get(dep)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
    }

    /// Remove tasks by id (workflow garbage collection).
    pub async fn remove_all(&self, ids: &[Uuid]) {
        let mut tasks = self.tasks.write().await;
        for id in ids {
            tasks.remove(id);
        }
    }

    /// Number of registered tasks.
    pub async fn len(&self) -> usize {
        let tasks = self.tasks.read().await;
        tasks.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for TaskMonitor {
    fn default() -> Self {
        Self::new()
    }
}
