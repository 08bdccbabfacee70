use crate::config::TokenEstimatePolicy;
use crate::types::{ResourceEntry, Task};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bookkeeping for named capacity pools (worker slots, token budget,
/// memory).
///
/// The ledger is the single source of truth for capacity: no component may
/// mutate `allocated` except through [`reserve`](Self::reserve) and
/// [`release`](Self::release). One mutex guards the whole table, so
/// reserve/release pairs on the same resource are applied atomically and
/// `allocated` can never go negative or over capacity.
pub struct ResourceLedger {
    entries: Mutex<HashMap<String, ResourceEntry>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Construct a ledger pre-populated with `entries`.
    pub fn with_entries(entries: Vec<ResourceEntry>) -> Self {
        Self {
            entries: Mutex::new(entries.into_iter().map(|e| (e.id.clone(), e)).collect()),
        }
    }

    /// Add or replace a ledger entry.
    pub async fn register(&self, entry: ResourceEntry) {
        let mut entries = self.entries.lock().await;
        entries.insert(entry.id.clone(), entry);
    }

    /// Remove an entry, returning it if present.
    pub async fn deregister(&self, resource_id: &str) -> Option<ResourceEntry> {
        let mut entries = self.entries.lock().await;
        entries.remove(resource_id)
    }

    /// Try to reserve `amount` units for `task_id`.
    ///
    /// Succeeds only when `allocated + amount <= capacity`; on failure
    /// nothing is mutated and the caller decides how to recover (defer,
    /// negotiate). Reserving against an unknown resource also fails.
    pub async fn reserve(&self, resource_id: &str, amount: f64, task_id: Uuid) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(resource_id) else {
            warn!(resource = resource_id, "reserve against unknown resource");
            return false;
        };

        if entry.allocated + amount > entry.capacity {
            debug!(
                resource = resource_id,
                requested = amount,
                allocated = entry.allocated,
                capacity = entry.capacity,
                "reservation rejected"
            );
            return false;
        }

        entry.allocated += amount;
        entry.reserved_by.insert(task_id);
        true
    }

    /// Release `amount` units held by `task_id`.
    ///
    /// `amount` is the task's *actual* recorded usage, which may differ
    /// from the original reservation; `allocated` is clamped at zero.
    pub async fn release(&self, resource_id: &str, amount: f64, task_id: Uuid) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(resource_id) else {
            warn!(resource = resource_id, "release against unknown resource");
            return;
        };
        entry.allocated = (entry.allocated - amount).max(0.0);
        entry.reserved_by.remove(&task_id);
    }

    /// Drop every reservation held by `task_id`, releasing the given
    /// amounts per resource. Resources the task holds but that are absent
    /// from `amounts` release zero units (the slot membership still clears).
    pub async fn release_all_for(&self, task_id: Uuid, amounts: &HashMap<String, f64>) {
        let mut entries = self.entries.lock().await;
        for entry in entries.values_mut() {
            if entry.reserved_by.remove(&task_id) {
                let amount = amounts.get(&entry.id).copied().unwrap_or(0.0);
                entry.allocated = (entry.allocated - amount).max(0.0);
            }
        }
    }

    /// `allocated / capacity` for the entry, or 0 when unknown.
    pub async fn utilization(&self, resource_id: &str) -> f64 {
        let entries = self.entries.lock().await;
        entries.get(resource_id).map_or(0.0, ResourceEntry::utilization)
    }

    /// Tasks currently holding a reservation on the entry.
    pub async fn reserving_tasks(&self, resource_id: &str) -> Vec<Uuid> {
        let entries = self.entries.lock().await;
        entries
            .get(resource_id)
            .map(|e| e.reserved_by.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether more than one task holds a reservation on the entry.
    pub async fn contended(&self, resource_id: &str) -> bool {
        let entries = self.entries.lock().await;
        entries.get(resource_id).is_some_and(|e| e.reserved_by.len() > 1)
    }

    /// Snapshot of every entry, for observability.
    pub async fn snapshot(&self) -> Vec<ResourceEntry> {
        let entries = self.entries.lock().await;
        entries.values().cloned().collect()
    }

    /// Snapshot of one entry.
    pub async fn get(&self, resource_id: &str) -> Option<ResourceEntry> {
        let entries = self.entries.lock().await;
        entries.get(resource_id).cloned()
    }
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Estimate the token cost of a task: a fixed base plus linear terms in
/// description length, required-tool count, and subtask count. Coefficients
/// live in [`TokenEstimatePolicy`], not here.
pub fn estimate_tokens(task: &Task, policy: &TokenEstimatePolicy) -> f64 {
    policy.base_tokens
        + policy.per_description_char * task.description.len() as f64
        + policy.per_tool * task.required_tools.len() as f64
        + policy.per_subtask * task.subtasks.len() as f64
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::ResourceKind;

    #[tokio::test]
    async fn test_reserve_within_capacity() {
        let ledger = ResourceLedger::new();
        ledger
            .register(ResourceEntry::new("pool", ResourceKind::Memory, 100.0))
            .await;

        let task = Uuid::new_v4();
        assert!(ledger.reserve("pool", 60.0, task).await);
        assert!((ledger.utilization("pool").await - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_reserve_over_capacity_mutates_nothing() {
        let ledger = ResourceLedger::new();
        ledger
            .register(ResourceEntry::new("pool", ResourceKind::Memory, 100.0))
            .await;

        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        assert!(ledger.reserve("pool", 80.0, t1).await);
        assert!(!ledger.reserve("pool", 30.0, t2).await);

        let entry = ledger.get("pool").await.unwrap();
        assert_eq!(entry.allocated, 80.0);
        assert!(!entry.reserved_by.contains(&t2));
    }

    #[tokio::test]
    async fn test_release_clamps_at_zero() {
        let ledger = ResourceLedger::new();
        ledger
            .register(ResourceEntry::new("pool", ResourceKind::TokenBudget, 100.0))
            .await;

        let task = Uuid::new_v4();
        assert!(ledger.reserve("pool", 40.0, task).await);
        // Actual usage reported higher than the reservation.
        ledger.release("pool", 75.0, task).await;

        let entry = ledger.get("pool").await.unwrap();
        assert_eq!(entry.allocated, 0.0);
        assert!(entry.reserved_by.is_empty());
    }

    #[tokio::test]
    async fn test_conservation_over_sequence() {
        let ledger = ResourceLedger::new();
        ledger
            .register(ResourceEntry::new("pool", ResourceKind::Computational, 10.0))
            .await;

        let tasks: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for t in &tasks {
            ledger.reserve("pool", 2.0, *t).await;
            let entry = ledger.get("pool").await.unwrap();
            assert!(entry.allocated >= 0.0 && entry.allocated <= entry.capacity);
        }
        // Pool is full; the next reservation must fail.
        assert!(!ledger.reserve("pool", 1.0, Uuid::new_v4()).await);

        for t in &tasks {
            ledger.release("pool", 2.0, *t).await;
            let entry = ledger.get("pool").await.unwrap();
            assert!(entry.allocated >= 0.0 && entry.allocated <= entry.capacity);
        }
        assert_eq!(ledger.get("pool").await.unwrap().allocated, 0.0);
    }

    #[tokio::test]
    async fn test_unknown_resource_rejected() {
        let ledger = ResourceLedger::new();
        assert!(!ledger.reserve("nope", 1.0, Uuid::new_v4()).await);
        assert_eq!(ledger.utilization("nope").await, 0.0);
    }

    #[tokio::test]
    async fn test_contended_detection() {
        let ledger = ResourceLedger::new();
        ledger
            .register(ResourceEntry::new("pool", ResourceKind::Memory, 10.0))
            .await;

        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        ledger.reserve("pool", 1.0, t1).await;
        assert!(!ledger.contended("pool").await);
        ledger.reserve("pool", 1.0, t2).await;
        assert!(ledger.contended("pool").await);
        assert_eq!(ledger.reserving_tasks("pool").await.len(), 2);
    }

    #[tokio::test]
    async fn test_release_all_for_task() {
        let ledger = ResourceLedger::new();
        ledger
            .register(ResourceEntry::new("a", ResourceKind::Worker, 1.0))
            .await;
        ledger
            .register(ResourceEntry::new("b", ResourceKind::TokenBudget, 100.0))
            .await;

        let task = Uuid::new_v4();
        ledger.reserve("a", 1.0, task).await;
        ledger.reserve("b", 50.0, task).await;

        let amounts = HashMap::from([("a".to_string(), 1.0), ("b".to_string(), 50.0)]);
        ledger.release_all_for(task, &amounts).await;

        assert_eq!(ledger.get("a").await.unwrap().allocated, 0.0);
        assert_eq!(ledger.get("b").await.unwrap().allocated, 0.0);
        assert!(ledger.reserving_tasks("a").await.is_empty());
    }

    #[test]
    fn test_estimate_tokens_linear_terms() {
        let policy = TokenEstimatePolicy::default();
        let bare = Task::new("t", "");
        assert_eq!(estimate_tokens(&bare, &policy), policy.base_tokens);

        let mut rich = Task::new("t", "x".repeat(100))
            .with_required_tools(vec!["a".into(), "b".into()]);
        rich.subtasks.push(crate::types::SubTask::new("s"));

        let expected = policy.base_tokens
            + policy.per_description_char * 100.0
            + policy.per_tool * 2.0
            + policy.per_subtask;
        assert!((estimate_tokens(&rich, &policy) - expected).abs() < 1e-9);
    }
}
