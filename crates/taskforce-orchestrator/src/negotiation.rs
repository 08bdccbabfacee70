use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::{info, warn};
use taskforce_core::{Envelope, Payload};
use uuid::Uuid;

/// Lifecycle of a resource dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationStatus {
    Open,
    Resolved,
    Failed,
}

/// One tracked dispute over a shared resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationState {
    pub id: Uuid,
    /// Ledger id of the contested resource.
    pub resource_id: String,
    /// Worker that triggered the dispute.
    pub initiator: String,
    /// All workers party to the dispute (always includes the initiator).
    pub involved: HashSet<String>,
    /// Ordered message history.
    pub messages: Vec<Envelope>,
    pub status: NegotiationStatus,
    /// Human-readable outcome, set on resolution or failure.
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counters exposed for observability dashboards.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NegotiationMetrics {
    pub total: usize,
    pub active: usize,
    pub resolved: usize,
    pub failed: usize,
    /// `resolved / (resolved + failed)`, or 0 with no terminal records.
    pub success_rate: f64,
}

/// Registry of all in-flight resource disputes.
///
/// Explicitly constructed and injected into the orchestrator (one instance
/// per orchestrator), so tests run in isolation without shared global
/// state. The orchestrator only *reports* contention here; resolution is
/// this manager's job alone.
pub struct NegotiationManager {
    negotiations: RwLock<HashMap<Uuid, NegotiationState>>,
    /// Age after which an open negotiation is force-resolved.
    timeout: Duration,
    /// Age after which terminal records are swept out.
    retention: Duration,
}

impl NegotiationManager {
    pub fn new(timeout_secs: u64, retention_secs: u64) -> Self {
        Self {
            negotiations: RwLock::new(HashMap::new()),
            timeout: Duration::seconds(timeout_secs as i64),
            retention: Duration::seconds(retention_secs as i64),
        }
    }

    /// Open a dispute over `resource_id` and immediately attempt automatic
    /// resolution. Heuristics are ordered; the first match wins:
    ///
    /// 1. per-worker resource with at most two parties → time-sharing;
    /// 2. token budget → priority allocation favoring the initiator;
    /// 3. memory/computational pool → load balancing across parties;
    /// 4. otherwise the negotiation stays open awaiting messages.
    pub async fn start(
        &self,
        resource_id: &str,
        initiator: &str,
        involved: Vec<String>,
    ) -> NegotiationState {
        let now = Utc::now();
        let mut parties: HashSet<String> = involved.into_iter().collect();
        parties.insert(initiator.to_string());

        let mut state = NegotiationState {
            id: Uuid::new_v4(),
            resource_id: resource_id.to_string(),
            initiator: initiator.to_string(),
            involved: parties,
            messages: Vec::new(),
            status: NegotiationStatus::Open,
            resolution: None,
            created_at: now,
            updated_at: now,
        };

        if let Some(resolution) = auto_resolve(&state) {
            state.status = NegotiationStatus::Resolved;
            state.resolution = Some(resolution.clone());
            info!(
                negotiation_id = %state.id,
                resource = resource_id,
                resolution = %resolution,
                "negotiation auto-resolved"
            );
        } else {
            info!(
                negotiation_id = %state.id,
                resource = resource_id,
                parties = state.involved.len(),
                "negotiation opened"
            );
        }

        let mut negotiations = self.negotiations.write().await;
        negotiations.insert(state.id, state.clone());
        state
    }

    /// Append a message to a dispute's history, then check the most recent
    /// three messages for an accepting response; acceptance resolves the
    /// dispute naming the accepting party.
    pub async fn add_message(&self, negotiation_id: Uuid, message: Envelope) -> bool {
        let mut negotiations = self.negotiations.write().await;
        let Some(state) = negotiations.get_mut(&negotiation_id) else {
            warn!(negotiation_id = %negotiation_id, "message for unknown negotiation");
            return false;
        };

        state.messages.push(message);
        state.updated_at = Utc::now();

        if state.status != NegotiationStatus::Open {
            return true;
        }

        let accepted_by = state.messages.iter().rev().take(3).find_map(|m| {
            matches!(m.payload, Payload::NegotiationResponse { accept: true, .. })
                .then(|| m.header.sender_id.clone())
        });
        if let Some(sender) = accepted_by {
            state.status = NegotiationStatus::Resolved;
            state.resolution = Some(format!("accepted by {sender}"));
            info!(
                negotiation_id = %negotiation_id,
                accepted_by = %sender,
                "negotiation resolved by agreement"
            );
        }
        true
    }

    /// Terminal, idempotent transition to `Resolved`. Only an `Open`
    /// negotiation moves; anything terminal is left as is.
    pub async fn resolve(&self, negotiation_id: Uuid, resolution: impl Into<String>) {
        let mut negotiations = self.negotiations.write().await;
        if let Some(state) = negotiations.get_mut(&negotiation_id) {
            if state.status == NegotiationStatus::Open {
                state.status = NegotiationStatus::Resolved;
                state.resolution = Some(resolution.into());
                state.updated_at = Utc::now();
            }
        }
    }

    /// Terminal, idempotent transition to `Failed`.
    pub async fn fail(&self, negotiation_id: Uuid, reason: impl Into<String>) {
        let mut negotiations = self.negotiations.write().await;
        if let Some(state) = negotiations.get_mut(&negotiation_id) {
            if state.status == NegotiationStatus::Open {
                state.status = NegotiationStatus::Failed;
                state.resolution = Some(reason.into());
                state.updated_at = Utc::now();
            }
        }
    }

    /// Force-resolve every open negotiation older than the configured
    /// timeout in favor of its initiator. This is a timeout default, not a
    /// negotiated outcome, and is logged as such. Returns the number of
    /// negotiations it closed.
    pub async fn sweep_timeouts(&self) -> usize {
        let cutoff = Utc::now() - self.timeout;
        let mut negotiations = self.negotiations.write().await;
        let mut swept = 0;
        for state in negotiations.values_mut() {
            if state.status == NegotiationStatus::Open && state.created_at < cutoff {
                state.status = NegotiationStatus::Resolved;
                state.resolution =
                    Some(format!("timeout default: allocated to {}", state.initiator));
                state.updated_at = Utc::now();
                swept += 1;
                warn!(
                    negotiation_id = %state.id,
                    resource = %state.resource_id,
                    initiator = %state.initiator,
                    "negotiation timed out, defaulting to initiator"
                );
            }
        }
        swept
    }

    /// Drop terminal records older than the retention window. Returns the
    /// number removed.
    pub async fn prune(&self) -> usize {
        let cutoff = Utc::now() - self.retention;
        let mut negotiations = self.negotiations.write().await;
        let before = negotiations.len();
        negotiations
            .retain(|_, s| s.status == NegotiationStatus::Open || s.updated_at >= cutoff);
        before - negotiations.len()
    }

    /// Open negotiations over `resource_id`.
    pub async fn get_active(&self, resource_id: &str) -> Vec<NegotiationState> {
        let negotiations = self.negotiations.read().await;
        negotiations
            .values()
            .filter(|s| s.status == NegotiationStatus::Open && s.resource_id == resource_id)
            .cloned()
            .collect()
    }

    /// Snapshot of one negotiation.
    pub async fn get(&self, negotiation_id: Uuid) -> Option<NegotiationState> {
        let negotiations = self.negotiations.read().await;
        negotiations.get(&negotiation_id).cloned()
    }

    /// Administrative override: resolve every open dispute on the resource
    /// in favor of `winner`.
    pub async fn force_resolve_all(&self, resource_id: &str, winner: &str) -> usize {
        let mut negotiations = self.negotiations.write().await;
        let mut count = 0;
        for state in negotiations.values_mut() {
            if state.status == NegotiationStatus::Open && state.resource_id == resource_id {
                state.status = NegotiationStatus::Resolved;
                state.resolution = Some(format!("administrative override: allocated to {winner}"));
                state.updated_at = Utc::now();
                count += 1;
            }
        }
        count
    }

    /// Aggregate counters for observability.
    pub async fn metrics(&self) -> NegotiationMetrics {
        let negotiations = self.negotiations.read().await;
        let total = negotiations.len();
        let active = negotiations
            .values()
            .filter(|s| s.status == NegotiationStatus::Open)
            .count();
        let resolved = negotiations
            .values()
            .filter(|s| s.status == NegotiationStatus::Resolved)
            .count();
        let failed = negotiations
            .values()
            .filter(|s| s.status == NegotiationStatus::Failed)
            .count();
        let terminal = resolved + failed;
        NegotiationMetrics {
            total,
            active,
            resolved,
            failed,
            success_rate: if terminal == 0 {
                0.0
            } else {
                resolved as f64 / terminal as f64
            },
        }
    }
}

/// First-match-wins resolution heuristics, keyed off the ledger id naming
/// scheme (`worker:<id>`, `token-budget`, `memory-pool`, `compute-pool`).
fn auto_resolve(state: &NegotiationState) -> Option<String> {
    if state.resource_id.starts_with("worker:") && state.involved.len() <= 2 {
        let mut parties: Vec<&str> = state.involved.iter().map(String::as_str).collect();
        parties.sort_unstable();
        return Some(format!("time-sharing between {}", parties.join(" and ")));
    }
    if state.resource_id.contains("token") {
        return Some(format!(
            "priority allocation: {} holds the budget first",
            state.initiator
        ));
    }
    if state.resource_id.contains("memory") || state.resource_id.contains("compute") {
        return Some("load balancing across involved workers".to_string());
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn manager() -> NegotiationManager {
        NegotiationManager::new(300, 3600)
    }

    fn response(negotiation_id: Uuid, sender: &str, accept: bool) -> Envelope {
        Envelope::new(
            sender,
            "orchestrator",
            Payload::NegotiationResponse {
                negotiation_id,
                accept,
                counter_proposal: None,
            },
        )
    }

    #[tokio::test]
    async fn test_worker_resource_two_parties_time_sharing() {
        let mgr = manager();
        let state = mgr
            .start("worker:alice", "w1", vec!["w2".to_string()])
            .await;
        assert_eq!(state.status, NegotiationStatus::Resolved);
        assert!(state.resolution.unwrap().contains("time-sharing"));
    }

    #[tokio::test]
    async fn test_worker_resource_many_parties_stays_open() {
        let mgr = manager();
        let state = mgr
            .start(
                "worker:alice",
                "w1",
                vec!["w2".to_string(), "w3".to_string()],
            )
            .await;
        assert_eq!(state.status, NegotiationStatus::Open);
    }

    #[tokio::test]
    async fn test_token_budget_favors_initiator() {
        let mgr = manager();
        let state = mgr
            .start("token-budget", "w1", vec!["w2".into(), "w3".into()])
            .await;
        assert_eq!(state.status, NegotiationStatus::Resolved);
        assert!(state.resolution.unwrap().contains("w1"));
    }

    #[tokio::test]
    async fn test_memory_pool_load_balances() {
        let mgr = manager();
        let state = mgr.start("memory-pool", "w1", vec!["w2".into()]).await;
        assert_eq!(state.status, NegotiationStatus::Resolved);
        assert!(state.resolution.unwrap().contains("load balancing"));
    }

    #[tokio::test]
    async fn test_unclassified_resource_stays_open() {
        let mgr = manager();
        let state = mgr
            .start("external-api:billing", "w1", vec!["w2".into(), "w3".into()])
            .await;
        assert_eq!(state.status, NegotiationStatus::Open);
        assert_eq!(mgr.get_active("external-api:billing").await.len(), 1);
    }

    #[tokio::test]
    async fn test_accept_message_resolves() {
        let mgr = manager();
        let state = mgr
            .start("external-api:billing", "w1", vec!["w2".into(), "w3".into()])
            .await;

        mgr.add_message(state.id, response(state.id, "w2", false)).await;
        assert_eq!(mgr.get(state.id).await.unwrap().status, NegotiationStatus::Open);

        mgr.add_message(state.id, response(state.id, "w3", true)).await;
        let resolved = mgr.get(state.id).await.unwrap();
        assert_eq!(resolved.status, NegotiationStatus::Resolved);
        assert!(resolved.resolution.unwrap().contains("w3"));
        assert_eq!(resolved.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_accept_outside_last_three_ignored() {
        let mgr = manager();
        let state = mgr
            .start("external-api:billing", "w1", vec!["w2".into(), "w3".into()])
            .await;

        mgr.add_message(state.id, response(state.id, "w2", true)).await;
        // The accept above resolves immediately; reopen scenario instead:
        // craft a fresh negotiation and bury a stale accept under rejections.
        let state = mgr
            .start("external-api:metrics", "w1", vec!["w2".into(), "w3".into()])
            .await;
        let accept = response(state.id, "w2", true);
        let mut history = vec![
            response(state.id, "w2", false),
            response(state.id, "w3", false),
            response(state.id, "w2", false),
        ];
        // Manually assemble: stale accept first, then three rejections.
        {
            let mut negotiations = mgr.negotiations.write().await;
            let s = negotiations.get_mut(&state.id).unwrap();
            s.messages.push(accept);
            s.messages.append(&mut history);
        }
        // Next message triggers the scan; only the last 3 are inspected.
        mgr.add_message(state.id, response(state.id, "w3", false)).await;
        assert_eq!(mgr.get(state.id).await.unwrap().status, NegotiationStatus::Open);
    }

    #[tokio::test]
    async fn test_timeout_sweep_defaults_to_initiator() {
        let mgr = NegotiationManager::new(0, 3600);
        let state = mgr
            .start("external-api:billing", "w1", vec!["w2".into(), "w3".into()])
            .await;

        // timeout of zero seconds: already expired
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(mgr.sweep_timeouts().await, 1);

        let swept = mgr.get(state.id).await.unwrap();
        assert_eq!(swept.status, NegotiationStatus::Resolved);
        assert!(swept.resolution.unwrap().contains("timeout default"));
    }

    #[tokio::test]
    async fn test_terminal_transitions_idempotent() {
        let mgr = manager();
        let state = mgr
            .start("external-api:billing", "w1", vec!["w2".into(), "w3".into()])
            .await;

        mgr.fail(state.id, "no agreement").await;
        // A later resolve must not flip the terminal state.
        mgr.resolve(state.id, "late agreement").await;

        let final_state = mgr.get(state.id).await.unwrap();
        assert_eq!(final_state.status, NegotiationStatus::Failed);
        assert_eq!(final_state.resolution.unwrap(), "no agreement");
    }

    #[tokio::test]
    async fn test_prune_removes_only_old_terminal() {
        let mgr = NegotiationManager::new(300, 0);
        let resolved = mgr.start("worker:a", "w1", vec!["w2".into()]).await;
        assert_eq!(resolved.status, NegotiationStatus::Resolved);
        let open = mgr
            .start("external-api:billing", "w1", vec!["w2".into(), "w3".into()])
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(mgr.prune().await, 1);
        assert!(mgr.get(resolved.id).await.is_none());
        assert!(mgr.get(open.id).await.is_some());
    }

    #[tokio::test]
    async fn test_force_resolve_all() {
        let mgr = manager();
        let a = mgr
            .start("external-api:billing", "w1", vec!["w2".into(), "w3".into()])
            .await;
        let b = mgr
            .start("external-api:billing", "w2", vec!["w1".into(), "w3".into()])
            .await;

        assert_eq!(mgr.force_resolve_all("external-api:billing", "w3").await, 2);
        for id in [a.id, b.id] {
            let state = mgr.get(id).await.unwrap();
            assert_eq!(state.status, NegotiationStatus::Resolved);
            assert!(state.resolution.unwrap().contains("w3"));
        }
    }

    #[tokio::test]
    async fn test_metrics() {
        let mgr = manager();
        mgr.start("worker:a", "w1", vec!["w2".into()]).await; // resolved
        mgr.start("token-budget", "w1", vec!["w2".into()]).await; // resolved
        let open = mgr
            .start("external-api:billing", "w1", vec!["w2".into(), "w3".into()])
            .await;
        mgr.fail(open.id, "stalled").await;

        let metrics = mgr.metrics().await;
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.resolved, 2);
        assert_eq!(metrics.failed, 1);
        assert!((metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_every_negotiation_terminates() {
        // Even with zero incoming messages, a sweep pass closes every
        // open negotiation once the timeout elapses.
        let mgr = NegotiationManager::new(0, 3600);
        for i in 0..4 {
            mgr.start(
                &format!("external-api:{i}"),
                "w1",
                vec!["w2".into(), "w3".into()],
            )
            .await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        mgr.sweep_timeouts().await;
        let metrics = mgr.metrics().await;
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.resolved + metrics.failed, metrics.total);
    }
}
