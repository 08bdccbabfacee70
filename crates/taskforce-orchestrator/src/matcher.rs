use crate::config::MatcherPolicy;
use crate::types::{Task, Worker, WorkerStatus};
use std::collections::HashSet;

/// Lower-cased alphanumeric tokens of `text`, ignoring fragments shorter
/// than three characters.
fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_lowercase)
        .collect()
}

/// Score a worker against a task. Pure: no side effects, no hidden state,
/// so the same inputs always produce the same score.
///
/// The score is additive:
/// - capability overlap between task title+description tokens and the
///   worker's role/description tokens, weighted by `overlap_weight`;
/// - `tool_superset_bonus` when the worker's tools cover every required
///   tool, plus `tool_match_bonus` per individually matching tool;
/// - `busy_penalty` while the worker is busy, plus `workload_penalty` per
///   task already queued on it;
/// - a model-quality bonus from the configured tier table.
pub fn score(worker: &Worker, task: &Task, policy: &MatcherPolicy) -> f64 {
    let task_tokens = tokenize(&format!("{} {}", task.title, task.description));
    let worker_tokens = tokenize(&format!("{} {}", worker.role, worker.description));
    let overlap = task_tokens.intersection(&worker_tokens).count() as f64;

    let mut total = overlap * policy.overlap_weight;

    let worker_tools: HashSet<&str> = worker.tools.iter().map(String::as_str).collect();
    let matching = task
        .required_tools
        .iter()
        .filter(|t| worker_tools.contains(t.as_str()))
        .count();
    total += matching as f64 * policy.tool_match_bonus;
    if !task.required_tools.is_empty() && matching == task.required_tools.len() {
        total += policy.tool_superset_bonus;
    }

    if worker.status == WorkerStatus::Busy {
        total -= policy.busy_penalty;
    }
    total -= f64::from(worker.workload) * policy.workload_penalty;

    total += model_tier_bonus(&worker.model, policy);

    total
}

/// Tier bonus for a model identifier, via longest-substring lookup in the
/// policy table. Unknown models get no bonus.
fn model_tier_bonus(model: &str, policy: &MatcherPolicy) -> f64 {
    policy
        .model_tiers
        .iter()
        .filter(|(key, _)| model.contains(key.as_str()))
        .max_by_key(|(key, _)| key.len())
        .map_or(0.0, |(_, bonus)| *bonus)
}

/// Pick the highest-scoring eligible worker for `task`.
///
/// Workers with status `Offline` are never returned; workers lacking a
/// required tool are excluded outright, since dispatching to them could
/// only fail. Ties break by first-seen order (strict `>` keeps the
/// earliest maximum), so allocation is deterministic. Returns `None` when
/// no eligible worker exists.
pub fn allocate<'a>(workers: &'a [Worker], task: &Task, policy: &MatcherPolicy) -> Option<&'a Worker> {
    let mut best: Option<(&Worker, f64)> = None;
    for worker in workers {
        if worker.status == WorkerStatus::Offline {
            continue;
        }
        let worker_tools: HashSet<&str> = worker.tools.iter().map(String::as_str).collect();
        if !task
            .required_tools
            .iter()
            .all(|t| worker_tools.contains(t.as_str()))
        {
            continue;
        }
        let s = score(worker, task, policy);
        match best {
            Some((_, top)) if s <= top => {}
            _ => best = Some((worker, s)),
        }
    }
    best.map(|(worker, _)| worker)
}
