use crate::types::Task;
use std::collections::{HashMap, HashSet, VecDeque};
use taskforce_core::{TaskforceError, TaskforceResult};
use uuid::Uuid;

/// Validate that every dependency reference points at a task in the set.
fn check_references(tasks: &[Task]) -> TaskforceResult<HashSet<Uuid>> {
    let ids: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();
    for task in tasks {
        for dep in &task.dependencies {
            if !ids.contains(dep) {
                return Err(TaskforceError::Graph(format!(
                    "task '{}' depends on unknown task {dep}",
                    task.title
                )));
            }
        }
    }
    Ok(ids)
}

/// Kahn's algorithm over the dependency graph.
///
/// Returns task ids in an order where every task appears after all of its
/// dependencies. Ties (tasks becoming ready in the same round) keep the
/// slice order, so the result is deterministic. A cycle or a dangling
/// dependency reference fails with [`TaskforceError::Graph`] — never a
/// partial order.
pub fn topo_order(tasks: &[Task]) -> TaskforceResult<Vec<Uuid>> {
    check_references(tasks)?;

    let mut in_degree: HashMap<Uuid, usize> =
        tasks.iter().map(|t| (t.id, t.dependencies.len())).collect();
    let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            dependents.entry(*dep).or_default().push(task.id);
        }
    }

    let mut queue: VecDeque<Uuid> = tasks
        .iter()
        .filter(|t| t.dependencies.is_empty())
        .map(|t| t.id)
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(id) = queue.pop_front() {
        order.push(id);
        if let Some(children) = dependents.get(&id) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }
    }

    if order.len() != tasks.len() {
        return Err(TaskforceError::Graph(format!(
            "dependency cycle detected: {} of {} tasks unreachable",
            tasks.len() - order.len(),
            tasks.len()
        )));
    }

    Ok(order)
}

/// Group tasks into dependency levels for parallel dispatch.
///
/// A task's level is `1 + max(level of each dependency)`, or 0 with no
/// dependencies. `result[n]` holds every task at level `n`, in slice order.
/// Cycles are a graph-validation error, not a level-0 fallback.
pub fn levels(tasks: &[Task]) -> TaskforceResult<Vec<Vec<Uuid>>> {
    let order = topo_order(tasks)?;
    let by_id: HashMap<Uuid, &Task> = tasks.iter().map(|t| (t.id, t)).collect();

    let mut level_of: HashMap<Uuid, usize> = HashMap::new();
    for id in &order {
        let task = by_id[id];
        let level = task
            .dependencies
            .iter()
            .map(|dep| level_of[dep] + 1)
            .max()
            .unwrap_or(0);
        level_of.insert(*id, level);
    }

    let depth = level_of.values().max().map_or(0, |max| max + 1);
    let mut grouped: Vec<Vec<Uuid>> = vec![Vec::new(); depth];
    // Iterate the slice, not the map, to keep submission order within a level.
    for task in tasks {
        grouped[level_of[&task.id]].push(task.id);
    }

    Ok(grouped)
}
