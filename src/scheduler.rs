//! Task DAG Scheduler: a pure function over `tasks.json` and a concurrency
//! cap, deciding which tasks are ready to run in the next wave.

use crate::types::{Task, TaskStatus};

/// Tasks eligible for scheduling: `pending` or `failed` (retryable without
/// workflow intervention), with every `dependsOn` id resolved to `passed`.
///
/// Returned in ascending task-id order, capped at `cap`, for deterministic
/// reproduction and testing. `passed` tasks are never returned; a task whose
/// `dependsOn` names an id that isn't in `tasks` at all is permanently
/// un-ready (it will never schedule until the caller fixes the DAG) rather
/// than panicking.
pub fn schedule_ready<'a>(tasks: &'a [Task], cap: usize) -> Vec<&'a Task> {
    let mut ready: Vec<&Task> = tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Failed))
        .filter(|t| dependencies_satisfied(t, tasks))
        .collect();

    ready.sort_by(|a, b| a.id.cmp(&b.id));
    ready.truncate(cap);
    ready
}

fn dependencies_satisfied(task: &Task, tasks: &[Task]) -> bool {
    task.depends_on.iter().all(|dep_id| {
        tasks
            .iter()
            .find(|t| &t.id == dep_id)
            .is_some_and(|t| t.status == TaskStatus::Passed)
    })
}
