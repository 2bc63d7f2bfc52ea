//! Shared data model for the run manager and its collaborators.
//!
//! These types mirror the on-disk JSON shapes described by the filesystem
//! layout: `issue.json`, `tasks.json`, wave artifacts, and run status
//! snapshots. Fields the core doesn't interpret are preserved verbatim via
//! `#[serde(flatten)]` catch-alls so round-tripping a write never drops
//! data another collaborator (the workflow engine, the viewer) depends on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{owner, repo, issueNumber}`, with a canonical `owner/repo#n` string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueRef {
    pub owner: String,
    pub repo: String,
    pub issue_number: u64,
}

impl IssueRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, issue_number: u64) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            issue_number,
        }
    }

    /// The canonical `owner/repo#n` string used in logs and runner args.
    pub fn canonical(&self) -> String {
        format!("{}/{}#{}", self.owner, self.repo, self.issue_number)
    }
}

impl std::fmt::Display for IssueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Status of a single task in `tasks.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Passed,
    Failed,
}

/// One task in the task DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub files_allowed: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub status: TaskStatus,

    /// Fields the core doesn't interpret, preserved for round-tripping.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// `<stateDir>/tasks.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksJson {
    pub schema_version: u32,
    #[serde(default)]
    pub decomposed_from: String,
    pub tasks: Vec<Task>,
}

impl TasksJson {
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn has_more_tasks(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Failed))
    }

    pub fn all_tasks_complete(&self) -> bool {
        !self.tasks.is_empty()
            && self.tasks.iter().all(|t| t.status == TaskStatus::Passed)
    }
}

/// The parallel-wave bookmark recorded on `issue.json.status.parallel`.
///
/// Present iff a wave is actively reserved; the single source of truth for
/// rollback and crash recovery (spec §3 invariants).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelBookmark {
    pub run_id: String,
    pub active_wave_id: String,
    pub active_wave_phase: String,
    pub active_wave_task_ids: Vec<String>,
    pub reserved_status_by_task_id: HashMap<String, TaskStatus>,
    pub reserved_at: DateTime<Utc>,
}

/// Known status flags the core consumes, plus an opaque rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueStatus {
    pub current_task_id: Option<String>,
    pub pre_check_passed: Option<bool>,
    pub task_decomposition_complete: Option<bool>,
    pub task_passed: Option<bool>,
    pub task_failed: Option<bool>,
    pub has_more_tasks: Option<bool>,
    pub all_tasks_complete: Option<bool>,
    pub parallel: Option<ParallelBookmark>,

    /// Flags the core doesn't know about, preserved verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Explicit, operator-issued controls consumed (and cleared) by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueControl {
    #[serde(default)]
    pub restart_phase: bool,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Per-phase task-execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionSettings {
    pub mode: ExecutionMode,
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
}

fn default_max_parallel_tasks() -> usize {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueSettings {
    pub task_execution: Option<TaskExecutionSettings>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// `<stateDir>/issue.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueJson {
    pub repo: String,
    pub issue: IssueNumberField,
    pub branch: String,
    pub workflow: String,
    pub phase: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub settings: IssueSettings,
    #[serde(default)]
    pub control: IssueControl,
    #[serde(default)]
    pub status: IssueStatus,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueNumberField {
    pub number: u64,
}

/// Why a wave ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveReason {
    Ok,
    Timeout,
    SetupFailure,
    Stopped,
}

/// The per-task result a wave produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub status: TaskStatus,
    #[serde(default)]
    pub notes: String,
}

/// Which task phase a wave executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    ImplementTask,
    TaskSpecCheck,
}

impl TaskPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImplementTask => "implement_task",
            Self::TaskSpecCheck => "task_spec_check",
        }
    }

    pub fn done_marker_name(self) -> &'static str {
        match self {
            Self::ImplementTask => "implement_task.done",
            Self::TaskSpecCheck => "task_spec_check.done",
        }
    }
}

/// A wave's outcome, returned to the Run Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveOutcome {
    pub reason: WaveReason,
    pub per_task: HashMap<String, TaskOutcome>,
}

/// `.runs/<runId>/waves/<waveId>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveArtifact {
    pub wave_id: String,
    pub run_id: String,
    pub phase: TaskPhase,
    pub reason: WaveReason,
    pub per_task: HashMap<String, TaskOutcome>,
    pub diagnostics: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Result of merging a worker branch into the canonical branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Ok,
    Conflict,
    OtherFailure(String),
}

/// Snapshot of the Run Manager's lifecycle, persisted to
/// `viewer-run-status.json` when a run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub running: bool,
    pub current_iteration: u64,
    pub max_iterations: u64,
    pub last_error: Option<String>,
    pub completion_reason: Option<String>,
    pub command: Option<String>,
    pub viewer_log_path: Option<String>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            running: false,
            current_iteration: 0,
            max_iterations: 10,
            last_error: None,
            completion_reason: None,
            command: None,
            viewer_log_path: None,
        }
    }
}

/// Event delivered to the caller-supplied broadcast callback.
#[derive(Debug, Clone)]
pub enum BroadcastEvent {
    State {
        issue_ref: IssueRef,
        issue_json: Box<IssueJson>,
        run: RunStatus,
    },
    Run {
        run: RunStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_ref_canonical_form() {
        let r = IssueRef::new("acme", "widgets", 42);
        assert_eq!(r.canonical(), "acme/widgets#42");
        assert_eq!(r.to_string(), "acme/widgets#42");
    }

    #[test]
    fn tasks_json_has_more_tasks() {
        let tasks = TasksJson {
            schema_version: 1,
            decomposed_from: String::new(),
            tasks: vec![
                Task {
                    id: "t1".into(),
                    title: String::new(),
                    summary: String::new(),
                    acceptance_criteria: vec![],
                    files_allowed: vec![],
                    depends_on: vec![],
                    status: TaskStatus::Passed,
                    extra: HashMap::new(),
                },
                Task {
                    id: "t2".into(),
                    title: String::new(),
                    summary: String::new(),
                    acceptance_criteria: vec![],
                    files_allowed: vec![],
                    depends_on: vec![],
                    status: TaskStatus::Pending,
                    extra: HashMap::new(),
                },
            ],
        };
        assert!(tasks.has_more_tasks());
        assert!(!tasks.all_tasks_complete());
    }

    #[test]
    fn issue_json_round_trips_unknown_status_flags() {
        let raw = serde_json::json!({
            "repo": "acme/widgets",
            "issue": {"number": 42},
            "branch": "issue/42",
            "workflow": "default",
            "phase": "hello",
            "status": {
                "taskPassed": true,
                "somethingFromTheFuture": "keep-me"
            }
        });
        let issue: IssueJson = serde_json::from_value(raw).unwrap();
        assert_eq!(issue.status.task_passed, Some(true));
        assert_eq!(
            issue.status.extra.get("somethingFromTheFuture"),
            Some(&Value::String("keep-me".to_string()))
        );

        let back = serde_json::to_value(&issue).unwrap();
        assert_eq!(back["status"]["somethingFromTheFuture"], "keep-me");
    }
}
