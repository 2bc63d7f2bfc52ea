use thiserror::Error;

/// Core error type for the run manager and its collaborators.
#[derive(Error, Debug)]
pub enum CoreError {
    /// An unrecognized provider name was supplied to `start`.
    #[error("invalid provider: {0}")]
    InvalidProvider(String),

    /// An unrecognized model name was resolved for a phase.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// `setIssue` was never called, or the issue it named has no state dir.
    #[error("no issue selected")]
    NoIssueSelected,

    /// `start` was called while a run was already in progress.
    #[error("a run is already in progress")]
    AlreadyRunning,

    /// `issue.json` named a workflow the adapter could not load.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// The issue state directory does not exist on disk.
    #[error("issue state directory missing: {0}")]
    IssueStateMissing(String),

    /// The canonical worktree does not exist on disk.
    #[error("canonical worktree missing: {0}")]
    WorktreeMissing(String),

    /// A JSON state file existed but failed to parse.
    #[error("malformed JSON at {path}: {source}")]
    MalformedJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// A workflow YAML file existed but failed to parse.
    #[error("malformed workflow YAML at {path}: {source}")]
    MalformedWorkflow {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// A git invocation inside the Sandbox Manager returned non-zero.
    #[error("sandbox operation '{op}' failed: {stderr}")]
    Sandbox {
        op: String,
        stdout: String,
        stderr: String,
    },

    /// A child process exceeded one of its deadlines.
    #[error("child timed out ({kind})")]
    ChildTimeout { kind: TimeoutKind },

    /// A child process was terminated by a signal.
    #[error("child terminated by signal {0}")]
    ChildSignal(i32),

    /// A child process exited with a non-zero status.
    #[error("child exited with status {0}")]
    ChildNonZero(i32),

    /// A worker's merge into the canonical branch conflicted.
    #[error("merge conflict for task {task} in wave {wave_id}")]
    MergeConflict { task: String, wave_id: String },

    /// A worker's merge into the canonical branch failed for a non-conflict reason.
    #[error("merge failed for task {task}: {stderr}")]
    MergeFailure { task: String, stderr: String },

    /// I/O failure on a canonical state write, after the single retry.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What kind of deadline a child process exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Inactivity,
    Iteration,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactivity => write!(f, "inactivity"),
            Self::Iteration => write!(f, "iteration"),
        }
    }
}

/// Result alias used at every public function boundary in this crate.
pub type CoreResult<T> = Result<T, CoreError>;
