//! Sandbox Manager: worker git worktree lifecycle and canonical merges.
//!
//! Every git invocation runs through `tokio::process::Command` with piped
//! stdio, following the pack's precedent for spawning short-lived,
//! fully-captured child processes (`boternity-infra::skill::local_executor`).
//! A non-zero git exit surfaces as a typed [`CoreError::Sandbox`] with the
//! captured stdout/stderr; setup failures are never silently retried here —
//! that decision belongs to the Wave Runner.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::state_store;
use crate::types::{IssueControl, IssueJson, IssueNumberField, IssueSettings, IssueStatus, TasksJson};

/// Paths for a single issue's sandboxes, rooted at `dataDir`.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    data_dir: PathBuf,
    owner: String,
    repo: String,
    issue_number: u64,
}

impl SandboxPaths {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        issue_number: u64,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            owner: owner.into(),
            repo: repo.into(),
            issue_number,
        }
    }

    /// The canonical worktree, on branch `issue/<n>`.
    pub fn canonical_worktree(&self) -> PathBuf {
        self.data_dir
            .join("worktrees")
            .join(&self.owner)
            .join(&self.repo)
            .join(format!("issue-{}", self.issue_number))
    }

    /// The issue's state root: `issue.json`, `tasks.json`, logs, and
    /// `.runs/`. Distinct from the canonical worktree, which holds the
    /// checked-out repository itself.
    pub fn issue_state_dir(&self) -> PathBuf {
        self.data_dir
            .join("state")
            .join(&self.owner)
            .join(&self.repo)
            .join(format!("issue-{}", self.issue_number))
    }

    pub fn canonical_branch(&self) -> String {
        format!("issue/{}", self.issue_number)
    }

    /// A worker's worktree, on branch `issue/<n>-<taskId>`.
    pub fn worker_worktree(&self, run_id: &str, task_id: &str) -> PathBuf {
        self.data_dir
            .join("worktrees")
            .join(&self.owner)
            .join(&self.repo)
            .join(format!("issue-{}-workers", self.issue_number))
            .join(run_id)
            .join(task_id)
    }

    pub fn worker_branch(&self, task_id: &str) -> String {
        format!("issue/{}-{}", self.issue_number, task_id)
    }
}

/// A worker's state directory, symlinked into its worktree as `.jeeves`.
pub fn worker_state_dir(issue_state_dir: &Path, run_id: &str, task_id: &str) -> PathBuf {
    issue_state_dir
        .join(".runs")
        .join(run_id)
        .join("workers")
        .join(task_id)
}

async fn run_git(args: &[&str], cwd: &Path) -> CoreResult<(String, String)> {
    debug!(?args, cwd = %cwd.display(), "git");
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| CoreError::Sandbox {
            op: format!("git {}", args.join(" ")),
            stdout: String::new(),
            stderr: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if output.status.success() {
        Ok((stdout, stderr))
    } else {
        Err(CoreError::Sandbox {
            op: format!("git {}", args.join(" ")),
            stdout,
            stderr,
        })
    }
}

/// Create (or reuse) a worker sandbox: materialize the worktree, seed its
/// state dir with a mirror of the canonical phase/task status, and symlink
/// `.jeeves` into it.
///
/// `force_branch` forces the per-task branch to the issue branch tip before
/// creating the worktree — appropriate for a fresh implement wave. A
/// spec-check wave reusing an implement wave's sandbox passes `false` so it
/// doesn't discard the worker's commits.
pub async fn create_worker_sandbox(
    paths: &SandboxPaths,
    issue_state_dir: &Path,
    run_id: &str,
    task_id: &str,
    canonical_issue: &IssueJson,
    canonical_tasks: &TasksJson,
    force_branch: bool,
) -> CoreResult<PathBuf> {
    let canonical = paths.canonical_worktree();
    let worker_branch = paths.worker_branch(task_id);
    let worker_worktree = paths.worker_worktree(run_id, task_id);

    if force_branch {
        run_git(
            &["branch", "-f", &worker_branch, &paths.canonical_branch()],
            &canonical,
        )
        .await?;
    }

    if !worker_worktree.exists() {
        tokio::fs::create_dir_all(worker_worktree.parent().unwrap()).await?;
        run_git(
            &[
                "worktree",
                "add",
                "--force",
                worker_worktree.to_str().unwrap(),
                &worker_branch,
            ],
            &canonical,
        )
        .await?;
    }

    let state_dir = worker_state_dir(issue_state_dir, run_id, task_id);
    tokio::fs::create_dir_all(&state_dir).await?;

    let mirrored_issue = IssueJson {
        repo: canonical_issue.repo.clone(),
        issue: IssueNumberField {
            number: canonical_issue.issue.number,
        },
        branch: canonical_issue.branch.clone(),
        workflow: canonical_issue.workflow.clone(),
        phase: canonical_issue.phase.clone(),
        notes: canonical_issue.notes.clone(),
        settings: IssueSettings::default(),
        control: IssueControl::default(),
        status: IssueStatus::default(),
        extra: Default::default(),
    };
    state_store::write_issue_json(&state_dir, &mirrored_issue).await?;
    state_store::write_tasks_json(&state_dir, canonical_tasks).await?;

    let symlink_path = worker_worktree.join(".jeeves");
    if !symlink_path.exists() {
        #[cfg(unix)]
        tokio::fs::symlink(&state_dir, &symlink_path).await?;
    }

    Ok(worker_worktree)
}

/// Tear down a worker sandbox. Tolerates remnants: `git worktree remove
/// --force` failure falls back to pruning, and either way this function
/// never fails the caller's wave.
pub async fn destroy_worker_sandbox(paths: &SandboxPaths, run_id: &str, task_id: &str) {
    let canonical = paths.canonical_worktree();
    let worker_worktree = paths.worker_worktree(run_id, task_id);

    if run_git(
        &["worktree", "remove", "--force", worker_worktree.to_str().unwrap()],
        &canonical,
    )
    .await
    .is_err()
    {
        let _ = run_git(&["worktree", "prune"], &canonical).await;
        let _ = tokio::fs::remove_dir_all(&worker_worktree).await;
    }
}

/// Merge a worker's branch into the canonical branch.
///
/// On conflict, the canonical worktree is restored with `git merge
/// --abort` before returning [`crate::types::MergeResult::Conflict`].
pub async fn merge_worker_into_canonical(
    paths: &SandboxPaths,
    task_id: &str,
    config: &Config,
) -> CoreResult<crate::types::MergeResult> {
    use crate::types::MergeResult;

    let canonical = paths.canonical_worktree();
    let worker_branch = paths.worker_branch(task_id);

    run_git(
        &["config", "user.name", &config.sandbox.merge_author_name],
        &canonical,
    )
    .await?;
    run_git(
        &["config", "user.email", &config.sandbox.merge_author_email],
        &canonical,
    )
    .await?;

    match run_git(&["merge", "--no-ff", "--no-edit", &worker_branch], &canonical).await {
        Ok(_) => Ok(MergeResult::Ok),
        Err(CoreError::Sandbox { stdout, stderr, .. }) => {
            let _ = run_git(&["merge", "--abort"], &canonical).await;
            if stdout.contains("CONFLICT") || stderr.contains("CONFLICT") {
                Ok(MergeResult::Conflict)
            } else {
                Ok(MergeResult::OtherFailure(stderr))
            }
        }
        Err(e) => Err(e),
    }
}
