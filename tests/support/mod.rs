//! Shared fixtures for the end-to-end scenario tests: a temp git repo
//! standing in for the canonical worktree, a workflow YAML fixture, and a
//! tiny shell-script "runner" stand-in spawned via `$PATH`, matching the
//! pack's precedent of filesystem-backed, end-to-end integration tests
//! over unit-level mocking (`tests/test_sandbox_service.rs`).

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use jeeves_core::config::Config;
use jeeves_core::types::{BroadcastEvent, IssueRef};
use tokio::process::Command;

/// A fully wired-up temp environment: `dataDir`, `workflowsDir`,
/// `promptsDir`, and the canonical worktree/state dir for one issue.
pub struct Harness {
    pub data_dir: tempfile::TempDir,
    pub workflows_dir: tempfile::TempDir,
    pub prompts_dir: tempfile::TempDir,
    pub bin_dir: tempfile::TempDir,
    pub issue_ref: IssueRef,
    original_path: String,
}

impl Harness {
    pub async fn new() -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let workflows_dir = tempfile::tempdir().unwrap();
        let prompts_dir = tempfile::tempdir().unwrap();
        let bin_dir = tempfile::tempdir().unwrap();
        let issue_ref = IssueRef::new("acme", "widgets", 1);

        let original_path = std::env::var("PATH").unwrap_or_default();

        Self {
            data_dir,
            workflows_dir,
            prompts_dir,
            bin_dir,
            issue_ref,
            original_path,
        }
    }

    pub fn paths(&self) -> jeeves_core::sandbox::SandboxPaths {
        jeeves_core::sandbox::SandboxPaths::new(
            self.data_dir.path(),
            &self.issue_ref.owner,
            &self.issue_ref.repo,
            self.issue_ref.issue_number,
        )
    }

    /// Prepend `bin_dir` to `PATH` so `Command::new("runner")` resolves to
    /// our fake script. Callers must hold the `env` serial-test lock.
    pub fn activate_fake_runner(&self) {
        let new_path = format!("{}:{}", self.bin_dir.path().display(), self.original_path);
        // SAFETY: test-local PATH mutation under `#[serial_test::serial(env)]`.
        unsafe {
            std::env::set_var("PATH", new_path);
        }
    }

    pub fn restore_path(&self) {
        // SAFETY: same test-local restoration.
        unsafe {
            std::env::set_var("PATH", &self.original_path);
        }
    }

    /// Write an executable shell script named `runner` into `bin_dir`.
    pub fn write_fake_runner(&self, body: &str) {
        let path = self.bin_dir.path().join("runner");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
    }

    pub fn write_workflow(&self, name: &str, yaml: &str) {
        std::fs::write(self.workflows_dir.path().join(format!("{name}.yaml")), yaml).unwrap();
    }

    pub async fn init_canonical_repo(&self) {
        let dir = self.paths().canonical_worktree();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        run_git(&["init", "-q"], &dir).await;
        run_git(&["config", "user.name", "test"], &dir).await;
        run_git(&["config", "user.email", "test@example.com"], &dir).await;
        tokio::fs::write(dir.join("README.md"), b"hello").await.unwrap();
        run_git(&["add", "."], &dir).await;
        run_git(&["commit", "-q", "-m", "init"], &dir).await;
        let branch = self.paths().canonical_branch();
        run_git(&["branch", "-M", &branch], &dir).await;
    }

    /// Create the canonical worktree directory without initializing git in
    /// it, for scenarios that only need the directory to exist (sequential
    /// mode) or that deliberately want every git invocation to fail (setup
    /// failure).
    pub async fn init_bare_worktree_dir(&self) {
        tokio::fs::create_dir_all(self.paths().canonical_worktree()).await.unwrap();
    }

    pub fn state_dir(&self) -> PathBuf {
        self.paths().issue_state_dir()
    }

    pub async fn write_issue_json(&self, issue: &jeeves_core::types::IssueJson) {
        jeeves_core::state_store::write_issue_json(&self.state_dir(), issue).await.unwrap();
    }

    pub async fn write_tasks_json(&self, tasks: &jeeves_core::types::TasksJson) {
        jeeves_core::state_store::write_tasks_json(&self.state_dir(), tasks).await.unwrap();
    }

    pub async fn read_issue_json(&self) -> jeeves_core::types::IssueJson {
        jeeves_core::state_store::read_issue_json(&self.state_dir())
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn read_tasks_json(&self) -> jeeves_core::types::TasksJson {
        jeeves_core::state_store::read_tasks_json(&self.state_dir())
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn viewer_log(&self) -> String {
        tokio::fs::read_to_string(self.state_dir().join("viewer-run.log"))
            .await
            .unwrap_or_default()
    }

    pub fn run_manager(&self) -> (jeeves_core::RunManager, Arc<Mutex<Vec<BroadcastEvent>>>) {
        let events: Arc<Mutex<Vec<BroadcastEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let broadcast = Arc::new(move |event: BroadcastEvent| {
            captured.lock().unwrap().push(event);
        });
        let manager = jeeves_core::RunManager::new(
            self.prompts_dir.path(),
            self.workflows_dir.path(),
            self.data_dir.path(),
            self.data_dir.path(),
            broadcast,
            Config::default(),
        );
        (manager, events)
    }
}

pub fn sample_issue(phase: &str, workflow: &str) -> jeeves_core::types::IssueJson {
    use jeeves_core::types::{IssueControl, IssueJson, IssueNumberField, IssueSettings, IssueStatus};
    IssueJson {
        repo: "acme/widgets".to_string(),
        issue: IssueNumberField { number: 1 },
        branch: "issue/1".to_string(),
        workflow: workflow.to_string(),
        phase: phase.to_string(),
        notes: String::new(),
        settings: IssueSettings::default(),
        control: IssueControl::default(),
        status: IssueStatus::default(),
        extra: Default::default(),
    }
}

pub fn task(id: &str, status: jeeves_core::types::TaskStatus) -> jeeves_core::types::Task {
    jeeves_core::types::Task {
        id: id.to_string(),
        title: String::new(),
        summary: String::new(),
        acceptance_criteria: vec![],
        files_allowed: vec![],
        depends_on: vec![],
        status,
        extra: Default::default(),
    }
}

async fn run_git(args: &[&str], cwd: &Path) {
    let status = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .unwrap();
    assert!(status.status.success(), "git {:?} failed: {}", args, String::from_utf8_lossy(&status.stderr));
}
