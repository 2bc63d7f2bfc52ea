//! Run Manager: the top-level public contract. Owns one run at a time for
//! a selected issue, driving the workflow's phase graph to completion by
//! repeatedly invoking the runner (sequentially or as a parallel wave) and
//! reconciling its effect on canonical state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::child_supervisor::{self, Deadlines};
use crate::completion;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::sandbox::SandboxPaths;
use crate::state_store::{self, append_viewer_log};
use crate::types::{BroadcastEvent, IssueJson, IssueRef, RunStatus, TaskExecutionSettings, WaveReason};
use crate::wave_runner::{self, WaveContext, WaveRequest};
use crate::workflow;

/// Parameters accepted by [`RunManager::start`], before normalization.
#[derive(Debug, Clone, Default)]
pub struct StartParams {
    pub provider: String,
    pub workflow_override: Option<String>,
    pub max_iterations: Option<f64>,
    pub inactivity_timeout_sec: Option<f64>,
    pub iteration_timeout_sec: Option<f64>,
    /// Caps the run at a single iteration regardless of `max_iterations`.
    pub quick: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopParams {
    pub force: bool,
}

struct Inner {
    issue_ref: Option<IssueRef>,
    running: bool,
    stop_token: Option<CancellationToken>,
    status: RunStatus,
}

pub struct RunManager {
    prompts_dir: PathBuf,
    workflows_dir: PathBuf,
    #[allow(dead_code)]
    repo_root: PathBuf,
    data_dir: PathBuf,
    broadcast: Arc<dyn Fn(BroadcastEvent) + Send + Sync>,
    config: Config,
    inner: AsyncMutex<Inner>,
}

impl RunManager {
    pub fn new(
        prompts_dir: impl Into<PathBuf>,
        workflows_dir: impl Into<PathBuf>,
        repo_root: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        broadcast: Arc<dyn Fn(BroadcastEvent) + Send + Sync>,
        config: Config,
    ) -> Self {
        Self {
            prompts_dir: prompts_dir.into(),
            workflows_dir: workflows_dir.into(),
            repo_root: repo_root.into(),
            data_dir: data_dir.into(),
            broadcast,
            config,
            inner: AsyncMutex::new(Inner {
                issue_ref: None,
                running: false,
                stop_token: None,
                status: RunStatus::default(),
            }),
        }
    }

    fn paths_for(&self, issue_ref: &IssueRef) -> SandboxPaths {
        SandboxPaths::new(&self.data_dir, &issue_ref.owner, &issue_ref.repo, issue_ref.issue_number)
    }

    /// Select the issue this manager operates on. Validates that the issue
    /// state directory and canonical worktree both exist.
    pub async fn set_issue(&self, issue_ref: IssueRef) -> CoreResult<()> {
        let paths = self.paths_for(&issue_ref);
        let state_dir = paths.issue_state_dir();
        if state_store::read_issue_json(&state_dir).await?.is_none() {
            return Err(CoreError::IssueStateMissing(state_dir.display().to_string()));
        }
        if !paths.canonical_worktree().exists() {
            return Err(CoreError::WorktreeMissing(paths.canonical_worktree().display().to_string()));
        }

        let issue_json = state_store::read_issue_json(&state_dir).await?.unwrap();
        {
            let mut inner = self.inner.lock().await;
            inner.issue_ref = Some(issue_ref.clone());
        }
        self.broadcast_state(&issue_ref, issue_json).await;
        Ok(())
    }

    pub async fn get_status(&self) -> RunStatus {
        self.inner.lock().await.status.clone()
    }

    /// Cooperative (`force: false`) or forceful (`force: true`) stop. A
    /// duplicate stop is a no-op.
    pub async fn stop(&self, params: StopParams) {
        let inner = self.inner.lock().await;
        if let Some(token) = &inner.stop_token {
            token.cancel();
        }
        let _ = params.force; // escalation to SIGKILL happens inside the child supervisor's own grace window
    }

    /// Begin the run loop for the currently selected issue. Fails with
    /// [`CoreError::AlreadyRunning`] if a run is already in progress.
    pub async fn start(&self, params: StartParams) -> CoreResult<()> {
        let issue_ref = {
            let inner = self.inner.lock().await;
            inner.issue_ref.clone().ok_or(CoreError::NoIssueSelected)?
        };

        if !workflow::KNOWN_PROVIDERS.contains(&params.provider.as_str()) {
            return Err(CoreError::InvalidProvider(params.provider));
        }

        let max_iterations = if params.quick {
            1
        } else {
            normalize_max_iterations(params.max_iterations, self.config.run.default_max_iterations)
        };
        let inactivity_timeout = normalize_timeout_secs(
            params.inactivity_timeout_sec,
            self.config.run.default_inactivity_timeout_secs,
        );
        let iteration_timeout = normalize_timeout_secs(
            params.iteration_timeout_sec,
            self.config.run.default_iteration_timeout_secs,
        );

        let stop_token = CancellationToken::new();
        {
            let mut inner = self.inner.lock().await;
            if inner.running {
                return Err(CoreError::AlreadyRunning);
            }
            inner.running = true;
            inner.stop_token = Some(stop_token.clone());
            inner.status = RunStatus {
                running: true,
                current_iteration: 0,
                max_iterations,
                last_error: None,
                completion_reason: None,
                command: Some(params.provider.clone()),
                viewer_log_path: Some(
                    self.paths_for(&issue_ref)
                        .issue_state_dir()
                        .join("viewer-run.log")
                        .display()
                        .to_string(),
                ),
            };
        }
        self.broadcast_run().await;

        let run_id = uuid::Uuid::new_v4().to_string();
        self.run_loop(
            &issue_ref,
            &params,
            &run_id,
            max_iterations,
            Deadlines {
                inactivity: Duration::from_secs(inactivity_timeout),
                iteration: Duration::from_secs(iteration_timeout),
            },
            stop_token,
        )
        .await;

        {
            let mut inner = self.inner.lock().await;
            inner.running = false;
            inner.stop_token = None;
            inner.status.running = false;
        }
        self.broadcast_run().await;
        Ok(())
    }

    async fn run_loop(
        &self,
        issue_ref: &IssueRef,
        params: &StartParams,
        run_id: &str,
        max_iterations: u64,
        deadlines: Deadlines,
        stop_token: CancellationToken,
    ) {
        let paths = self.paths_for(issue_ref);
        let state_dir = paths.issue_state_dir();
        let log_path = state_dir.join("viewer-run.log");
        let run_started = std::time::Instant::now();

        // A bookmark from a different (now-dead) run means the process that
        // owned it crashed mid-wave; there are no live children to join, so
        // roll it back before this run's first iteration touches state.
        let max_iterations = match wave_runner::recover_crashed_wave(&state_dir, run_id, &log_path).await {
            Ok(_) => max_iterations,
            Err(e) => {
                self.update_status(|s| s.last_error = Some(e.to_string())).await;
                0
            }
        };

        for i in 1..=max_iterations {
            {
                let mut inner = self.inner.lock().await;
                inner.status.current_iteration = i;
            }

            if stop_token.is_cancelled() {
                let _ = append_viewer_log(&log_path, "[STOP] stop requested before iteration start").await;
                self.update_status(|s| s.completion_reason = Some("stopped".to_string())).await;
                break;
            }

            let issue = match state_store::read_issue_json(&state_dir).await {
                Ok(Some(v)) => v,
                Ok(None) => {
                    self.update_status(|s| s.last_error = Some("issue state missing".to_string())).await;
                    break;
                }
                Err(e) => {
                    self.update_status(|s| s.last_error = Some(e.to_string())).await;
                    break;
                }
            };

            let workflow_name = params.workflow_override.clone().unwrap_or_else(|| issue.workflow.clone());
            let workflow = match workflow::load_workflow(&workflow_name, &self.workflows_dir).await {
                Ok(w) => w,
                Err(e) => {
                    self.update_status(|s| s.last_error = Some(e.to_string())).await;
                    break;
                }
            };

            if workflow::is_terminal(&workflow, &issue.phase) {
                self.update_status(|s| {
                    s.completion_reason = Some(format!("already in terminal phase: {}", issue.phase))
                })
                .await;
                break;
            }

            let phase = match workflow.phase(&issue.phase) {
                Some(p) => p.clone(),
                None => {
                    self.update_status(|s| s.last_error = Some(format!("unknown phase: {}", issue.phase))).await;
                    break;
                }
            };

            let provider = match workflow::resolve_provider(&phase, &workflow, &params.provider) {
                Ok(p) => p,
                Err(e) => {
                    self.update_status(|s| s.last_error = Some(e.to_string())).await;
                    break;
                }
            };
            let model = workflow::resolve_model(&phase, &workflow);

            let mut issue = issue;
            let mut skip_transition = false;

            if issue.control.restart_phase {
                issue.control.restart_phase = false;
                if let Err(e) = state_store::write_issue_json(&state_dir, &issue).await {
                    self.update_status(|s| s.last_error = Some(e.to_string())).await;
                    break;
                }
                skip_transition = true;
            }

            if issue.phase == "implement_task" {
                if let Ok(Some(mut tasks)) = state_store::read_tasks_json(&state_dir).await {
                    if auto_expand_files_allowed(&mut tasks) {
                        let _ = state_store::write_tasks_json(&state_dir, &tasks).await;
                    }
                }
            }

            if matches!(issue.phase.as_str(), "design_plan" | "design_draft" | "design_edit") {
                match handle_design_doc_commit(&paths.canonical_worktree(), issue_ref.issue_number, &issue.phase).await
                {
                    Ok(DesignDocOutcome::Committed) => {
                        issue.phase = "design_review".to_string();
                        if let Err(e) = state_store::write_issue_json(&state_dir, &issue).await {
                            self.update_status(|s| s.last_error = Some(e.to_string())).await;
                            break;
                        }
                        let _ = append_viewer_log(
                            &log_path,
                            &format!("[CHECKPOINT] committed design doc for issue #{}", issue_ref.issue_number),
                        )
                        .await;
                        // `phase`/`provider`/`model` above were resolved for the old
                        // design_plan/design_draft/design_edit phase; restart the
                        // iteration so design_review resolves its own.
                        continue;
                    }
                    Ok(DesignDocOutcome::OtherStagedChanges) => {
                        self.update_status(|s| {
                            s.last_error = Some(
                                "Refusing to auto-commit design doc with other staged changes present".to_string(),
                            )
                        })
                        .await;
                        break;
                    }
                    Ok(DesignDocOutcome::NotApplicable) => {}
                    Err(e) => {
                        self.update_status(|s| s.last_error = Some(e.to_string())).await;
                        break;
                    }
                }
            }

            let parallel = matches!(issue.phase.as_str(), "implement_task" | "task_spec_check")
                && issue
                    .settings
                    .task_execution
                    .as_ref()
                    .map(|t| t.mode == crate::types::ExecutionMode::Parallel)
                    .unwrap_or(false);

            if parallel {
                let cap = issue
                    .settings
                    .task_execution
                    .as_ref()
                    .map(|t: &TaskExecutionSettings| t.max_parallel_tasks)
                    .unwrap_or(1);
                let task_phase = if issue.phase == "implement_task" {
                    crate::types::TaskPhase::ImplementTask
                } else {
                    crate::types::TaskPhase::TaskSpecCheck
                };
                let ctx = WaveContext {
                    workflow_name: workflow_name.clone(),
                    provider: provider.clone(),
                    model: model.clone(),
                    workflows_dir: self.workflows_dir.clone(),
                    prompts_dir: self.prompts_dir.clone(),
                    data_dir: self.data_dir.clone(),
                    issue_ref: issue_ref.canonical(),
                };
                let request = WaveRequest {
                    phase: task_phase,
                    run_id: run_id.to_string(),
                    wave_index: u32::try_from(i).unwrap_or(u32::MAX),
                    cap,
                    deadlines,
                };
                let _ = append_viewer_log(
                    &log_path,
                    &format!("[PARALLEL] starting wave for phase {}", issue.phase),
                )
                .await;

                let outcome =
                    match wave_runner::run_wave(&ctx, &paths, &state_dir, &self.config, request, stop_token.clone())
                        .await
                    {
                        Ok(o) => o,
                        Err(e) => {
                            self.update_status(|s| s.last_error = Some(e.to_string())).await;
                            break;
                        }
                    };

                match outcome.reason {
                    WaveReason::Timeout => {
                        crate::metrics::record_iteration(&provider, "timeout");
                        self.update_status(|s| s.last_error = Some("parallel wave timed out".to_string())).await;
                        break;
                    }
                    WaveReason::SetupFailure => {
                        crate::metrics::record_iteration(&provider, "setup_failure");
                        let _ = append_viewer_log(&log_path, "[ERROR] parallel wave setup failure").await;
                        self.update_status(|s| {
                            s.last_error = Some("wave setup failure".to_string());
                            s.completion_reason = Some("setup_failure".to_string());
                        })
                        .await;
                        break;
                    }
                    WaveReason::Stopped => {
                        crate::metrics::record_iteration(&provider, "stopped");
                        let _ = append_viewer_log(&log_path, "[STOP] skipping phase transition").await;
                        self.update_status(|s| s.completion_reason = Some("stopped".to_string())).await;
                        break;
                    }
                    WaveReason::Ok => {
                        crate::metrics::record_iteration(&provider, "ok");
                    }
                }
            } else {
                let args = vec![
                    "runner".to_string(),
                    "run-phase".to_string(),
                    "--workflow".to_string(),
                    workflow_name.clone(),
                    "--phase".to_string(),
                    issue.phase.clone(),
                    "--provider".to_string(),
                    provider.clone(),
                    "--workflows-dir".to_string(),
                    self.workflows_dir.display().to_string(),
                    "--prompts-dir".to_string(),
                    self.prompts_dir.display().to_string(),
                    "--issue".to_string(),
                    issue_ref.canonical(),
                ];
                let mut env = std::collections::HashMap::new();
                env.insert("JEEVES_DATA_DIR".to_string(), self.data_dir.display().to_string());
                if let Some(model) = &model {
                    env.insert("JEEVES_MODEL".to_string(), model.clone());
                }

                let outcome = match child_supervisor::run_child(
                    &args,
                    &env,
                    &paths.canonical_worktree(),
                    &log_path,
                    &state_dir,
                    deadlines,
                    stop_token.clone(),
                    &self.config,
                )
                .await
                {
                    Ok(o) => o,
                    Err(e) => {
                        self.update_status(|s| s.last_error = Some(e.to_string())).await;
                        break;
                    }
                };

                if let Some(kind) = outcome.timed_out {
                    crate::metrics::record_child_timeout(match kind {
                        crate::error::TimeoutKind::Inactivity => "inactivity",
                        crate::error::TimeoutKind::Iteration => "iteration",
                    });
                    crate::metrics::record_iteration(&provider, "timeout");
                    self.update_status(|s| {
                        s.last_error = Some(format!("child timed out ({kind})"));
                        s.completion_reason = Some("error".to_string());
                    })
                    .await;
                    break;
                }
                if let Some(signal) = outcome.signal {
                    warn!(signal, "child terminated by signal");
                    crate::metrics::record_iteration(&provider, "signaled");
                    self.update_status(|s| {
                        s.last_error = Some(format!(
                            "child terminated by signal {signal} (exit code {})",
                            outcome.exit_code
                        ))
                    })
                    .await;
                } else if outcome.exit_code != 0 {
                    info!(exit_code = outcome.exit_code, "child exited non-zero");
                    crate::metrics::record_iteration(&provider, "nonzero_exit");
                } else {
                    crate::metrics::record_iteration(&provider, "ok");
                }
            }

            if stop_token.is_cancelled() {
                let _ = append_viewer_log(&log_path, "[STOP] skipping phase transition").await;
                self.update_status(|s| s.completion_reason = Some("stopped".to_string())).await;
                break;
            }

            let issue = match state_store::read_issue_json(&state_dir).await {
                Ok(Some(v)) => v,
                _ => {
                    self.update_status(|s| s.last_error = Some("issue state missing after phase execution".to_string()))
                        .await;
                    break;
                }
            };

            let mut issue = issue;
            if !skip_transition {
                if let Some(next) = workflow::next_phase(&workflow, &issue.phase, &issue) {
                    issue.phase = next.clone();
                    if let Err(e) = state_store::write_issue_json(&state_dir, &issue).await {
                        self.update_status(|s| s.last_error = Some(e.to_string())).await;
                        break;
                    }
                    self.broadcast_state(issue_ref, issue.clone()).await;
                    if workflow::is_terminal(&workflow, &next) {
                        self.update_status(|s| s.completion_reason = Some(format!("reached terminal phase: {next}"))).await;
                        break;
                    }
                }
            }

            if let Ok(true) = completion::check_completion(&state_dir, completion::DEFAULT_TAIL).await {
                self.update_status(|s| s.completion_reason = Some("completed_via_promise".to_string())).await;
                break;
            }
        }

        {
            let status = self.get_status().await;
            if status.completion_reason.is_none() && status.last_error.is_none() {
                self.update_status(|s| {
                    s.completion_reason = Some(format!("max_iterations reached ({max_iterations})"))
                })
                .await;
            }
        }

        let final_status = self.get_status().await;
        crate::metrics::record_run_duration(
            completion_reason_label(final_status.completion_reason.as_deref(), final_status.last_error.is_some()),
            run_started.elapsed().as_secs_f64(),
        );

        let status_path = state_dir.join("viewer-run-status.json");
        let _ = state_store::write_json_atomic(&status_path, &final_status).await;
    }

    async fn update_status(&self, f: impl FnOnce(&mut RunStatus)) {
        let mut inner = self.inner.lock().await;
        f(&mut inner.status);
    }

    async fn broadcast_run(&self) {
        let status = self.get_status().await;
        (self.broadcast)(BroadcastEvent::Run { run: status });
    }

    async fn broadcast_state(&self, issue_ref: &IssueRef, issue_json: IssueJson) {
        let status = self.get_status().await;
        (self.broadcast)(BroadcastEvent::State {
            issue_ref: issue_ref.clone(),
            issue_json: Box::new(issue_json),
            run: status,
        });
    }
}

fn normalize_max_iterations(value: Option<f64>, default: u64) -> u64 {
    match value {
        Some(v) if v.is_finite() => (v.floor() as i64).max(1) as u64,
        _ => default,
    }
}

fn normalize_timeout_secs(value: Option<f64>, default: u64) -> u64 {
    match value {
        Some(v) if v.is_finite() && v >= 1.0 => v.floor() as u64,
        _ => default,
    }
}

/// Collapse a free-form `completion_reason` into a bounded label set for the
/// `jeeves_core_run_duration_seconds` metric — the raw string can embed a
/// phase name or iteration count, which would blow up label cardinality.
fn completion_reason_label(completion_reason: Option<&str>, has_error: bool) -> &'static str {
    match completion_reason {
        Some(reason) if reason == "completed_via_promise" => "completed_via_promise",
        Some(reason) if reason == "stopped" => "stopped",
        Some(reason) if reason == "setup_failure" => "setup_failure",
        Some(reason) if reason.starts_with("reached terminal phase") => "terminal_phase",
        Some(reason) if reason.starts_with("max_iterations reached") => "max_iterations",
        Some(reason) if reason.starts_with("already in terminal phase") => "terminal_phase",
        Some(_) if has_error => "error",
        Some(_) => "other",
        None if has_error => "error",
        None => "unknown",
    }
}

fn is_test_path(path: &str) -> bool {
    path.contains(".test.") || path.contains("__tests__/")
}

fn expand_test_variants(path: &str) -> Vec<String> {
    let p = Path::new(path);
    let dir = p.parent().filter(|d| !d.as_os_str().is_empty()).map(|d| d.to_string_lossy().to_string());
    let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let ext = p.extension().and_then(|s| s.to_str()).unwrap_or_default();

    let colocated = match &dir {
        Some(dir) => format!("{dir}/{stem}.test.{ext}"),
        None => format!("{stem}.test.{ext}"),
    };
    let dunder = match &dir {
        Some(dir) => format!("{dir}/__tests__/{stem}.{ext}"),
        None => format!("__tests__/{stem}.{ext}"),
    };
    vec![colocated, dunder]
}

/// Applies the auto-expand `filesAllowed` policy (spec §4.7.2 step 4):
/// every non-test source path gets its co-located and `__tests__/`
/// variants added, if not already present. Returns whether anything
/// changed (so the caller only writes `tasks.json` when needed).
fn auto_expand_files_allowed(tasks: &mut crate::types::TasksJson) -> bool {
    let mut changed = false;
    for task in tasks.tasks.iter_mut() {
        let originals: Vec<String> = task.files_allowed.iter().filter(|p| !is_test_path(p)).cloned().collect();
        for path in originals {
            for variant in expand_test_variants(&path) {
                if !task.files_allowed.contains(&variant) {
                    task.files_allowed.push(variant);
                    changed = true;
                }
            }
        }
    }
    changed
}

enum DesignDocOutcome {
    NotApplicable,
    Committed,
    OtherStagedChanges,
}

async fn handle_design_doc_commit(canonical_worktree: &Path, issue_number: u64, phase: &str) -> CoreResult<DesignDocOutcome> {
    if !matches!(phase, "design_plan" | "design_draft" | "design_edit") {
        return Ok(DesignDocOutcome::NotApplicable);
    }

    let (stdout, _) = run_git(&["diff", "--cached", "--name-only"], canonical_worktree).await?;
    let staged: Vec<&str> = stdout.lines().filter(|l| !l.is_empty()).collect();
    if staged.is_empty() {
        return Ok(DesignDocOutcome::NotApplicable);
    }

    let expected = format!("docs/issue-{issue_number}-design.md");
    if staged.len() == 1 && staged[0] == expected {
        run_git(
            &["commit", "-m", &format!("checkpoint issue #{issue_number} design doc ({phase})")],
            canonical_worktree,
        )
        .await?;
        Ok(DesignDocOutcome::Committed)
    } else {
        Ok(DesignDocOutcome::OtherStagedChanges)
    }
}

async fn run_git(args: &[&str], cwd: &Path) -> CoreResult<(String, String)> {
    let output = tokio::process::Command::new("git")
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
