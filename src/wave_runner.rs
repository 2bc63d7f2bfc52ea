//! Wave Runner: executes one parallel wave of a task phase across a set of
//! ready tasks, reconciling the result back into canonical state.
//!
//! Generalizes the teacher's `research_pool.rs` fan-out — spawn one job per
//! unit of work, join all, then reconcile — from a persistent
//! `crossbeam-channel` worker pool into a per-wave `tokio::spawn` fan-out,
//! since a wave's worker count is small and bounded by `cap` rather than by
//! a long-lived job queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::child_supervisor::{self, ChildOutcome, Deadlines};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::sandbox::{self, SandboxPaths};
use crate::scheduler::schedule_ready;
use crate::state_store;
use crate::types::{
    IssueJson, MergeResult, ParallelBookmark, TaskOutcome, TaskPhase, TaskStatus, TasksJson,
    WaveArtifact, WaveOutcome, WaveReason,
};

/// Everything the wave needs to assemble a runner invocation, constant
/// across every task in the wave.
#[derive(Debug, Clone)]
pub struct WaveContext {
    pub workflow_name: String,
    pub provider: String,
    pub model: Option<String>,
    pub workflows_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub data_dir: PathBuf,
    pub issue_ref: String,
}

/// A single wave's request parameters (spec §4.6.1).
#[derive(Debug, Clone)]
pub struct WaveRequest {
    pub phase: TaskPhase,
    pub run_id: String,
    pub wave_index: u32,
    pub cap: usize,
    pub deadlines: Deadlines,
}

fn run_phase_argv(ctx: &WaveContext, phase: TaskPhase) -> Vec<String> {
    vec![
        "runner".to_string(),
        "run-phase".to_string(),
        "--workflow".to_string(),
        ctx.workflow_name.clone(),
        "--phase".to_string(),
        phase.as_str().to_string(),
        "--provider".to_string(),
        ctx.provider.clone(),
        "--workflows-dir".to_string(),
        ctx.workflows_dir.display().to_string(),
        "--prompts-dir".to_string(),
        ctx.prompts_dir.display().to_string(),
        "--issue".to_string(),
        ctx.issue_ref.clone(),
    ]
}

fn child_env(ctx: &WaveContext) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("JEEVES_DATA_DIR".to_string(), ctx.data_dir.display().to_string());
    if let Some(model) = &ctx.model {
        env.insert("JEEVES_MODEL".to_string(), model.clone());
    }
    env
}

/// What a single task's execution produced, before classification.
struct TaskRun {
    task_id: String,
    setup_failed: bool,
    outcome: Option<ChildOutcome>,
    worker_status: Option<TaskStatus>,
}

/// Run one wave to completion: reserve, execute, classify, reconcile.
///
/// `canonical_state_dir` is the issue's state root (holds `issue.json`,
/// `tasks.json`, and `.runs/<runId>/`); `paths` locates the git worktrees.
pub async fn run_wave(
    ctx: &WaveContext,
    paths: &SandboxPaths,
    canonical_state_dir: &Path,
    config: &Config,
    request: WaveRequest,
    stop_token: CancellationToken,
) -> CoreResult<WaveOutcome> {
    let mut issue = state_store::read_issue_json(canonical_state_dir)
        .await?
        .ok_or_else(|| CoreError::IssueStateMissing(canonical_state_dir.display().to_string()))?;
    let mut tasks = state_store::read_tasks_json(canonical_state_dir)
        .await?
        .ok_or_else(|| CoreError::IssueStateMissing(canonical_state_dir.display().to_string()))?;

    let (wave_id, task_ids, reserved_status) = match resume_bookmark(&issue, &request.run_id) {
        Some(bookmark) => {
            info!(wave_id = %bookmark.active_wave_id, "resuming crashed wave");
            (
                bookmark.active_wave_id.clone(),
                bookmark.active_wave_task_ids.clone(),
                bookmark.reserved_status_by_task_id.clone(),
            )
        }
        None => {
            let ready = schedule_ready(&tasks.tasks, request.cap);
            if ready.is_empty() {
                return Ok(WaveOutcome {
                    reason: WaveReason::Ok,
                    per_task: HashMap::new(),
                });
            }
            let task_ids: Vec<String> = ready.iter().map(|t| t.id.clone()).collect();
            let reserved_status: HashMap<String, TaskStatus> = ready
                .iter()
                .map(|t| (t.id.clone(), t.status))
                .collect();
            let wave_id = format!("{}-{}-{}", request.run_id, request.phase.as_str(), request.wave_index);

            for id in &task_ids {
                if let Some(task) = tasks.get_mut(id) {
                    task.status = TaskStatus::InProgress;
                }
            }
            issue.status.parallel = Some(ParallelBookmark {
                run_id: request.run_id.clone(),
                active_wave_id: wave_id.clone(),
                active_wave_phase: request.phase.as_str().to_string(),
                active_wave_task_ids: task_ids.clone(),
                reserved_status_by_task_id: reserved_status.clone(),
                reserved_at: Utc::now(),
            });

            state_store::write_tasks_json(canonical_state_dir, &tasks).await?;
            state_store::write_issue_json(canonical_state_dir, &issue).await?;

            (wave_id, task_ids, reserved_status)
        }
    };

    let started_at = Utc::now();
    let wave_cancel = stop_token.child_token();

    let runs = join_all(task_ids.iter().map(|task_id| {
        execute_task(
            ctx,
            paths,
            canonical_state_dir,
            config,
            &request,
            task_id.clone(),
            &issue,
            &tasks,
            wave_cancel.clone(),
        )
    }))
    .await;

    let stopped = stop_token.is_cancelled();
    let any_timed_out = runs.iter().any(|r| {
        r.outcome
            .as_ref()
            .is_some_and(|o| o.timed_out.is_some())
    });
    let any_setup_failed = runs.iter().any(|r| r.setup_failed);

    let reason = if stopped {
        WaveReason::Stopped
    } else if any_timed_out {
        WaveReason::Timeout
    } else if any_setup_failed {
        WaveReason::SetupFailure
    } else {
        WaveReason::Ok
    };

    let mut per_task = HashMap::new();
    let mut diagnostics = Vec::new();

    match reason {
        WaveReason::Stopped | WaveReason::SetupFailure => {
            for id in &task_ids {
                if let Some(task) = tasks.get_mut(id) {
                    task.status = reserved_status.get(id).copied().unwrap_or(TaskStatus::Pending);
                }
                sandbox::destroy_worker_sandbox(paths, &request.run_id, id).await;
            }
            if reason == WaveReason::SetupFailure {
                diagnostics.push("one or more worker sandboxes failed to set up".to_string());
                warn!(wave_id = %wave_id, "wave setup failure; reserved tasks rolled back");
            }
        }
        WaveReason::Timeout => {
            for id in &task_ids {
                if let Some(task) = tasks.get_mut(id) {
                    task.status = TaskStatus::Failed;
                }
                per_task.insert(
                    id.clone(),
                    TaskOutcome {
                        status: TaskStatus::Failed,
                        notes: "wave timed out".to_string(),
                    },
                );
                sandbox::destroy_worker_sandbox(paths, &request.run_id, id).await;
            }
        }
        WaveReason::Ok => {
            for run in &runs {
                let outcome = classify_task(paths, canonical_state_dir, config, &request, &wave_id, run).await?;
                // An implement-task sandbox whose task passed must survive: a
                // following task_spec_check wave reuses it (see
                // `create_worker_sandbox`'s `force_branch=false` reuse path).
                // A spec-check wave always ends that task's sandbox lifecycle,
                // except on merge conflict, where the sandbox is left in place
                // for inspection.
                if request.phase == TaskPhase::TaskSpecCheck && !outcome.notes.starts_with("merge conflict") {
                    sandbox::destroy_worker_sandbox(paths, &request.run_id, &run.task_id).await;
                }
                if let Some(task) = tasks.get_mut(&run.task_id) {
                    task.status = outcome.status;
                }
                per_task.insert(run.task_id.clone(), outcome);
            }
        }
    }

    issue.status.parallel = None;
    if reason == WaveReason::Ok {
        issue.status.task_passed = Some(per_task.values().any(|o| o.status == TaskStatus::Passed));
        issue.status.task_failed = Some(per_task.values().any(|o| o.status == TaskStatus::Failed));
    }
    issue.status.has_more_tasks = Some(tasks.has_more_tasks());
    issue.status.all_tasks_complete = Some(tasks.all_tasks_complete());

    state_store::write_tasks_json(canonical_state_dir, &tasks).await?;
    state_store::write_issue_json(canonical_state_dir, &issue).await?;

    let ended_at = Utc::now();
    let wave_seconds = (ended_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
    crate::metrics::record_wave(request.phase.as_str(), wave_reason_label(reason), wave_seconds);

    let artifact = WaveArtifact {
        wave_id: wave_id.clone(),
        run_id: request.run_id.clone(),
        phase: request.phase,
        reason,
        per_task: per_task.clone(),
        diagnostics,
        started_at,
        ended_at,
    };
    let artifact_path = canonical_state_dir
        .join(".runs")
        .join(&request.run_id)
        .join("waves")
        .join(format!("{wave_id}.json"));
    state_store::write_json_atomic(&artifact_path, &artifact).await?;

    Ok(WaveOutcome { reason, per_task })
}

fn wave_reason_label(reason: WaveReason) -> &'static str {
    match reason {
        WaveReason::Ok => "ok",
        WaveReason::Timeout => "timeout",
        WaveReason::SetupFailure => "setup_failure",
        WaveReason::Stopped => "stopped",
    }
}

/// `issue.json.status.parallel`, if present and owned by this run.
fn resume_bookmark<'a>(issue: &'a IssueJson, run_id: &str) -> Option<&'a ParallelBookmark> {
    issue
        .status
        .parallel
        .as_ref()
        .filter(|b| b.run_id == run_id)
}

/// Reconnect recovery (spec §4.7.5): a fresh process starting a run may find
/// `status.parallel` left over from a wave whose process tree no longer
/// exists (it belongs to a different, now-dead, `runId`). There are no live
/// children to join, so the wave is treated as crashed: every reserved task
/// rolls back to its pre-reservation status, the bookmark is cleared, and the
/// caller proceeds as if no wave had ever started.
///
/// A bookmark whose `run_id` matches `current_run_id` is left untouched —
/// that is an in-progress wave of *this* run, handled by `resume_bookmark`.
pub async fn recover_crashed_wave(
    canonical_state_dir: &Path,
    current_run_id: &str,
    log_path: &Path,
) -> CoreResult<Option<String>> {
    let Some(mut issue) = state_store::read_issue_json(canonical_state_dir).await? else {
        return Ok(None);
    };
    let Some(bookmark) = issue.status.parallel.clone() else {
        return Ok(None);
    };
    if bookmark.run_id == current_run_id {
        return Ok(None);
    }

    if let Some(mut tasks) = state_store::read_tasks_json(canonical_state_dir).await? {
        for id in &bookmark.active_wave_task_ids {
            if let Some(task) = tasks.get_mut(id) {
                task.status = bookmark.reserved_status_by_task_id.get(id).copied().unwrap_or(TaskStatus::Pending);
            }
        }
        state_store::write_tasks_json(canonical_state_dir, &tasks).await?;
    }

    issue.status.parallel = None;
    state_store::write_issue_json(canonical_state_dir, &issue).await?;

    let line = format!("[PARALLEL] recovered crashed wave {}", bookmark.active_wave_id);
    let _ = state_store::append_viewer_log(log_path, &line).await;
    warn!(wave_id = %bookmark.active_wave_id, "recovered crashed wave on reconnect");

    Ok(Some(bookmark.active_wave_id))
}

#[allow(clippy::too_many_arguments)]
async fn execute_task(
    ctx: &WaveContext,
    paths: &SandboxPaths,
    canonical_state_dir: &Path,
    config: &Config,
    request: &WaveRequest,
    task_id: String,
    canonical_issue: &IssueJson,
    canonical_tasks: &TasksJson,
    cancel: CancellationToken,
) -> TaskRun {
    let force_branch = request.phase == TaskPhase::ImplementTask;
    let worker_worktree = match sandbox::create_worker_sandbox(
        paths,
        canonical_state_dir,
        &request.run_id,
        &task_id,
        canonical_issue,
        canonical_tasks,
        force_branch,
    )
    .await
    {
        Ok(path) => path,
        Err(e) => {
            warn!(task = %task_id, error = %e, "worker sandbox setup failed");
            return TaskRun {
                task_id,
                setup_failed: true,
                outcome: None,
                worker_status: None,
            };
        }
    };

    let worker_state_dir = sandbox::worker_state_dir(canonical_state_dir, &request.run_id, &task_id);
    let done_marker = worker_state_dir.join(request.phase.done_marker_name());

    let outcome = if tokio::fs::metadata(&done_marker).await.is_ok() {
        None
    } else {
        let args = run_phase_argv(ctx, request.phase);
        let env = child_env(ctx);
        let log_path = canonical_state_dir.join("viewer-run.log");
        match child_supervisor::run_child(
            &args,
            &env,
            &worker_worktree,
            &log_path,
            &worker_state_dir,
            request.deadlines,
            cancel,
            config,
        )
        .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(task = %task_id, error = %e, "failed to spawn worker child");
                return TaskRun {
                    task_id,
                    setup_failed: true,
                    outcome: None,
                    worker_status: None,
                };
            }
        }
    };

    let worker_status = state_store::read_tasks_json(&worker_state_dir)
        .await
        .ok()
        .flatten()
        .and_then(|t| t.get(&task_id).map(|t| t.status));

    TaskRun {
        task_id,
        setup_failed: false,
        outcome,
        worker_status,
    }
}

async fn classify_task(
    paths: &SandboxPaths,
    canonical_state_dir: &Path,
    config: &Config,
    request: &WaveRequest,
    wave_id: &str,
    run: &TaskRun,
) -> CoreResult<TaskOutcome> {
    let worker_passed = run.worker_status == Some(TaskStatus::Passed);

    if request.phase == TaskPhase::ImplementTask {
        return Ok(TaskOutcome {
            status: if worker_passed { TaskStatus::Passed } else { TaskStatus::Failed },
            notes: String::new(),
        });
    }

    if !worker_passed {
        return Ok(TaskOutcome {
            status: TaskStatus::Failed,
            notes: "task-spec-check worker did not report success".to_string(),
        });
    }

    match sandbox::merge_worker_into_canonical(paths, &run.task_id, config).await? {
        MergeResult::Ok => Ok(TaskOutcome {
            status: TaskStatus::Passed,
            notes: String::new(),
        }),
        MergeResult::Conflict => {
            crate::metrics::record_merge_conflict(request.phase.as_str());
            write_feedback(
                canonical_state_dir,
                &run.task_id,
                wave_id,
                &format!(
                    "Merging the work for task {} conflicted with canonical. See wave artifact `{wave_id}.json` and retry `implement_task`.",
                    run.task_id
                ),
            )
            .await?;
            Ok(TaskOutcome {
                status: TaskStatus::Failed,
                notes: format!("merge conflict (wave {wave_id})"),
            })
        }
        MergeResult::OtherFailure(stderr) => Ok(TaskOutcome {
            status: TaskStatus::Failed,
            notes: format!("merge failed: {stderr}"),
        }),
    }
}

async fn write_feedback(canonical_state_dir: &Path, task_id: &str, wave_id: &str, message: &str) -> CoreResult<()> {
    let path = canonical_state_dir
        .join("task-feedback")
        .join(format!("{task_id}.md"));
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(&path, format!("# Feedback for {task_id}\n\nwave: {wave_id}\n\n{message}\n")).await?;
    Ok(())
}
