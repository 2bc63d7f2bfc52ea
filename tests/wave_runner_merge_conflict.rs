//! Scenario 8 (merge-conflict resumability): a spec-check wave whose worker
//! branch conflicts with canonical on merge must fail the task, leave
//! feedback, clear the bookmark, and — combined with the Workflow Adapter —
//! route the next iteration back to `implement_task`.

mod support;

use std::path::Path;

use jeeves_core::config::Config;
use jeeves_core::sandbox;
use jeeves_core::state_store;
use jeeves_core::types::{TaskPhase, TaskStatus, TasksJson, WaveReason};
use jeeves_core::wave_runner::{self, WaveContext, WaveRequest};
use jeeves_core::workflow::{self, Phase, Transition, Workflow};
use support::{sample_issue, task, Harness};
use tokio_util::sync::CancellationToken;

async fn git(args: &[&str], cwd: &Path) {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .unwrap();
    assert!(output.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&output.stderr));
}

/// The fake `runner` reports success by writing straight into `.jeeves/tasks.json`
/// (symlinked to the worker's state dir), the way the real runner subprocess would
/// after deciding the spec check passed.
const FAKE_SPEC_CHECK_PASS: &str = r#"cat > .jeeves/tasks.json <<'EOF'
{"schemaVersion":1,"decomposedFrom":"","tasks":[{"id":"t1","status":"passed"}]}
EOF
exit 0
"#;

#[tokio::test]
#[serial_test::serial(env)]
async fn spec_check_merge_conflict_fails_task_and_routes_back_to_implement() {
    let harness = Harness::new().await;
    harness.write_fake_runner(FAKE_SPEC_CHECK_PASS);
    harness.activate_fake_runner();
    harness.init_canonical_repo().await;

    let paths = harness.paths();
    let state_dir = harness.state_dir();
    let run_id = "run1";
    let task_id = "t1";

    let canonical_tasks = TasksJson {
        schema_version: 1,
        decomposed_from: String::new(),
        tasks: vec![task(task_id, TaskStatus::Pending)],
    };
    let canonical_issue = sample_issue("task_spec_check", "implement-only");

    // Materialize the worker sandbox (as a prior implement wave would have)
    // and diverge its branch from canonical on the same line.
    let worker_worktree =
        sandbox::create_worker_sandbox(&paths, &state_dir, run_id, task_id, &canonical_issue, &canonical_tasks, true)
            .await
            .unwrap();
    tokio::fs::write(worker_worktree.join("README.md"), "worker change\n").await.unwrap();
    git(&["commit", "-am", "worker edit"], &worker_worktree).await;

    // Advance canonical past the same point so the merge conflicts.
    let canonical_worktree = paths.canonical_worktree();
    tokio::fs::write(canonical_worktree.join("README.md"), "canonical change\n").await.unwrap();
    git(&["commit", "-am", "canonical edit"], &canonical_worktree).await;

    state_store::write_issue_json(&state_dir, &canonical_issue).await.unwrap();
    state_store::write_tasks_json(&state_dir, &canonical_tasks).await.unwrap();

    let ctx = WaveContext {
        workflow_name: "implement-only".to_string(),
        provider: "fake".to_string(),
        model: None,
        workflows_dir: harness.workflows_dir.path().to_path_buf(),
        prompts_dir: harness.prompts_dir.path().to_path_buf(),
        data_dir: harness.data_dir.path().to_path_buf(),
        issue_ref: harness.issue_ref.canonical(),
    };
    let config = Config::default();

    let outcome = wave_runner::run_wave(
        &ctx,
        &paths,
        &state_dir,
        &config,
        WaveRequest {
            phase: TaskPhase::TaskSpecCheck,
            run_id: run_id.to_string(),
            wave_index: 0,
            cap: 4,
            deadlines: jeeves_core::child_supervisor::Deadlines {
                inactivity: std::time::Duration::from_secs(5),
                iteration: std::time::Duration::from_secs(5),
            },
        },
        CancellationToken::new(),
    )
    .await
    .unwrap();

    harness.restore_path();

    assert_eq!(outcome.reason, WaveReason::Ok);
    let task_outcome = outcome.per_task.get(task_id).expect("task t1 classified");
    assert_eq!(task_outcome.status, TaskStatus::Failed);
    assert!(task_outcome.notes.contains("merge conflict"), "notes: {}", task_outcome.notes);

    let issue_after = state_store::read_issue_json(&state_dir).await.unwrap().unwrap();
    assert!(issue_after.status.parallel.is_none());
    assert_eq!(issue_after.status.task_failed, Some(true));
    assert_eq!(issue_after.status.has_more_tasks, Some(true));

    let tasks_after = state_store::read_tasks_json(&state_dir).await.unwrap().unwrap();
    assert_eq!(tasks_after.get(task_id).unwrap().status, TaskStatus::Failed);

    let feedback_path = state_dir.join("task-feedback/t1.md");
    assert!(feedback_path.exists(), "feedback file should be written on conflict");

    let artifact_path = state_dir.join(".runs").join(run_id).join("waves").join("run1-task_spec_check-0.json");
    assert!(artifact_path.exists(), "wave artifact should be written");

    // Resumability: the next nextPhase evaluation sees taskFailed + hasMoreTasks
    // and routes back to implement_task, never getting stuck on task_spec_check.
    let workflow = Workflow {
        name: "implement-only".to_string(),
        default_provider: None,
        default_model: None,
        phases: vec![Phase {
            name: "task_spec_check".to_string(),
            terminal: false,
            provider: None,
            model: None,
            transitions: vec![
                Transition {
                    when: std::collections::HashMap::from([
                        ("taskFailed".to_string(), true),
                        ("hasMoreTasks".to_string(), true),
                    ]),
                    to: "implement_task".to_string(),
                },
                Transition {
                    when: std::collections::HashMap::from([("allTasksComplete".to_string(), true)]),
                    to: "done".to_string(),
                },
            ],
        }],
    };
    let next = workflow::next_phase(&workflow, "task_spec_check", &issue_after);
    assert_eq!(next.as_deref(), Some("implement_task"));
}
