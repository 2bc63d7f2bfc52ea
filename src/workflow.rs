//! Workflow Adapter: a thin facade over the declarative workflow engine.
//!
//! The engine itself — loading arbitrary YAML and evaluating transitions —
//! is "given" (out of scope); this module defines the minimal phase-graph
//! schema the adapter needs to answer `nextPhase`/`isTerminal` and to
//! resolve a phase's provider/model, and nothing more.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::IssueJson;

/// A single phase in a workflow's phase graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

/// A transition out of a phase: if every flag named in `when` matches the
/// current `issue.json.status` (missing flags count as `false`), `to` is
/// the next phase. Transitions are evaluated in file order; first match
/// wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default)]
    pub when: HashMap<String, bool>,
    pub to: String,
}

/// A loaded workflow: its name, phase-graph, and run-level defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    pub phases: Vec<Phase>,
}

impl Workflow {
    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }
}

/// Providers the run manager recognizes; an unrecognized provider fails
/// fast before any child is spawned.
pub const KNOWN_PROVIDERS: &[&str] = &["claude", "fake", "codex"];

/// Load a workflow by name from `<workflowsDir>/<name>.yaml`.
pub async fn load_workflow(name: &str, workflows_dir: &Path) -> CoreResult<Workflow> {
    let path = workflows_dir.join(format!("{name}.yaml"));
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| CoreError::UnknownWorkflow(name.to_string()))?;
    let workflow: Workflow = serde_yaml::from_str(&content).map_err(|source| CoreError::MalformedWorkflow {
        path: path.display().to_string(),
        source,
    })?;
    Ok(workflow)
}

/// Whether `phase` is terminal in `workflow`. A phase name absent from the
/// workflow is treated as non-terminal (the caller's `nextPhase` evaluation
/// will already have failed earlier if the phase is truly unknown).
pub fn is_terminal(workflow: &Workflow, phase: &str) -> bool {
    workflow.phase(phase).is_some_and(|p| p.terminal)
}

/// Evaluate the next phase for `current_phase` given the issue's current
/// status flags. Returns `None` if no transition matches (the phase is kept
/// as-is by the caller) or if the phase doesn't exist in this workflow.
pub fn next_phase(workflow: &Workflow, current_phase: &str, issue_json: &IssueJson) -> Option<String> {
    let phase = workflow.phase(current_phase)?;
    for transition in &phase.transitions {
        if transition_matches(transition, issue_json) {
            return Some(transition.to.clone());
        }
    }
    None
}

fn transition_matches(transition: &Transition, issue_json: &IssueJson) -> bool {
    transition.when.iter().all(|(flag, expected)| {
        let actual = status_flag(issue_json, flag);
        actual == *expected
    })
}

/// Read a named status flag, treating unknown/absent flags as `false`.
fn status_flag(issue_json: &IssueJson, flag: &str) -> bool {
    match flag {
        "taskPassed" => issue_json.status.task_passed.unwrap_or(false),
        "taskFailed" => issue_json.status.task_failed.unwrap_or(false),
        "hasMoreTasks" => issue_json.status.has_more_tasks.unwrap_or(false),
        "allTasksComplete" => issue_json.status.all_tasks_complete.unwrap_or(false),
        "preCheckPassed" => issue_json.status.pre_check_passed.unwrap_or(false),
        "taskDecompositionComplete" => issue_json
            .status
            .task_decomposition_complete
            .unwrap_or(false),
        other => issue_json
            .status
            .extra
            .get(other)
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    }
}

/// Resolve the provider for a phase: phase value, then workflow default,
/// then the run-start default. Fails fast on an unrecognized provider
/// before any child is spawned.
pub fn resolve_provider(phase: &Phase, workflow: &Workflow, run_default: &str) -> CoreResult<String> {
    let candidate = phase
        .provider
        .clone()
        .or_else(|| workflow.default_provider.clone())
        .unwrap_or_else(|| run_default.to_string());

    if KNOWN_PROVIDERS.contains(&candidate.as_str()) {
        Ok(candidate)
    } else {
        Err(CoreError::InvalidProvider(candidate))
    }
}

/// Resolve the model for a phase: phase value, then workflow default. No
/// run-level default exists for models; `None` means no `JEEVES_MODEL` is
/// set on the child's environment.
pub fn resolve_model(phase: &Phase, workflow: &Workflow) -> Option<String> {
    phase.model.clone().or_else(|| workflow.default_model.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IssueControl, IssueNumberField, IssueSettings, IssueStatus};
    use std::collections::HashMap as StdHashMap;

    fn issue_with_status(status: IssueStatus) -> IssueJson {
        IssueJson {
            repo: "acme/widgets".to_string(),
            issue: IssueNumberField { number: 1 },
            branch: "issue/1".to_string(),
            workflow: "default".to_string(),
            phase: "task_spec_check".to_string(),
            notes: String::new(),
            settings: IssueSettings::default(),
            control: IssueControl::default(),
            status,
            extra: StdHashMap::new(),
        }
    }

    fn trivial_workflow() -> Workflow {
        Workflow {
            name: "fixture-trivial".to_string(),
            default_provider: Some("codex".to_string()),
            default_model: Some("sonnet".to_string()),
            phases: vec![
                Phase {
                    name: "hello".to_string(),
                    terminal: false,
                    provider: None,
                    model: None,
                    transitions: vec![Transition {
                        when: StdHashMap::new(),
                        to: "complete".to_string(),
                    }],
                },
                Phase {
                    name: "complete".to_string(),
                    terminal: true,
                    provider: None,
                    model: None,
                    transitions: vec![],
                },
            ],
        }
    }

    #[test]
    fn trivial_workflow_advances_on_empty_guard() {
        let workflow = trivial_workflow();
        let issue = issue_with_status(IssueStatus::default());
        let next = next_phase(&workflow, "hello", &issue);
        assert_eq!(next.as_deref(), Some("complete"));
        assert!(is_terminal(&workflow, "complete"));
        assert!(!is_terminal(&workflow, "hello"));
    }

    #[test]
    fn spec_check_merge_conflict_routes_back_to_implement() {
        let workflow = Workflow {
            name: "impl-spec".to_string(),
            default_provider: None,
            default_model: None,
            phases: vec![Phase {
                name: "task_spec_check".to_string(),
                terminal: false,
                provider: None,
                model: None,
                transitions: vec![
                    Transition {
                        when: StdHashMap::from([
                            ("taskFailed".to_string(), true),
                            ("hasMoreTasks".to_string(), true),
                        ]),
                        to: "implement_task".to_string(),
                    },
                    Transition {
                        when: StdHashMap::from([("allTasksComplete".to_string(), true)]),
                        to: "done".to_string(),
                    },
                ],
            }],
        };

        let mut status = IssueStatus::default();
        status.task_failed = Some(true);
        status.has_more_tasks = Some(true);
        let issue = issue_with_status(status);

        assert_eq!(
            next_phase(&workflow, "task_spec_check", &issue).as_deref(),
            Some("implement_task")
        );
    }

    #[test]
    fn provider_precedence_phase_then_workflow_then_run() {
        let workflow = trivial_workflow();
        let mut phase = workflow.phase("hello").unwrap().clone();

        // phase override wins
        phase.provider = Some("claude".to_string());
        assert_eq!(
            resolve_provider(&phase, &workflow, "fake").unwrap(),
            "claude"
        );

        // workflow default wins over run default
        phase.provider = None;
        assert_eq!(
            resolve_provider(&phase, &workflow, "fake").unwrap(),
            "codex"
        );

        // run default used when neither phase nor workflow specify one
        let mut bare_workflow = workflow.clone();
        bare_workflow.default_provider = None;
        assert_eq!(
            resolve_provider(&phase, &bare_workflow, "fake").unwrap(),
            "fake"
        );
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let workflow = trivial_workflow();
        let mut phase = workflow.phase("hello").unwrap().clone();
        phase.provider = Some("not-a-real-provider".to_string());
        let err = resolve_provider(&phase, &workflow, "fake").unwrap_err();
        assert!(matches!(err, CoreError::InvalidProvider(_)));
    }

    #[test]
    fn model_resolution_falls_back_to_workflow_default() {
        let workflow = trivial_workflow();
        let phase = workflow.phase("hello").unwrap().clone();
        assert_eq!(resolve_model(&phase, &workflow).as_deref(), Some("sonnet"));

        let mut bare_workflow = workflow.clone();
        bare_workflow.default_model = None;
        assert_eq!(resolve_model(&phase, &bare_workflow), None);
    }

    #[test]
    fn unmatched_transition_keeps_current_phase() {
        let workflow = Workflow {
            name: "w".to_string(),
            default_provider: None,
            default_model: None,
            phases: vec![Phase {
                name: "p".to_string(),
                terminal: false,
                provider: None,
                model: None,
                transitions: vec![Transition {
                    when: StdHashMap::from([("taskPassed".to_string(), true)]),
                    to: "next".to_string(),
                }],
            }],
        };
        let issue = issue_with_status(IssueStatus::default());
        assert_eq!(next_phase(&workflow, "p", &issue), None);
    }
}
