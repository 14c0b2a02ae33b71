#![allow(dead_code)]

//! Builders for workflows and a ready-to-tick orchestrator harness.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::watch;

use agentdag::engine::{EngineOptions, Orchestrator};
use agentdag::exec::{LaunchRequest, StepRunner};
use agentdag::gate::{AlwaysOpenGates, GateEvaluator};
use agentdag::notify::{NotificationDispatcher, NotificationSink, StepEvent};
use agentdag::report::{PlaceholderPolicy, ReportValidator};
use agentdag::state::{RunState, StateStore};
use agentdag::workflow::{
    validate_workflow, LoopSource, LoopSpec, Step, Workflow,
};

use crate::common::fake::{FakeBackend, Script};

pub const RUN_ID: &str = "testrun1";

/// Builder for workflow [`Step`]s.
pub struct StepBuilder {
    step: Step,
}

impl StepBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            step: Step {
                id: id.to_string(),
                agent: "agent".to_string(),
                prompt: format!("prompts/{id}.md"),
                needs: vec![],
                next_on_success: vec![],
                gates: vec![],
                human_in_the_loop: false,
                loop_back_to: None,
                timeout_secs: None,
                metadata: BTreeMap::new(),
                loop_spec: None,
            },
        }
    }

    pub fn agent(mut self, agent: &str) -> Self {
        self.step.agent = agent.to_string();
        self
    }

    pub fn needs(mut self, dep: &str) -> Self {
        self.step.needs.push(dep.to_string());
        self
    }

    pub fn gate(mut self, gate: &str) -> Self {
        self.step.gates.push(gate.to_string());
        self
    }

    pub fn human_in_the_loop(mut self) -> Self {
        self.step.human_in_the_loop = true;
        self
    }

    pub fn loop_back_to(mut self, target: &str) -> Self {
        self.step.loop_back_to = Some(target.to_string());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.step.timeout_secs = Some(secs);
        self
    }

    pub fn loop_items(mut self, items: Vec<Value>) -> Self {
        self.step.loop_spec = Some(loop_spec(LoopSource::Inline(items)));
        self
    }

    pub fn loop_from_step(mut self, source: &str) -> Self {
        self.step.loop_spec = Some(loop_spec(LoopSource::FromStep {
            step: source.to_string(),
            metric: None,
        }));
        self
    }

    pub fn loop_from_metric(mut self, source: &str, metric: &str) -> Self {
        self.step.loop_spec = Some(loop_spec(LoopSource::FromStep {
            step: source.to_string(),
            metric: Some(metric.to_string()),
        }));
        self
    }

    pub fn loop_from_artifact(mut self, path: &str) -> Self {
        self.step.loop_spec = Some(loop_spec(LoopSource::FromArtifact(PathBuf::from(path))));
        self
    }

    pub fn build(self) -> Step {
        self.step
    }
}

fn loop_spec(source: LoopSource) -> LoopSpec {
    LoopSpec {
        source,
        item_var: "LOOP_ITEM".to_string(),
        index_var: "LOOP_INDEX".to_string(),
        max_iterations: None,
    }
}

/// Builder for [`Workflow`]s; validates on build.
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<Step>,
}

impl WorkflowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: vec![],
        }
    }

    pub fn step(mut self, builder: StepBuilder) -> Self {
        self.steps.push(builder.build());
        self
    }

    pub fn build(self) -> Workflow {
        let workflow = Workflow {
            name: self.name,
            description: String::new(),
            steps: self.steps,
        };
        validate_workflow(&workflow).expect("builder produced an invalid workflow");
        workflow
    }
}

/// Records every event the dispatcher delivers, for assertions.
struct RecordingSink {
    events: Arc<Mutex<Vec<StepEvent>>>,
}

impl NotificationSink for RecordingSink {
    fn notify(&self, event: &StepEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Everything a scenario test needs: the orchestrator, the recorded wrapper
/// launches and notifications, the run directories, and a cancellation
/// handle.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub launches: Arc<Mutex<Vec<LaunchRequest>>>,
    pub events: Arc<Mutex<Vec<StepEvent>>>,
    pub cancel_tx: watch::Sender<bool>,
    pub repo_dir: PathBuf,
    pub run_dir: PathBuf,
    _dir: Option<TempDir>,
}

impl Harness {
    pub fn launched_step_ids(&self) -> Vec<String> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .map(|l| l.step_id.clone())
            .collect()
    }

    pub fn launch_for(&self, step_id: &str) -> LaunchRequest {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.step_id == step_id)
            .unwrap_or_else(|| panic!("no launch recorded for '{step_id}'"))
            .clone()
    }

    /// Events delivered so far. The dispatcher drains on a background
    /// task, so give it a moment to catch up first.
    pub async fn settled_events(&self) -> Vec<StepEvent> {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.events.lock().unwrap().clone()
    }
}

/// Build a harness in a fresh temp dir.
pub fn build_harness(workflow: Workflow, script: Script, options: EngineOptions) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut harness = build_harness_in(dir.path().to_path_buf(), workflow, script, options);
    harness._dir = Some(dir);
    harness
}

/// Build a harness in a fresh temp dir with a custom gate evaluator.
pub fn build_harness_gated(
    workflow: Workflow,
    script: Script,
    options: EngineOptions,
    gates: Box<dyn GateEvaluator>,
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut harness =
        build_harness_full(dir.path().to_path_buf(), workflow, script, options, gates);
    harness._dir = Some(dir);
    harness
}

/// Build a harness rooted at `base`. When the run directory already holds a
/// persisted state (a previous harness on the same dir), the run resumes
/// from it, mirroring the production wiring.
pub fn build_harness_in(
    base: PathBuf,
    workflow: Workflow,
    script: Script,
    options: EngineOptions,
) -> Harness {
    build_harness_full(base, workflow, script, options, Box::new(AlwaysOpenGates))
}

fn build_harness_full(
    base: PathBuf,
    workflow: Workflow,
    script: Script,
    options: EngineOptions,
    gates: Box<dyn GateEvaluator>,
) -> Harness {
    let repo_dir = base.join("repo");
    std::fs::create_dir_all(&repo_dir).unwrap();

    for step in &workflow.steps {
        let prompt = repo_dir.join(&step.prompt);
        if let Some(parent) = prompt.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        if !prompt.exists() {
            std::fs::write(&prompt, "stub prompt").unwrap();
        }
    }

    let run_dir = repo_dir.join(".agents").join("runs").join(RUN_ID);
    let reports_dir = run_dir.join("reports");
    let manual_inputs_dir = run_dir.join("manual_inputs");
    std::fs::create_dir_all(&reports_dir).unwrap();
    std::fs::create_dir_all(run_dir.join("logs")).unwrap();
    std::fs::create_dir_all(run_dir.join("artifacts")).unwrap();
    std::fs::create_dir_all(&manual_inputs_dir).unwrap();

    let store = StateStore::new(run_dir.join("run_state.json"));
    let state = store.load().unwrap().unwrap_or_else(|| {
        RunState::new(
            RUN_ID,
            workflow.name.clone(),
            repo_dir.clone(),
            reports_dir,
            manual_inputs_dir,
            workflow.steps.iter().map(|s| s.id.clone()),
        )
    });

    let (backend, launches) = FakeBackend::new(script);
    let runner = StepRunner::new(
        Box::new(backend),
        vec!["wrapper".to_string()],
        repo_dir.clone(),
        repo_dir.clone(),
        &run_dir,
        BTreeMap::new(),
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    let notifier = NotificationDispatcher::spawn(Box::new(RecordingSink {
        events: events.clone(),
    }));
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let orchestrator = Orchestrator::new(
        workflow,
        state,
        store,
        runner,
        ReportValidator::new(PlaceholderPolicy::default()),
        gates,
        notifier,
        options,
        cancel_rx,
    );

    Harness {
        orchestrator,
        launches,
        events,
        cancel_tx,
        repo_dir,
        run_dir,
        _dir: None,
    }
}
