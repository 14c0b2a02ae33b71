// src/engine/orchestrator.rs

//! The orchestrator owns the step state machine. Every tick it admits
//! ready steps, polls active wrapper launches, applies state transitions
//! (retry, loop-back, human input, timeouts), persists the run state, and
//! checks for termination. A single control task drives the loop; wrapper
//! processes run in parallel on the host and are only ever polled.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dag::DagGraph;
use crate::engine::expand;
use crate::errors::{EngineError, Result};
use crate::exec::{PollOutcome, StepRunner};
use crate::gate::GateEvaluator;
use crate::notify::{read_log_tail, NotificationDispatcher, StepEvent, StepEventKind};
use crate::report::{ReportStatus, ReportValidator, RunReport};
use crate::state::{utc_now, RunState, StateStore, StepStatus};
use crate::workflow::{Step, Workflow};

/// Options that influence the scheduling loop.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub poll_interval: Duration,
    /// Per-step retry cap within one iteration. Zero makes any failure
    /// immediately terminal.
    pub max_attempts: u32,
    /// Loop-back cap per step. Zero makes any gate failure terminal.
    pub max_iterations: u32,
    pub pause_for_human_input: bool,
    /// How long to wait for killed children on cancellation.
    pub grace_period: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_attempts: 2,
            max_iterations: 4,
            pause_for_human_input: false,
            grace_period: Duration::from_secs(10),
        }
    }
}

/// Final outcome of one engine run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    /// True iff every step ended COMPLETED or SKIPPED.
    pub success: bool,
}

/// Loop instance context attached to an expanded child.
#[derive(Debug, Clone)]
struct LoopContext {
    parent: String,
    index: usize,
    item: Value,
    item_var: String,
    index_var: String,
}

/// Runtime step table entry: a declared step, or a synthesized loop child.
#[derive(Debug, Clone)]
struct StepSpec {
    step: Step,
    loop_ctx: Option<LoopContext>,
}

pub struct Orchestrator {
    workflow: Workflow,
    /// Dependency graph over the *declared* steps.
    graph: DagGraph,
    /// Declared steps plus synthesized loop children, keyed by runtime id.
    steps: BTreeMap<String, StepSpec>,
    state: RunState,
    store: StateStore,
    runner: StepRunner,
    validator: ReportValidator,
    gates: Box<dyn GateEvaluator>,
    notifier: NotificationDispatcher,
    options: EngineOptions,
    active: HashMap<String, crate::exec::StepLaunch>,
    cancel: watch::Receiver<bool>,
    /// Env merged from manual-input files, consumed at the next launch.
    pending_manual_env: HashMap<String, BTreeMap<String, String>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflow: Workflow,
        state: RunState,
        store: StateStore,
        runner: StepRunner,
        validator: ReportValidator,
        gates: Box<dyn GateEvaluator>,
        notifier: NotificationDispatcher,
        options: EngineOptions,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let graph = DagGraph::from_workflow(&workflow);
        let steps: BTreeMap<String, StepSpec> = workflow
            .steps
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    StepSpec {
                        step: s.clone(),
                        loop_ctx: None,
                    },
                )
            })
            .collect();

        let mut orchestrator = Self {
            workflow,
            graph,
            steps,
            state,
            store,
            runner,
            validator,
            gates,
            notifier,
            options,
            active: HashMap::new(),
            cancel,
            pending_manual_env: HashMap::new(),
        };

        for step in &orchestrator.workflow.steps {
            orchestrator
                .state
                .steps
                .entry(step.id.clone())
                .or_default();
        }

        // Re-synthesize loop children from item lists persisted by a prior
        // run, so a resumed group keeps its original expansion.
        let expansions: Vec<(String, Vec<Value>)> = orchestrator
            .workflow
            .steps
            .iter()
            .filter(|s| s.loop_spec.is_some())
            .filter_map(|s| {
                orchestrator
                    .state
                    .steps
                    .get(&s.id)
                    .and_then(|rt| rt.loop_items.clone())
                    .map(|items| (s.id.clone(), items))
            })
            .collect();
        for (parent_id, items) in expansions {
            if !items.is_empty() {
                orchestrator.install_children(&parent_id, &items);
            }
        }

        // A reloaded state can record steps as RUNNING although no child
        // survives the previous process; re-queue them.
        for (id, rt) in orchestrator.state.steps.iter_mut() {
            if rt.status == StepStatus::Running {
                warn!(step = %id, "step was RUNNING at last shutdown; re-queueing");
                rt.status = StepStatus::Pending;
                rt.clear_attempt_fields();
            }
        }

        orchestrator
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Apply a `start_at` resume hint: reset the step and the transitive
    /// closure of steps depending on it, preserving upstream results and
    /// every `iteration_count`.
    pub fn reset_from(&mut self, step_id: &str) -> Result<()> {
        if self.workflow.step(step_id).is_none() {
            return Err(EngineError::WorkflowDefinition(format!(
                "start_at step '{step_id}' is not part of workflow '{}'",
                self.workflow.name
            )));
        }

        let mut members: Vec<String> = vec![step_id.to_string()];
        members.extend(self.graph.descendants_of(step_id));

        for member in members {
            // Drop any expansion; a rerun from here may legitimately
            // resolve a different item list.
            let children = self
                .state
                .steps
                .get(&member)
                .map(|rt| rt.loop_children.clone())
                .unwrap_or_default();
            for child in children {
                self.state.steps.remove(&child);
                self.steps.remove(&child);
            }

            if let Some(rt) = self.state.steps.get_mut(&member) {
                let iterations = rt.iteration_count;
                rt.reset_for_resume();
                rt.iteration_count = iterations;
                info!(step = %member, "reset to PENDING for resume");
            }
        }
        Ok(())
    }

    /// Drive the run to completion (or cancellation).
    pub async fn run(&mut self) -> Result<RunSummary> {
        info!(
            workflow = %self.workflow.name,
            run_id = %self.state.run_id,
            repo = %self.state.repo_dir.display(),
            "starting workflow run"
        );

        loop {
            if *self.cancel.borrow() {
                self.cancel_run().await;
                break;
            }

            let progress = self.tick().await;

            if self.all_terminal() && self.active.is_empty() {
                break;
            }

            if !progress {
                let sleep = tokio::time::sleep(self.options.poll_interval);
                tokio::pin!(sleep);
                let mut cancel = self.cancel.clone();
                tokio::select! {
                    _ = &mut sleep => {}
                    _ = cancel.changed() => {}
                }
            }
        }

        let success = self.steps.keys().all(|id| {
            self.state
                .steps
                .get(id)
                .map(|rt| rt.status.satisfies_dependency())
                .unwrap_or(false)
        });

        if success {
            info!(run_id = %self.state.run_id, "workflow complete");
        } else {
            error!(run_id = %self.state.run_id, "workflow finished with failures");
        }

        Ok(RunSummary {
            run_id: self.state.run_id.clone(),
            success,
        })
    }

    /// One scheduler iteration: admit, collect, check manual input,
    /// persist. Public so tests can single-step the state machine.
    pub async fn tick(&mut self) -> bool {
        let mut progress = false;
        progress |= self.admit_ready();
        progress |= self.collect_running().await;
        progress |= self.check_manual_steps();
        self.persist();
        progress
    }

    // -----------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------

    fn admit_ready(&mut self) -> bool {
        let ids: Vec<String> = self.steps.keys().cloned().collect();
        let mut progress = false;

        for id in ids {
            if self.active.contains_key(&id) {
                continue;
            }
            let status = match self.state.steps.get(&id) {
                Some(rt) => rt.status,
                None => continue,
            };
            if status != StepStatus::Pending {
                continue;
            }

            let spec = match self.steps.get(&id) {
                Some(spec) => spec.clone(),
                None => continue,
            };
            if !self.deps_satisfied(&spec.step) {
                continue;
            }
            if !self.gates_open(&spec.step) {
                continue;
            }

            if spec.step.loop_spec.is_some() {
                progress |= self.admit_loop_parent(&id);
                continue;
            }

            if spec.step.human_in_the_loop && self.options.pause_for_human_input {
                let path = self
                    .state
                    .manual_inputs_dir
                    .join(format!("{}__{}.json", self.state.run_id, id));
                let rt = self.state.steps.get_mut(&id).expect("runtime exists");
                rt.status = StepStatus::WaitingOnHuman;
                rt.manual_input_path = Some(path);
                info!(step = %id, "awaiting human input");
                self.notify_paused(&id);
                progress = true;
                continue;
            }

            progress |= self.launch_step(&id);
        }
        progress
    }

    fn deps_satisfied(&self, step: &Step) -> bool {
        step.needs.iter().all(|dep| {
            self.state
                .steps
                .get(dep)
                .map(|rt| rt.status.satisfies_dependency())
                .unwrap_or(false)
        })
    }

    fn gates_open(&self, step: &Step) -> bool {
        for gate in &step.gates {
            if !self.gates.open(&step.id, gate) {
                debug!(step = %step.id, gate = %gate, "gate closed; step waiting");
                return false;
            }
        }
        true
    }

    /// A looping step never launches a wrapper itself: first readiness
    /// resolves the item list and expands the group; later re-entries
    /// (after a rewind or resume) reactivate the existing expansion.
    fn admit_loop_parent(&mut self, id: &str) -> bool {
        let spec = self.steps.get(id).cloned().expect("spec exists");
        let loop_spec = spec.step.loop_spec.clone().expect("loop step");

        let resolved = self
            .state
            .steps
            .get(id)
            .and_then(|rt| rt.loop_items.clone());

        match resolved {
            Some(items) => {
                if items.is_empty() {
                    let rt = self.state.steps.get_mut(id).expect("runtime exists");
                    rt.status = StepStatus::Skipped;
                    rt.ended_at = Some(utc_now());
                    return true;
                }
                let count = items.len();
                let rt = self.state.steps.get_mut(id).expect("runtime exists");
                rt.status = StepStatus::Running;
                rt.started_at = Some(utc_now());
                info!(step = %id, instances = count, "loop re-entered");
                true
            }
            None => match expand::resolve_items(&loop_spec, &self.state, &self.state.repo_dir) {
                Ok(items) if items.is_empty() => {
                    let rt = self.state.steps.get_mut(id).expect("runtime exists");
                    rt.loop_items = Some(items);
                    rt.status = StepStatus::Skipped;
                    rt.ended_at = Some(utc_now());
                    info!(step = %id, "loop resolved to an empty list; step skipped");
                    true
                }
                Ok(items) => {
                    let children = self.install_children(id, &items);
                    let count = children.len();
                    let rt = self.state.steps.get_mut(id).expect("runtime exists");
                    rt.loop_items = Some(items);
                    rt.loop_children = children;
                    rt.status = StepStatus::Running;
                    rt.started_at = Some(utc_now());
                    info!(step = %id, instances = count, "loop expanded");
                    true
                }
                Err(message) => {
                    error!(step = %id, error = %message, "failed to resolve loop items");
                    let rt = self.state.steps.get_mut(id).expect("runtime exists");
                    rt.status = StepStatus::Failed;
                    rt.last_error = Some(message);
                    rt.ended_at = Some(utc_now());
                    self.notify_failed(id);
                    self.fail_branch(id);
                    true
                }
            },
        }
    }

    /// Synthesize the `__NN` child instances for a looping step. Each child
    /// inherits the parent's configuration and depends serially on the
    /// previous child so the iteration runs in order.
    fn install_children(&mut self, parent_id: &str, items: &[Value]) -> Vec<String> {
        let parent = self.steps.get(parent_id).cloned().expect("parent exists");
        let loop_spec = parent.step.loop_spec.clone().expect("loop step");

        let mut ids = Vec::with_capacity(items.len());
        let mut previous: Option<String> = None;

        for (index, item) in items.iter().enumerate() {
            let child_id = expand::child_id(parent_id, index);

            let mut child = parent.step.clone();
            child.id = child_id.clone();
            child.loop_spec = None;
            // Loop-back stays declared on the parent; a child's gate
            // failure is routed through it.
            child.loop_back_to = None;
            child.needs = parent.step.needs.clone();
            if let Some(prev) = &previous {
                child.needs.push(prev.clone());
            }

            self.steps.insert(
                child_id.clone(),
                StepSpec {
                    step: child,
                    loop_ctx: Some(LoopContext {
                        parent: parent_id.to_string(),
                        index,
                        item: item.clone(),
                        item_var: loop_spec.item_var.clone(),
                        index_var: loop_spec.index_var.clone(),
                    }),
                },
            );
            self.state.steps.entry(child_id.clone()).or_default();

            previous = Some(child_id.clone());
            ids.push(child_id);
        }
        ids
    }

    fn launch_step(&mut self, id: &str) -> bool {
        let spec = match self.steps.get(id) {
            Some(spec) => spec.clone(),
            None => return false,
        };
        let run_id = self.state.run_id.clone();

        let mut extra_env = self.dependency_artifact_env(&spec.step);
        if let Some(ctx) = &spec.loop_ctx {
            extra_env.insert(ctx.index_var.clone(), ctx.index.to_string());
            extra_env.insert(ctx.item_var.clone(), expand::item_env_value(&ctx.item));
        }
        if let Some(manual) = self.pending_manual_env.remove(id) {
            extra_env.extend(manual);
        }

        let report_path = self.runner.report_path(&run_id, id);
        let (attempt, manual_path) = {
            let rt = self.state.steps.get_mut(id).expect("runtime exists");
            rt.attempts += 1;
            rt.status = StepStatus::Running;
            rt.started_at = Some(utc_now());
            rt.ended_at = None;
            rt.blocked_by_loop = None;
            rt.report_path = Some(report_path);
            (rt.attempts, rt.manual_input_path.clone())
        };

        match self.runner.launch(
            &spec.step,
            id,
            &run_id,
            attempt,
            manual_path.as_deref(),
            &extra_env,
        ) {
            Ok(launch) => {
                info!(step = %id, agent = %spec.step.agent, attempt, "launched wrapper");
                self.active.insert(id.to_string(), launch);
            }
            Err(err) => {
                // Missing prompts and spawn errors are per-step fatal.
                error!(step = %id, error = %err, "failed to launch step");
                let rt = self.state.steps.get_mut(id).expect("runtime exists");
                rt.status = StepStatus::Failed;
                rt.last_error = Some(err.to_string());
                rt.ended_at = Some(utc_now());
                self.notify_failed(id);
                self.fail_branch(id);
            }
        }
        true
    }

    /// Export predecessor artifacts into the wrapper env, plus the issue
    /// convenience mapping when a dependency produced a `gh_issue_*.md`.
    fn dependency_artifact_env(&self, step: &Step) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let mut issue_artifact: Option<PathBuf> = None;

        for dep in &step.needs {
            let runtime = match self.state.steps.get(dep) {
                Some(rt) => rt,
                None => continue,
            };
            if runtime.artifacts.is_empty() {
                continue;
            }

            let key_base = env_safe(dep);
            let mut resolved = Vec::with_capacity(runtime.artifacts.len());
            for (index, artifact) in runtime.artifacts.iter().enumerate() {
                let path = Path::new(artifact);
                let absolute = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.state.repo_dir.join(path)
                };
                env.insert(
                    format!("DEP_{key_base}_ARTIFACT_{index}"),
                    absolute.display().to_string(),
                );
                if issue_artifact.is_none() {
                    if let Some(name) = absolute.file_name().and_then(|n| n.to_str()) {
                        if name.starts_with("gh_issue_") && name.ends_with(".md") {
                            issue_artifact = Some(absolute.clone());
                        }
                    }
                }
                resolved.push(absolute.display().to_string());
            }
            env.insert(format!("DEP_{key_base}_ARTIFACTS"), resolved.join(","));
        }

        if let Some(issue) = issue_artifact {
            env.entry("ISSUE_MARKDOWN_PATH".to_string())
                .or_insert_with(|| issue.display().to_string());
            env.entry("ISSUE_MARKDOWN_DIR".to_string()).or_insert_with(|| {
                issue
                    .parent()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            });
            env.entry("ISSUE_MARKDOWN_FILENAME".to_string())
                .or_insert_with(|| {
                    issue
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or_default()
                        .to_string()
                });
        }
        env
    }

    // -----------------------------------------------------------------
    // Collection and resolution
    // -----------------------------------------------------------------

    async fn collect_running(&mut self) -> bool {
        let ids: Vec<String> = self.active.keys().cloned().collect();
        let mut progress = false;

        for id in ids {
            let outcome = match self.active.get_mut(&id) {
                Some(launch) => launch.poll(),
                None => continue,
            };

            match outcome {
                PollOutcome::StillRunning => {}
                PollOutcome::ReportArrived => {
                    let report_path = self
                        .active
                        .get(&id)
                        .map(|l| l.report_path.clone())
                        .expect("active launch");
                    match self.validator.read(&report_path).await {
                        Ok(report) => {
                            self.active.remove(&id);
                            self.resolve_report(&id, report);
                            progress = true;
                        }
                        Err(err) => {
                            let running = self
                                .active
                                .get_mut(&id)
                                .map(|l| l.child_running())
                                .unwrap_or(false);
                            if running {
                                // The wrapper may still be mid-write.
                                debug!(step = %id, error = %err, "report not yet valid; child still running");
                            } else {
                                self.active.remove(&id);
                                warn!(step = %id, error = %err, "invalid run report");
                                self.attempt_failure(&id, err.to_string());
                                progress = true;
                            }
                        }
                    }
                }
                PollOutcome::ChildExited(code) => {
                    self.active.remove(&id);
                    self.attempt_failure(
                        &id,
                        format!("wrapper exited with code {code} without writing a run report"),
                    );
                    progress = true;
                }
                PollOutcome::TimedOut => {
                    self.active.remove(&id);
                    self.attempt_failure(
                        &id,
                        "step timed out before a run report appeared".to_string(),
                    );
                    progress = true;
                }
            }
        }

        progress |= self.resolve_loop_groups();
        progress
    }

    fn resolve_report(&mut self, id: &str, report: RunReport) {
        let declared_id = self.declared_of(id);
        let loop_back = self
            .steps
            .get(&declared_id)
            .and_then(|s| s.step.loop_back_to.clone());

        {
            let rt = self.state.steps.get_mut(id).expect("runtime exists");
            rt.ended_at = Some(report.ended_at.clone());
            rt.artifacts = report.artifacts.clone();
            rt.metrics = report.metrics.clone();
            rt.logs = report.logs.clone();
        }

        match report.status {
            ReportStatus::Failed => {
                let message = if report.logs.is_empty() {
                    "agent reported failure".to_string()
                } else {
                    let tail: Vec<String> =
                        report.logs.iter().rev().take(3).rev().cloned().collect();
                    tail.join(", ")
                };
                warn!(step = %id, error = %message, "wrapper reported failure");
                self.attempt_failure(id, message);
            }
            ReportStatus::Completed => {
                {
                    let rt = self.state.steps.get_mut(id).expect("runtime exists");
                    rt.status = StepStatus::Completed;
                    rt.last_error = None;
                }
                if report.gate_failure {
                    match loop_back {
                        Some(target) => {
                            info!(step = %id, target = %target, "gate failure reported; rewinding");
                            self.loop_back(id, &declared_id, &target);
                        }
                        None => warn!(
                            step = %id,
                            "gate failure reported but no loop_back_to declared; treating as success"
                        ),
                    }
                } else {
                    info!(step = %id, "step completed");
                }
            }
        }
    }

    fn attempt_failure(&mut self, id: &str, message: String) {
        let max_attempts = self.options.max_attempts;
        let terminal = {
            let rt = self.state.steps.get_mut(id).expect("runtime exists");
            if rt.attempts < max_attempts {
                rt.status = StepStatus::Pending;
                rt.last_error = Some(message.clone());
                rt.clear_attempt_fields();
                info!(step = %id, attempts = rt.attempts, "attempt failed; retry scheduled");
                false
            } else {
                rt.status = StepStatus::Failed;
                rt.last_error = Some(message.clone());
                rt.ended_at = Some(utc_now());
                error!(
                    step = %id,
                    attempts = rt.attempts,
                    error = %message,
                    "step failed after exhausting attempts"
                );
                true
            }
        };

        if terminal {
            self.notify_failed(id);
            self.fail_branch(id);
        }
    }

    /// When all instances of a loop finished, fold the group outcome back
    /// into the declared step.
    fn resolve_loop_groups(&mut self) -> bool {
        let parents: Vec<String> = self
            .steps
            .iter()
            .filter(|(_, spec)| spec.step.loop_spec.is_some())
            .map(|(id, _)| id.clone())
            .collect();

        let mut progress = false;
        for parent_id in parents {
            let (children, status) = match self.state.steps.get(&parent_id) {
                Some(rt) => (rt.loop_children.clone(), rt.status),
                None => continue,
            };
            if status != StepStatus::Running || children.is_empty() {
                continue;
            }

            let all_completed = children.iter().all(|child| {
                self.state
                    .steps
                    .get(child)
                    .map(|rt| rt.status == StepStatus::Completed)
                    .unwrap_or(false)
            });
            if !all_completed {
                continue;
            }

            let mut artifacts = Vec::new();
            let mut ended_at = None;
            let mut report_path = None;
            for child in &children {
                if let Some(rt) = self.state.steps.get(child) {
                    artifacts.extend(rt.artifacts.iter().cloned());
                    if rt.ended_at.is_some() {
                        ended_at = rt.ended_at.clone();
                    }
                    if rt.report_path.is_some() {
                        report_path = rt.report_path.clone();
                    }
                }
            }

            let count = children.len();
            let rt = self.state.steps.get_mut(&parent_id).expect("runtime exists");
            rt.status = StepStatus::Completed;
            rt.ended_at = ended_at.or_else(|| Some(utc_now()));
            rt.artifacts = artifacts;
            rt.report_path = report_path;
            info!(step = %parent_id, instances = count, "loop completed");
            progress = true;
        }
        progress
    }

    // -----------------------------------------------------------------
    // Loop-back
    // -----------------------------------------------------------------

    /// Rewind the reset set `{target} ∪ (descendants(target) ∩ ancestors
    /// of the trigger, trigger included)`. Each member's iteration counter
    /// is bumped first; a member that reaches the cap is failed instead of
    /// reset and its downstream branch is terminated.
    fn loop_back(&mut self, trigger_id: &str, trigger_declared: &str, target: &str) {
        let reset = self.graph.reset_set(target, trigger_declared);
        let max_iterations = self.options.max_iterations;
        let mut capped: Vec<String> = Vec::new();

        for member in &reset {
            let members = self.group_members(member);
            for runtime_id in members {
                let rt = match self.state.steps.get_mut(&runtime_id) {
                    Some(rt) => rt,
                    None => continue,
                };
                rt.iteration_count += 1;
                if rt.iteration_count >= max_iterations {
                    rt.status = StepStatus::Failed;
                    rt.last_error = Some("max loop-back iterations exceeded".to_string());
                    rt.ended_at = Some(utc_now());
                    error!(
                        step = %runtime_id,
                        iterations = rt.iteration_count,
                        "loop-back cap reached"
                    );
                    capped.push(runtime_id);
                } else {
                    rt.reset_for_loop_back(trigger_id);
                    info!(
                        step = %runtime_id,
                        iteration = rt.iteration_count,
                        target = %target,
                        "rewound by loop-back"
                    );
                }
            }
        }

        for id in capped {
            self.notify_failed(&id);
            self.fail_branch(&id);
        }
    }

    /// A declared step plus its expanded instances, if any.
    fn group_members(&self, declared: &str) -> Vec<String> {
        let mut members = vec![declared.to_string()];
        if let Some(rt) = self.state.steps.get(declared) {
            members.extend(rt.loop_children.iter().cloned());
        }
        members
    }

    fn declared_of(&self, runtime_id: &str) -> String {
        self.steps
            .get(runtime_id)
            .and_then(|spec| spec.loop_ctx.as_ref())
            .map(|ctx| ctx.parent.clone())
            .unwrap_or_else(|| runtime_id.to_string())
    }

    /// Mark everything that can no longer run because of a terminal
    /// failure, so the loop drains instead of waiting forever.
    fn fail_branch(&mut self, failed_id: &str) {
        let declared_id = self.declared_of(failed_id);
        let mut to_fail: Vec<String> = Vec::new();

        if let Some(ctx) = self
            .steps
            .get(failed_id)
            .and_then(|spec| spec.loop_ctx.clone())
        {
            let siblings = self
                .state
                .steps
                .get(&ctx.parent)
                .map(|rt| rt.loop_children.clone())
                .unwrap_or_default();
            to_fail.extend(siblings.into_iter().skip(ctx.index + 1));
            to_fail.push(ctx.parent.clone());
        }

        for descendant in self.graph.descendants_of(&declared_id) {
            let children = self
                .state
                .steps
                .get(&descendant)
                .map(|rt| rt.loop_children.clone())
                .unwrap_or_default();
            to_fail.push(descendant);
            to_fail.extend(children);
        }

        for target in to_fail {
            if self.active.contains_key(&target) {
                continue;
            }
            let rt = match self.state.steps.get_mut(&target) {
                Some(rt) => rt,
                None => continue,
            };
            if rt.status.is_terminal() {
                continue;
            }
            rt.status = StepStatus::Failed;
            rt.last_error = Some(format!("upstream step '{failed_id}' failed"));
            debug!(step = %target, upstream = %failed_id, "failing dependent");
            self.notify_failed(&target);
        }
    }

    // -----------------------------------------------------------------
    // Human input
    // -----------------------------------------------------------------

    fn check_manual_steps(&mut self) -> bool {
        if !self.options.pause_for_human_input {
            return false;
        }

        let waiting: Vec<(String, PathBuf)> = self
            .state
            .steps
            .iter()
            .filter(|(_, rt)| rt.status == StepStatus::WaitingOnHuman)
            .filter_map(|(id, rt)| {
                rt.manual_input_path.clone().map(|path| (id.clone(), path))
            })
            .collect();

        let mut progress = false;
        for (id, path) in waiting {
            if !path.exists() {
                continue;
            }
            let manual_env = parse_manual_input(&path);
            info!(step = %id, path = %path.display(), "manual input received; resuming step");
            self.pending_manual_env.insert(id.clone(), manual_env);
            self.launch_step(&id);
            progress = true;
        }
        progress
    }

    // -----------------------------------------------------------------
    // Cancellation, persistence, termination
    // -----------------------------------------------------------------

    async fn cancel_run(&mut self) {
        warn!(run_id = %self.state.run_id, "cancellation requested; terminating active steps");
        for launch in self.active.values_mut() {
            launch.start_kill();
        }

        let deadline = Instant::now() + self.options.grace_period;
        while !self.active.is_empty() && Instant::now() < deadline {
            let ids: Vec<String> = self.active.keys().cloned().collect();
            for id in ids {
                let exited = self
                    .active
                    .get_mut(&id)
                    .map(|launch| !launch.child_running())
                    .unwrap_or(true);
                if exited {
                    self.active.remove(&id);
                }
            }
            if self.active.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.active.clear();

        for rt in self.state.steps.values_mut() {
            if !rt.status.is_terminal() {
                rt.status = StepStatus::Failed;
                rt.last_error = Some("cancelled".to_string());
                rt.ended_at = Some(utc_now());
            }
        }
        self.persist();
    }

    /// Persistence failures are logged and retried on the next tick; they
    /// never kill the loop.
    fn persist(&mut self) {
        if let Err(err) = self.store.save(&mut self.state) {
            error!(error = %err, "failed to persist run state; will retry next tick");
        }
    }

    fn all_terminal(&self) -> bool {
        self.steps.keys().all(|id| {
            self.state
                .steps
                .get(id)
                .map(|rt| rt.status.is_terminal())
                .unwrap_or(false)
        })
    }

    // -----------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------

    fn notify_failed(&self, id: &str) {
        let Some(rt) = self.state.steps.get(id) else {
            return;
        };
        let log_path = self.runner.log_path(&self.state.run_id, id, rt.attempts.max(1));
        self.notifier.fire(StepEvent {
            kind: StepEventKind::StepFailed,
            run_id: self.state.run_id.clone(),
            workflow: self.workflow.name.clone(),
            step_id: id.to_string(),
            attempts: rt.attempts,
            iteration_count: rt.iteration_count,
            last_error: rt.last_error.clone(),
            log_tail: read_log_tail(&log_path),
            manual_input_path: None,
        });
    }

    fn notify_paused(&self, id: &str) {
        let Some(rt) = self.state.steps.get(id) else {
            return;
        };
        let log_path = self.runner.log_path(&self.state.run_id, id, rt.attempts.max(1));
        self.notifier.fire(StepEvent {
            kind: StepEventKind::StepPaused,
            run_id: self.state.run_id.clone(),
            workflow: self.workflow.name.clone(),
            step_id: id.to_string(),
            attempts: rt.attempts,
            iteration_count: rt.iteration_count,
            last_error: rt.last_error.clone(),
            log_tail: read_log_tail(&log_path),
            manual_input_path: rt.manual_input_path.clone(),
        });
    }
}

/// Merge a manual-input JSON object into env form: keys uppercased,
/// scalar strings raw, anything else JSON-encoded.
fn parse_manual_input(path: &Path) -> BTreeMap<String, String> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unable to read manual input");
            return BTreeMap::new();
        }
    };
    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key.to_uppercase(), rendered)
            })
            .collect(),
        _ => {
            warn!(
                path = %path.display(),
                "manual input is not a JSON object; resuming without merged env"
            );
            BTreeMap::new()
        }
    }
}

fn env_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
