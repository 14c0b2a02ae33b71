// src/exec/runner.rs

//! Materializes one wrapper invocation for a step: resolves the prompt,
//! computes report/log paths, assembles the environment, renders the argv
//! template, and hands the spawn to the backend. The runner never decides
//! retry policy; the orchestrator interprets poll outcomes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::exec::backend::{ChildHandle, LaunchRequest, WrapperBackend};
use crate::workflow::Step;

/// What the scheduler learns from polling an active launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    StillRunning,
    /// The report file exists; validation is up to the caller.
    ReportArrived,
    /// The child exited (with this code) and no report appeared.
    ChildExited(i32),
    /// The per-step wall-clock limit elapsed; the child has been killed.
    TimedOut,
}

/// Bookkeeping for one in-flight wrapper invocation.
pub struct StepLaunch {
    pub step_id: String,
    pub attempt: u32,
    pub report_path: PathBuf,
    pub log_path: PathBuf,
    launched: Instant,
    timeout: Option<Duration>,
    exit_code: Option<i32>,
    child: Box<dyn ChildHandle>,
}

impl StepLaunch {
    /// Non-blocking classification of where this launch stands.
    pub fn poll(&mut self) -> PollOutcome {
        if self.report_path.exists() {
            return PollOutcome::ReportArrived;
        }
        if let Some(code) = self.probe_exit() {
            return PollOutcome::ChildExited(code);
        }
        if let Some(limit) = self.timeout {
            if self.launched.elapsed() > limit {
                let _ = self.child.start_kill();
                return PollOutcome::TimedOut;
            }
        }
        PollOutcome::StillRunning
    }

    /// Whether the child process is still alive.
    pub fn child_running(&mut self) -> bool {
        self.probe_exit().is_none()
    }

    pub fn start_kill(&mut self) {
        let _ = self.child.start_kill();
    }

    fn probe_exit(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match self.child.try_wait() {
            Ok(Some(code)) => {
                self.exit_code = Some(code);
                self.exit_code
            }
            Ok(None) => None,
            Err(_) => {
                self.exit_code = Some(-1);
                self.exit_code
            }
        }
    }
}

/// Builds and launches wrapper invocations for the orchestrator.
pub struct StepRunner {
    backend: Box<dyn WrapperBackend>,
    argv_template: Vec<String>,
    repo_dir: PathBuf,
    workflow_root: PathBuf,
    reports_dir: PathBuf,
    logs_dir: PathBuf,
    artifacts_dir: PathBuf,
    env_overrides: BTreeMap<String, String>,
}

impl StepRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Box<dyn WrapperBackend>,
        argv_template: Vec<String>,
        repo_dir: PathBuf,
        workflow_root: PathBuf,
        run_dir: &Path,
        env_overrides: BTreeMap<String, String>,
    ) -> Self {
        Self {
            backend,
            argv_template,
            repo_dir,
            workflow_root,
            reports_dir: run_dir.join("reports"),
            logs_dir: run_dir.join("logs"),
            artifacts_dir: run_dir.join("artifacts"),
            env_overrides,
        }
    }

    /// Where the wrapper must write its report for this runtime step.
    pub fn report_path(&self, run_id: &str, step_id: &str) -> PathBuf {
        self.reports_dir.join(format!("{run_id}__{step_id}.json"))
    }

    /// Per-attempt log file.
    pub fn log_path(&self, run_id: &str, step_id: &str, attempt: u32) -> PathBuf {
        self.logs_dir
            .join(format!("{run_id}__{step_id}__attempt{attempt}.log"))
    }

    /// Launch one wrapper invocation. `extra_env` carries dependency
    /// artifacts, loop context and merged manual input, computed by the
    /// orchestrator.
    #[allow(clippy::too_many_arguments)]
    pub fn launch(
        &mut self,
        step: &Step,
        step_id: &str,
        run_id: &str,
        attempt: u32,
        manual_input_path: Option<&Path>,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<StepLaunch> {
        let prompt_path = self.resolve_prompt(&step.prompt)?;
        let report_path = self.report_path(run_id, step_id);
        let log_path = self.log_path(run_id, step_id, attempt);

        // A fresh attempt must not see the previous attempt's report.
        if report_path.exists() {
            let _ = std::fs::remove_file(&report_path);
        }

        let mut env: BTreeMap<String, String> = BTreeMap::new();
        env.insert("RUN_ID".to_string(), run_id.to_string());
        env.insert("STEP_ID".to_string(), step_id.to_string());
        env.insert("AGENT_ID".to_string(), step.agent.clone());
        env.insert(
            "REPO_DIR".to_string(),
            self.repo_dir.display().to_string(),
        );
        env.insert(
            "PROMPT_PATH".to_string(),
            prompt_path.display().to_string(),
        );
        env.insert(
            "REPORT_PATH".to_string(),
            report_path.display().to_string(),
        );
        env.insert(
            "ARTIFACTS_DIR".to_string(),
            self.artifacts_dir.display().to_string(),
        );
        env.insert("LOGS_DIR".to_string(), self.logs_dir.display().to_string());
        env.insert("STEP_ATTEMPT".to_string(), attempt.to_string());
        env.insert(
            "MANUAL_RESULT_PATH".to_string(),
            manual_input_path
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        env.extend(self.env_overrides.clone());
        env.extend(extra_env.clone());

        let argv = self.render_argv(step, step_id, run_id, attempt, &prompt_path, &report_path, manual_input_path);

        let request = LaunchRequest {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            agent: step.agent.clone(),
            attempt,
            prompt_path,
            report_path: report_path.clone(),
            log_path: log_path.clone(),
            manual_input_path: manual_input_path.map(|p| p.to_path_buf()),
            workdir: self.repo_dir.clone(),
            env,
            argv,
        };

        let child = self.backend.launch(&request)?;

        Ok(StepLaunch {
            step_id: step_id.to_string(),
            attempt,
            report_path,
            log_path,
            launched: Instant::now(),
            timeout: step.timeout_secs.map(Duration::from_secs),
            exit_code: None,
            child,
        })
    }

    /// Resolution order: absolute path, repo prompt override, workflow
    /// root, repo root.
    fn resolve_prompt(&self, prompt: &str) -> Result<PathBuf> {
        let candidate = Path::new(prompt);
        if candidate.is_absolute() && candidate.exists() {
            return Ok(candidate.to_path_buf());
        }

        if let Some(basename) = candidate.file_name() {
            let local_override = self.repo_dir.join(".agents").join("prompts").join(basename);
            if local_override.exists() {
                debug!(prompt = %prompt, path = %local_override.display(), "using local prompt override");
                return Ok(local_override);
            }
        }

        let from_workflow = self.workflow_root.join(candidate);
        if from_workflow.exists() {
            return Ok(from_workflow);
        }
        let from_repo = self.repo_dir.join(candidate);
        if from_repo.exists() {
            return Ok(from_repo);
        }

        Err(EngineError::PromptNotFound(prompt.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    fn render_argv(
        &self,
        step: &Step,
        step_id: &str,
        run_id: &str,
        attempt: u32,
        prompt_path: &Path,
        report_path: &Path,
        manual_input_path: Option<&Path>,
    ) -> Vec<String> {
        let substitutions: [(&str, String); 8] = [
            ("{run_id}", run_id.to_string()),
            ("{step_id}", step_id.to_string()),
            ("{agent}", step.agent.clone()),
            ("{prompt}", prompt_path.display().to_string()),
            ("{report}", report_path.display().to_string()),
            ("{repo}", self.repo_dir.display().to_string()),
            ("{attempt}", attempt.to_string()),
            (
                "{manual_input}",
                manual_input_path
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
        ];

        self.argv_template
            .iter()
            .map(|element| {
                let mut rendered = element.clone();
                for (key, value) in &substitutions {
                    rendered = rendered.replace(key, value);
                }
                rendered
            })
            .collect()
    }
}
