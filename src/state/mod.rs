// src/state/mod.rs

//! Durable run state: one JSON document per run, rewritten after every
//! scheduler transition so that a crash or interruption can be resumed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{EngineError, Result};

pub const STATE_SCHEMA: &str = "run_state@v1";

/// ISO-8601 UTC timestamp with microsecond precision.
pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Lifecycle status of a step within a run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    WaitingOnHuman,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether a dependency in this status unblocks its dependents.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::WaitingOnHuman => "WAITING_ON_HUMAN",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Dynamic state of a single step (or loop instance) within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepRuntime {
    #[serde(default)]
    pub status: StepStatus,
    /// Retry attempts within the current iteration.
    #[serde(default)]
    pub attempts: u32,
    /// Loop-back iterations this step has re-entered.
    #[serde(default)]
    pub iteration_count: u32,
    #[serde(default)]
    pub report_path: Option<PathBuf>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub manual_input_path: Option<PathBuf>,
    /// Id of the step whose gate failure caused the most recent reset.
    #[serde(default)]
    pub blocked_by_loop: Option<String>,
    /// On a loop parent: the item list resolved at first expansion. Kept
    /// verbatim so a rewind never re-resolves against changed inputs.
    #[serde(default)]
    pub loop_items: Option<Vec<Value>>,
    /// On a loop parent: ids of the expanded instances, in order.
    #[serde(default)]
    pub loop_children: Vec<String>,
    /// Fields written by newer schema versions survive a load/save cycle.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl StepRuntime {
    /// Clear the per-attempt fields before a retry relaunch.
    pub fn clear_attempt_fields(&mut self) {
        self.report_path = None;
        self.started_at = None;
        self.ended_at = None;
    }

    /// Rewind this step for a new loop-back iteration triggered by `trigger`.
    /// `loop_items` and `loop_children` survive; the group is replayed
    /// against the originally resolved item list.
    pub fn reset_for_loop_back(&mut self, trigger: &str) {
        self.status = StepStatus::Pending;
        self.attempts = 0;
        self.clear_attempt_fields();
        self.last_error = None;
        self.artifacts.clear();
        self.metrics.clear();
        self.logs.clear();
        self.manual_input_path = None;
        self.blocked_by_loop = Some(trigger.to_string());
    }

    /// Reset for a `start_at` resume hint: back to a fresh PENDING record
    /// while preserving `iteration_count`.
    pub fn reset_for_resume(&mut self) {
        self.status = StepStatus::Pending;
        self.attempts = 0;
        self.clear_attempt_fields();
        self.last_error = None;
        self.artifacts.clear();
        self.metrics.clear();
        self.logs.clear();
        self.manual_input_path = None;
        self.blocked_by_loop = None;
        self.loop_items = None;
        self.loop_children.clear();
    }
}

/// Top-level persisted aggregate for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub run_id: String,
    pub workflow_name: String,
    pub repo_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub manual_inputs_dir: PathBuf,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    pub steps: BTreeMap<String, StepRuntime>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_schema() -> String {
    STATE_SCHEMA.to_string()
}

impl RunState {
    pub fn new(
        run_id: impl Into<String>,
        workflow_name: impl Into<String>,
        repo_dir: PathBuf,
        reports_dir: PathBuf,
        manual_inputs_dir: PathBuf,
        step_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        let now = utc_now();
        Self {
            schema: STATE_SCHEMA.to_string(),
            run_id: run_id.into(),
            workflow_name: workflow_name.into(),
            repo_dir,
            reports_dir,
            manual_inputs_dir,
            created_at: now.clone(),
            updated_at: now,
            steps: step_ids
                .into_iter()
                .map(|id| (id, StepRuntime::default()))
                .collect(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Persists [`RunState`] as a single pretty-printed JSON document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the state document, refreshing `updated_at`.
    pub fn save(&self, state: &mut RunState) -> Result<()> {
        state.updated_at = utc_now();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| EngineError::State(format!("serializing run state: {e}")))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Load a prior state document. Absent file means "new run"; corrupt
    /// JSON is an error.
    pub fn load(&self) -> Result<Option<RunState>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let state: RunState = serde_json::from_str(&contents).map_err(|e| {
            EngineError::State(format!(
                "corrupt run state at {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(state))
    }
}
