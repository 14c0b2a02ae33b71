// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::EngineError;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// poll_interval = 0.5
/// max_attempts = 2
/// max_iterations = 4
/// pause_for_human_input = false
/// grace_period = 10
/// gate_state_path = ".agents/gates.json"
///
/// [wrapper]
/// argv = ["python3", "wrapper.py", "--prompt", "{prompt}", "--report", "{report}"]
///
/// [env_overrides]
/// MODEL = "sonnet"
///
/// [placeholders]
/// phrases = ["fill me in"]
/// ```
///
/// All sections except `[wrapper]` are optional and have defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEngineConfig {
    #[serde(default)]
    pub engine: EngineSection,

    pub wrapper: WrapperSection,

    /// Key/value pairs merged into every wrapper environment.
    #[serde(default)]
    pub env_overrides: BTreeMap<String, String>,

    #[serde(default)]
    pub placeholders: PlaceholderSection,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Scheduler tick period in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,

    /// Per-step retry cap within one iteration.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Loop-back cap per step.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Enable WAITING_ON_HUMAN transitions for `human_in_the_loop` steps.
    #[serde(default)]
    pub pause_for_human_input: bool,

    /// Seconds to wait for killed children to exit on cancellation.
    #[serde(default = "default_grace_period")]
    pub grace_period: u64,

    /// Optional JSON file mapping gate key -> boolean. When absent all
    /// gates are considered open.
    #[serde(default)]
    pub gate_state_path: Option<PathBuf>,
}

fn default_poll_interval() -> f64 {
    0.5
}

fn default_max_attempts() -> u32 {
    2
}

fn default_max_iterations() -> u32 {
    4
}

fn default_grace_period() -> u64 {
    10
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_attempts: default_max_attempts(),
            max_iterations: default_max_iterations(),
            pause_for_human_input: false,
            grace_period: default_grace_period(),
            gate_state_path: None,
        }
    }
}

/// `[wrapper]` section: how to invoke the wrapper subprocess.
///
/// Each argv element may contain `{placeholder}` references substituted at
/// launch time: `{run_id}`, `{step_id}`, `{agent}`, `{prompt}`, `{report}`,
/// `{repo}`, `{attempt}`, `{manual_input}`.
#[derive(Debug, Clone, Deserialize)]
pub struct WrapperSection {
    pub argv: Vec<String>,
}

/// `[placeholders]` section: extra phrases appended to the built-in
/// placeholder blacklist used by the run-report validator.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlaceholderSection {
    #[serde(default)]
    pub phrases: Vec<String>,
}

/// Validated engine configuration used by the rest of the application.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub max_iterations: u32,
    pub pause_for_human_input: bool,
    pub grace_period: Duration,
    pub gate_state_path: Option<PathBuf>,
    pub wrapper_argv: Vec<String>,
    pub env_overrides: BTreeMap<String, String>,
    pub placeholder_phrases: Vec<String>,
}

impl TryFrom<RawEngineConfig> for EngineConfig {
    type Error = EngineError;

    fn try_from(raw: RawEngineConfig) -> Result<Self, Self::Error> {
        if raw.wrapper.argv.is_empty() {
            return Err(EngineError::Config(
                "[wrapper].argv must contain at least the wrapper executable".to_string(),
            ));
        }
        if !raw.engine.poll_interval.is_finite() || raw.engine.poll_interval <= 0.0 {
            return Err(EngineError::Config(format!(
                "[engine].poll_interval must be a positive number of seconds (got {})",
                raw.engine.poll_interval
            )));
        }

        Ok(Self {
            poll_interval: Duration::from_secs_f64(raw.engine.poll_interval),
            max_attempts: raw.engine.max_attempts,
            max_iterations: raw.engine.max_iterations,
            pause_for_human_input: raw.engine.pause_for_human_input,
            grace_period: Duration::from_secs(raw.engine.grace_period),
            gate_state_path: raw.engine.gate_state_path,
            wrapper_argv: raw.wrapper.argv,
            env_overrides: raw.env_overrides,
            placeholder_phrases: raw.placeholders.phrases,
        })
    }
}
