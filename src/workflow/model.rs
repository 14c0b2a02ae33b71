// src/workflow/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::errors::EngineError;

/// Default env var names for loop context.
pub const DEFAULT_ITEM_VAR: &str = "LOOP_ITEM";
pub const DEFAULT_INDEX_VAR: &str = "LOOP_INDEX";

/// A named, immutable workflow DAG loaded once per run.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub description: String,
    /// Steps in declaration order.
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Static configuration for a single agent step.
#[derive(Debug, Clone)]
pub struct Step {
    /// Stable id, unique within the workflow, safe as a filesystem segment.
    pub id: String,
    /// Logical role name; informational, exported to the wrapper env.
    pub agent: String,
    /// Prompt file, resolved against the repo override dir, the workflow
    /// root, then the repo root.
    pub prompt: String,
    /// Step ids that must be COMPLETED (or SKIPPED) before this step runs.
    pub needs: Vec<String>,
    /// Advisory: readiness is derived from `needs` alone.
    pub next_on_success: Vec<String>,
    /// External gate predicates that must be open before launch.
    pub gates: Vec<String>,
    /// Pause for an operator-written input file before running.
    pub human_in_the_loop: bool,
    /// Ancestor step rewound when this step reports a gate failure.
    pub loop_back_to: Option<String>,
    /// Wall-clock limit for one wrapper invocation.
    pub timeout_secs: Option<u64>,
    pub metadata: BTreeMap<String, String>,
    pub loop_spec: Option<LoopSpec>,
}

/// Loop configuration on a declared step.
#[derive(Debug, Clone)]
pub struct LoopSpec {
    pub source: LoopSource,
    /// Env var name carrying the current item.
    pub item_var: String,
    /// Env var name carrying the current index.
    pub index_var: String,
    /// Cap on the number of expanded instances.
    pub max_iterations: Option<usize>,
}

/// Where loop items come from. Exactly one source per loop, enforced at
/// load time so the invariant is structural from here on.
#[derive(Debug, Clone)]
pub enum LoopSource {
    /// Inline JSON array of items.
    Inline(Vec<Value>),
    /// A predecessor's report: its first artifact as a JSON array file, or
    /// a named `metrics` entry parsed as a JSON array.
    FromStep {
        step: String,
        metric: Option<String>,
    },
    /// Repo-relative path to a JSON array file.
    FromArtifact(PathBuf),
}

// ---------------------------------------------------------------------------
// Raw (serde) forms
// ---------------------------------------------------------------------------

/// Workflow file as deserialized from YAML, before semantic conversion.
#[derive(Debug, Clone, Deserialize)]
pub struct RawWorkflow {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<RawStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStep {
    pub id: String,
    pub agent: String,
    pub prompt: String,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub next_on_success: Vec<String>,
    #[serde(default)]
    pub gates: Vec<String>,
    #[serde(default)]
    pub human_in_the_loop: bool,
    #[serde(default)]
    pub loop_back_to: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, rename = "loop")]
    pub loop_spec: Option<RawLoopSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLoopSpec {
    #[serde(default)]
    pub items: Option<Vec<Value>>,
    #[serde(default)]
    pub items_from_step: Option<String>,
    /// Only meaningful with `items_from_step`: read the item list from this
    /// metrics entry instead of the first artifact.
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub items_from_artifact: Option<PathBuf>,
    #[serde(default)]
    pub item_var: Option<String>,
    #[serde(default)]
    pub index_var: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

impl RawLoopSpec {
    fn into_spec(self, step_id: &str) -> Result<LoopSpec, EngineError> {
        let mut sources = 0;
        if self.items.is_some() {
            sources += 1;
        }
        if self.items_from_step.is_some() {
            sources += 1;
        }
        if self.items_from_artifact.is_some() {
            sources += 1;
        }
        if sources != 1 {
            return Err(EngineError::WorkflowDefinition(format!(
                "step '{}' loop must specify exactly one of: items, items_from_step, items_from_artifact",
                step_id
            )));
        }
        if self.metric.is_some() && self.items_from_step.is_none() {
            return Err(EngineError::WorkflowDefinition(format!(
                "step '{}' loop 'metric' is only valid together with items_from_step",
                step_id
            )));
        }

        let source = if let Some(items) = self.items {
            LoopSource::Inline(items)
        } else if let Some(step) = self.items_from_step {
            LoopSource::FromStep {
                step,
                metric: self.metric,
            }
        } else {
            LoopSource::FromArtifact(self.items_from_artifact.expect("checked above"))
        };

        Ok(LoopSpec {
            source,
            item_var: self.item_var.unwrap_or_else(|| DEFAULT_ITEM_VAR.to_string()),
            index_var: self
                .index_var
                .unwrap_or_else(|| DEFAULT_INDEX_VAR.to_string()),
            max_iterations: self.max_iterations,
        })
    }
}

impl TryFrom<RawStep> for Step {
    type Error = EngineError;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let loop_spec = match raw.loop_spec {
            Some(ls) => Some(ls.into_spec(&raw.id)?),
            None => None,
        };
        Ok(Self {
            id: raw.id,
            agent: raw.agent,
            prompt: raw.prompt,
            needs: raw.needs,
            next_on_success: raw.next_on_success,
            gates: raw.gates,
            human_in_the_loop: raw.human_in_the_loop,
            loop_back_to: raw.loop_back_to,
            timeout_secs: raw.timeout_secs,
            metadata: raw.metadata,
            loop_spec,
        })
    }
}

impl TryFrom<RawWorkflow> for Workflow {
    type Error = EngineError;

    fn try_from(raw: RawWorkflow) -> Result<Self, Self::Error> {
        let mut steps = Vec::with_capacity(raw.steps.len());
        for raw_step in raw.steps {
            steps.push(Step::try_from(raw_step)?);
        }
        Ok(Self {
            name: raw.name.unwrap_or_else(|| "unnamed".to_string()),
            description: raw.description.unwrap_or_default(),
            steps,
        })
    }
}
