// src/engine/expand.rs

//! Loop expansion: turning one declared looping step into N serialized
//! per-item instances.
//!
//! Items are resolved at the moment the declared step becomes ready, not at
//! workflow load time, because they may come out of a predecessor's report.

use std::path::Path;

use serde_json::Value;

use crate::state::{RunState, StepStatus};
use crate::workflow::{LoopSource, LoopSpec};

/// Synthetic id for the Nth instance of a looping step.
pub fn child_id(parent: &str, index: usize) -> String {
    format!("{parent}__{index:02}")
}

/// Resolve the item list for a loop whose declared step just became ready.
///
/// Errors are returned as plain strings; the orchestrator records them as
/// the parent's `last_error` and fails the step.
pub fn resolve_items(
    spec: &LoopSpec,
    state: &RunState,
    repo_dir: &Path,
) -> Result<Vec<Value>, String> {
    let mut items = match &spec.source {
        LoopSource::Inline(items) => items.clone(),
        LoopSource::FromStep { step, metric } => resolve_from_step(step, metric.as_deref(), state, repo_dir)?,
        LoopSource::FromArtifact(path) => {
            let resolved = if path.is_absolute() {
                path.clone()
            } else {
                repo_dir.join(path)
            };
            read_items_file(&resolved)?
        }
    };

    if let Some(cap) = spec.max_iterations {
        items.truncate(cap);
    }
    Ok(items)
}

fn resolve_from_step(
    step_id: &str,
    metric: Option<&str>,
    state: &RunState,
    repo_dir: &Path,
) -> Result<Vec<Value>, String> {
    let runtime = state
        .steps
        .get(step_id)
        .ok_or_else(|| format!("loop source step '{step_id}' has no runtime record"))?;
    if runtime.status != StepStatus::Completed {
        return Err(format!(
            "loop source step '{step_id}' is {} instead of COMPLETED",
            runtime.status
        ));
    }

    if let Some(key) = metric {
        let raw = runtime.metrics.get(key).ok_or_else(|| {
            format!("loop source step '{step_id}' has no metric '{key}'")
        })?;
        return match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(_) => Err(format!(
                "metric '{key}' of step '{step_id}' is not a JSON array"
            )),
            Err(err) => Err(format!(
                "metric '{key}' of step '{step_id}' is not valid JSON: {err}"
            )),
        };
    }

    let first = runtime.artifacts.first().ok_or_else(|| {
        format!("loop source step '{step_id}' produced no artifacts")
    })?;
    let path = Path::new(first);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo_dir.join(path)
    };
    read_items_file(&resolved)
}

/// A JSON array file, or an object carrying the array under `items`.
fn read_items_file(path: &Path) -> Result<Vec<Value>, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| format!("unable to read loop items from {}: {err}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .map_err(|err| format!("loop items file {} is not valid JSON: {err}", path.display()))?;
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(format!(
                "loop items file {} must be a JSON array or an object with an 'items' array",
                path.display()
            )),
        },
        _ => Err(format!(
            "loop items file {} must be a JSON array",
            path.display()
        )),
    }
}

/// Env value for the current item: scalar strings raw, anything else
/// JSON-encoded.
pub fn item_env_value(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
