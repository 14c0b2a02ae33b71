// src/workflow/loader.rs

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::workflow::model::{RawWorkflow, Workflow};
use crate::workflow::validate::validate_workflow;

/// Load a workflow definition from a YAML file, without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading workflow file at {:?}", path))?;

    let raw: RawWorkflow = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing YAML workflow from {:?}", path))?;

    let workflow = Workflow::try_from(raw)
        .with_context(|| format!("converting workflow from {:?}", path))?;

    Ok(workflow)
}

/// Load a workflow from path and run full validation.
///
/// Checks:
/// - unique, filesystem-safe step ids
/// - all `needs` / `next_on_success` / `loop_back_to` / loop references
///   point at existing steps
/// - the dependency graph has no cycles
/// - every `loop_back_to` target is an ancestor of the declaring step
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow> {
    let workflow = load_from_path(&path)?;
    validate_workflow(&workflow)
        .with_context(|| format!("validating workflow from {:?}", path.as_ref()))?;
    Ok(workflow)
}
