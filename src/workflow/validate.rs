// src/workflow/validate.rs

use std::collections::HashSet;

use anyhow::Result;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::DagGraph;
use crate::errors::EngineError;
use crate::workflow::model::{LoopSource, Step, Workflow};

/// Run semantic validation against a loaded workflow.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), EngineError> {
    ensure_has_steps(workflow)?;
    validate_step_ids(workflow)?;
    validate_references(workflow)?;
    validate_dag(workflow)?;
    validate_loop_backs(workflow)?;
    Ok(())
}

fn definition_error(msg: String) -> EngineError {
    EngineError::WorkflowDefinition(msg)
}

fn ensure_has_steps(workflow: &Workflow) -> Result<(), EngineError> {
    if workflow.steps.is_empty() {
        return Err(definition_error(
            "workflow must declare at least one step".to_string(),
        ));
    }
    Ok(())
}

fn validate_step_ids(workflow: &Workflow) -> Result<(), EngineError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if step.id.is_empty() {
            return Err(definition_error("step id must not be empty".to_string()));
        }
        if !step
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(definition_error(format!(
                "step id '{}' is not filesystem-safe (use letters, digits, '-', '_')",
                step.id
            )));
        }
        if step.id.contains("__") {
            return Err(definition_error(format!(
                "step id '{}' contains '__', which is reserved for loop instances",
                step.id
            )));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(definition_error(format!(
                "duplicate step id detected: {}",
                step.id
            )));
        }
    }
    Ok(())
}

fn validate_references(workflow: &Workflow) -> Result<(), EngineError> {
    let ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();

    for step in &workflow.steps {
        for dep in &step.needs {
            if !ids.contains(dep.as_str()) {
                return Err(definition_error(format!(
                    "step '{}' has unknown dependency '{}' in `needs`",
                    step.id, dep
                )));
            }
            if dep == &step.id {
                return Err(definition_error(format!(
                    "step '{}' cannot depend on itself",
                    step.id
                )));
            }
        }
        for next in &step.next_on_success {
            if !ids.contains(next.as_str()) {
                return Err(definition_error(format!(
                    "step '{}' references unknown next step '{}'",
                    step.id, next
                )));
            }
        }
        if let Some(target) = &step.loop_back_to {
            if !ids.contains(target.as_str()) {
                return Err(definition_error(format!(
                    "step '{}' has unknown loop_back_to target '{}'",
                    step.id, target
                )));
            }
        }
        if let Some(spec) = &step.loop_spec {
            validate_loop_source(step, spec.source.clone(), &ids)?;
        }
    }
    Ok(())
}

fn validate_loop_source(
    step: &Step,
    source: LoopSource,
    ids: &HashSet<&str>,
) -> Result<(), EngineError> {
    if let LoopSource::FromStep { step: source_id, .. } = source {
        if !ids.contains(source_id.as_str()) {
            return Err(definition_error(format!(
                "step '{}' loop references unknown step '{}'",
                step.id, source_id
            )));
        }
        if !step.needs.contains(&source_id) {
            return Err(definition_error(format!(
                "step '{}' loop references step '{}' which is not in its needs list",
                step.id, source_id
            )));
        }
    }
    Ok(())
}

fn validate_dag(workflow: &Workflow) -> Result<(), EngineError> {
    // Edge direction: dep -> step. A topological sort fails on cycles.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for step in &workflow.steps {
        graph.add_node(step.id.as_str());
    }
    for step in &workflow.steps {
        for dep in &step.needs {
            graph.add_edge(dep.as_str(), step.id.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(definition_error(format!(
            "cycle detected in workflow DAG involving step '{}'",
            cycle.node_id()
        ))),
    }
}

/// Every `loop_back_to` target must be an ancestor of the declaring step,
/// i.e. in the transitive closure of its `needs`.
fn validate_loop_backs(workflow: &Workflow) -> Result<(), EngineError> {
    let graph = DagGraph::from_workflow(workflow);
    for step in &workflow.steps {
        if let Some(target) = &step.loop_back_to {
            let ancestors = graph.ancestors_of(&step.id);
            if !ancestors.contains(target) {
                return Err(definition_error(format!(
                    "step '{}' loop_back_to target '{}' is not an ancestor",
                    step.id, target
                )));
            }
        }
    }
    Ok(())
}
