// src/dag/graph.rs

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::workflow::Workflow;

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone)]
struct DagNode {
    /// Direct dependencies: steps that must finish before this one can run.
    deps: Vec<String>,
    /// Direct dependents: steps that depend on this one.
    dependents: Vec<String>,
}

/// Simple in-memory DAG representation keyed by step id.
///
/// Acyclicity is validated at workflow load time; here we just keep
/// adjacency information for scheduling and the loop-back closures.
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: HashMap<String, DagNode>,
}

impl DagGraph {
    /// Build a DAG from a validated [`Workflow`].
    pub fn from_workflow(workflow: &Workflow) -> Self {
        Self::from_steps(
            workflow
                .steps
                .iter()
                .map(|s| (s.id.clone(), s.needs.clone())),
        )
    }

    /// Build a DAG from `(id, needs)` pairs.
    pub fn from_steps(steps: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        let mut nodes: HashMap<String, DagNode> = HashMap::new();

        for (id, deps) in steps {
            nodes.insert(
                id,
                DagNode {
                    deps,
                    dependents: Vec::new(),
                },
            );
        }

        // Second pass: populate dependents based on deps.
        let ids: Vec<String> = nodes.keys().cloned().collect();
        for id in ids {
            let deps = nodes
                .get(&id)
                .map(|n| n.deps.clone())
                .unwrap_or_default();

            for dep in deps {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.push(id.clone());
                }
            }
        }

        Self { nodes }
    }

    /// Immediate dependencies of a step.
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a step.
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Transitive closure of `needs`: everything this step depends on.
    pub fn ancestors_of(&self, id: &str) -> HashSet<String> {
        self.closure(id, |name| self.dependencies_of(name))
    }

    /// Transitive dependents: everything that depends on this step.
    pub fn descendants_of(&self, id: &str) -> HashSet<String> {
        self.closure(id, |name| self.dependents_of(name))
    }

    /// The loop-back reset set: the target, plus every step on a dependency
    /// path from the target up to and including the triggering step.
    ///
    /// Dependents of the target that do not feed the trigger are left out.
    pub fn reset_set(&self, target: &str, trigger: &str) -> BTreeSet<String> {
        let mut set: BTreeSet<String> = BTreeSet::new();
        set.insert(target.to_string());
        set.insert(trigger.to_string());

        let trigger_ancestors = self.ancestors_of(trigger);
        for step in self.descendants_of(target) {
            if step == trigger || trigger_ancestors.contains(&step) {
                set.insert(step);
            }
        }
        set
    }

    fn closure<'a, F>(&'a self, root: &str, neighbours: F) -> HashSet<String>
    where
        F: Fn(&str) -> &'a [String],
    {
        let mut out: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = neighbours(root).to_vec();

        while let Some(name) = stack.pop() {
            if out.insert(name.clone()) {
                stack.extend(neighbours(&name).iter().cloned());
            }
        }
        out
    }
}
