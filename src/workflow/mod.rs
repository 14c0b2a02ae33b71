// src/workflow/mod.rs

//! Workflow definitions: the declared DAG of agent steps.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::load_workflow;
pub use model::{LoopSource, LoopSpec, Step, Workflow};
pub use validate::validate_workflow;
