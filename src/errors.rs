// src/errors.rs

//! Crate-wide error types.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("workflow definition error: {0}")]
    WorkflowDefinition(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("prompt file not found for '{0}'")]
    PromptNotFound(String),

    #[error("invalid run report at {path}: {message}")]
    ReportParse { path: PathBuf, message: String },

    #[error("placeholder content in run report at {path}: {message}")]
    PlaceholderContent { path: PathBuf, message: String },

    #[error("run state error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
