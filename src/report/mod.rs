// src/report/mod.rs

//! Run reports: the JSON artifact a wrapper writes to signal completion.

pub mod validator;

use std::collections::BTreeMap;

pub use validator::{PlaceholderPolicy, ReportValidator};

/// Outcome a wrapper reports for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Completed,
    Failed,
}

/// A validated run report.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub schema: String,
    pub run_id: String,
    pub step_id: String,
    pub agent: String,
    pub status: ReportStatus,
    pub started_at: String,
    pub ended_at: String,
    /// Repo-relative paths the step produced.
    pub artifacts: Vec<String>,
    pub metrics: BTreeMap<String, String>,
    pub logs: Vec<String>,
    /// Signals a quality-gate failure; drives loop-back.
    pub gate_failure: bool,
    /// Advisory, like `next_on_success`.
    pub next_suggested_steps: Vec<String>,
}
