// src/notify/mod.rs

//! Operator notifications for step failures and human-input pauses.
//!
//! The dispatcher is asynchronous relative to the scheduler: events are
//! queued on a channel and drained by a background task, so a slow or
//! failing sink can never stall or abort the run.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{info, warn};

/// How many lines of the latest attempt log ride along with an event.
const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEventKind {
    /// A step reached terminal FAILED.
    StepFailed,
    /// A step entered WAITING_ON_HUMAN.
    StepPaused,
}

/// Payload describing a step-level event.
#[derive(Debug, Clone)]
pub struct StepEvent {
    pub kind: StepEventKind,
    pub run_id: String,
    pub workflow: String,
    pub step_id: String,
    pub attempts: u32,
    pub iteration_count: u32,
    pub last_error: Option<String>,
    pub log_tail: Vec<String>,
    pub manual_input_path: Option<PathBuf>,
}

/// Pluggable notification target.
pub trait NotificationSink: Send {
    fn notify(&self, event: &StepEvent) -> anyhow::Result<()>;
}

/// Discards all events (default behaviour).
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _event: &StepEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Emits events through `tracing`, for operators tailing the engine log.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: &StepEvent) -> anyhow::Result<()> {
        match event.kind {
            StepEventKind::StepFailed => warn!(
                run_id = %event.run_id,
                step = %event.step_id,
                attempts = event.attempts,
                iterations = event.iteration_count,
                error = event.last_error.as_deref().unwrap_or(""),
                "step failed"
            ),
            StepEventKind::StepPaused => info!(
                run_id = %event.run_id,
                step = %event.step_id,
                manual_input = %event
                    .manual_input_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                "step paused for human input"
            ),
        }
        Ok(())
    }
}

/// Handle the scheduler uses to fire events without blocking.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::Sender<StepEvent>,
}

impl NotificationDispatcher {
    /// Spawn the background drain task for the given sink.
    pub fn spawn(sink: Box<dyn NotificationSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<StepEvent>(64);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(err) = sink.notify(&event) {
                    warn!(
                        step = %event.step_id,
                        error = %err,
                        "notification sink failed; event dropped"
                    );
                }
            }
        });

        Self { tx }
    }

    /// Enqueue an event. Never blocks; a full or closed channel drops the
    /// event with a warning.
    pub fn fire(&self, event: StepEvent) {
        if let Err(err) = self.tx.try_send(event) {
            warn!(error = %err, "unable to enqueue notification");
        }
    }
}

/// Last lines of the given log file, for event payloads.
pub fn read_log_tail(path: &Path) -> Vec<String> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return Vec::new(),
    };
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    lines[start..].iter().map(|l| l.to_string()).collect()
}
