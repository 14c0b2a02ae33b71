// src/exec/backend.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use tracing::debug;

use crate::errors::Result;

/// Everything needed to start one wrapper invocation. Fully materialized
/// before the backend is involved, so fake backends in tests can inspect
/// the exact argv and env a real process would have received.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub run_id: String,
    /// Runtime step id, including any `__NN` loop suffix.
    pub step_id: String,
    pub agent: String,
    pub attempt: u32,
    pub prompt_path: PathBuf,
    pub report_path: PathBuf,
    pub log_path: PathBuf,
    pub manual_input_path: Option<PathBuf>,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub argv: Vec<String>,
}

/// Non-blocking view of a spawned wrapper.
pub trait ChildHandle: Send {
    /// Exit code if the child has finished, without blocking.
    fn try_wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Begin killing the child. Reaping still happens via `try_wait`.
    fn start_kill(&mut self) -> std::io::Result<()>;
}

/// How scheduled steps are turned into running wrappers.
pub trait WrapperBackend: Send {
    fn launch(&mut self, request: &LaunchRequest) -> Result<Box<dyn ChildHandle>>;
}

/// Real backend: spawns the wrapper as an OS process with stdout/stderr
/// appended to the attempt log file.
pub struct ProcessBackend;

impl WrapperBackend for ProcessBackend {
    fn launch(&mut self, request: &LaunchRequest) -> Result<Box<dyn ChildHandle>> {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_path)
            .with_context(|| format!("opening log file {:?}", request.log_path))?;
        let stderr_file = log_file
            .try_clone()
            .with_context(|| format!("cloning log handle for {:?}", request.log_path))?;

        debug!(
            step = %request.step_id,
            attempt = request.attempt,
            argv = ?request.argv,
            "spawning wrapper process"
        );

        let mut cmd = tokio::process::Command::new(&request.argv[0]);
        cmd.args(&request.argv[1..])
            .current_dir(&request.workdir)
            .envs(request.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);

        let child = cmd.spawn().with_context(|| {
            format!(
                "spawning wrapper '{}' for step '{}'",
                request.argv[0], request.step_id
            )
        })?;

        Ok(Box::new(ProcessChild { child }))
    }
}

struct ProcessChild {
    child: tokio::process::Child,
}

impl ChildHandle for ProcessChild {
    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}
