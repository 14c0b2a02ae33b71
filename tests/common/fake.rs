//! Fake wrapper backend: scripts per-step outcomes and writes report files
//! directly, so scheduler behaviour can be tested without OS processes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::json;

use agentdag::errors::Result;
use agentdag::exec::{ChildHandle, LaunchRequest, WrapperBackend};
use agentdag::state::utc_now;

/// One scripted wrapper invocation.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Write a COMPLETED report.
    Completed {
        logs: Vec<String>,
        artifacts: Vec<String>,
        metrics: BTreeMap<String, serde_json::Value>,
        gate_failure: bool,
    },
    /// Write a FAILED report.
    Failed { logs: Vec<String> },
    /// Exit with this code without writing any report.
    ExitWithoutReport(i32),
    /// Never exit and never report (until killed).
    Hang,
}

impl Scripted {
    pub fn ok() -> Self {
        Self::Completed {
            logs: vec!["did the work".to_string()],
            artifacts: vec![],
            metrics: BTreeMap::new(),
            gate_failure: false,
        }
    }

    pub fn ok_with_artifacts(artifacts: &[&str]) -> Self {
        Self::Completed {
            logs: vec!["produced artifacts".to_string()],
            artifacts: artifacts.iter().map(|a| a.to_string()).collect(),
            metrics: BTreeMap::new(),
            gate_failure: false,
        }
    }

    pub fn ok_with_metric(key: &str, value: serde_json::Value) -> Self {
        let mut metrics = BTreeMap::new();
        metrics.insert(key.to_string(), value);
        Self::Completed {
            logs: vec!["recorded metrics".to_string()],
            artifacts: vec![],
            metrics,
            gate_failure: false,
        }
    }

    pub fn gate_failure() -> Self {
        Self::Completed {
            logs: vec!["review found blocking issues".to_string()],
            artifacts: vec![],
            metrics: BTreeMap::new(),
            gate_failure: true,
        }
    }

    pub fn failed(message: &str) -> Self {
        Self::Failed {
            logs: vec![message.to_string()],
        }
    }
}

/// Per-step queues of scripted outcomes. Steps without a script entry
/// complete successfully; an exhausted queue repeats its last outcome.
#[derive(Debug, Default, Clone)]
pub struct Script {
    outcomes: HashMap<String, VecDeque<Scripted>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, id: &str, outcomes: Vec<Scripted>) -> Self {
        self.outcomes.insert(id.to_string(), outcomes.into());
        self
    }
}

pub struct FakeBackend {
    script: Script,
    launches: Arc<Mutex<Vec<LaunchRequest>>>,
}

impl FakeBackend {
    pub fn new(script: Script) -> (Self, Arc<Mutex<Vec<LaunchRequest>>>) {
        let launches = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                script,
                launches: launches.clone(),
            },
            launches,
        )
    }

    fn next_outcome(&mut self, step_id: &str) -> Scripted {
        match self.script.outcomes.get_mut(step_id) {
            Some(queue) => {
                if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap_or_else(Scripted::ok)
                }
            }
            None => Scripted::ok(),
        }
    }
}

impl WrapperBackend for FakeBackend {
    fn launch(&mut self, request: &LaunchRequest) -> Result<Box<dyn ChildHandle>> {
        self.launches.lock().unwrap().push(request.clone());

        // Mirror the production backend's log file.
        if let Some(parent) = request.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &request.log_path,
            format!("fake wrapper for {} attempt {}\n", request.step_id, request.attempt),
        )?;

        let outcome = self.next_outcome(&request.step_id);
        let exit = match outcome {
            Scripted::Completed {
                logs,
                artifacts,
                metrics,
                gate_failure,
            } => {
                write_report(request, "COMPLETED", logs, artifacts, metrics, gate_failure);
                Some(0)
            }
            Scripted::Failed { logs } => {
                write_report(request, "FAILED", logs, vec![], BTreeMap::new(), false);
                Some(0)
            }
            Scripted::ExitWithoutReport(code) => Some(code),
            Scripted::Hang => None,
        };

        Ok(Box::new(FakeChild {
            code: exit,
            killed: false,
        }))
    }
}

fn write_report(
    request: &LaunchRequest,
    status: &str,
    logs: Vec<String>,
    artifacts: Vec<String>,
    metrics: BTreeMap<String, serde_json::Value>,
    gate_failure: bool,
) {
    let report = json!({
        "schema": "run_report@v0",
        "run_id": request.run_id,
        "step_id": request.step_id,
        "agent": request.agent,
        "status": status,
        "started_at": utc_now(),
        "ended_at": utc_now(),
        "artifacts": artifacts,
        "metrics": metrics,
        "logs": logs,
        "gate_failure": gate_failure,
    });
    if let Some(parent) = request.report_path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(
        &request.report_path,
        serde_json::to_string_pretty(&report).unwrap(),
    )
    .unwrap();
}

struct FakeChild {
    code: Option<i32>,
    killed: bool,
}

impl ChildHandle for FakeChild {
    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        if self.killed {
            return Ok(Some(-9));
        }
        Ok(self.code)
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        self.killed = true;
        Ok(())
    }
}
