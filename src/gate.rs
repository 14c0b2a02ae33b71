// src/gate.rs

//! Gate evaluation: external boolean predicates that must hold before a
//! step may launch. Gates are re-read every scheduler tick, so an external
//! system can flip them open between ticks.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::debug;

/// Answers "is this gate open for this step right now?".
pub trait GateEvaluator: Send {
    fn open(&self, step_id: &str, gate: &str) -> bool;
}

/// Used when no gate file is configured: every gate is open.
pub struct AlwaysOpenGates;

impl GateEvaluator for AlwaysOpenGates {
    fn open(&self, _step_id: &str, _gate: &str) -> bool {
        true
    }
}

/// Reads gate states from a JSON object (`{"ci_green": true}`) maintained
/// by external systems. A missing file, unreadable JSON, or an absent key
/// all evaluate to closed.
pub struct FileBackedGates {
    path: PathBuf,
}

impl FileBackedGates {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn states(&self) -> BTreeMap<String, bool> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_str::<serde_json::Value>(&contents) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .map(|(k, v)| (k, v.as_bool().unwrap_or(false)))
                .collect(),
            _ => {
                debug!(path = %self.path.display(), "gate state file is not a JSON object");
                BTreeMap::new()
            }
        }
    }
}

impl GateEvaluator for FileBackedGates {
    fn open(&self, _step_id: &str, gate: &str) -> bool {
        self.states().get(gate).copied().unwrap_or(false)
    }
}

/// Build the evaluator implied by configuration.
pub fn evaluator_from_config(path: Option<PathBuf>) -> Box<dyn GateEvaluator> {
    match path {
        Some(path) => Box::new(FileBackedGates::new(path)),
        None => Box::new(AlwaysOpenGates),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_closes_named_gates() {
        let gates = FileBackedGates::new("/nonexistent/gates.json");
        assert!(!gates.open("build", "ci_green"));
    }

    #[test]
    fn file_backed_gates_follow_the_json_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gates.json");
        std::fs::write(&path, r#"{"ci_green": true, "approved": false}"#).unwrap();

        let gates = FileBackedGates::new(&path);
        assert!(gates.open("build", "ci_green"));
        assert!(!gates.open("build", "approved"));
        assert!(!gates.open("build", "unknown"));

        // Flip a gate open; the next evaluation sees it.
        std::fs::write(&path, r#"{"ci_green": true, "approved": true}"#).unwrap();
        assert!(gates.open("build", "approved"));
    }
}
