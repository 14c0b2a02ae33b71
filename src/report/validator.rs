// src/report/validator.rs

//! Parsing and validation of run report files.
//!
//! Wrappers are expected to publish reports atomically, but racey
//! filesystems can expose partial reads, so syntactic failures are retried
//! with bounded exponential backoff before they count against the step.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::report::{ReportStatus, RunReport};

const PARSE_ATTEMPTS: u32 = 5;
const PARSE_BACKOFF_START: Duration = Duration::from_millis(100);

const REQUIRED_FIELDS: &[&str] = &[
    "schema",
    "run_id",
    "step_id",
    "agent",
    "status",
    "started_at",
    "ended_at",
];

/// Phrases that mark a report entry as instructional boilerplate the agent
/// failed to replace. Matched as lowercase substrings.
const BUILTIN_PLACEHOLDER_PHRASES: &[&str] = &[
    "<replace",
    "replace with",
    "list of created file paths",
    "list/of/created/file/paths",
    "relative path to each created file",
    "relative path to the artifact you produced",
    "summary of what you accomplished",
    "concise summary of work performed",
    "concise bullet summarizing work",
];

/// Injectable blacklist used to reject placeholder content. The built-in
/// phrase list can be extended from configuration so that prompt evolution
/// does not require code changes.
#[derive(Debug, Clone)]
pub struct PlaceholderPolicy {
    phrases: Vec<String>,
}

impl Default for PlaceholderPolicy {
    fn default() -> Self {
        Self {
            phrases: BUILTIN_PLACEHOLDER_PHRASES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl PlaceholderPolicy {
    /// Built-in phrases plus extra ones from configuration.
    pub fn with_extra_phrases(extra: &[String]) -> Self {
        let mut policy = Self::default();
        policy
            .phrases
            .extend(extra.iter().map(|p| p.trim().to_lowercase()));
        policy
    }

    /// Whether any entry still contains placeholder text.
    pub fn flags(&self, values: &[String]) -> Option<&str> {
        for value in values {
            let lowered = value.to_lowercase();
            for phrase in &self.phrases {
                if !phrase.is_empty() && lowered.contains(phrase.as_str()) {
                    return Some(phrase.as_str());
                }
            }
        }
        None
    }
}

/// Reads run report files and turns them into validated [`RunReport`]s.
pub struct ReportValidator {
    policy: PlaceholderPolicy,
}

impl ReportValidator {
    pub fn new(policy: PlaceholderPolicy) -> Self {
        Self { policy }
    }

    /// Read and validate the report at `path`.
    pub async fn read(&self, path: &Path) -> Result<RunReport> {
        let payload = self.read_payload(path).await?;
        self.validate(path, payload)
    }

    async fn read_payload(&self, path: &Path) -> Result<Value> {
        let mut delay = PARSE_BACKOFF_START;
        let mut last_error = String::new();

        for attempt in 0..PARSE_ATTEMPTS {
            if attempt > 0 {
                sleep(delay).await;
                delay *= 2;
            }

            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    last_error = format!("unable to read file: {err}");
                    continue;
                }
            };

            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    debug!(
                        path = %path.display(),
                        attempt,
                        error = %err,
                        "run report not yet parseable; backing off"
                    );
                    last_error = err.to_string();
                }
            }
        }

        Err(EngineError::ReportParse {
            path: path.to_path_buf(),
            message: last_error,
        })
    }

    fn validate(&self, path: &Path, payload: Value) -> Result<RunReport> {
        let parse_err = |message: String| EngineError::ReportParse {
            path: path.to_path_buf(),
            message,
        };
        let placeholder_err = |message: String| EngineError::PlaceholderContent {
            path: path.to_path_buf(),
            message,
        };

        let obj = payload
            .as_object()
            .ok_or_else(|| parse_err("run report must be a JSON object".to_string()))?;

        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|field| {
                !matches!(obj.get(*field), Some(Value::String(s)) if !s.trim().is_empty())
            })
            .collect();
        if !missing.is_empty() {
            return Err(parse_err(format!("missing fields: {}", missing.join(", "))));
        }

        let field = |name: &str| -> String {
            obj.get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string()
        };

        let status = match field("status").to_uppercase().as_str() {
            "COMPLETED" => ReportStatus::Completed,
            "FAILED" => ReportStatus::Failed,
            other => {
                return Err(parse_err(format!(
                    "status must be COMPLETED or FAILED (got '{other}')"
                )))
            }
        };

        let started_at = field("started_at");
        let ended_at = field("ended_at");
        parse_utc_timestamp(&started_at)
            .map_err(|e| parse_err(format!("invalid started_at: {e}")))?;
        parse_utc_timestamp(&ended_at)
            .map_err(|e| parse_err(format!("invalid ended_at: {e}")))?;

        let artifacts = normalize_string_list(obj.get("artifacts"));
        let logs = normalize_string_list(obj.get("logs"));

        if let Some(phrase) = self.policy.flags(&artifacts) {
            return Err(placeholder_err(format!(
                "artifact entry matches placeholder phrase '{phrase}'; replace it with a real relative path"
            )));
        }
        if let Some(phrase) = self.policy.flags(&logs) {
            return Err(placeholder_err(format!(
                "log entry matches placeholder phrase '{phrase}'; describe the work actually performed"
            )));
        }
        if status == ReportStatus::Completed && logs.is_empty() {
            return Err(placeholder_err(
                "at least one log entry is required in a completed run report".to_string(),
            ));
        }

        let metrics = normalize_metrics(obj.get("metrics"));
        let gate_failure = obj
            .get("gate_failure")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(RunReport {
            schema: field("schema"),
            run_id: field("run_id"),
            step_id: field("step_id"),
            agent: field("agent"),
            status,
            started_at,
            ended_at,
            artifacts,
            metrics,
            logs,
            gate_failure,
            next_suggested_steps: normalize_string_list(obj.get("next_suggested_steps")),
        })
    }
}

/// Parse an RFC 3339 timestamp, requiring an explicit UTC offset and
/// rejecting the epoch sentinel.
pub fn parse_utc_timestamp(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .map_err(|e| format!("'{value}' is not RFC 3339 with timezone: {e}"))?;

    if parsed.offset().local_minus_utc() != 0 {
        return Err(format!("'{value}' must carry a UTC offset (Z or +00:00)"));
    }

    let utc = parsed.with_timezone(&Utc);
    if utc.timestamp() == 0 && utc.timestamp_subsec_micros() == 0 {
        return Err("epoch sentinel timestamp is not a real completion time".to_string());
    }

    Ok(utc)
}

/// Coerce a JSON value into a list of trimmed, non-empty strings.
fn normalize_string_list(value: Option<&Value>) -> Vec<String> {
    let items: Vec<&Value> = match value {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single) => vec![single],
    };

    items
        .into_iter()
        .filter_map(|item| {
            let text = match item {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        })
        .collect()
}

/// Coerce metrics values to strings.
fn normalize_metrics(value: Option<&Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(Value::Object(map)) = value {
        for (key, val) in map {
            let text = match val {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.insert(key.clone(), text);
        }
    }
    out
}
