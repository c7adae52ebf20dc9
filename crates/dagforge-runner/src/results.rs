//! Run results and `run_results.json`

use crate::error::RunnerError;
use dagforge_catalog::AdapterResponse;
use dagforge_core::{ExitCode, SecretScrubber};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Schema URL written to `metadata.dbt_schema_version`
pub const RUN_RESULTS_SCHEMA: &str = "https://schemas.dagforge.dev/run-results/v6.json";

pub const RUN_RESULTS_FILE: &str = "run_results.json";

/// Terminal status of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Success,
    Error,
    Skipped,
    /// Test returned no failures
    Pass,
    /// Test returned failures at `error` severity
    Fail,
    /// Test returned failures at `warn` severity
    Warn,
}

impl NodeStatus {
    /// Whether descendants of this node must be skipped
    pub fn is_failure(self) -> bool {
        matches!(self, NodeStatus::Error | NodeStatus::Fail)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Success => "success",
            NodeStatus::Error => "error",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Pass => "pass",
            NodeStatus::Fail => "fail",
            NodeStatus::Warn => "warn",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed phase of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingInfo {
    /// `compile` or `execute`
    pub name: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

/// Result for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub unique_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub timing: Vec<TimingInfo>,
    /// Worker slot that ran the node, e.g. `Thread-2`
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Seconds
    pub execution_time: f64,
    #[serde(default)]
    pub adapter_response: Option<AdapterResponse>,
    #[serde(default)]
    pub message: Option<String>,
    /// Failing rows of a test
    #[serde(default)]
    pub failures: Option<u64>,
    /// Rendered statement sent to the adapter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_code: Option<String>,
}

impl NodeResult {
    pub fn new(unique_id: impl Into<String>, status: NodeStatus) -> Self {
        Self {
            unique_id: unique_id.into(),
            status,
            timing: Vec::new(),
            thread_id: None,
            execution_time: 0.0,
            adapter_response: None,
            message: None,
            failures: None,
            compiled_code: None,
        }
    }

    pub fn skipped(unique_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(unique_id, NodeStatus::Skipped).with_message(message)
    }

    pub fn error(unique_id: impl Into<String>, err: &RunnerError) -> Self {
        Self::new(unique_id, NodeStatus::Error).with_message(err.to_string())
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResultsMetadata {
    pub dbt_schema_version: String,
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub invocation_id: String,
}

impl Default for RunResultsMetadata {
    fn default() -> Self {
        Self {
            dbt_schema_version: RUN_RESULTS_SCHEMA.to_string(),
            generated_at: chrono::Utc::now(),
            invocation_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Everything one invocation produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResults {
    pub metadata: RunResultsMetadata,
    pub results: Vec<NodeResult>,
    /// Seconds
    pub elapsed_time: f64,
    /// The run was cancelled before every node finished
    #[serde(default)]
    pub interrupted: bool,
}

impl RunResults {
    pub fn new(results: Vec<NodeResult>, elapsed_time: f64, interrupted: bool) -> Self {
        Self {
            metadata: RunResultsMetadata::default(),
            results,
            elapsed_time,
            interrupted,
        }
    }

    pub fn get(&self, unique_id: &str) -> Option<&NodeResult> {
        self.results.iter().find(|r| r.unique_id == unique_id)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.status.is_failure())
    }

    /// 0 unless a node failed or the run was interrupted
    pub fn exit_code(&self) -> ExitCode {
        if self.interrupted || self.has_failures() {
            ExitCode::Failure
        } else {
            ExitCode::Success
        }
    }

    pub fn path_in(target_dir: &Path) -> PathBuf {
        target_dir.join(RUN_RESULTS_FILE)
    }

    /// Write `run_results.json` with secrets scrubbed from every string
    pub fn write(&self, target_dir: &Path, scrubber: &SecretScrubber) -> Result<PathBuf, RunnerError> {
        let path = Self::path_in(target_dir);
        let mut value = serde_json::to_value(self).map_err(|e| RunnerError::Serialize(e.to_string()))?;
        scrubber.scrub_json(&mut value);
        let json = serde_json::to_string_pretty(&value).map_err(|e| RunnerError::Serialize(e.to_string()))?;

        std::fs::create_dir_all(target_dir).map_err(|e| RunnerError::Io {
            path: target_dir.display().to_string(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|e| RunnerError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        tracing::debug!(path = %path.display(), results = self.results.len(), "Wrote run results");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_follows_failures_and_interrupts() {
        let ok = RunResults::new(vec![NodeResult::new("model.p.a", NodeStatus::Success)], 0.1, false);
        assert_eq!(ok.exit_code(), ExitCode::Success);

        let warned = RunResults::new(vec![NodeResult::new("test.p.t", NodeStatus::Warn)], 0.1, false);
        assert_eq!(warned.exit_code(), ExitCode::Success);

        let failed = RunResults::new(vec![NodeResult::new("test.p.t", NodeStatus::Fail)], 0.1, false);
        assert_eq!(failed.exit_code(), ExitCode::Failure);

        let interrupted = RunResults::new(Vec::new(), 0.1, true);
        assert_eq!(interrupted.exit_code(), ExitCode::Failure);
    }

    #[test]
    fn written_results_are_scrubbed() {
        let dir = tempfile::tempdir().unwrap();
        let scrubber = SecretScrubber::from_pairs(
            [("DBT_ENV_SECRET_TOKEN".to_string(), "hunter2".to_string())],
            "DBT_ENV_SECRET_",
        );
        let result = NodeResult::new("model.p.a", NodeStatus::Error).with_message("login failed for hunter2");
        let path = RunResults::new(vec![result], 1.0, false).write(dir.path(), &scrubber).unwrap();

        let json = std::fs::read_to_string(path).unwrap();
        assert!(!json.contains("hunter2"));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["metadata"]["dbt_schema_version"], RUN_RESULTS_SCHEMA);
        assert_eq!(value["results"][0]["status"], "error");
        assert_eq!(value["results"][0]["message"], "login failed for *****");
    }
}
