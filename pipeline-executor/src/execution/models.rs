use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Status of an execution, moving only forward through
/// Pending -> Running -> terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Merge a freshly observed status into a cached one without ever
    /// leaving a terminal state
    pub fn advance(self, observed: ExecutionStatus) -> ExecutionStatus {
        if self.is_terminal() {
            self
        } else {
            observed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient infrastructure failure (timeouts, kills, runtime hiccups)
    Retryable,
    /// Deterministic failure caused by the step itself or its input
    NonRetryable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Retryable => f.write_str("retryable"),
            ErrorKind::NonRetryable => f.write_str("non_retryable"),
        }
    }
}

/// Outcome of a step run as seen by the pipeline layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepRunStatus {
    /// Map a finished execution onto a step run status
    pub fn from_execution(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Pending => StepRunStatus::Pending,
            ExecutionStatus::Running => StepRunStatus::Running,
            ExecutionStatus::Completed => StepRunStatus::Completed,
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => StepRunStatus::Failed,
        }
    }
}

impl fmt::Display for StepRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepRunStatus::Pending => "pending",
            StepRunStatus::Running => "running",
            StepRunStatus::Completed => "completed",
            StepRunStatus::Failed => "failed",
            StepRunStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

fn default_retention_days() -> u32 {
    14
}

/// An artifact a step is expected to produce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Name, unique within a job; also the file name under the artifacts dir
    pub name: String,
    /// Logical path the artifact is published under
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl ArtifactSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: name.clone(),
            name,
            retention_days: default_retention_days(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }
}

/// Result of a finished (or still running) execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    /// -1 when no exit code is available yet or the process was signalled
    pub exit_code: i32,
    /// Captured stdout and stderr, merged, with secret values redacted
    pub logs: String,
    /// Artifact name -> host path, only for artifacts that exist
    pub artifacts: HashMap<String, String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_terminal_status_never_regresses() {
        assert_eq!(
            ExecutionStatus::Running.advance(ExecutionStatus::Completed),
            ExecutionStatus::Completed
        );
        assert_eq!(
            ExecutionStatus::Cancelled.advance(ExecutionStatus::Running),
            ExecutionStatus::Cancelled
        );
        assert_eq!(
            ExecutionStatus::Failed.advance(ExecutionStatus::Completed),
            ExecutionStatus::Failed
        );
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ExecutionStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        assert_eq!(ErrorKind::NonRetryable.to_string(), "non_retryable");
    }

    #[test]
    fn test_step_run_status_mapping() {
        assert_eq!(
            StepRunStatus::from_execution(ExecutionStatus::Completed),
            StepRunStatus::Completed
        );
        assert_eq!(
            StepRunStatus::from_execution(ExecutionStatus::Cancelled),
            StepRunStatus::Failed
        );
        assert_eq!(StepRunStatus::Skipped.to_string(), "skipped");
    }

    #[test]
    fn test_artifact_spec_defaults() {
        let spec: ArtifactSpec = serde_yaml::from_str("name: model.pkl").unwrap();
        assert_eq!(spec.name, "model.pkl");
        assert_eq!(spec.retention_days, 14);

        let spec = ArtifactSpec::new("report.csv").with_retention_days(3);
        assert_eq!(spec.path, "report.csv");
        assert_eq!(spec.retention_days, 3);
    }
}
