// Backends Module
// Pluggable runtimes that start, poll, cancel and clean up step executions

pub mod classifier;
pub mod container;
pub mod local;
pub mod workspace;

#[cfg(all(test, unix))]
pub(crate) mod testing;

// Re-export key types
pub use classifier::{Classification, ErrorClassifier, FailureContext, MarkerClassifier};
pub use container::{ContainerBackend, CONTAINER_BACKEND};
pub use local::{LocalBackend, LOCAL_BACKEND};
pub use workspace::{
    ExecutionWorkspace, StagingMode, ARTIFACTS_DIR_VAR, EXECUTION_ID_VAR, INPUTS_DIR_VAR,
    STEP_RUN_ID_VAR,
};

use crate::config::ExecutorConfig;
use crate::error::ExecutorResult;
use crate::execution::models::{ArtifactSpec, ExecutionResult, ExecutionStatus};

use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Time a cancelled job gets to exit before it is killed
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Why the backend is stopping an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    Cancelled,
    TimedOut,
}

impl Termination {
    /// Status an execution settles in once it has stopped
    pub(crate) fn final_status(self) -> ExecutionStatus {
        match self {
            Termination::Cancelled => ExecutionStatus::Cancelled,
            Termination::TimedOut => ExecutionStatus::Failed,
        }
    }
}

/// Trait for execution backends.
///
/// A backend owns every execution it creates; ids it returns are only
/// meaningful to that backend instance.
#[async_trait::async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Name the backend registers under (e.g. "local")
    fn backend_type(&self) -> &str;

    /// Prepare the backend for submissions. Safe to call repeatedly; the
    /// latest config applies to later submissions only.
    async fn initialize(&self, config: &ExecutorConfig) -> ExecutorResult<()>;

    /// Start a job and return its backend execution id once it is running
    async fn submit(
        &self,
        step_run_id: Uuid,
        command: &str,
        input_artifacts: &HashMap<String, String>,
        expected_outputs: &[ArtifactSpec],
    ) -> ExecutorResult<Uuid>;

    /// Poll the current status, enforcing the timeout
    async fn get_status(&self, execution_id: Uuid) -> ExecutorResult<ExecutionStatus>;

    /// Logs, artifacts and failure classification of an execution
    async fn get_result(&self, execution_id: Uuid) -> ExecutorResult<ExecutionResult>;

    /// Stop a running job. Returns true when the job is no longer running.
    async fn cancel(&self, execution_id: Uuid) -> ExecutorResult<bool>;

    /// Release native resources and forget the execution
    async fn cleanup(&self, execution_id: Uuid) -> ExecutorResult<()>;
}
