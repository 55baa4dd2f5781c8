// Executor Errors
// Error taxonomy shared by backends, the worker agent and the executor service

use crate::pipeline::dependency::GraphError;

use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Result alias used throughout the crate
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors raised while running steps
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The runtime behind a backend cannot be used at all
    #[error("Backend is unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend not initialized, call initialize() first")]
    NotInitialized,

    /// A single job failed to start; other jobs are unaffected
    #[error("Failed to submit execution: {0}")]
    Submission(String),

    #[error("Execution {0} not found")]
    UnknownExecution(Uuid),

    #[error("Worker has reached maximum concurrent executions ({max})")]
    CapacityExceeded { max: usize },

    #[error("Backend of type '{0}' is not registered")]
    UnknownBackend(String),

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Worker '{name}' is {status} and not accepting executions")]
    WorkerUnavailable { name: String, status: String },

    #[error("Failed to cancel execution: {0}")]
    Cancellation(String),

    /// A call to the process or container runtime failed after submission
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl ExecutorError {
    /// Usage errors are surfaced to the caller and never retried internally
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ExecutorError::UnknownExecution(_)
                | ExecutorError::CapacityExceeded { .. }
                | ExecutorError::UnknownBackend(_)
                | ExecutorError::UnknownWorker(_)
        )
    }
}
