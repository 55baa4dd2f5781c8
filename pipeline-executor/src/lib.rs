// Pipeline Executor Library
// Execution backends, worker agent and pipeline runner for step runs

pub mod backends;
pub mod config;
pub mod error;
pub mod execution;
pub mod pipeline;
pub mod service;
pub mod worker;

// Re-export commonly used types
pub use error::{ExecutorError, ExecutorResult};

// Re-export configuration types
pub use config::{
    collect_platform_info, ConfigError, ContainerOptions, ExecutorConfig, ResourceLimits,
    WorkerCapability, WorkerConfig,
};

// Re-export backend types
pub use backends::{
    ContainerBackend, ErrorClassifier, ExecutionBackend, LocalBackend, MarkerClassifier,
    CONTAINER_BACKEND, LOCAL_BACKEND,
};

// Re-export execution types
pub use execution::{
    event_channel, ArtifactSpec, ErrorKind, EventReceiver, EventSenderHandle, ExecutionEvent,
    ExecutionResult, ExecutionStatus, StepRunStatus,
};

// Re-export pipeline types
pub use pipeline::{DependencyGraph, GraphError, ParseError, PipelineDefinition, PipelineParser, StepDefinition};

// Re-export worker and service types
pub use service::{ExecutorService, PipelineRunReport, StepReport, StepRunOutcome, StepRunRequest, DEFAULT_WORKER};
pub use worker::{WorkerAgent, WorkerExecution, WorkerInfo, WorkerStatus};
