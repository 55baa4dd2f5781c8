// Execution Module
// Status model, results and event reporting

pub mod events;
pub mod models;

pub use events::{event_channel, EventReceiver, EventSender, EventSenderHandle, ExecutionEvent, Heartbeat};
pub use models::{ArtifactSpec, ErrorKind, ExecutionResult, ExecutionStatus, StepRunStatus};
