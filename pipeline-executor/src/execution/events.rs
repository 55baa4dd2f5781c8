// Execution Events
// Heartbeats, execution status changes and pipeline progress

use crate::config::WorkerCapability;
use crate::execution::models::{ExecutionStatus, StepRunStatus};
use crate::worker::WorkerStatus;

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender for worker and pipeline events
pub type EventSenderHandle = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for worker and pipeline events
pub type EventReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new event channel
pub fn event_channel() -> (EventSenderHandle, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Periodic liveness report of a worker
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub worker_id: String,
    pub name: String,
    pub status: WorkerStatus,
    pub active_executions: usize,
    pub capabilities: Vec<WorkerCapability>,
    pub timestamp: DateTime<Utc>,
}

/// Events emitted by workers and pipeline runs
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Worker went online
    WorkerStarted { worker_id: String, name: String },

    /// Worker went offline
    WorkerStopped { worker_id: String, name: String },

    Heartbeat(Heartbeat),

    /// Execution accepted by a worker
    ExecutionSubmitted {
        execution_id: Uuid,
        step_run_id: Uuid,
        backend_type: String,
    },

    /// Cached status of an execution changed
    ExecutionStatusChanged {
        execution_id: Uuid,
        step_run_id: Uuid,
        previous: ExecutionStatus,
        status: ExecutionStatus,
    },

    /// Pipeline run started
    PipelineStarted {
        pipeline_name: String,
        total_steps: usize,
    },

    /// Pipeline run finished
    PipelineCompleted {
        pipeline_name: String,
        success: bool,
        duration: Duration,
    },

    /// Step submitted to a worker
    StepStarted {
        step_name: String,
        execution_id: Uuid,
        backend_type: String,
    },

    /// Step reached a terminal state
    StepCompleted {
        step_name: String,
        status: StepRunStatus,
        duration: Duration,
        exit_code: Option<i32>,
        logs: String,
    },

    /// Step was not run because an upstream step failed
    StepSkipped { step_name: String, reason: String },
}

impl ExecutionEvent {
    pub fn status_changed(
        execution_id: Uuid,
        step_run_id: Uuid,
        previous: ExecutionStatus,
        status: ExecutionStatus,
    ) -> Self {
        Self::ExecutionStatusChanged {
            execution_id,
            step_run_id,
            previous,
            status,
        }
    }

    pub fn pipeline_started(name: impl Into<String>, total_steps: usize) -> Self {
        Self::PipelineStarted {
            pipeline_name: name.into(),
            total_steps,
        }
    }

    pub fn pipeline_completed(name: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::PipelineCompleted {
            pipeline_name: name.into(),
            success,
            duration,
        }
    }

    pub fn step_skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StepSkipped {
            step_name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Fire-and-forget event delivery. Returns whether a receiver got the event.
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent) -> bool;
}

impl EventSender for EventSenderHandle {
    fn send_event(&self, event: ExecutionEvent) -> bool {
        self.send(event).is_ok()
    }
}

impl EventSender for Option<EventSenderHandle> {
    fn send_event(&self, event: ExecutionEvent) -> bool {
        match self {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }
}
