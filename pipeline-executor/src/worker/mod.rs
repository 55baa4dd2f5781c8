pub mod agent;

pub use agent::{WorkerAgent, WorkerExecution, WorkerInfo, WorkerStatus};
