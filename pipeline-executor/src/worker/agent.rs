// Worker Agent
// Tracks executions across registered backends, with heartbeat and
// reconciliation loops running in the background

use crate::backends::ExecutionBackend;
use crate::config::{collect_platform_info, ExecutorConfig, WorkerCapability, WorkerConfig};
use crate::error::{ExecutorError, ExecutorResult};
use crate::execution::events::{EventSender, EventSenderHandle, ExecutionEvent, Heartbeat};
use crate::execution::models::{ArtifactSpec, ExecutionResult, ExecutionStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bound on how long stop() waits for each background loop
const LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Offline,
    Online,
    Busy,
    Maintenance,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Offline => "offline",
            WorkerStatus::Online => "online",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// An execution tracked by the worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerExecution {
    pub execution_id: Uuid,
    pub step_run_id: Uuid,
    pub backend_type: String,
    pub backend_execution_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub status: ExecutionStatus,
}

/// Point-in-time description of a worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: WorkerStatus,
    pub capabilities: Vec<WorkerCapability>,
    pub platform_info: HashMap<String, String>,
    pub active_executions: usize,
    pub max_concurrent_executions: usize,
}

#[derive(Clone)]
struct RegisteredBackend {
    backend: Arc<dyn ExecutionBackend>,
    /// Serializes initialize+submit so each submit sees its own config
    submit_gate: Arc<Mutex<()>>,
}

#[derive(Default)]
struct ExecutionTable {
    executions: HashMap<Uuid, WorkerExecution>,
    /// Submissions in flight that already hold a capacity slot
    reserved: usize,
}

impl ExecutionTable {
    fn occupied(&self) -> usize {
        self.executions.len() + self.reserved
    }

    fn is_idle(&self) -> bool {
        self.occupied() == 0
    }
}

/// State shared with the background loops.
///
/// Lock order: `table` before `status`.
struct WorkerState {
    config: RwLock<WorkerConfig>,
    status: RwLock<WorkerStatus>,
    backends: RwLock<HashMap<String, RegisteredBackend>>,
    table: Mutex<ExecutionTable>,
    events: Option<EventSenderHandle>,
}

impl WorkerState {
    async fn mark_busy(&self) {
        let mut status = self.status.write().await;
        if *status == WorkerStatus::Online {
            *status = WorkerStatus::Busy;
        }
    }

    async fn mark_online_if_idle(&self, table: &ExecutionTable) {
        if table.is_idle() {
            let mut status = self.status.write().await;
            if *status == WorkerStatus::Busy {
                *status = WorkerStatus::Online;
            }
        }
    }

    /// Mirror a status observed from the backend into the table
    async fn record_status(&self, execution_id: Uuid, observed: ExecutionStatus) -> ExecutionStatus {
        let mut table = self.table.lock().await;
        let Some(execution) = table.executions.get_mut(&execution_id) else {
            return observed;
        };

        let previous = execution.status;
        execution.status = previous.advance(observed);
        if execution.status != previous {
            info!(
                execution_id = %execution_id,
                from = %previous,
                to = %execution.status,
                "Execution status changed"
            );
            self.events.send_event(ExecutionEvent::status_changed(
                execution_id,
                execution.step_run_id,
                previous,
                execution.status,
            ));
        }
        execution.status
    }

    async fn lookup(
        &self,
        execution_id: Uuid,
    ) -> ExecutorResult<(WorkerExecution, Arc<dyn ExecutionBackend>)> {
        let record = self
            .table
            .lock()
            .await
            .executions
            .get(&execution_id)
            .cloned()
            .ok_or(ExecutorError::UnknownExecution(execution_id))?;

        let backend = self
            .backends
            .read()
            .await
            .get(&record.backend_type)
            .map(|b| b.backend.clone())
            .ok_or_else(|| ExecutorError::UnknownBackend(record.backend_type.clone()))?;

        Ok((record, backend))
    }

    async fn send_heartbeat(&self) {
        let active_executions = self.table.lock().await.executions.len();
        let status = *self.status.read().await;
        let heartbeat = {
            let config = self.config.read().await;
            Heartbeat {
                worker_id: config.worker_id.clone(),
                name: config.name.clone(),
                status,
                active_executions,
                capabilities: config.capabilities.clone(),
                timestamp: Utc::now(),
            }
        };

        debug!(
            worker = %heartbeat.name,
            status = %heartbeat.status,
            active_executions,
            "Heartbeat"
        );

        if self.events.is_some() && !self.events.send_event(ExecutionEvent::Heartbeat(heartbeat)) {
            warn!("Failed to deliver heartbeat, event receiver is gone");
        }
    }

    /// Poll every non-terminal execution once
    async fn reconcile(&self) {
        let pending: Vec<(Uuid, String, Uuid)> = {
            let table = self.table.lock().await;
            table
                .executions
                .values()
                .filter(|e| !e.status.is_terminal())
                .map(|e| (e.execution_id, e.backend_type.clone(), e.backend_execution_id))
                .collect()
        };

        for (execution_id, backend_type, backend_execution_id) in pending {
            let backend = self
                .backends
                .read()
                .await
                .get(&backend_type)
                .map(|b| b.backend.clone());
            let Some(backend) = backend else {
                continue;
            };

            match backend.get_status(backend_execution_id).await {
                Ok(observed) => {
                    self.record_status(execution_id, observed).await;
                }
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "Failed to poll execution status");
                }
            }
        }
    }
}

struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

/// Runs step executions on registered backends
pub struct WorkerAgent {
    state: Arc<WorkerState>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl WorkerAgent {
    pub fn new(config: WorkerConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a worker reporting heartbeats and status changes to `events`
    pub fn with_event_sender(config: WorkerConfig, events: EventSenderHandle) -> Self {
        Self::build(config, Some(events))
    }

    fn build(mut config: WorkerConfig, events: Option<EventSenderHandle>) -> Self {
        if config.platform_info.is_empty() {
            config.platform_info = collect_platform_info();
        }

        Self {
            state: Arc::new(WorkerState {
                config: RwLock::new(config),
                status: RwLock::new(WorkerStatus::Offline),
                backends: RwLock::new(HashMap::new()),
                table: Mutex::new(ExecutionTable::default()),
                events,
            }),
            tasks: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> WorkerStatus {
        *self.state.status.read().await
    }

    pub async fn worker_id(&self) -> String {
        self.state.config.read().await.worker_id.clone()
    }

    pub async fn info(&self) -> WorkerInfo {
        let active_executions = self.state.table.lock().await.executions.len();
        let status = self.status().await;
        let config = self.state.config.read().await;

        WorkerInfo {
            worker_id: config.worker_id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            status,
            capabilities: config.capabilities.clone(),
            platform_info: config.platform_info.clone(),
            active_executions,
            max_concurrent_executions: config.max_concurrent_executions,
        }
    }

    /// Register a backend under `name` and advertise it as a capability.
    ///
    /// The first instance registered under a name stays: tracked executions
    /// resolve through it. Returns false when `name` was already taken.
    pub async fn register_backend(&self, name: impl Into<String>, backend: Arc<dyn ExecutionBackend>) -> bool {
        let name = name.into();
        {
            let mut backends = self.state.backends.write().await;
            if backends.contains_key(&name) {
                debug!(backend = %name, "Backend already registered, keeping the existing instance");
                return false;
            }
            backends.insert(
                name.clone(),
                RegisteredBackend {
                    backend,
                    submit_gate: Arc::new(Mutex::new(())),
                },
            );
        }

        let mut config = self.state.config.write().await;
        if !config.capabilities.iter().any(|c| c.backend_type == name) {
            config.capabilities.push(WorkerCapability::new(name.clone()));
        }
        debug!(backend = %name, "Registered backend");
        true
    }

    /// Go online and start the heartbeat and reconciliation loops
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return;
        }

        *self.state.status.write().await = WorkerStatus::Online;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(self.state.clone(), shutdown_rx.clone()));
        let reconcile = tokio::spawn(reconcile_loop(self.state.clone(), shutdown_rx));
        *tasks = Some(BackgroundTasks {
            shutdown,
            handles: vec![("heartbeat", heartbeat), ("reconcile", reconcile)],
        });

        let config = self.state.config.read().await;
        info!(worker_id = %config.worker_id, name = %config.name, "Worker started");
        self.state.events.send_event(ExecutionEvent::WorkerStarted {
            worker_id: config.worker_id.clone(),
            name: config.name.clone(),
        });
    }

    /// Stop the loops, cancel every tracked execution and go offline
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };

        let _ = tasks.shutdown.send(true);
        for (name, mut handle) in tasks.handles {
            if tokio::time::timeout(LOOP_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!(task = name, "Background loop did not stop in time, aborting");
                handle.abort();
            }
        }

        let running: Vec<Uuid> = {
            let table = self.state.table.lock().await;
            table
                .executions
                .values()
                .filter(|e| !e.status.is_terminal())
                .map(|e| e.execution_id)
                .collect()
        };
        for execution_id in running {
            if let Err(e) = self.cancel_execution(execution_id).await {
                error!(execution_id = %execution_id, error = %e, "Failed to cancel execution during shutdown");
            }
        }

        *self.state.status.write().await = WorkerStatus::Offline;

        let config = self.state.config.read().await;
        info!(worker_id = %config.worker_id, name = %config.name, "Worker stopped");
        self.state.events.send_event(ExecutionEvent::WorkerStopped {
            worker_id: config.worker_id.clone(),
            name: config.name.clone(),
        });
    }

    /// Stop accepting submissions; tracked executions keep running
    pub async fn enter_maintenance(&self) -> ExecutorResult<()> {
        let mut status = self.state.status.write().await;
        if *status == WorkerStatus::Offline {
            return Err(self.unavailable(WorkerStatus::Offline).await);
        }
        *status = WorkerStatus::Maintenance;
        info!("Worker entered maintenance");
        Ok(())
    }

    pub async fn exit_maintenance(&self) {
        let table = self.state.table.lock().await;
        let mut status = self.state.status.write().await;
        if *status == WorkerStatus::Maintenance {
            let resumed = if table.is_idle() {
                WorkerStatus::Online
            } else {
                WorkerStatus::Busy
            };
            *status = resumed;
            info!(status = %resumed, "Worker left maintenance");
        }
    }

    /// Start a step run on `backend_type` and return the worker execution id
    pub async fn submit_execution(
        &self,
        step_run_id: Uuid,
        command: &str,
        backend_type: &str,
        config: &ExecutorConfig,
        input_artifacts: &HashMap<String, String>,
        expected_outputs: &[ArtifactSpec],
    ) -> ExecutorResult<Uuid> {
        let status = self.status().await;
        if matches!(status, WorkerStatus::Offline | WorkerStatus::Maintenance) {
            return Err(self.unavailable(status).await);
        }

        let max = self.state.config.read().await.max_concurrent_executions;
        let registered = {
            let mut table = self.state.table.lock().await;
            if table.occupied() >= max {
                return Err(ExecutorError::CapacityExceeded { max });
            }
            let registered = self
                .state
                .backends
                .read()
                .await
                .get(backend_type)
                .cloned()
                .ok_or_else(|| ExecutorError::UnknownBackend(backend_type.to_string()))?;
            table.reserved += 1;
            registered
        };
        self.state.mark_busy().await;

        let outcome: ExecutorResult<Uuid> = async {
            let _gate = registered.submit_gate.lock().await;
            registered.backend.initialize(config).await?;
            registered
                .backend
                .submit(step_run_id, command, input_artifacts, expected_outputs)
                .await
        }
        .await;

        let mut table = self.state.table.lock().await;
        table.reserved -= 1;

        match outcome {
            Ok(backend_execution_id) => {
                let execution_id = Uuid::new_v4();
                table.executions.insert(
                    execution_id,
                    WorkerExecution {
                        execution_id,
                        step_run_id,
                        backend_type: backend_type.to_string(),
                        backend_execution_id,
                        started_at: Utc::now(),
                        status: ExecutionStatus::Running,
                    },
                );
                drop(table);

                info!(
                    execution_id = %execution_id,
                    step_run_id = %step_run_id,
                    backend = backend_type,
                    "Execution submitted"
                );
                self.state.events.send_event(ExecutionEvent::ExecutionSubmitted {
                    execution_id,
                    step_run_id,
                    backend_type: backend_type.to_string(),
                });
                Ok(execution_id)
            }
            Err(e) => {
                self.state.mark_online_if_idle(&table).await;
                error!(step_run_id = %step_run_id, backend = backend_type, error = %e, "Submission failed");
                Err(match e {
                    ExecutorError::Submission(message) => ExecutorError::Submission(message),
                    other => ExecutorError::Submission(other.to_string()),
                })
            }
        }
    }

    pub async fn get_execution_status(&self, execution_id: Uuid) -> ExecutorResult<ExecutionStatus> {
        let (record, backend) = self.state.lookup(execution_id).await?;
        let observed = backend.get_status(record.backend_execution_id).await?;
        Ok(self.state.record_status(execution_id, observed).await)
    }

    pub async fn get_execution_result(&self, execution_id: Uuid) -> ExecutorResult<ExecutionResult> {
        let (record, backend) = self.state.lookup(execution_id).await?;
        let result = backend.get_result(record.backend_execution_id).await?;
        self.state.record_status(execution_id, result.status).await;
        Ok(result)
    }

    pub async fn cancel_execution(&self, execution_id: Uuid) -> ExecutorResult<bool> {
        let (record, backend) = self.state.lookup(execution_id).await?;
        let stopped = backend.cancel(record.backend_execution_id).await?;
        let observed = backend.get_status(record.backend_execution_id).await?;
        self.state.record_status(execution_id, observed).await;
        Ok(stopped)
    }

    /// Release backend resources and forget the execution
    pub async fn cleanup_execution(&self, execution_id: Uuid) -> ExecutorResult<()> {
        let (record, backend) = self.state.lookup(execution_id).await?;
        backend.cleanup(record.backend_execution_id).await?;

        let mut table = self.state.table.lock().await;
        table.executions.remove(&execution_id);
        self.state.mark_online_if_idle(&table).await;
        debug!(execution_id = %execution_id, "Execution cleaned up");
        Ok(())
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Option<WorkerExecution> {
        self.state
            .table
            .lock()
            .await
            .executions
            .get(&execution_id)
            .cloned()
    }

    /// Tracked executions, oldest first
    pub async fn list_executions(&self) -> Vec<WorkerExecution> {
        let mut executions: Vec<WorkerExecution> = self
            .state
            .table
            .lock()
            .await
            .executions
            .values()
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.started_at);
        executions
    }

    /// Run one reconciliation pass immediately
    pub async fn reconcile(&self) {
        self.state.reconcile().await;
    }

    async fn unavailable(&self, status: WorkerStatus) -> ExecutorError {
        ExecutorError::WorkerUnavailable {
            name: self.state.config.read().await.name.clone(),
            status: status.to_string(),
        }
    }
}

async fn heartbeat_loop(state: Arc<WorkerState>, mut shutdown: watch::Receiver<bool>) {
    let period = state.config.read().await.heartbeat_interval();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => state.send_heartbeat().await,
            _ = shutdown.changed() => {
                debug!("Heartbeat loop shutting down");
                break;
            }
        }
    }
}

async fn reconcile_loop(state: Arc<WorkerState>, mut shutdown: watch::Receiver<bool>) {
    let period = state.config.read().await.status_poll_interval();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => state.reconcile().await,
            _ = shutdown.changed() => {
                debug!("Reconciliation loop shutting down");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backends::{LocalBackend, LOCAL_BACKEND};
    use crate::execution::events::event_channel;
    use std::path::Path;

    fn worker_config(root: &Path, max: usize) -> WorkerConfig {
        let mut config = WorkerConfig::new("test-worker");
        config.max_concurrent_executions = max;
        config.heartbeat_interval_secs = 0.05;
        config.status_poll_interval_secs = 0.1;
        config.artifact_dir = Some(root.to_path_buf());
        config
    }

    async fn register_local(agent: &WorkerAgent, root: &Path) -> bool {
        let backend = LocalBackend::new(root).with_grace_period(Duration::from_secs(1));
        agent.register_backend(LOCAL_BACKEND, Arc::new(backend)).await
    }

    async fn started_agent(root: &Path, max: usize) -> WorkerAgent {
        let agent = WorkerAgent::new(worker_config(root, max));
        register_local(&agent, root).await;
        agent.start().await;
        agent
    }

    async fn submit(agent: &WorkerAgent, command: &str) -> ExecutorResult<Uuid> {
        agent
            .submit_execution(
                Uuid::new_v4(),
                command,
                LOCAL_BACKEND,
                &ExecutorConfig::default(),
                &HashMap::new(),
                &[],
            )
            .await
    }

    async fn wait_terminal(agent: &WorkerAgent, id: Uuid) -> ExecutionStatus {
        for _ in 0..100 {
            let status = agent.get_execution_status(id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("execution {} did not finish", id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_transitions() {
        let temp = tempfile::tempdir().unwrap();
        let agent = WorkerAgent::new(worker_config(temp.path(), 2));
        register_local(&agent, temp.path()).await;
        assert_eq!(agent.status().await, WorkerStatus::Offline);

        agent.start().await;
        agent.start().await;
        assert_eq!(agent.status().await, WorkerStatus::Online);

        let id = submit(&agent, "echo hi").await.unwrap();
        assert_eq!(agent.status().await, WorkerStatus::Busy);

        assert_eq!(wait_terminal(&agent, id).await, ExecutionStatus::Completed);
        agent.cleanup_execution(id).await.unwrap();
        assert_eq!(agent.status().await, WorkerStatus::Online);

        agent.stop().await;
        agent.stop().await;
        assert_eq!(agent.status().await, WorkerStatus::Offline);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_capacity_ceiling() {
        let temp = tempfile::tempdir().unwrap();
        let agent = started_agent(temp.path(), 2).await;

        let first = submit(&agent, "sleep 30").await.unwrap();
        submit(&agent, "sleep 30").await.unwrap();

        let err = submit(&agent, "sleep 30").await.unwrap_err();
        assert!(matches!(err, ExecutorError::CapacityExceeded { max: 2 }));

        agent.cancel_execution(first).await.unwrap();
        agent.cleanup_execution(first).await.unwrap();
        submit(&agent, "sleep 30").await.unwrap();

        agent.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_backend() {
        let temp = tempfile::tempdir().unwrap();
        let agent = started_agent(temp.path(), 2).await;

        let err = agent
            .submit_execution(
                Uuid::new_v4(),
                "true",
                "gpu",
                &ExecutorConfig::default(),
                &HashMap::new(),
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownBackend(ref b) if b == "gpu"));
        assert_eq!(agent.status().await, WorkerStatus::Online);

        agent.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_submission_frees_slot() {
        let temp = tempfile::tempdir().unwrap();
        let agent = started_agent(temp.path(), 1).await;

        let inputs = HashMap::from([("x".to_string(), "/no/such/input".to_string())]);
        let err = agent
            .submit_execution(
                Uuid::new_v4(),
                "true",
                LOCAL_BACKEND,
                &ExecutorConfig::default(),
                &inputs,
                &[],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Submission(_)));
        assert_eq!(agent.status().await, WorkerStatus::Online);
        assert!(agent.list_executions().await.is_empty());
        submit(&agent, "true").await.unwrap();

        agent.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rejects_submissions_when_unavailable() {
        let temp = tempfile::tempdir().unwrap();
        let agent = WorkerAgent::new(worker_config(temp.path(), 2));
        register_local(&agent, temp.path()).await;

        let err = submit(&agent, "true").await.unwrap_err();
        assert!(matches!(err, ExecutorError::WorkerUnavailable { ref status, .. } if status == "offline"));
        assert!(agent.enter_maintenance().await.is_err());

        agent.start().await;
        agent.enter_maintenance().await.unwrap();
        let err = submit(&agent, "true").await.unwrap_err();
        assert!(matches!(err, ExecutorError::WorkerUnavailable { ref status, .. } if status == "maintenance"));

        agent.exit_maintenance().await;
        assert_eq!(agent.status().await, WorkerStatus::Online);
        submit(&agent, "true").await.unwrap();

        agent.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconciliation_loop_updates_status() {
        let temp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = event_channel();
        let agent = WorkerAgent::with_event_sender(worker_config(temp.path(), 2), tx);
        register_local(&agent, temp.path()).await;
        agent.start().await;

        let id = submit(&agent, "echo done").await.unwrap();

        let mut status = ExecutionStatus::Running;
        for _ in 0..100 {
            status = agent.get_execution(id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status, ExecutionStatus::Completed);

        let mut saw_change = false;
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::ExecutionStatusChanged {
                execution_id,
                status,
                ..
            } = event
            {
                saw_change |= execution_id == id && status == ExecutionStatus::Completed;
            }
        }
        assert!(saw_change);

        agent.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_events() {
        let temp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = event_channel();
        let agent = WorkerAgent::with_event_sender(worker_config(temp.path(), 3), tx);
        register_local(&agent, temp.path()).await;
        agent.start().await;

        let heartbeat = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(ExecutionEvent::Heartbeat(hb)) = rx.recv().await {
                    return hb;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(heartbeat.name, "test-worker");
        assert_eq!(heartbeat.active_executions, 0);
        assert_eq!(heartbeat.capabilities, vec![WorkerCapability::new(LOCAL_BACKEND)]);

        agent.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_cancels_running_executions() {
        let temp = tempfile::tempdir().unwrap();
        let agent = started_agent(temp.path(), 2).await;

        let id = submit(&agent, "sleep 30").await.unwrap();
        agent.stop().await;

        let execution = agent.get_execution(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(agent.status().await, WorkerStatus::Offline);
    }

    #[tokio::test]
    async fn test_register_backend_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let agent = WorkerAgent::new(worker_config(temp.path(), 2));
        assert!(register_local(&agent, temp.path()).await);
        assert!(!register_local(&agent, temp.path()).await);

        let info = agent.info().await;
        assert_eq!(info.capabilities.len(), 1);
        assert_eq!(info.status, WorkerStatus::Offline);
        assert!(info.platform_info.contains_key("system"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reregistering_keeps_tracked_executions_reachable() {
        let temp = tempfile::tempdir().unwrap();
        let agent = started_agent(temp.path(), 1).await;

        let id = submit(&agent, "sleep 30").await.unwrap();
        assert!(!register_local(&agent, temp.path()).await);

        assert_eq!(
            agent.get_execution_status(id).await.unwrap(),
            ExecutionStatus::Running
        );
        assert!(agent.cancel_execution(id).await.unwrap());
        agent.cleanup_execution(id).await.unwrap();
        assert!(agent.list_executions().await.is_empty());
        submit(&agent, "true").await.unwrap();

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let temp = tempfile::tempdir().unwrap();
        let agent = WorkerAgent::new(worker_config(temp.path(), 2));

        let id = Uuid::new_v4();
        assert!(matches!(
            agent.get_execution_status(id).await,
            Err(ExecutorError::UnknownExecution(_))
        ));
        assert!(matches!(
            agent.cleanup_execution(id).await,
            Err(ExecutorError::UnknownExecution(_))
        ));
    }
}
