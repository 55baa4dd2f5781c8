// Executor Service
// Runs step runs and whole pipelines on named workers

use crate::backends::{ContainerBackend, LocalBackend, CONTAINER_BACKEND, LOCAL_BACKEND};
use crate::config::{ExecutorConfig, WorkerConfig};
use crate::error::{ExecutorError, ExecutorResult};
use crate::execution::events::{EventSender, EventSenderHandle, ExecutionEvent};
use crate::execution::models::{ArtifactSpec, ExecutionResult, ExecutionStatus, StepRunStatus};
use crate::pipeline::models::{InputSource, PipelineDefinition, StepDefinition};
use crate::worker::WorkerAgent;

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Name of the worker created by [`ExecutorService::local`]
pub const DEFAULT_WORKER: &str = "local";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A request to run one step
#[derive(Debug, Clone)]
pub struct StepRunRequest {
    pub step_run_id: Uuid,
    pub command: String,
    pub backend_type: String,
    pub worker: String,
    pub config: ExecutorConfig,
    pub input_artifacts: HashMap<String, String>,
    pub expected_outputs: Vec<ArtifactSpec>,
}

impl StepRunRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            step_run_id: Uuid::new_v4(),
            command: command.into(),
            backend_type: LOCAL_BACKEND.to_string(),
            worker: DEFAULT_WORKER.to_string(),
            config: ExecutorConfig::default(),
            input_artifacts: HashMap::new(),
            expected_outputs: Vec::new(),
        }
    }

    pub fn with_backend(mut self, backend_type: impl Into<String>) -> Self {
        self.backend_type = backend_type.into();
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = worker.into();
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.input_artifacts.insert(name.into(), path.into());
        self
    }

    pub fn with_output(mut self, artifact: ArtifactSpec) -> Self {
        self.expected_outputs.push(artifact);
        self
    }
}

/// What the pipeline layer records for a finished step run
#[derive(Debug, Clone, Serialize)]
pub struct StepRunOutcome {
    pub step_run_id: Uuid,
    pub status: StepRunStatus,
    pub logs: String,
    pub artifacts: HashMap<String, String>,
    pub metadata: Map<String, Value>,
}

impl StepRunOutcome {
    fn from_result(step_run_id: Uuid, result: &ExecutionResult) -> Self {
        let mut metadata = Map::new();
        metadata.insert(
            "execution_time_secs".into(),
            result
                .metadata
                .get("execution_time_secs")
                .cloned()
                .unwrap_or(Value::Null),
        );
        if let Some(backend) = result.metadata.get("backend") {
            metadata.insert("backend".into(), backend.clone());
        }
        metadata.insert("exit_code".into(), json!(result.exit_code));
        metadata.insert("error_kind".into(), json!(result.error_kind));
        metadata.insert("error_message".into(), json!(result.error_message));

        Self {
            step_run_id,
            status: StepRunStatus::from_execution(result.status),
            logs: result.logs.clone(),
            artifacts: result.artifacts.clone(),
            metadata,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.metadata
            .get("exit_code")
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok())
    }
}

/// Result of one step inside a pipeline run
#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: String,
    pub status: StepRunStatus,
    pub outcome: Option<StepRunOutcome>,
    /// Why the step failed before running or was skipped
    pub reason: Option<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineRunReport {
    pub pipeline_name: String,
    pub order: Vec<String>,
    pub steps: Vec<StepReport>,
    pub duration: Duration,
}

impl PipelineRunReport {
    pub fn success(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.status == StepRunStatus::Completed)
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Front door for running steps on workers
pub struct ExecutorService {
    workers: HashMap<String, Arc<WorkerAgent>>,
    /// Execution id -> owning worker
    executions: Mutex<HashMap<Uuid, String>>,
    poll_interval: Duration,
    events: Option<EventSenderHandle>,
}

impl ExecutorService {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
            executions: Mutex::new(HashMap::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            events: None,
        }
    }

    /// Service with one started worker named "local" carrying the local and
    /// container backends
    pub async fn local(config: WorkerConfig, events: Option<EventSenderHandle>) -> Self {
        let root = config.resolved_artifact_dir();
        let worker = match events.clone() {
            Some(tx) => WorkerAgent::with_event_sender(config, tx),
            None => WorkerAgent::new(config),
        };

        worker
            .register_backend(LOCAL_BACKEND, Arc::new(LocalBackend::new(&root)))
            .await;
        // Engine availability is checked when a step first targets it
        worker
            .register_backend(CONTAINER_BACKEND, Arc::new(ContainerBackend::new(&root)))
            .await;
        worker.start().await;

        let mut service = Self::new();
        service.events = events;
        service.add_worker(DEFAULT_WORKER, Arc::new(worker));
        service
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_event_sender(mut self, events: EventSenderHandle) -> Self {
        self.events = Some(events);
        self
    }

    pub fn add_worker(&mut self, name: impl Into<String>, worker: Arc<WorkerAgent>) {
        self.workers.insert(name.into(), worker);
    }

    pub fn worker(&self, name: &str) -> ExecutorResult<&Arc<WorkerAgent>> {
        self.workers
            .get(name)
            .ok_or_else(|| ExecutorError::UnknownWorker(name.to_string()))
    }

    async fn owner(&self, execution_id: Uuid) -> ExecutorResult<&Arc<WorkerAgent>> {
        let name = self
            .executions
            .lock()
            .await
            .get(&execution_id)
            .cloned()
            .ok_or(ExecutorError::UnknownExecution(execution_id))?;
        self.worker(&name)
    }

    /// Submit a step run and return the execution id
    pub async fn execute_step(&self, request: &StepRunRequest) -> ExecutorResult<Uuid> {
        let worker = self.worker(&request.worker)?;
        let execution_id = worker
            .submit_execution(
                request.step_run_id,
                &request.command,
                &request.backend_type,
                &request.config,
                &request.input_artifacts,
                &request.expected_outputs,
            )
            .await?;

        self.executions
            .lock()
            .await
            .insert(execution_id, request.worker.clone());
        Ok(execution_id)
    }

    pub async fn get_execution_status(&self, execution_id: Uuid) -> ExecutorResult<ExecutionStatus> {
        self.owner(execution_id)
            .await?
            .get_execution_status(execution_id)
            .await
    }

    pub async fn get_execution_result(&self, execution_id: Uuid) -> ExecutorResult<ExecutionResult> {
        self.owner(execution_id)
            .await?
            .get_execution_result(execution_id)
            .await
    }

    /// Poll until the execution is terminal
    pub async fn wait_for_completion(
        &self,
        execution_id: Uuid,
        timeout: Option<Duration>,
    ) -> ExecutorResult<ExecutionStatus> {
        let started = Instant::now();
        loop {
            let status = self.get_execution_status(execution_id).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if timeout.is_some_and(|limit| started.elapsed() >= limit) {
                return Err(ExecutorError::Runtime(format!(
                    "execution {} still {} after waiting {:?}",
                    execution_id, status, timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Collect the outcome of a finished execution and release it
    pub async fn complete_step_execution(&self, execution_id: Uuid) -> ExecutorResult<StepRunOutcome> {
        let worker = self.owner(execution_id).await?;
        let record = worker
            .get_execution(execution_id)
            .await
            .ok_or(ExecutorError::UnknownExecution(execution_id))?;

        let result = worker.get_execution_result(execution_id).await?;
        if !result.status.is_terminal() {
            return Err(ExecutorError::Runtime(format!(
                "execution {} has not finished",
                execution_id
            )));
        }

        let outcome = StepRunOutcome::from_result(record.step_run_id, &result);
        self.release(worker, execution_id).await;
        Ok(outcome)
    }

    /// Cancel an execution; the step run is recorded as failed
    pub async fn cancel_execution(&self, execution_id: Uuid) -> ExecutorResult<StepRunOutcome> {
        let worker = self.owner(execution_id).await?;
        let record = worker
            .get_execution(execution_id)
            .await
            .ok_or(ExecutorError::UnknownExecution(execution_id))?;

        worker.cancel_execution(execution_id).await?;
        let result = worker.get_execution_result(execution_id).await?;

        let mut outcome = StepRunOutcome::from_result(record.step_run_id, &result);
        outcome.status = StepRunStatus::Failed;
        if !outcome.logs.is_empty() && !outcome.logs.ends_with('\n') {
            outcome.logs.push('\n');
        }
        outcome.logs.push_str("Execution cancelled by user");
        outcome.metadata.insert("cancelled".into(), json!(true));

        info!(execution_id = %execution_id, step_run_id = %record.step_run_id, "Execution cancelled by user");
        self.release(worker, execution_id).await;
        Ok(outcome)
    }

    async fn release(&self, worker: &WorkerAgent, execution_id: Uuid) {
        if let Err(e) = worker.cleanup_execution(execution_id).await {
            warn!(execution_id = %execution_id, error = %e, "Failed to clean up execution");
        }
        self.executions.lock().await.remove(&execution_id);
    }

    /// Run every step of `pipeline` in dependency order on `worker`.
    ///
    /// Steps run one at a time. Artifacts of finished steps are wired into
    /// the inputs of later ones, and a failed step skips everything that
    /// depends on it.
    pub async fn run_pipeline(
        &self,
        pipeline: &PipelineDefinition,
        worker: &str,
        base_config: &ExecutorConfig,
    ) -> ExecutorResult<PipelineRunReport> {
        self.worker(worker)?;
        let graph = pipeline.dependency_graph()?;
        let order = graph.topological_sort()?;
        let started = Instant::now();

        info!(pipeline = %pipeline.name, steps = order.len(), "Running pipeline");
        self.events
            .send_event(ExecutionEvent::pipeline_started(&pipeline.name, order.len()));

        let mut produced: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut skipped: HashMap<String, String> = HashMap::new();
        let mut reports = Vec::with_capacity(order.len());

        for name in &order {
            let Some(step) = pipeline.step(name) else {
                continue;
            };

            if let Some(reason) = skipped.get(name) {
                info!(step = %name, reason = %reason, "Skipping step");
                self.events
                    .send_event(ExecutionEvent::step_skipped(name, reason));
                reports.push(StepReport {
                    name: name.clone(),
                    status: StepRunStatus::Skipped,
                    outcome: None,
                    reason: Some(reason.clone()),
                    duration: Duration::ZERO,
                });
                continue;
            }

            let step_started = Instant::now();
            let report = match self.resolve_inputs(pipeline, step, &produced) {
                Ok(inputs) => {
                    let request = StepRunRequest {
                        step_run_id: Uuid::new_v4(),
                        command: step.command.clone(),
                        backend_type: step.backend.clone(),
                        worker: worker.to_string(),
                        config: pipeline.executor_config(step, base_config),
                        input_artifacts: inputs,
                        expected_outputs: step.outputs.clone(),
                    };
                    match self.run_step(name, &request).await {
                        Ok(outcome) => StepReport {
                            name: name.clone(),
                            status: outcome.status,
                            reason: None,
                            outcome: Some(outcome),
                            duration: step_started.elapsed(),
                        },
                        Err(e) => StepReport {
                            name: name.clone(),
                            status: StepRunStatus::Failed,
                            outcome: None,
                            reason: Some(request.config.redact(&e.to_string())),
                            duration: step_started.elapsed(),
                        },
                    }
                }
                Err(reason) => StepReport {
                    name: name.clone(),
                    status: StepRunStatus::Failed,
                    outcome: None,
                    reason: Some(reason),
                    duration: step_started.elapsed(),
                },
            };

            self.events.send_event(ExecutionEvent::StepCompleted {
                step_name: name.clone(),
                status: report.status,
                duration: report.duration,
                exit_code: report.outcome.as_ref().and_then(StepRunOutcome::exit_code),
                logs: report
                    .outcome
                    .as_ref()
                    .map(|o| o.logs.clone())
                    .or_else(|| report.reason.clone())
                    .unwrap_or_default(),
            });

            if report.status == StepRunStatus::Completed {
                if let Some(outcome) = &report.outcome {
                    produced.insert(name.clone(), outcome.artifacts.clone());
                }
            } else {
                warn!(step = %name, reason = ?report.reason, "Step failed");
                for dependent in graph.transitive_dependents(name) {
                    skipped
                        .entry(dependent)
                        .or_insert_with(|| format!("upstream step '{}' failed", name));
                }
            }
            reports.push(report);
        }

        let report = PipelineRunReport {
            pipeline_name: pipeline.name.clone(),
            order,
            steps: reports,
            duration: started.elapsed(),
        };
        info!(pipeline = %pipeline.name, success = report.success(), "Pipeline finished");
        self.events.send_event(ExecutionEvent::pipeline_completed(
            &pipeline.name,
            report.success(),
            report.duration,
        ));
        Ok(report)
    }

    async fn run_step(&self, name: &str, request: &StepRunRequest) -> ExecutorResult<StepRunOutcome> {
        let execution_id = self.execute_step(request).await?;
        self.events.send_event(ExecutionEvent::StepStarted {
            step_name: name.to_string(),
            execution_id,
            backend_type: request.backend_type.clone(),
        });

        let outcome = match self.wait_for_completion(execution_id, None).await {
            Ok(_) => self.complete_step_execution(execution_id).await,
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            self.abandon(execution_id).await;
        }
        outcome
    }

    /// Best-effort stop and release of an execution nobody will complete
    async fn abandon(&self, execution_id: Uuid) {
        // Already released
        let Ok(worker) = self.owner(execution_id).await else {
            return;
        };
        if let Err(e) = worker.cancel_execution(execution_id).await {
            warn!(execution_id = %execution_id, error = %e, "Failed to stop abandoned execution");
        }
        self.release(worker, execution_id).await;
    }

    fn resolve_inputs(
        &self,
        pipeline: &PipelineDefinition,
        step: &StepDefinition,
        produced: &HashMap<String, HashMap<String, String>>,
    ) -> Result<HashMap<String, String>, String> {
        let mut inputs = HashMap::with_capacity(step.inputs.len());
        for (input, value) in &step.inputs {
            let path = match pipeline.resolve_input(value) {
                InputSource::Artifact { step: upstream, artifact } => produced
                    .get(upstream)
                    .and_then(|artifacts| artifacts.get(artifact))
                    .cloned()
                    .ok_or_else(|| {
                        format!(
                            "input '{}' expects artifact '{}' from step '{}', which was not produced",
                            input, artifact, upstream
                        )
                    })?,
                InputSource::Path(path) => path.to_string(),
            };
            inputs.insert(input.clone(), path);
        }
        Ok(inputs)
    }

    /// Stop every worker
    pub async fn shutdown(&self) {
        for (name, worker) in &self.workers {
            info!(worker = %name, "Stopping worker");
            worker.stop().await;
        }
    }
}

impl Default for ExecutorService {
    fn default() -> Self {
        Self::new()
    }
}
