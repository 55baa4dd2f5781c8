// Container Backend
// Runs step commands in per-execution images through the container engine CLI

use super::classifier::{ErrorClassifier, FailureContext, MarkerClassifier};
use super::workspace::{self, ExecutionWorkspace, StagingMode};
use super::{ExecutionBackend, Termination, DEFAULT_GRACE_PERIOD};
use crate::config::{redact_secrets, ContainerOptions, ExecutorConfig};
use crate::error::{ExecutorError, ExecutorResult};
use crate::execution::models::{ArtifactSpec, ExecutionResult, ExecutionStatus};

use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registration name of the container backend
pub const CONTAINER_BACKEND: &str = "docker";

const CONTAINER_WORKDIR: &str = "/app";
const CONTAINER_ARTIFACTS_DIR: &str = "/app/artifacts";
const CONTAINER_INPUTS_DIR: &str = "/app/inputs";
const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Errors that can occur while talking to the container engine
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Container engine is not available: {0}")]
    EngineNotAvailable(String),

    #[error("Failed to build image: {0}")]
    BuildFailed(String),

    #[error("Failed to start container: {0}")]
    StartFailed(String),

    #[error("Engine command '{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Everything needed to start one container
struct Launch<'a> {
    execution_id: Uuid,
    step_run_id: Uuid,
    command: &'a str,
    container_name: &'a str,
    image: &'a str,
    inputs: &'a HashMap<String, String>,
    expected_outputs: &'a [ArtifactSpec],
}

/// A container started by this backend
struct ContainerExecution {
    step_run_id: Uuid,
    command: String,
    status: ExecutionStatus,
    started_at: DateTime<Utc>,
    started: Instant,
    finished: Option<Instant>,
    workspace: ExecutionWorkspace,
    expected_outputs: Vec<ArtifactSpec>,
    container_id: String,
    container_name: String,
    image: String,
    engine: String,
    cleanup_image: bool,
    exit_code: Option<i32>,
    termination: Option<Termination>,
    timeout: Option<Duration>,
    secrets: Vec<String>,
    max_retries: u32,
    retry_delay_secs: u64,
}

impl ContainerExecution {
    /// Merge an observed engine state into the cached status
    fn settle(&mut self, observed: ExecutionStatus, exit_code: Option<i32>) {
        if self.status.is_terminal() {
            return;
        }
        if exit_code.is_some() {
            self.exit_code = exit_code;
        }

        let observed = match self.termination {
            Some(termination) if observed.is_terminal() => termination.final_status(),
            _ => observed,
        };
        self.status = self.status.advance(observed);
        if self.status.is_terminal() {
            self.finished = Some(Instant::now());
        }
    }

    fn timeout_exceeded(&self) -> bool {
        self.timeout
            .is_some_and(|limit| self.started.elapsed() > limit)
    }

    fn elapsed(&self) -> Duration {
        self.finished
            .unwrap_or_else(Instant::now)
            .duration_since(self.started)
    }
}

/// Backend building one image and running one container per job
pub struct ContainerBackend {
    root: PathBuf,
    grace_period: Duration,
    classifier: Arc<dyn ErrorClassifier>,
    /// Engine binary whose daemon was last verified reachable
    verified_engine: Mutex<Option<String>>,
    config: RwLock<Option<ExecutorConfig>>,
    executions: Mutex<HashMap<Uuid, ContainerExecution>>,
}

impl ContainerBackend {
    /// Create a backend placing build contexts and artifacts under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            grace_period: DEFAULT_GRACE_PERIOD,
            classifier: Arc::new(MarkerClassifier::default()),
            verified_engine: Mutex::new(None),
            config: RwLock::new(None),
            executions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build the image and start the container. Returns the container id.
    async fn start_container(
        &self,
        launch: &Launch<'_>,
        config: &ExecutorConfig,
        workspace: &mut ExecutionWorkspace,
    ) -> Result<String, ContainerError> {
        let options = &config.container;

        // Links would not resolve inside the container
        workspace.stage_inputs(launch.inputs, StagingMode::Copy)?;
        workspace.prepare_outputs(launch.expected_outputs)?;

        let with_requirements = match &options.requirements_file {
            Some(file) if file.exists() => {
                tokio::fs::copy(file, workspace.root.join(REQUIREMENTS_FILE)).await?;
                true
            }
            Some(file) => {
                warn!(path = %file.display(), "Requirements file not found, skipping");
                false
            }
            None => false,
        };

        tokio::fs::write(
            workspace.root.join("Dockerfile"),
            render_dockerfile(options, with_requirements),
        )
        .await?;
        tokio::fs::write(
            workspace.root.join(".dockerignore"),
            "artifacts\ninputs\noutput.log\n",
        )
        .await?;

        debug!(execution_id = %launch.execution_id, image = launch.image, "Building image");
        let build = engine_output(
            &options.engine,
            &[
                "build".to_string(),
                "-t".to_string(),
                launch.image.to_string(),
                workspace.root.to_string_lossy().to_string(),
            ],
            &HashMap::new(),
        )
        .await?;
        if !build.status.success() {
            return Err(ContainerError::BuildFailed(stderr_of(&build)));
        }

        let env = workspace::location_env(
            CONTAINER_ARTIFACTS_DIR,
            workspace.inputs_dir.as_ref().map(|_| CONTAINER_INPUTS_DIR),
            launch.execution_id,
            launch.step_run_id,
        );
        let args = run_args(
            launch.container_name,
            launch.image,
            workspace,
            config,
            &env,
            launch.command,
        );

        // Secret values reach the engine through its environment, not argv
        let run = engine_output(&options.engine, &args, &config.secrets).await?;
        if !run.status.success() {
            return Err(ContainerError::StartFailed(stderr_of(&run)));
        }

        Ok(String::from_utf8_lossy(&run.stdout).trim().to_string())
    }

    /// Undo a partially started execution
    async fn rollback(&self, engine: &str, launch: &Launch<'_>, workspace: &ExecutionWorkspace) {
        let no_env = HashMap::new();
        let rm = ["rm", "-f", launch.container_name].map(String::from);
        let rmi = ["rmi", "-f", launch.image].map(String::from);

        // Either may not exist yet, failures are expected
        let _ = engine_output(engine, &rm, &no_env).await;
        let _ = engine_output(engine, &rmi, &no_env).await;

        if let Err(e) = workspace.remove() {
            warn!(
                path = %workspace.root.display(),
                error = %e,
                "Failed to remove execution directory"
            );
        }
    }

    /// `docker stop` with the grace period, then settle the final status
    async fn stop_container(&self, execution_id: Uuid) -> ExecutorResult<()> {
        let (engine, container_id) = self.handle(execution_id).await?;

        let stop = engine_output(
            &engine,
            &[
                "stop".to_string(),
                format!("--time={}", self.grace_period.as_secs()),
                container_id.clone(),
            ],
            &HashMap::new(),
        )
        .await
        .map_err(|e| ExecutorError::Cancellation(e.to_string()))?;

        if !stop.status.success() {
            return Err(ExecutorError::Cancellation(stderr_of(&stop)));
        }

        let exit_code = inspect_state(&engine, &container_id)
            .await
            .ok()
            .and_then(|(_, code)| code);

        let mut table = self.executions.lock().await;
        if let Some(execution) = table.get_mut(&execution_id) {
            execution.settle(ExecutionStatus::Cancelled, exit_code);
        }
        Ok(())
    }

    /// Inspect the container and fold what the engine reports into the record
    async fn refresh(&self, execution_id: Uuid) -> ExecutorResult<ExecutionStatus> {
        let (engine, container_id) = {
            let table = self.executions.lock().await;
            let execution = table
                .get(&execution_id)
                .ok_or(ExecutorError::UnknownExecution(execution_id))?;
            if execution.status.is_terminal() {
                return Ok(execution.status);
            }
            (execution.engine.clone(), execution.container_id.clone())
        };

        let (observed, exit_code) = observe(execution_id, &engine, &container_id).await;

        let mut table = self.executions.lock().await;
        let execution = table
            .get_mut(&execution_id)
            .ok_or(ExecutorError::UnknownExecution(execution_id))?;
        execution.settle(observed, exit_code);
        Ok(execution.status)
    }

    async fn handle(&self, execution_id: Uuid) -> ExecutorResult<(String, String)> {
        let table = self.executions.lock().await;
        table
            .get(&execution_id)
            .map(|e| (e.engine.clone(), e.container_id.clone()))
            .ok_or(ExecutorError::UnknownExecution(execution_id))
    }

    async fn current_status(&self, execution_id: Uuid) -> ExecutorResult<ExecutionStatus> {
        let table = self.executions.lock().await;
        table
            .get(&execution_id)
            .map(|e| e.status)
            .ok_or(ExecutorError::UnknownExecution(execution_id))
    }
}

/// Dockerfile used when no template is configured
pub fn render_dockerfile(options: &ContainerOptions, with_requirements: bool) -> String {
    if let Some(template) = &options.dockerfile_template {
        return template.clone();
    }

    let mut lines = vec![
        format!("FROM {}", options.base_image),
        format!("WORKDIR {}", CONTAINER_WORKDIR),
    ];
    if with_requirements {
        lines.push(format!(
            "COPY {} {}/{}",
            REQUIREMENTS_FILE, CONTAINER_WORKDIR, REQUIREMENTS_FILE
        ));
        lines.push(format!(
            "RUN pip install --no-cache-dir -r {}/{}",
            CONTAINER_WORKDIR, REQUIREMENTS_FILE
        ));
    }
    lines.push(format!(
        "RUN mkdir -p {} {}",
        CONTAINER_ARTIFACTS_DIR, CONTAINER_INPUTS_DIR
    ));
    lines.push("ENV PYTHONUNBUFFERED=1".to_string());

    let mut dockerfile = lines.join("\n");
    dockerfile.push('\n');
    dockerfile
}

/// Arguments of the detached `run` invocation
fn run_args(
    container_name: &str,
    image: &str,
    workspace: &ExecutionWorkspace,
    config: &ExecutorConfig,
    location_env: &[(String, String)],
    command: &str,
) -> Vec<String> {
    let options = &config.container;
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container_name.to_string(),
        "--network".to_string(),
        options.network_mode.clone(),
    ];

    if let Some(memory) = &options.resource_limits.memory {
        args.push("--memory".to_string());
        args.push(memory.clone());
    }
    if let Some(cpus) = &options.resource_limits.cpus {
        args.push("--cpus".to_string());
        args.push(cpus.clone());
    }

    args.push("-v".to_string());
    args.push(format!(
        "{}:{}",
        workspace.artifacts_dir.display(),
        CONTAINER_ARTIFACTS_DIR
    ));
    if let Some(inputs) = &workspace.inputs_dir {
        args.push("-v".to_string());
        args.push(format!("{}:{}", inputs.display(), CONTAINER_INPUTS_DIR));
    }

    let mut volumes: Vec<_> = options.volumes.iter().collect();
    volumes.sort();
    for (host, container) in volumes {
        args.push("-v".to_string());
        args.push(format!("{}:{}", host, container));
    }

    let mut env: Vec<_> = config.env.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    // Name only; the engine reads the value from its own environment
    let mut secret_keys: Vec<_> = config.secrets.keys().collect();
    secret_keys.sort();
    for key in secret_keys {
        args.push("-e".to_string());
        args.push(key.clone());
    }

    for (key, value) in location_env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(image.to_string());
    args.push("/bin/sh".to_string());
    args.push("-c".to_string());
    args.push(command.to_string());
    args
}

/// Parse `"<status> <exit code>"` as printed by inspect
fn parse_state(output: &str) -> (String, Option<i32>) {
    let mut parts = output.split_whitespace();
    let state = parts.next().unwrap_or_default().to_string();
    let exit_code = parts.next().and_then(|c| c.parse().ok());
    (state, exit_code)
}

/// Exit codes the engine reports for containers stopped by a signal
fn signal_from_exit(exit_code: Option<i32>) -> Option<i32> {
    match exit_code {
        Some(137) => Some(9),
        Some(143) => Some(15),
        _ => None,
    }
}

async fn engine_output(
    engine: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<Output, ContainerError> {
    Command::new(engine)
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| ContainerError::EngineNotAvailable(e.to_string()))
}

async fn inspect_state(
    engine: &str,
    container_id: &str,
) -> Result<(String, Option<i32>), ContainerError> {
    let output = engine_output(
        engine,
        &[
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}} {{.State.ExitCode}}".to_string(),
            container_id.to_string(),
        ],
        &HashMap::new(),
    )
    .await?;

    if !output.status.success() {
        return Err(ContainerError::CommandFailed {
            command: "inspect".to_string(),
            stderr: stderr_of(&output),
        });
    }
    Ok(parse_state(&String::from_utf8_lossy(&output.stdout)))
}

/// Map the engine's view of a container onto an execution status
async fn observe(
    execution_id: Uuid,
    engine: &str,
    container_id: &str,
) -> (ExecutionStatus, Option<i32>) {
    match inspect_state(engine, container_id).await {
        Ok((state, exit_code)) => match state.as_str() {
            "created" | "running" | "restarting" | "paused" => (ExecutionStatus::Running, None),
            "exited" | "dead" if exit_code == Some(0) => (ExecutionStatus::Completed, exit_code),
            "exited" | "dead" => (ExecutionStatus::Failed, exit_code),
            other => {
                warn!(execution_id = %execution_id, state = other, "Unexpected container state");
                (ExecutionStatus::Failed, exit_code)
            }
        },
        Err(e) => {
            warn!(execution_id = %execution_id, error = %e, "Container vanished");
            (ExecutionStatus::Failed, None)
        }
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Log a failed removal; cleanup carries on regardless
fn warn_on_failure(result: Result<Output, ContainerError>, execution_id: Uuid, what: &str) {
    match result {
        Ok(output) if !output.status.success() => warn!(
            execution_id = %execution_id,
            stderr = %stderr_of(&output),
            "Failed to remove {}", what
        ),
        Err(e) => warn!(execution_id = %execution_id, error = %e, "Failed to remove {}", what),
        Ok(_) => {}
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for ContainerBackend {
    fn backend_type(&self) -> &str {
        CONTAINER_BACKEND
    }

    async fn initialize(&self, config: &ExecutorConfig) -> ExecutorResult<()> {
        let engine = &config.container.engine;
        which::which(engine).map_err(|e| {
            ExecutorError::BackendUnavailable(format!(
                "container engine '{}' is not installed: {}",
                engine, e
            ))
        })?;

        {
            let mut verified = self.verified_engine.lock().await;
            if verified.as_deref() != Some(engine.as_str()) {
                let info = engine_output(engine, &["info".to_string()], &HashMap::new())
                    .await
                    .map_err(|e| ExecutorError::BackendUnavailable(e.to_string()))?;
                if !info.status.success() {
                    return Err(ExecutorError::BackendUnavailable(format!(
                        "container engine '{}' is not reachable: {}",
                        engine,
                        stderr_of(&info)
                    )));
                }
                *verified = Some(engine.clone());
            }
        }

        tokio::fs::create_dir_all(&self.root).await?;
        *self.config.write().await = Some(config.clone());
        debug!(root = %self.root.display(), engine, "Container backend initialized");
        Ok(())
    }

    async fn submit(
        &self,
        step_run_id: Uuid,
        command: &str,
        input_artifacts: &HashMap<String, String>,
        expected_outputs: &[ArtifactSpec],
    ) -> ExecutorResult<Uuid> {
        let config = self
            .config
            .read()
            .await
            .clone()
            .ok_or(ExecutorError::NotInitialized)?;

        let execution_id = Uuid::new_v4();
        let container_name = format!("pipeline-exec-{}", execution_id.simple());
        let image = format!("pipeline-exec-{}", execution_id.simple());

        let mut workspace = ExecutionWorkspace::create(&self.root, execution_id).map_err(|e| {
            ExecutorError::Submission(format!("failed to create execution directory: {}", e))
        })?;

        let launch = Launch {
            execution_id,
            step_run_id,
            command,
            container_name: &container_name,
            image: &image,
            inputs: input_artifacts,
            expected_outputs,
        };

        let container_id = match self.start_container(&launch, &config, &mut workspace).await {
            Ok(id) => id,
            Err(e) => {
                self.rollback(&config.container.engine, &launch, &workspace)
                    .await;
                return Err(ExecutorError::Submission(e.to_string()));
            }
        };

        info!(
            execution_id = %execution_id,
            step_run_id = %step_run_id,
            container = %container_name,
            "Started container execution"
        );

        let execution = ContainerExecution {
            step_run_id,
            command: command.to_string(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            started: Instant::now(),
            finished: None,
            workspace,
            expected_outputs: expected_outputs.to_vec(),
            container_id,
            container_name,
            image,
            engine: config.container.engine.clone(),
            cleanup_image: config.container.cleanup_image,
            exit_code: None,
            termination: None,
            timeout: config.timeout(),
            secrets: config.secrets.values().cloned().collect(),
            max_retries: config.max_retries,
            retry_delay_secs: config.retry_delay_secs,
        };

        self.executions.lock().await.insert(execution_id, execution);
        Ok(execution_id)
    }

    async fn get_status(&self, execution_id: Uuid) -> ExecutorResult<ExecutionStatus> {
        let status = self.refresh(execution_id).await?;
        if status.is_terminal() {
            return Ok(status);
        }

        // Only a container still running when its limit passed is stopped
        let timed_out = {
            let mut table = self.executions.lock().await;
            let execution = table
                .get_mut(&execution_id)
                .ok_or(ExecutorError::UnknownExecution(execution_id))?;
            let timed_out = !execution.status.is_terminal() && execution.timeout_exceeded();
            if timed_out {
                execution.termination.get_or_insert(Termination::TimedOut);
            }
            timed_out
        };

        if timed_out {
            warn!(execution_id = %execution_id, "Container execution timed out");
            self.stop_container(execution_id).await?;
        }
        self.current_status(execution_id).await
    }

    async fn get_result(&self, execution_id: Uuid) -> ExecutorResult<ExecutionResult> {
        let status = self.get_status(execution_id).await?;

        let (mut result, engine, container_id, log_file, secrets, exit_code, timed_out, timeout) = {
            let table = self.executions.lock().await;
            let execution = table
                .get(&execution_id)
                .ok_or(ExecutorError::UnknownExecution(execution_id))?;

            let timed_out = execution.termination == Some(Termination::TimedOut);
            let mut metadata = Map::new();
            metadata.insert("backend".into(), json!(CONTAINER_BACKEND));
            metadata.insert(
                "execution_time_secs".into(),
                json!(execution.elapsed().as_secs_f64()),
            );
            metadata.insert("step_run_id".into(), json!(execution.step_run_id));
            metadata.insert("started_at".into(), json!(execution.started_at.to_rfc3339()));
            metadata.insert(
                "command".into(),
                json!(redact_secrets(&execution.command, &execution.secrets)),
            );
            metadata.insert("container_id".into(), json!(execution.container_id));
            metadata.insert("container_name".into(), json!(execution.container_name));
            metadata.insert("image".into(), json!(execution.image));
            metadata.insert("max_retries".into(), json!(execution.max_retries));
            metadata.insert("retry_delay_secs".into(), json!(execution.retry_delay_secs));
            metadata.insert("timed_out".into(), json!(timed_out));

            let result = ExecutionResult {
                status,
                exit_code: execution.exit_code.unwrap_or(-1),
                logs: String::new(),
                artifacts: execution
                    .workspace
                    .collect_artifacts(&execution.expected_outputs),
                error_kind: None,
                error_message: None,
                metadata,
            };

            (
                result,
                execution.engine.clone(),
                execution.container_id.clone(),
                execution.workspace.log_file.clone(),
                execution.secrets.clone(),
                execution.exit_code,
                timed_out,
                execution.timeout,
            )
        };

        let logs_output = engine_output(
            &engine,
            &["logs".to_string(), container_id],
            &HashMap::new(),
        )
        .await;

        let logs = match logs_output {
            Ok(output) if output.status.success() => {
                let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
                logs.push_str(&String::from_utf8_lossy(&output.stderr));
                let logs = redact_secrets(&logs, &secrets);
                if status.is_terminal() {
                    if let Err(e) = tokio::fs::write(&log_file, &logs).await {
                        debug!(execution_id = %execution_id, error = %e, "Failed to persist logs");
                    }
                }
                logs
            }
            // Container gone: fall back to what was persisted earlier
            _ => tokio::fs::read_to_string(&log_file).await.unwrap_or_default(),
        };
        result.logs = logs;

        if status == ExecutionStatus::Failed {
            let classification = self.classifier.classify(&FailureContext {
                subject: "Container",
                exit_code,
                signal: signal_from_exit(exit_code),
                timed_out,
                timeout,
                logs: &result.logs,
            });
            result.error_kind = Some(classification.kind);
            result.error_message = Some(classification.message);
        }

        Ok(result)
    }

    async fn cancel(&self, execution_id: Uuid) -> ExecutorResult<bool> {
        // A container that already exited keeps its own outcome
        if self.refresh(execution_id).await?.is_terminal() {
            return Ok(true);
        }

        {
            let mut table = self.executions.lock().await;
            let execution = table
                .get_mut(&execution_id)
                .ok_or(ExecutorError::UnknownExecution(execution_id))?;
            if execution.status.is_terminal() {
                return Ok(true);
            }
            execution.termination.get_or_insert(Termination::Cancelled);
            info!(
                execution_id = %execution_id,
                container = %execution.container_name,
                "Cancelling container execution"
            );
        }

        self.stop_container(execution_id).await?;
        Ok(true)
    }

    async fn cleanup(&self, execution_id: Uuid) -> ExecutorResult<()> {
        if !self.current_status(execution_id).await?.is_terminal() {
            // `rm -f` below kills whatever the graceful stop left running
            if let Err(e) = self.cancel(execution_id).await {
                warn!(execution_id = %execution_id, error = %e, "Graceful stop failed, removing by force");
            }
        }

        let execution = self
            .executions
            .lock()
            .await
            .remove(&execution_id)
            .ok_or(ExecutorError::UnknownExecution(execution_id))?;

        let rm = engine_output(
            &execution.engine,
            &["rm", "-f", execution.container_id.as_str()].map(String::from),
            &HashMap::new(),
        )
        .await;
        warn_on_failure(rm, execution_id, "container");

        if execution.cleanup_image {
            let rmi = engine_output(
                &execution.engine,
                &["rmi", "-f", execution.image.as_str()].map(String::from),
                &HashMap::new(),
            )
            .await;
            warn_on_failure(rmi, execution_id, "image");
        }

        if let Err(e) = execution.workspace.remove_inputs() {
            warn!(execution_id = %execution_id, error = %e, "Failed to remove staged inputs");
        }
        debug!(execution_id = %execution_id, "Cleaned up container execution");
        Ok(())
    }
}
