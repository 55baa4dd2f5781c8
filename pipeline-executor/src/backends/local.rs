// Local Backend
// Runs step commands as child processes of the worker

use super::classifier::{ErrorClassifier, FailureContext, MarkerClassifier};
use super::workspace::{ExecutionWorkspace, StagingMode};
use super::{ExecutionBackend, Termination, DEFAULT_GRACE_PERIOD};
use crate::config::{redact_secrets, ExecutorConfig};
use crate::error::{ExecutorError, ExecutorResult};
use crate::execution::models::{ArtifactSpec, ExecutionResult, ExecutionStatus};

use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Registration name of the local backend
pub const LOCAL_BACKEND: &str = "local";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to wait for the process to disappear after a forced kill
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Shell executable and arguments (sh on Unix, cmd on Windows)
fn shell_command() -> (&'static str, &'static [&'static str]) {
    if cfg!(target_os = "windows") {
        ("cmd", &["/C"])
    } else {
        ("sh", &["-c"])
    }
}

/// A child process started by this backend
struct LocalExecution {
    step_run_id: Uuid,
    command: String,
    status: ExecutionStatus,
    started_at: DateTime<Utc>,
    started: Instant,
    finished: Option<Instant>,
    workspace: ExecutionWorkspace,
    expected_outputs: Vec<ArtifactSpec>,
    child: Child,
    pid: Option<u32>,
    exit: Option<ExitStatus>,
    termination: Option<Termination>,
    // Snapshotted at submit so a later initialize() cannot change them
    timeout: Option<Duration>,
    secrets: Vec<String>,
    max_retries: u32,
    retry_delay_secs: u64,
}

impl LocalExecution {
    /// Reap the child if it has exited. Returns true once it has.
    fn poll_exit(&mut self) -> ExecutorResult<bool> {
        if self.exit.is_some() {
            return Ok(true);
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(ExecutorError::Runtime(format!(
                "failed to poll process {:?}: {}",
                self.pid, e
            ))),
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.exit = Some(status);
        self.finished = Some(Instant::now());

        let observed = match self.termination {
            Some(termination) => termination.final_status(),
            None if status.success() => ExecutionStatus::Completed,
            None => ExecutionStatus::Failed,
        };
        self.status = self.status.advance(observed);
    }

    fn timeout_exceeded(&self) -> bool {
        self.timeout
            .is_some_and(|limit| self.started.elapsed() > limit)
    }

    fn exit_code(&self) -> i32 {
        self.exit.and_then(|s| s.code()).unwrap_or(-1)
    }

    fn signal(&self) -> Option<i32> {
        self.exit.and_then(exit_signal)
    }

    fn elapsed(&self) -> Duration {
        self.finished
            .unwrap_or_else(Instant::now)
            .duration_since(self.started)
    }

    /// Ask the process group to stop (SIGTERM)
    #[cfg(unix)]
    fn request_stop(&mut self) {
        if let Some(pid) = self.pid {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(pid = ?self.pid, error = %e, "Failed to kill process");
        }
    }

    /// Kill the process group outright (SIGKILL)
    fn force_stop(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
        }

        if let Err(e) = self.child.start_kill() {
            debug!(pid = ?self.pid, error = %e, "Failed to kill process");
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };

    match killpg(Pid::from_raw(raw), signal) {
        // ESRCH: the group is already gone
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, ?signal, error = %e, "Failed to signal process group"),
    }
}

/// Backend running each job as a shell command in its own process group
pub struct LocalBackend {
    root: PathBuf,
    grace_period: Duration,
    classifier: Arc<dyn ErrorClassifier>,
    config: RwLock<Option<ExecutorConfig>>,
    executions: Mutex<HashMap<Uuid, LocalExecution>>,
}

impl LocalBackend {
    /// Create a backend placing execution directories under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            grace_period: DEFAULT_GRACE_PERIOD,
            classifier: Arc::new(MarkerClassifier::default()),
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

    fn spawn(
        &self,
        execution_id: Uuid,
        step_run_id: Uuid,
        command: &str,
        config: &ExecutorConfig,
        workspace: &mut ExecutionWorkspace,
        inputs: &HashMap<String, String>,
        expected_outputs: &[ArtifactSpec],
    ) -> io::Result<Child> {
        workspace.stage_inputs(inputs, StagingMode::LinkOrCopy)?;
        workspace.prepare_outputs(expected_outputs)?;

        let log = File::create(&workspace.log_file)?;
        let (shell, shell_args) = shell_command();
        let work_dir = config
            .working_directory
            .as_deref()
            .unwrap_or(workspace.root.as_path());

        let mut cmd = Command::new(shell);
        cmd.args(shell_args);
        cmd.arg(command);
        cmd.current_dir(work_dir);
        cmd.envs(&config.env);
        cmd.envs(&config.secrets);
        cmd.envs(workspace.location_env(execution_id, step_run_id));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log.try_clone()?));
        cmd.stderr(Stdio::from(log));
        cmd.kill_on_drop(true);

        // Own process group so cancellation reaches grandchildren too
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
    }

    /// Stop the process: graceful first, forceful once the grace period
    /// has passed. The table lock is released between polls.
    async fn terminate(&self, execution_id: Uuid) -> ExecutorResult<()> {
        {
            let mut table = self.executions.lock().await;
            let execution = table
                .get_mut(&execution_id)
                .ok_or(ExecutorError::UnknownExecution(execution_id))?;
            if execution.poll_exit()? {
                return Ok(());
            }
            execution.request_stop();
        }

        let grace_deadline = Instant::now() + self.grace_period;
        let mut kill_deadline: Option<Instant> = None;

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let mut table = self.executions.lock().await;
            let Some(execution) = table.get_mut(&execution_id) else {
                return Ok(());
            };
            if execution.poll_exit()? {
                return Ok(());
            }

            let now = Instant::now();
            match kill_deadline {
                None if now >= grace_deadline => {
                    warn!(
                        execution_id = %execution_id,
                        pid = ?execution.pid,
                        "Process did not exit within {}s, killing",
                        self.grace_period.as_secs()
                    );
                    execution.force_stop();
                    kill_deadline = Some(now + KILL_WAIT);
                }
                Some(deadline) if now >= deadline => {
                    return Err(ExecutorError::Cancellation(format!(
                        "process {:?} did not exit after being killed",
                        execution.pid
                    )));
                }
                _ => {}
            }
        }
    }

    async fn current_status(&self, execution_id: Uuid) -> ExecutorResult<ExecutionStatus> {
        let table = self.executions.lock().await;
        table
            .get(&execution_id)
            .map(|e| e.status)
            .ok_or(ExecutorError::UnknownExecution(execution_id))
    }
}

/// Mask secret values in the log file on disk
async fn scrub_log(log_file: &Path, secrets: &[String]) -> io::Result<()> {
    if secrets.iter().all(|s| s.is_empty()) {
        return Ok(());
    }
    let raw = match tokio::fs::read(log_file).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let redacted = redact_secrets(&raw, secrets);
    if redacted != raw {
        tokio::fs::write(log_file, redacted).await?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl ExecutionBackend for LocalBackend {
    fn backend_type(&self) -> &str {
        LOCAL_BACKEND
    }

    async fn initialize(&self, config: &ExecutorConfig) -> ExecutorResult<()> {
        let (shell, _) = shell_command();
        which::which(shell).map_err(|e| {
            ExecutorError::BackendUnavailable(format!("shell '{}' not found: {}", shell, e))
        })?;

        tokio::fs::create_dir_all(&self.root).await?;
        if let Some(dir) = &config.working_directory {
            tokio::fs::create_dir_all(dir).await?;
        }

        *self.config.write().await = Some(config.clone());
        debug!(root = %self.root.display(), "Local backend initialized");
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
        let mut workspace = ExecutionWorkspace::create(&self.root, execution_id).map_err(|e| {
            ExecutorError::Submission(format!("failed to create execution directory: {}", e))
        })?;

        let child = match self.spawn(
            execution_id,
            step_run_id,
            command,
            &config,
            &mut workspace,
            input_artifacts,
            expected_outputs,
        ) {
            Ok(child) => child,
            Err(e) => {
                if let Err(cleanup_err) = workspace.remove() {
                    warn!(
                        execution_id = %execution_id,
                        error = %cleanup_err,
                        "Failed to remove execution directory"
                    );
                }
                return Err(ExecutorError::Submission(e.to_string()));
            }
        };

        let pid = child.id();
        info!(
            execution_id = %execution_id,
            step_run_id = %step_run_id,
            pid = ?pid,
            "Started local execution"
        );

        let execution = LocalExecution {
            step_run_id,
            command: command.to_string(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            started: Instant::now(),
            finished: None,
            workspace,
            expected_outputs: expected_outputs.to_vec(),
            child,
            pid,
            exit: None,
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
        {
            let mut table = self.executions.lock().await;
            let execution = table
                .get_mut(&execution_id)
                .ok_or(ExecutorError::UnknownExecution(execution_id))?;

            if execution.status.is_terminal() || execution.poll_exit()? {
                return Ok(execution.status);
            }
            if !execution.timeout_exceeded() {
                return Ok(execution.status);
            }

            warn!(
                execution_id = %execution_id,
                timeout_secs = ?execution.timeout.map(|t| t.as_secs()),
                "Execution timed out"
            );
            execution.termination.get_or_insert(Termination::TimedOut);
        }

        self.terminate(execution_id).await?;
        self.current_status(execution_id).await
    }

    async fn get_result(&self, execution_id: Uuid) -> ExecutorResult<ExecutionResult> {
        let status = self.get_status(execution_id).await?;

        let (mut result, log_file, secrets, exit_code, signal, timed_out, timeout) = {
            let table = self.executions.lock().await;
            let execution = table
                .get(&execution_id)
                .ok_or(ExecutorError::UnknownExecution(execution_id))?;

            let mut metadata = Map::new();
            metadata.insert("backend".into(), json!(LOCAL_BACKEND));
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
            metadata.insert("pid".into(), json!(execution.pid));
            metadata.insert("max_retries".into(), json!(execution.max_retries));
            metadata.insert("retry_delay_secs".into(), json!(execution.retry_delay_secs));
            let timed_out = execution.termination == Some(Termination::TimedOut);
            metadata.insert("timed_out".into(), json!(timed_out));
            if let Some(signal) = execution.signal() {
                metadata.insert("signal".into(), json!(signal));
            }

            let result = ExecutionResult {
                status,
                exit_code: execution.exit_code(),
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
                execution.workspace.log_file.clone(),
                execution.secrets.clone(),
                execution.exit.and_then(|s| s.code()),
                execution.signal(),
                timed_out,
                execution.timeout,
            )
        };

        let logs = match tokio::fs::read(&log_file).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        result.logs = redact_secrets(&logs, &secrets);
        if status.is_terminal() && result.logs != logs {
            if let Err(e) = tokio::fs::write(&log_file, &result.logs).await {
                warn!(execution_id = %execution_id, error = %e, "Failed to rewrite redacted log");
            }
        }

        if status == ExecutionStatus::Failed {
            let classification = self.classifier.classify(&FailureContext {
                subject: "Process",
                exit_code,
                signal,
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
        {
            let mut table = self.executions.lock().await;
            let execution = table
                .get_mut(&execution_id)
                .ok_or(ExecutorError::UnknownExecution(execution_id))?;

            if execution.status.is_terminal() || execution.poll_exit()? {
                return Ok(true);
            }
            execution.termination.get_or_insert(Termination::Cancelled);
            info!(execution_id = %execution_id, pid = ?execution.pid, "Cancelling execution");
        }

        self.terminate(execution_id).await?;
        Ok(true)
    }

    async fn cleanup(&self, execution_id: Uuid) -> ExecutorResult<()> {
        let running = {
            let mut table = self.executions.lock().await;
            let execution = table
                .get_mut(&execution_id)
                .ok_or(ExecutorError::UnknownExecution(execution_id))?;
            !(execution.status.is_terminal() || execution.poll_exit()?)
        };

        if running {
            self.cancel(execution_id).await?;
        }

        let execution = self
            .executions
            .lock()
            .await
            .remove(&execution_id)
            .ok_or(ExecutorError::UnknownExecution(execution_id))?;

        if let Err(e) = execution.workspace.remove_inputs() {
            warn!(execution_id = %execution_id, error = %e, "Failed to remove staged inputs");
        }
        // The log outlives the record
        if let Err(e) = scrub_log(&execution.workspace.log_file, &execution.secrets).await {
            warn!(execution_id = %execution_id, error = %e, "Failed to redact retained log");
        }
        debug!(execution_id = %execution_id, "Cleaned up local execution");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::execution::models::ErrorKind;
    use std::fs;

    async fn backend(root: &Path, config: ExecutorConfig) -> LocalBackend {
        let backend = LocalBackend::new(root).with_grace_period(Duration::from_secs(2));
        backend.initialize(&config).await.unwrap();
        backend
    }

    async fn wait_terminal(backend: &LocalBackend, id: Uuid) -> ExecutionStatus {
        for _ in 0..200 {
            let status = backend.get_status(id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("execution {} did not finish", id);
    }

    async fn run(backend: &LocalBackend, command: &str, outputs: &[ArtifactSpec]) -> ExecutionResult {
        let id = backend
            .submit(Uuid::new_v4(), command, &HashMap::new(), outputs)
            .await
            .unwrap();
        wait_terminal(backend, id).await;
        backend.get_result(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_successful_command() {
        let temp = tempfile::tempdir().unwrap();
        let backend = backend(temp.path(), ExecutorConfig::default()).await;

        let result = run(&backend, "echo hello", &[]).await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.logs.trim(), "hello");
        assert!(result.error_kind.is_none());
        assert_eq!(result.metadata["backend"], "local");
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let temp = tempfile::tempdir().unwrap();
        let backend = backend(temp.path(), ExecutorConfig::default()).await;

        let result = run(&backend, "echo out; echo err >&2", &[]).await;
        assert!(result.logs.contains("out"));
        assert!(result.logs.contains("err"));
    }

    #[tokio::test]
    async fn test_failing_command() {
        let temp = tempfile::tempdir().unwrap();
        let backend = backend(temp.path(), ExecutorConfig::default()).await;

        let result = run(&backend, "exit 1", &[]).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.error_kind, Some(ErrorKind::Retryable));
        assert_eq!(
            result.error_message.as_deref(),
            Some("Process failed with exit code 1")
        );
    }

    #[tokio::test]
    async fn test_business_error_is_non_retryable() {
        let temp = tempfile::tempdir().unwrap();
        let backend = backend(temp.path(), ExecutorConfig::default()).await;

        let result = run(&backend, "echo 'BUSINESS_ERROR: invalid rows'; exit 2", &[]).await;
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.error_kind, Some(ErrorKind::NonRetryable));
    }

    #[tokio::test]
    async fn test_timeout() {
        let temp = tempfile::tempdir().unwrap();
        let config = ExecutorConfig::default().with_timeout(Duration::from_secs(1));
        let backend = backend(temp.path(), config).await;

        let started = Instant::now();
        let result = run(&backend, "sleep 30", &[]).await;
        assert!(started.elapsed() < Duration::from_secs(10));

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::Retryable));
        assert!(result.error_message.unwrap().contains("timed out"));
        assert_eq!(result.metadata["timed_out"], true);
    }

    #[tokio::test]
    async fn test_artifacts() {
        let temp = tempfile::tempdir().unwrap();
        let backend = backend(temp.path(), ExecutorConfig::default()).await;

        let outputs = vec![
            ArtifactSpec::new("model/weights.bin"),
            ArtifactSpec::new("missing.txt"),
        ];
        let result = run(
            &backend,
            "echo data > \"$PIPELINE_ARTIFACTS_DIR/model/weights.bin\"",
            &outputs,
        )
        .await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.artifacts.len(), 1);
        let path = &result.artifacts["model/weights.bin"];
        assert_eq!(fs::read_to_string(path).unwrap().trim(), "data");
        assert!(!result.artifacts.contains_key("missing.txt"));
    }

    #[tokio::test]
    async fn test_env_and_location_variables() {
        let temp = tempfile::tempdir().unwrap();
        let config = ExecutorConfig::default().with_env("MODE", "fast");
        let backend = backend(temp.path(), config).await;

        let step_run_id = Uuid::new_v4();
        let id = backend
            .submit(step_run_id, "echo \"$MODE $PIPELINE_STEP_RUN_ID $PIPELINE_EXECUTION_ID\"", &HashMap::new(), &[])
            .await
            .unwrap();
        wait_terminal(&backend, id).await;

        let result = backend.get_result(id).await.unwrap();
        assert_eq!(
            result.logs.trim(),
            format!("fast {} {}", step_run_id, id)
        );
    }

    #[tokio::test]
    async fn test_secrets_are_redacted() {
        let temp = tempfile::tempdir().unwrap();
        let config = ExecutorConfig::default().with_secret("API_TOKEN", "s3cr3t-value");
        let backend = backend(temp.path(), config).await;

        let result = run(&backend, "echo \"token=$API_TOKEN\"", &[]).await;
        assert_eq!(result.logs.trim(), "token=***");
        assert!(!result.logs.contains("s3cr3t-value"));
    }

    #[tokio::test]
    async fn test_retained_log_is_redacted() {
        let temp = tempfile::tempdir().unwrap();
        let config = ExecutorConfig::default().with_secret("API_TOKEN", "s3cr3t-value");
        let backend = backend(temp.path(), config).await;

        // Cleaned up without ever fetching the result
        let id = backend
            .submit(Uuid::new_v4(), "echo \"token=$API_TOKEN\"", &HashMap::new(), &[])
            .await
            .unwrap();
        wait_terminal(&backend, id).await;
        backend.cleanup(id).await.unwrap();

        let log = fs::read_to_string(temp.path().join(id.to_string()).join("output.log")).unwrap();
        assert_eq!(log.trim(), "token=***");

        // Fetching the result of a finished run rewrites the file too
        let id = backend
            .submit(Uuid::new_v4(), "echo \"again=$API_TOKEN\"", &HashMap::new(), &[])
            .await
            .unwrap();
        wait_terminal(&backend, id).await;
        let result = backend.get_result(id).await.unwrap();
        let log = fs::read_to_string(temp.path().join(id.to_string()).join("output.log")).unwrap();
        assert_eq!(log.trim(), "again=***");
        assert!(!result.logs.contains("s3cr3t-value"));
    }

    #[tokio::test]
    async fn test_inputs_are_staged() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("upstream.csv");
        fs::write(&source, "id,value\n1,42\n").unwrap();

        let backend = backend(&temp.path().join("runs"), ExecutorConfig::default()).await;
        let inputs = HashMap::from([(
            "data.csv".to_string(),
            source.to_string_lossy().to_string(),
        )]);

        let id = backend
            .submit(Uuid::new_v4(), "cat \"$PIPELINE_INPUTS_DIR/data.csv\"", &inputs, &[])
            .await
            .unwrap();
        wait_terminal(&backend, id).await;

        let result = backend.get_result(id).await.unwrap();
        assert!(result.logs.contains("1,42"));
    }

    #[tokio::test]
    async fn test_failed_submission_rolls_back() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("runs");
        let backend = backend(&root, ExecutorConfig::default()).await;

        let inputs = HashMap::from([("gone.csv".to_string(), "/no/such/file.csv".to_string())]);
        let err = backend
            .submit(Uuid::new_v4(), "true", &inputs, &[])
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Submission(_)));
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_submit_requires_initialize() {
        let temp = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(temp.path());

        let err = backend
            .submit(Uuid::new_v4(), "true", &HashMap::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NotInitialized));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let backend = backend(temp.path(), ExecutorConfig::default()).await;

        let id = backend
            .submit(Uuid::new_v4(), "sleep 30", &HashMap::new(), &[])
            .await
            .unwrap();
        assert_eq!(backend.get_status(id).await.unwrap(), ExecutionStatus::Running);

        assert!(backend.cancel(id).await.unwrap());
        assert_eq!(backend.get_status(id).await.unwrap(), ExecutionStatus::Cancelled);

        assert!(backend.cancel(id).await.unwrap());
        assert_eq!(backend.get_status(id).await.unwrap(), ExecutionStatus::Cancelled);

        let result = backend.get_result(id).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(result.error_kind.is_none());
    }

    #[tokio::test]
    async fn test_cancel_escalates_to_kill() {
        let temp = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(temp.path()).with_grace_period(Duration::from_millis(300));
        backend.initialize(&ExecutorConfig::default()).await.unwrap();

        let id = backend
            .submit(Uuid::new_v4(), "trap '' TERM; sleep 30", &HashMap::new(), &[])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        assert!(backend.cancel(id).await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(backend.get_status(id).await.unwrap(), ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_result_is_stable_once_terminal() {
        let temp = tempfile::tempdir().unwrap();
        let backend = backend(temp.path(), ExecutorConfig::default()).await;

        let id = backend
            .submit(Uuid::new_v4(), "echo partial; exit 3", &HashMap::new(), &[])
            .await
            .unwrap();
        wait_terminal(&backend, id).await;

        let first = backend.get_result(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = backend.get_result(id).await.unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.exit_code, 3);
        assert_eq!(first.exit_code, second.exit_code);
        assert_eq!(first.logs, second.logs);
        assert_eq!(first.error_message, second.error_message);
        assert_eq!(
            first.metadata["execution_time_secs"],
            second.metadata["execution_time_secs"]
        );
    }

    #[tokio::test]
    async fn test_cleanup() {
        let temp = tempfile::tempdir().unwrap();
        let backend = backend(temp.path(), ExecutorConfig::default()).await;

        let outputs = vec![ArtifactSpec::new("out.txt")];
        let id = backend
            .submit(Uuid::new_v4(), "echo x > \"$PIPELINE_ARTIFACTS_DIR/out.txt\"", &HashMap::new(), &outputs)
            .await
            .unwrap();
        wait_terminal(&backend, id).await;
        let result = backend.get_result(id).await.unwrap();

        backend.cleanup(id).await.unwrap();
        assert!(Path::new(&result.artifacts["out.txt"]).exists());
        assert!(matches!(
            backend.get_status(id).await,
            Err(ExecutorError::UnknownExecution(_))
        ));
        assert!(matches!(
            backend.cleanup(id).await,
            Err(ExecutorError::UnknownExecution(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_stops_running_process() {
        let temp = tempfile::tempdir().unwrap();
        let backend = backend(temp.path(), ExecutorConfig::default()).await;

        let id = backend
            .submit(Uuid::new_v4(), "sleep 30", &HashMap::new(), &[])
            .await
            .unwrap();
        backend.cleanup(id).await.unwrap();
        assert!(backend.executions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_working_directory() {
        let temp = tempfile::tempdir().unwrap();
        let work = temp.path().join("work");
        let config = ExecutorConfig::default().with_working_directory(&work);
        let backend = backend(&temp.path().join("runs"), config).await;

        let result = run(&backend, "pwd", &[]).await;
        let reported = PathBuf::from(result.logs.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            work.canonicalize().unwrap()
        );
    }
}
