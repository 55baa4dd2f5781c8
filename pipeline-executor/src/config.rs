// Configuration
// Executor and worker settings, loadable from YAML with defaults for every field

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Placeholder written in place of secret values
pub const REDACTED: &str = "***";

/// Errors that can occur while loading configuration files
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Per-submission executor settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Retry budget surfaced to the caller; the executor never retries itself
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// Wall clock limit per execution, 0 disables the limit
    pub timeout_secs: u64,
    pub env: HashMap<String, String>,
    /// Injected like `env` but never logged or returned
    pub secrets: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub container: ContainerOptions,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 30,
            timeout_secs: 3600,
            env: HashMap::new(),
            secrets: HashMap::new(),
            working_directory: None,
            container: ContainerOptions::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(key.into(), value.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Replace every secret value occurring in `text`
    pub fn redact(&self, text: &str) -> String {
        redact_secrets(text, self.secrets.values())
    }
}

impl fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secrets: HashMap<&String, &str> =
            self.secrets.keys().map(|k| (k, REDACTED)).collect();
        f.debug_struct("ExecutorConfig")
            .field("max_retries", &self.max_retries)
            .field("retry_delay_secs", &self.retry_delay_secs)
            .field("timeout_secs", &self.timeout_secs)
            .field("env", &self.env)
            .field("secrets", &secrets)
            .field("working_directory", &self.working_directory)
            .field("container", &self.container)
            .finish()
    }
}

pub(crate) fn redact_secrets<'a>(
    text: &str,
    secrets: impl IntoIterator<Item = &'a String>,
) -> String {
    let mut values: Vec<&String> = secrets.into_iter().filter(|v| !v.is_empty()).collect();
    // Longest first so a secret containing another is fully masked
    values.sort_by_key(|v| std::cmp::Reverse(v.len()));

    let mut redacted = text.to_string();
    for value in values {
        redacted = redacted.replace(value.as_str(), REDACTED);
    }
    redacted
}

/// Memory and CPU limits translated to engine flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// e.g. "512m"
    pub memory: Option<String>,
    /// e.g. "1.0"
    pub cpus: Option<String>,
}

/// Settings used only by the container backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    pub engine: String,
    pub base_image: String,
    /// Full Dockerfile contents replacing the generated one
    pub dockerfile_template: Option<String>,
    pub requirements_file: Option<PathBuf>,
    /// bridge, host, none or container:<name|id>
    pub network_mode: String,
    pub resource_limits: ResourceLimits,
    /// host path -> container path
    pub volumes: HashMap<String, String>,
    /// Remove the built image on cleanup. Off by default since the image
    /// cache is shared by the whole host.
    pub cleanup_image: bool,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            engine: "docker".to_string(),
            base_image: "python:3.9-slim".to_string(),
            dockerfile_template: None,
            requirements_file: None,
            network_mode: "bridge".to_string(),
            resource_limits: ResourceLimits::default(),
            volumes: HashMap::new(),
            cleanup_image: false,
        }
    }
}

/// A backend type advertised by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapability {
    pub backend_type: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl WorkerCapability {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            properties: HashMap::new(),
        }
    }
}

/// Configuration for a worker agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub name: String,
    pub description: Option<String>,
    pub capabilities: Vec<WorkerCapability>,
    pub max_concurrent_executions: usize,
    pub heartbeat_interval_secs: f64,
    /// How often the reconciliation loop polls running executions
    pub status_poll_interval_secs: f64,
    /// Root for per-execution working areas (default: a temp dir per worker)
    pub artifact_dir: Option<PathBuf>,
    /// Collected automatically when empty
    pub platform_info: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            name: "local-worker".to_string(),
            description: None,
            capabilities: Vec::new(),
            max_concurrent_executions: 5,
            heartbeat_interval_secs: 60.0,
            status_poll_interval_secs: 5.0,
            artifact_dir: None,
            platform_info: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load a worker config from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_secs.max(0.001))
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.status_poll_interval_secs.max(0.001))
    }

    /// Directory holding this worker's execution areas
    pub fn resolved_artifact_dir(&self) -> PathBuf {
        self.artifact_dir.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("pipeline-worker-{}", self.worker_id))
        })
    }
}

/// Describe the host the worker runs on
pub fn collect_platform_info() -> HashMap<String, String> {
    let mut info = HashMap::new();
    info.insert("system".to_string(), std::env::consts::OS.to_string());
    info.insert("family".to_string(), std::env::consts::FAMILY.to_string());
    info.insert("machine".to_string(), std::env::consts::ARCH.to_string());
    if let Some(host) = hostname() {
        info.insert("hostname".to_string(), host);
    }
    info
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_config_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_secs, 30);
        assert_eq!(config.timeout(), Some(Duration::from_secs(3600)));
        assert_eq!(config.container.network_mode, "bridge");

        let config = ExecutorConfig {
            timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_secrets_are_not_debug_printed() {
        let config = ExecutorConfig::default()
            .with_env("MODE", "fast")
            .with_secret("API_TOKEN", "hunter2");

        let printed = format!("{:?}", config);
        assert!(printed.contains("API_TOKEN"));
        assert!(printed.contains("fast"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_redact() {
        let config = ExecutorConfig::default()
            .with_secret("A", "abc")
            .with_secret("B", "abcdef")
            .with_secret("EMPTY", "");

        assert_eq!(config.redact("token=abcdef, short=abc"), "token=***, short=***");
        assert_eq!(config.redact("nothing here"), "nothing here");
    }

    #[test]
    fn test_worker_config_from_yaml() {
        let yaml = r#"
name: gpu-box
max_concurrent_executions: 2
heartbeat_interval_secs: 15
capabilities:
  - backend_type: local
"#;
        let config = WorkerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.name, "gpu-box");
        assert_eq!(config.max_concurrent_executions, 2);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.status_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.capabilities, vec![WorkerCapability::new("local")]);
        assert!(!config.worker_id.is_empty());
    }

    #[test]
    fn test_worker_config_from_missing_file() {
        let err = WorkerConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_resolved_artifact_dir() {
        let mut config = WorkerConfig::new("w");
        config.worker_id = "abc".to_string();
        assert!(config
            .resolved_artifact_dir()
            .ends_with("pipeline-worker-abc"));

        config.artifact_dir = Some(PathBuf::from("/srv/artifacts"));
        assert_eq!(config.resolved_artifact_dir(), PathBuf::from("/srv/artifacts"));
    }

    #[test]
    fn test_platform_info() {
        let info = collect_platform_info();
        assert_eq!(info.get("system").map(String::as_str), Some(std::env::consts::OS));
    }
}
