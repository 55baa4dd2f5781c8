pub mod exec;
pub mod run;
pub mod validate;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use pipeline_executor::{collect_platform_info, WorkerConfig};

/// `<config dir>/pipex/worker.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pipex").join("worker.yaml"))
}

/// Load the worker config. An explicit path must exist; the default path is
/// used only when present.
pub fn load_worker_config(path: Option<&Path>) -> Result<WorkerConfig> {
    let path = match path {
        Some(path) => {
            if !path.exists() {
                bail!("Worker config not found: {}", path.display());
            }
            Some(path.to_path_buf())
        }
        None => default_config_path().filter(|p| p.exists()),
    };

    let mut config = match &path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Loading worker config");
            WorkerConfig::from_file(path)
                .wrap_err_with(|| format!("Failed to load {}", path.display()))?
        }
        None => WorkerConfig::new("pipex"),
    };

    if config.platform_info.is_empty() {
        config.platform_info = collect_platform_info();
    }
    Ok(config)
}

/// Parse repeated `NAME=VALUE` flags
pub fn parse_pairs(values: &[String], flag: &str) -> Result<HashMap<String, String>> {
    let mut pairs = HashMap::new();
    for value in values {
        match value.split_once('=') {
            Some((name, val)) if !name.is_empty() => {
                pairs.insert(name.to_string(), val.to_string());
            }
            _ => bail!("Invalid {} '{}'. Expected NAME=VALUE", flag, value),
        }
    }
    Ok(pairs)
}
