// Execution Workspace
// Per-execution working area: artifacts dir, staged inputs and the captured log

use crate::execution::models::ArtifactSpec;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Directory the running command writes its artifacts to
pub const ARTIFACTS_DIR_VAR: &str = "PIPELINE_ARTIFACTS_DIR";
/// Directory holding staged input artifacts (only set when there are inputs)
pub const INPUTS_DIR_VAR: &str = "PIPELINE_INPUTS_DIR";
/// Backend execution id
pub const EXECUTION_ID_VAR: &str = "PIPELINE_EXECUTION_ID";
/// Step run the execution belongs to
pub const STEP_RUN_ID_VAR: &str = "PIPELINE_STEP_RUN_ID";

/// How input artifacts are placed into the inputs directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingMode {
    /// Symlink, falling back to a copy when the filesystem refuses links
    LinkOrCopy,
    /// Always copy (links would not resolve inside a container)
    Copy,
}

/// Isolated working area of one execution
#[derive(Debug, Clone)]
pub struct ExecutionWorkspace {
    pub root: PathBuf,
    pub artifacts_dir: PathBuf,
    pub inputs_dir: Option<PathBuf>,
    pub log_file: PathBuf,
}

impl ExecutionWorkspace {
    /// Create `<base>/<execution id>/artifacts`
    pub fn create(base: &Path, execution_id: Uuid) -> io::Result<Self> {
        let root = base.join(execution_id.to_string());
        let artifacts_dir = root.join("artifacts");
        fs::create_dir_all(&artifacts_dir)?;

        Ok(Self {
            log_file: root.join("output.log"),
            root,
            artifacts_dir,
            inputs_dir: None,
        })
    }

    /// Materialize input artifacts (name -> source path) under `inputs/`
    pub fn stage_inputs(
        &mut self,
        inputs: &HashMap<String, String>,
        mode: StagingMode,
    ) -> io::Result<()> {
        if inputs.is_empty() {
            return Ok(());
        }

        let inputs_dir = self.root.join("inputs");
        fs::create_dir_all(&inputs_dir)?;

        let mut names: Vec<&String> = inputs.keys().collect();
        names.sort();

        for name in names {
            let source = Path::new(&inputs[name]);
            let target = inputs_dir.join(checked_relative(name)?);

            if !source.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("input artifact '{}' not found at {}", name, source.display()),
                ));
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            match mode {
                StagingMode::LinkOrCopy => {
                    if symlink(source, &target).is_err() {
                        copy_recursive(source, &target)?;
                    }
                }
                StagingMode::Copy => copy_recursive(source, &target)?,
            }
        }

        self.inputs_dir = Some(inputs_dir);
        Ok(())
    }

    /// Create parent directories for expected outputs inside the artifacts dir
    pub fn prepare_outputs(&self, expected: &[ArtifactSpec]) -> io::Result<()> {
        for artifact in expected {
            let path = self.artifacts_dir.join(checked_relative(&artifact.name)?);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Expected artifacts that exist after the run; missing ones are left out
    pub fn collect_artifacts(&self, expected: &[ArtifactSpec]) -> HashMap<String, String> {
        expected
            .iter()
            .filter_map(|artifact| {
                let path = self.artifacts_dir.join(&artifact.name);
                path.exists()
                    .then(|| (artifact.name.clone(), path.to_string_lossy().to_string()))
            })
            .collect()
    }

    /// Location variables pointing at host paths
    pub fn location_env(&self, execution_id: Uuid, step_run_id: Uuid) -> Vec<(String, String)> {
        location_env(
            &self.artifacts_dir.to_string_lossy(),
            self.inputs_dir
                .as_ref()
                .map(|p| p.to_string_lossy().to_string())
                .as_deref(),
            execution_id,
            step_run_id,
        )
    }

    /// Drop staged inputs, keeping the artifacts and the log
    pub fn remove_inputs(&self) -> io::Result<()> {
        match &self.inputs_dir {
            Some(dir) if dir.exists() => fs::remove_dir_all(dir),
            _ => Ok(()),
        }
    }

    /// Remove the whole working area (rollback of a failed submission)
    pub fn remove(&self) -> io::Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

/// Build the injected location variables for the given paths
pub fn location_env(
    artifacts_dir: &str,
    inputs_dir: Option<&str>,
    execution_id: Uuid,
    step_run_id: Uuid,
) -> Vec<(String, String)> {
    let mut env = vec![
        (ARTIFACTS_DIR_VAR.to_string(), artifacts_dir.to_string()),
        (EXECUTION_ID_VAR.to_string(), execution_id.to_string()),
        (STEP_RUN_ID_VAR.to_string(), step_run_id.to_string()),
    ];
    if let Some(inputs) = inputs_dir {
        env.push((INPUTS_DIR_VAR.to_string(), inputs.to_string()));
    }
    env
}

/// Reject names that would escape the directory they are joined onto
pub fn checked_relative(name: &str) -> io::Result<&Path> {
    let path = Path::new(name);
    let escapes = name.is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));

    if escapes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("artifact name '{}' must be a relative path", name),
        ));
    }
    Ok(path)
}

#[cfg(unix)]
fn symlink(source: &Path, target: &Path) -> io::Result<()> {
    let source = source.canonicalize()?;
    std::os::unix::fs::symlink(source, target)
}

#[cfg(windows)]
fn symlink(source: &Path, target: &Path) -> io::Result<()> {
    let source = source.canonicalize()?;
    if source.is_dir() {
        std::os::windows::fs::symlink_dir(source, target)
    } else {
        std::os::windows::fs::symlink_file(source, target)
    }
}

fn copy_recursive(source: &Path, target: &Path) -> io::Result<()> {
    if source.is_dir() {
        fs::create_dir_all(target)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &target.join(entry.file_name()))?;
        }
    } else {
        fs::copy(source, target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, &Path)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, path)| (name.to_string(), path.to_string_lossy().to_string()))
            .collect()
    }

    #[test]
    fn test_create_workspace() {
        let temp = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let ws = ExecutionWorkspace::create(temp.path(), id).unwrap();

        assert!(ws.artifacts_dir.is_dir());
        assert_eq!(ws.root, temp.path().join(id.to_string()));
        assert!(ws.inputs_dir.is_none());
    }

    #[test]
    fn test_stage_inputs_link_or_copy() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("data.csv");
        fs::write(&source, "a,b\n1,2\n").unwrap();

        let mut ws = ExecutionWorkspace::create(temp.path(), Uuid::new_v4()).unwrap();
        ws.stage_inputs(&inputs(&[("data.csv", &source)]), StagingMode::LinkOrCopy)
            .unwrap();

        let staged = ws.inputs_dir.as_ref().unwrap().join("data.csv");
        assert_eq!(fs::read_to_string(staged).unwrap(), "a,b\n1,2\n");
    }

    #[test]
    fn test_stage_directory_by_copy() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("model");
        fs::create_dir_all(source.join("weights")).unwrap();
        fs::write(source.join("weights").join("layer0.bin"), "0101").unwrap();

        let mut ws = ExecutionWorkspace::create(temp.path(), Uuid::new_v4()).unwrap();
        ws.stage_inputs(&inputs(&[("model", &source)]), StagingMode::Copy)
            .unwrap();

        let staged = ws.inputs_dir.as_ref().unwrap().join("model");
        assert!(!fs::symlink_metadata(&staged).unwrap().file_type().is_symlink());
        assert_eq!(
            fs::read_to_string(staged.join("weights").join("layer0.bin")).unwrap(),
            "0101"
        );
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let mut ws = ExecutionWorkspace::create(temp.path(), Uuid::new_v4()).unwrap();
        let missing = temp.path().join("nope.txt");

        let err = ws
            .stage_inputs(&inputs(&[("nope.txt", &missing)]), StagingMode::Copy)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_collect_only_existing_artifacts() {
        let temp = tempfile::tempdir().unwrap();
        let ws = ExecutionWorkspace::create(temp.path(), Uuid::new_v4()).unwrap();
        let expected = vec![ArtifactSpec::new("reports/out.txt"), ArtifactSpec::new("never.txt")];

        ws.prepare_outputs(&expected).unwrap();
        assert!(ws.artifacts_dir.join("reports").is_dir());
        fs::write(ws.artifacts_dir.join("reports/out.txt"), "done").unwrap();

        let artifacts = ws.collect_artifacts(&expected);
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts["reports/out.txt"].ends_with("out.txt"));
        assert!(!artifacts.contains_key("never.txt"));
    }

    #[test]
    fn test_checked_relative() {
        assert!(checked_relative("a/b.txt").is_ok());
        assert!(checked_relative("../escape").is_err());
        assert!(checked_relative("/etc/passwd").is_err());
        assert!(checked_relative("").is_err());
    }

    #[test]
    fn test_location_env() {
        let exec = Uuid::new_v4();
        let run = Uuid::new_v4();
        let env = location_env("/app/artifacts", None, exec, run);
        assert_eq!(env.len(), 3);
        assert!(env.contains(&(EXECUTION_ID_VAR.to_string(), exec.to_string())));

        let env = location_env("/app/artifacts", Some("/app/inputs"), exec, run);
        assert!(env.contains(&(INPUTS_DIR_VAR.to_string(), "/app/inputs".to_string())));
    }

    #[test]
    fn test_remove_inputs_keeps_artifacts() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("in.txt");
        fs::write(&source, "x").unwrap();

        let mut ws = ExecutionWorkspace::create(temp.path(), Uuid::new_v4()).unwrap();
        ws.stage_inputs(&inputs(&[("in.txt", &source)]), StagingMode::LinkOrCopy)
            .unwrap();
        fs::write(ws.artifacts_dir.join("out.txt"), "y").unwrap();

        ws.remove_inputs().unwrap();
        assert!(!ws.inputs_dir.as_ref().unwrap().exists());
        assert!(ws.artifacts_dir.join("out.txt").exists());
        assert!(source.exists());
    }
}
