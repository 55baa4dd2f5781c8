// Shell script standing in for the container engine CLI in tests

use crate::config::ExecutorConfig;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

const SCRIPT: &str = r#"#!/bin/sh
dir=$(dirname "$0")
echo "$*" >> "$dir/calls.log"
if [ -f "$dir/fail-$1" ]; then
    echo "$1 failed: daemon hiccup" >&2
    exit 1
fi
case "$1" in
    run) echo "cid-$$" ;;
    inspect)
        if [ -f "$dir/state" ]; then
            cat "$dir/state"
        else
            echo "No such container" >&2
            exit 1
        fi
        ;;
    stop) echo "exited 143" > "$dir/state" ;;
    logs) echo "container output" ;;
esac
exit 0
"#;

/// Behaviour is driven by files next to the script: `state` holds what
/// `inspect` prints, `fail-<subcommand>` makes that subcommand fail. Every
/// invocation is appended to `calls.log`.
pub(crate) struct FakeEngine {
    dir: tempfile::TempDir,
    path: PathBuf,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine");
        fs::write(&path, SCRIPT).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, path }
    }

    pub(crate) fn set_state(&self, state: &str) {
        fs::write(self.dir.path().join("state"), state).unwrap();
    }

    /// Make `inspect` report the container as gone
    pub(crate) fn remove_state(&self) {
        let _ = fs::remove_file(self.dir.path().join("state"));
    }

    pub(crate) fn fail(&self, subcommand: &str) {
        fs::write(self.dir.path().join(format!("fail-{}", subcommand)), "").unwrap();
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub(crate) fn calls_to(&self, subcommand: &str) -> Vec<String> {
        let prefix = format!("{} ", subcommand);
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(&prefix))
            .collect()
    }

    /// Executor config pointing the container backend at this engine
    pub(crate) fn config(&self) -> ExecutorConfig {
        let mut config = ExecutorConfig::default();
        config.container.engine = self.path.to_string_lossy().to_string();
        config
    }
}
