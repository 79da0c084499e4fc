//! Worker launch description.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// What to run, where, and with which startup options. Built once and then
/// only read.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    command: Vec<String>,
    working_directory: PathBuf,
    env: BTreeMap<String, String>,
    startup_options: Map<String, Value>,
}

impl WorkerSpec {
    /// `command` is the executable followed by its arguments.
    pub fn new(command: Vec<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            command,
            working_directory: working_directory.into(),
            env: BTreeMap::new(),
            startup_options: Map::new(),
        }
    }

    /// `[bootstrap, app_root]` run inside `app_root`.
    pub fn bootstrap(bootstrap: impl AsRef<Path>, app_root: impl AsRef<Path>) -> Self {
        let app_root = app_root.as_ref();
        Self::new(
            vec![
                bootstrap.as_ref().to_string_lossy().into_owned(),
                app_root.to_string_lossy().into_owned(),
            ],
            app_root,
        )
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set one startup option passed to the worker.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.startup_options.insert(key.into(), value.into());
        self
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn startup_options(&self) -> &Map<String, Value> {
        &self.startup_options
    }
}
