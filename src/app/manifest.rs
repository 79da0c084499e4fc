//! Application manifest and framework kinds.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StartupFailure;

/// Manifest file expected at the application root.
pub const MANIFEST_FILE: &str = "app.json";

const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// The closed set of supported application kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "framework", rename_all = "snake_case")]
pub enum FrameworkKind {
    /// Files served from a directory under the app root.
    Static {
        #[serde(default = "default_public_dir")]
        public_dir: PathBuf,
    },
    /// Reflects each request back.
    Echo,
    /// One process per request: request JSON on stdin, response JSON on stdout.
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_command_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_public_dir() -> PathBuf {
    PathBuf::from("public")
}

fn default_command_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_MS
}

impl FrameworkKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Static { .. } => "static",
            Self::Echo => "echo",
            Self::Command { .. } => "command",
        }
    }
}

/// A resolved application: where it lives and what kind it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppManifest {
    pub root: PathBuf,
    pub framework: FrameworkKind,
}

impl AppManifest {
    /// Read `app.json` from `root`.
    ///
    /// A missing or unreadable manifest is a `LoadError`; one that does not
    /// parse is a `ConfigurationError`.
    pub fn load(root: &Path) -> Result<Self, StartupFailure> {
        if !root.is_dir() {
            return Err(StartupFailure::load(format!(
                "application root {} is not a directory",
                root.display()
            )));
        }

        let path = root.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            StartupFailure::load(format!("cannot read {}: {e}", path.display()))
        })?;

        let framework: FrameworkKind = serde_json::from_str(&raw).map_err(|e| {
            StartupFailure::configuration(format!("invalid {}: {e}", path.display()))
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            framework,
        })
    }
}
