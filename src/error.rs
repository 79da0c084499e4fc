//! Error types for the worker loader.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type for the loader and the bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Startup failed: {0}")]
    Startup(#[from] StartupFailure),

    #[error("Handshake channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of a failed worker startup.
///
/// The worker itself may only report `LoadError`, `BindError`,
/// `ConfigurationError` and `InternalError`; the remaining kinds are
/// assigned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum StartupErrorKind {
    SpawnError,
    StartupTimeout,
    LoadError,
    BindError,
    ConfigurationError,
    InternalError,
    ChannelClosed,
}

impl StartupErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnError => "SpawnError",
            Self::StartupTimeout => "StartupTimeout",
            Self::LoadError => "LoadError",
            Self::BindError => "BindError",
            Self::ConfigurationError => "ConfigurationError",
            Self::InternalError => "InternalError",
            Self::ChannelClosed => "ChannelClosed",
        }
    }
}

impl std::fmt::Display for StartupErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Kinds reported by a newer worker that this supervisor does not know
// collapse to InternalError instead of failing the whole frame.
impl From<String> for StartupErrorKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "SpawnError" => Self::SpawnError,
            "StartupTimeout" => Self::StartupTimeout,
            "LoadError" => Self::LoadError,
            "BindError" => Self::BindError,
            "ConfigurationError" => Self::ConfigurationError,
            "ChannelClosed" => Self::ChannelClosed,
            _ => Self::InternalError,
        }
    }
}

impl From<StartupErrorKind> for &'static str {
    fn from(kind: StartupErrorKind) -> Self {
        kind.as_str()
    }
}

/// A structured startup failure. Returned from `Loader::start` as a single
/// value; there is never a partially started worker.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StartupFailure {
    pub kind: StartupErrorKind,
    pub message: String,
    /// Best-effort backtrace reported by the worker.
    pub backtrace: Option<String>,
    /// Tail of the worker's stderr, captured for diagnostics.
    pub stderr: Option<String>,
    /// Pid of the spawned process, if one was created.
    pub pid: Option<u32>,
}

impl StartupFailure {
    pub fn new(kind: StartupErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            backtrace: None,
            stderr: None,
            pid: None,
        }
    }

    pub fn load(message: impl Into<String>) -> Self {
        Self::new(StartupErrorKind::LoadError, message)
    }

    pub fn bind(message: impl Into<String>) -> Self {
        Self::new(StartupErrorKind::BindError, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(StartupErrorKind::ConfigurationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StartupErrorKind::InternalError, message)
    }

    pub fn with_backtrace(mut self, backtrace: Option<String>) -> Self {
        self.backtrace = backtrace;
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_stderr(mut self, stderr: String) -> Self {
        if !stderr.trim().is_empty() {
            self.stderr = Some(stderr);
        }
        self
    }
}

/// Handshake channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Handshake channel closed by peer")]
    Closed,

    #[error("No handshake message within {0:?}")]
    Timeout(Duration),

    #[error("Handshake channel expired after an earlier timeout")]
    Expired,

    #[error("Malformed handshake frame: {0}")]
    Malformed(String),

    #[error("Handshake frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-request dispatch failure. Never fatal to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DispatchError {
    /// Short machine-readable classification, copied into the analytics record.
    pub kind: String,
    pub message: String,
}

impl DispatchError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn io(err: &std::io::Error) -> Self {
        Self::new("io", err.to_string())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the loader.
pub type Result<T> = std::result::Result<T, Error>;
