//! Configuration types.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::analytics::RequestIdPolicy;
use crate::error::ConfigError;

/// Environment variable carrying the JSON-serialized startup options into
/// the worker process.
pub const OPTIONS_ENV: &str = "WORKER_LOADER_OPTIONS";

/// Options consumed by `Loader::start`.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Maximum time to wait for the single handshake message.
    pub startup_timeout: Duration,
    /// Environment overrides applied on top of `WorkerSpec`'s environment.
    pub env: BTreeMap<String, String>,
    /// Additionally probe the listen address before declaring success.
    pub ready_check: bool,
    /// How long `stop` (and startup-failure cleanup) waits for a voluntary exit.
    pub shutdown_grace: Duration,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(5),
            env: BTreeMap::new(),
            ready_check: false,
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl StartOptions {
    /// Build options from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let startup_timeout = std::env::var("WORKER_LOADER_STARTUP_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.startup_timeout);

        let shutdown_grace = std::env::var("WORKER_LOADER_SHUTDOWN_GRACE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_grace);

        let ready_check = std::env::var("WORKER_LOADER_READY_CHECK")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(defaults.ready_check);

        Self {
            startup_timeout,
            env: BTreeMap::new(),
            ready_check,
            shutdown_grace,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_ready_check(mut self, ready_check: bool) -> Self {
        self.ready_check = ready_check;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Supervisor-side tuning that is not part of a single start request.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Time between SIGTERM and SIGKILL during forced termination.
    pub term_grace: Duration,
    /// Bytes of worker stderr retained for failure diagnostics.
    pub stderr_tail_bytes: usize,
    /// Largest handshake frame accepted from a worker.
    pub max_handshake_frame: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            term_grace: Duration::from_millis(500),
            stderr_tail_bytes: 8 * 1024,
            max_handshake_frame: 64 * 1024,
        }
    }
}

/// Startup options as seen from inside the worker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Address the request listener binds to.
    pub listen: SocketAddr,
    /// JSON-lines analytics file. When unset records go to `tracing`.
    pub analytics_log: Option<PathBuf>,
    /// Records buffered toward the sink before new ones are dropped.
    pub analytics_buffer: usize,
    pub request_id_policy: RequestIdPolicy,
    /// Largest request frame accepted on a connection.
    pub max_request_bytes: usize,
    /// How long in-flight connections may finish after shutdown is requested.
    pub drain_timeout_ms: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            analytics_log: None,
            analytics_buffer: 1024,
            request_id_policy: RequestIdPolicy::default(),
            max_request_bytes: 1024 * 1024,
            drain_timeout_ms: 2_000,
        }
    }
}

impl BootstrapConfig {
    /// Parse the serialized startup options. Unknown keys are ignored.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| ConfigError::ParseError(format!("{OPTIONS_ENV}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read the startup options handed over by the supervisor. An absent
    /// variable means all defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(OPTIONS_ENV) {
            Ok(raw) if !raw.trim().is_empty() => Self::from_json(&raw),
            _ => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.analytics_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "analytics_buffer".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_request_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_request_bytes".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
