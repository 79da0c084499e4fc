//! Supervisor side: spawn a worker, drive the handshake, hand back a handle.
//!
//! `start` never returns a half-started worker. Every path that does not
//! end in `Ready` makes sure the process is gone before reporting the
//! failure.

mod handle;
pub mod process;
mod spec;
mod state;
mod stderr;

pub use handle::WorkerHandle;
pub use spec::WorkerSpec;
pub use state::{Lifecycle, LifecycleState, StateTransition};
pub use stderr::StderrTail;

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::{LoaderConfig, OPTIONS_ENV, StartOptions};
use crate::error::{ChannelError, StartupErrorKind, StartupFailure};
use crate::handshake::{HandshakeMessage, HandshakeReader, HandshakeWriter};

/// Time allowed for the stderr relay to catch the last lines of a worker
/// that has already exited.
const STDERR_DRAIN: Duration = Duration::from_millis(250);

/// Spawns and stops workers.
#[derive(Debug, Clone, Default)]
pub struct Loader {
    config: LoaderConfig,
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LoaderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Spawn the worker described by `spec` and wait for its handshake.
    ///
    /// The wait is bounded by `options.startup_timeout` on the monotonic
    /// clock, including the optional readiness probe.
    pub async fn start(
        &self,
        spec: &WorkerSpec,
        options: &StartOptions,
    ) -> Result<WorkerHandle, StartupFailure> {
        let started = Instant::now();
        let mut spawned = self.spawn(spec, options)?;
        let pid = spawned.pid;

        let (Some(stdin), Some(stdout)) = (spawned.child.stdin.take(), spawned.child.stdout.take())
        else {
            let failure = StartupFailure::internal("worker stdio pipes missing");
            return Err(spawned.abandon(Duration::ZERO, &self.config, |_| failure).await);
        };
        let mut reader = HandshakeReader::with_max_frame(stdout, self.config.max_handshake_frame);
        let writer = HandshakeWriter::new(stdin);

        let received = reader.receive(options.startup_timeout).await;
        match received {
            Ok(HandshakeMessage::Ready {
                pid: reported,
                listen_address,
            }) => {
                if reported != pid {
                    tracing::warn!(pid, reported, "Worker reported a different pid");
                }

                if options.ready_check {
                    let budget = options.startup_timeout.saturating_sub(started.elapsed());
                    if let Err(failure) = probe(&listen_address, budget).await {
                        drop(writer);
                        return Err(spawned.abandon(Duration::ZERO, &self.config, |_| failure).await);
                    }
                }

                tracing::info!(
                    pid,
                    listen = %listen_address,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Worker ready"
                );
                Ok(WorkerHandle::new(
                    pid,
                    listen_address,
                    spec.clone(),
                    spawned.child,
                    reader,
                    writer,
                    options.shutdown_grace,
                    self.config.term_grace,
                ))
            }
            Ok(HandshakeMessage::StartupError {
                kind,
                message,
                backtrace,
            }) => {
                drop(writer);
                let failure = StartupFailure::new(kind, message).with_backtrace(backtrace);
                Err(spawned
                    .abandon(options.shutdown_grace, &self.config, |_| failure)
                    .await)
            }
            Ok(HandshakeMessage::Shutdown { reason }) => {
                drop(writer);
                let failure = StartupFailure::internal(format!(
                    "worker sent shutdown during startup: {reason}"
                ));
                Err(spawned.abandon(Duration::ZERO, &self.config, |_| failure).await)
            }
            Err(ChannelError::Timeout(timeout)) => {
                drop(writer);
                let failure = StartupFailure::new(
                    StartupErrorKind::StartupTimeout,
                    format!("no handshake within {timeout:?}"),
                );
                Err(spawned.abandon(Duration::ZERO, &self.config, |_| failure).await)
            }
            Err(ChannelError::Closed) => {
                drop(writer);
                Err(spawned
                    .abandon(options.shutdown_grace, &self.config, |status| {
                        let message = match status {
                            Some(status) => format!("worker exited before handshake ({status})"),
                            None => "worker closed the handshake channel".to_string(),
                        };
                        StartupFailure::new(StartupErrorKind::ChannelClosed, message)
                    })
                    .await)
            }
            Err(e) => {
                drop(writer);
                let failure = StartupFailure::internal(format!("handshake failed: {e}"));
                Err(spawned.abandon(Duration::ZERO, &self.config, |_| failure).await)
            }
        }
    }

    /// Stop a worker. Same as `WorkerHandle::stop`.
    pub async fn stop(&self, handle: &mut WorkerHandle) {
        handle.stop().await;
    }

    fn spawn(&self, spec: &WorkerSpec, options: &StartOptions) -> Result<Spawned, StartupFailure> {
        let Some((program, args)) = spec.command().split_first() else {
            return Err(StartupFailure::new(
                StartupErrorKind::SpawnError,
                "worker command is empty",
            ));
        };

        let serialized = serde_json::to_string(spec.startup_options()).map_err(|e| {
            StartupFailure::configuration(format!("cannot serialize startup options: {e}"))
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(spec.working_directory())
            .envs(spec.env())
            .envs(&options.env)
            .env(OPTIONS_ENV, serialized)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            StartupFailure::new(
                StartupErrorKind::SpawnError,
                format!("cannot spawn {program}: {e}"),
            )
        })?;
        let Some(pid) = child.id() else {
            return Err(StartupFailure::new(
                StartupErrorKind::SpawnError,
                format!("{program} exited before it could be tracked"),
            ));
        };
        tracing::info!(pid, command = ?spec.command(), "Worker spawned");

        let tail = StderrTail::new(self.config.stderr_tail_bytes);
        let relay = child.stderr.take().map(|stderr| tail.relay(stderr, pid));

        Ok(Spawned {
            child,
            pid,
            tail,
            relay,
        })
    }
}

/// A process between spawn and handshake outcome.
struct Spawned {
    child: Child,
    pid: u32,
    tail: StderrTail,
    relay: Option<JoinHandle<()>>,
}

impl Spawned {
    /// Give the worker `grace` to exit by itself, terminate it otherwise, and
    /// attach pid and stderr tail to the failure built from its exit status.
    async fn abandon<F>(mut self, grace: Duration, config: &LoaderConfig, failure: F) -> StartupFailure
    where
        F: FnOnce(Option<ExitStatus>) -> StartupFailure,
    {
        let status = match process::wait_exit(&mut self.child, grace).await {
            Some(status) => Some(status),
            None => process::terminate(&mut self.child, config.term_grace).await,
        };
        if let Some(relay) = self.relay.take() {
            let _ = tokio::time::timeout(STDERR_DRAIN, relay).await;
        }

        let failure = failure(status)
            .with_pid(self.pid)
            .with_stderr(self.tail.snapshot());
        tracing::warn!(
            pid = self.pid,
            kind = %failure.kind,
            status = ?status,
            "Worker startup failed: {}",
            failure.message
        );
        failure
    }
}

/// Connect once to `address` within `budget`. A refused connection is a
/// `BindError`; running out of budget is a `StartupTimeout`.
async fn probe(address: &str, budget: Duration) -> Result<(), StartupFailure> {
    let timed_out = || {
        StartupFailure::new(
            StartupErrorKind::StartupTimeout,
            format!("listen address {address} not reachable within the startup timeout"),
        )
    };
    if budget.is_zero() {
        return Err(timed_out());
    }
    match tokio::time::timeout(budget, TcpStream::connect(address)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(StartupFailure::bind(format!(
            "listen address {address} refused the ready check: {e}"
        ))),
        Err(_) => Err(timed_out()),
    }
}
