//! Handle to a running worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::process;
use super::spec::WorkerSpec;
use super::state::{Lifecycle, LifecycleState, StateTransition};
use crate::error::{ChannelError, StartupErrorKind};
use crate::handshake::{HandshakeMessage, HandshakeReader, HandshakeWriter};

/// A worker that completed its handshake.
///
/// Owned by the caller of `Loader::start`. Dropping the handle kills the
/// process; `stop` shuts it down gracefully first.
pub struct WorkerHandle {
    pid: u32,
    listen_address: String,
    spec: WorkerSpec,
    child: Child,
    writer: Option<HandshakeWriter<ChildStdin>>,
    lifecycle: Arc<Lifecycle>,
    monitor: Option<JoinHandle<()>>,
    shutdown_grace: Duration,
    term_grace: Duration,
}

impl WorkerHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pid: u32,
        listen_address: String,
        spec: WorkerSpec,
        child: Child,
        reader: HandshakeReader<ChildStdout>,
        writer: HandshakeWriter<ChildStdin>,
        shutdown_grace: Duration,
        term_grace: Duration,
    ) -> Self {
        let lifecycle = Arc::new(Lifecycle::new());
        if let Err(state) = lifecycle.transition_to(LifecycleState::Ready, None) {
            tracing::warn!(pid, %state, "Fresh lifecycle refused Ready");
        }
        let monitor = tokio::spawn(monitor(reader, Arc::clone(&lifecycle), pid));

        Self {
            pid,
            listen_address,
            spec,
            child,
            writer: Some(writer),
            lifecycle,
            monitor: Some(monitor),
            shutdown_grace,
            term_grace,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Address the worker accepts requests on, as reported in `Ready`.
    pub fn listen_address(&self) -> &str {
        &self.listen_address
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        self.lifecycle.transitions()
    }

    /// Why the worker was marked `Failed`, if it was.
    pub fn failure_reason(&self) -> Option<String> {
        self.lifecycle.failure_reason()
    }

    /// Resolve once the worker is marked `Failed`, with the reason.
    /// Returns `None` if it reaches `Stopped` instead.
    pub async fn wait_failed(&self) -> Option<String> {
        let mut rx = self.lifecycle.subscribe();
        let state = *rx.wait_for(|s| s.is_terminal()).await.ok()?;
        match state {
            LifecycleState::Failed => Some(self.failure_reason().unwrap_or_default()),
            _ => None,
        }
    }

    /// Shut the worker down. Idempotent.
    ///
    /// Sends `Shutdown`, closes the channel, waits up to the shutdown grace
    /// for a voluntary exit and then terminates by signal. The handle ends
    /// up `Stopped`, or stays `Failed` if the worker had already crashed;
    /// either way the process has been reaped.
    pub async fn stop(&mut self) {
        let state = match self
            .lifecycle
            .transition_to(LifecycleState::Stopping, Some("stop requested".to_string()))
        {
            Ok(()) => LifecycleState::Stopping,
            Err(current) => current,
        };

        match state {
            LifecycleState::Stopped => return,
            LifecycleState::Failed => {
                self.writer = None;
                self.abort_monitor();
                process::terminate(&mut self.child, self.term_grace).await;
                return;
            }
            _ => {}
        }

        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer
                .send(&HandshakeMessage::shutdown("stop requested"))
                .await
            {
                tracing::debug!(pid = self.pid, error = %e, "Could not send shutdown");
            }
            let _ = writer.close().await;
        }

        let status = match process::wait_exit(&mut self.child, self.shutdown_grace).await {
            Some(status) => Some(status),
            None => {
                tracing::warn!(
                    pid = self.pid,
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "Worker did not exit within grace, terminating"
                );
                process::terminate(&mut self.child, self.term_grace).await
            }
        };

        self.abort_monitor();
        if let Err(state) = self.lifecycle.transition_to(LifecycleState::Stopped, None) {
            tracing::warn!(pid = self.pid, %state, "Unexpected state after stop");
        }
        tracing::info!(pid = self.pid, status = ?status, "Worker stopped");
    }

    fn abort_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("listen_address", &self.listen_address)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.abort_monitor();
    }
}

/// Watch the channel after `Ready`. The worker never writes again unless it
/// misbehaves, so end of stream while `Ready` means it died.
async fn monitor(
    mut reader: HandshakeReader<ChildStdout>,
    lifecycle: Arc<Lifecycle>,
    pid: u32,
) {
    loop {
        match reader.next().await {
            Ok(message) => {
                tracing::warn!(
                    pid,
                    message = message.type_name(),
                    "Ignoring handshake message after ready"
                );
            }
            Err(ChannelError::Malformed(e)) => {
                tracing::warn!(pid, error = %e, "Ignoring malformed frame after ready");
            }
            Err(e) => {
                let reason = format!("{}: {e}", StartupErrorKind::ChannelClosed);
                match lifecycle.transition_to(LifecycleState::Failed, Some(reason)) {
                    Ok(()) => tracing::error!(pid, "Worker channel closed while ready"),
                    Err(state) => tracing::debug!(pid, %state, "Worker channel closed"),
                }
                return;
            }
        }
    }
}
