//! Signal-based termination and liveness checks for worker processes.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;

/// Whether `pid` names a live (or not yet reaped) process.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(raw), None).is_ok()
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Send SIGTERM. A process that is already gone is not an error.
#[cfg(unix)]
fn request_exit(pid: u32) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(std::io::Error::other)?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(std::io::Error::from(errno)),
    }
}

/// Wait up to `grace` for the child to exit on its own.
pub async fn wait_exit(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Waiting for worker failed");
            None
        }
        Err(_) => None,
    }
}

#[cfg(unix)]
async fn sigterm_and_wait(child: &mut Child, term_grace: Duration) -> Option<ExitStatus> {
    let pid = child.id()?;
    if let Err(e) = request_exit(pid) {
        tracing::warn!(pid, error = %e, "SIGTERM failed");
        return None;
    }
    match wait_exit(child, term_grace).await {
        Some(status) => {
            tracing::debug!(pid, %status, "Worker exited after SIGTERM");
            Some(status)
        }
        None => {
            tracing::warn!(pid, "Worker ignored SIGTERM, sending SIGKILL");
            None
        }
    }
}

#[cfg(not(unix))]
async fn sigterm_and_wait(_child: &mut Child, _term_grace: Duration) -> Option<ExitStatus> {
    None
}

/// Force the child down: SIGTERM, then SIGKILL once `term_grace` runs out.
/// Always reaps, so no zombie is left behind.
pub async fn terminate(child: &mut Child, term_grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    if let Some(status) = sigterm_and_wait(child, term_grace).await {
        return Some(status);
    }

    // `kill` sends SIGKILL and waits, which reaps.
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Killing worker failed");
    }
    child.try_wait().ok().flatten()
}
