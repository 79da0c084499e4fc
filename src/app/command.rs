//! Per-request command application.
//!
//! Each request runs `program` in the app root with:
//! - the request serialized as JSON on stdin
//! - a `Response` expected as JSON on stdout
//! - a per-request timeout, after which the process is killed

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Dispatch, Request, Response};
use crate::error::{DispatchError, StartupFailure};

/// Stderr kept in a dispatch error message.
const MAX_STDERR_IN_ERROR: usize = 2 * 1024;

#[derive(Debug, Clone)]
pub struct CommandApp {
    root: PathBuf,
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandApp {
    /// Resolve `program` against `root` and check that it can be executed.
    pub fn load(
        root: &Path,
        program: &Path,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, StartupFailure> {
        let resolved = if program.is_absolute() {
            program.to_path_buf()
        } else {
            root.join(program)
        };

        let metadata = std::fs::metadata(&resolved).map_err(|e| {
            StartupFailure::load(format!("program {}: {e}", resolved.display()))
        })?;
        if !metadata.is_file() {
            return Err(StartupFailure::load(format!(
                "program {} is not a regular file",
                resolved.display()
            )));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(StartupFailure::load(format!(
                    "program {} is not executable",
                    resolved.display()
                )));
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            program: resolved,
            args,
            timeout,
        })
    }

    async fn run(&self, input: Vec<u8>) -> Result<std::process::Output, DispatchError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DispatchError::new("spawn", format!("{}: {e}", self.program.display())))?;

        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            // A handler that exits without reading its input is not an error.
            match stdin.write_all(&input).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };

        // Input is fed while output is drained, and the timeout covers both.
        let exchange = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed?;
            output
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DispatchError::io(&e)),
            // The child was moved into the timed-out future; kill_on_drop reaps it.
            Err(_) => Err(DispatchError::new(
                "timeout",
                format!("handler exceeded {:?}", self.timeout),
            )),
        }
    }
}

#[async_trait]
impl Dispatch for CommandApp {
    async fn dispatch(&self, request: Request) -> Result<Response, DispatchError> {
        let input = serde_json::to_vec(&request)
            .map_err(|e| DispatchError::new("encode", e.to_string()))?;

        let output = self.run(input).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let tail = match stderr.char_indices().nth_back(MAX_STDERR_IN_ERROR) {
                Some((i, _)) => &stderr[i..],
                None => stderr,
            };
            return Err(DispatchError::new(
                "command_failed",
                format!("handler exited with {}: {tail}", output.status),
            ));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| DispatchError::new("invalid_response", e.to_string()))
    }
}
