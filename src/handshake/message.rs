//! Handshake wire messages.

use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, StartupErrorKind, StartupFailure};

/// A single handshake frame.
///
/// `Ready` or `StartupError` is sent exactly once per worker lifetime;
/// `Shutdown` at most once, supervisor to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    Ready {
        pid: u32,
        listen_address: String,
    },
    #[serde(rename = "error")]
    StartupError {
        kind: StartupErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backtrace: Option<String>,
    },
    Shutdown {
        #[serde(default)]
        reason: String,
    },
}

impl HandshakeMessage {
    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::Shutdown {
            reason: reason.into(),
        }
    }

    /// Short name of the frame type, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::StartupError { .. } => "error",
            Self::Shutdown { .. } => "shutdown",
        }
    }

    /// Serialize into a single newline-terminated frame.
    pub fn encode(&self) -> Result<Vec<u8>, ChannelError> {
        let mut frame =
            serde_json::to_vec(self).map_err(|e| ChannelError::Malformed(e.to_string()))?;
        frame.push(b'\n');
        Ok(frame)
    }

    /// Parse one frame (with or without its trailing newline).
    pub fn decode(frame: &[u8]) -> Result<Self, ChannelError> {
        serde_json::from_slice(frame.trim_ascii_end())
            .map_err(|e| ChannelError::Malformed(e.to_string()))
    }
}

impl From<&StartupFailure> for HandshakeMessage {
    fn from(failure: &StartupFailure) -> Self {
        Self::StartupError {
            kind: failure.kind,
            message: failure.message.clone(),
            backtrace: failure.backtrace.clone(),
        }
    }
}
