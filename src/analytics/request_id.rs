//! Request-id assignment across retried dispatches.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a dispatch attempt obtains its request id.
///
/// Retrying is the caller's business; this only decides whether the
/// caller's id survives into the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestIdPolicy {
    /// Every attempt gets a fresh id; a caller-supplied id is ignored.
    #[default]
    PerAttempt,
    /// Attempts reuse the caller-supplied id and are told apart by their
    /// `attempt` number. A fresh id is minted when none is supplied.
    SharedAcrossRetries,
}

impl RequestIdPolicy {
    pub fn resolve(&self, supplied: Option<Uuid>) -> Uuid {
        match self {
            Self::PerAttempt => Uuid::new_v4(),
            Self::SharedAcrossRetries => supplied.unwrap_or_else(Uuid::new_v4),
        }
    }
}
