//! Worker lifecycle state machine.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// State of a worker handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Spawned, waiting for the handshake.
    Starting,
    /// Handshake succeeded; accepting requests.
    Ready,
    /// `stop` in progress.
    Stopping,
    /// Stopped on request.
    Stopped,
    /// Failed to start, or crashed while ready.
    Failed,
}

impl LifecycleState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        use LifecycleState::*;

        matches!(
            (self, target),
            (Starting, Ready) | (Starting, Failed) |
            (Ready, Stopping) | (Ready, Failed) |
            (Stopping, Stopped)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug)]
struct History {
    transitions: Vec<StateTransition>,
}

/// Shared, observable lifecycle of one worker.
///
/// Written by the handle and by its crash monitor; every change is
/// published on a `watch` channel.
#[derive(Debug)]
pub struct Lifecycle {
    history: Mutex<History>,
    tx: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Starting);
        Self {
            history: Mutex::new(History {
                transitions: Vec::new(),
            }),
            tx,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Move to `target` if the current state allows it. Returns the state
    /// that blocked the transition otherwise.
    pub fn transition_to(
        &self,
        target: LifecycleState,
        reason: Option<String>,
    ) -> Result<(), LifecycleState> {
        let mut history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Check and publish under the history lock so concurrent writers
        // cannot both pass the check.
        let mut result = Ok(());
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(target) {
                history.transitions.push(StateTransition {
                    from: *current,
                    to: target,
                    timestamp: Utc::now(),
                    reason,
                });
                *current = target;
                true
            } else {
                result = Err(*current);
                false
            }
        });
        result
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        match self.history.lock() {
            Ok(h) => h.transitions.clone(),
            Err(poisoned) => poisoned.into_inner().transitions.clone(),
        }
    }

    /// The reason attached to the transition into `Failed`, if any.
    pub fn failure_reason(&self) -> Option<String> {
        self.transitions()
            .into_iter()
            .rev()
            .find(|t| t.to == LifecycleState::Failed)
            .and_then(|t| t.reason)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        use LifecycleState::*;
        assert!(Starting.can_transition_to(Ready));
        assert!(Starting.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Stopping));
        assert!(Ready.can_transition_to(Failed));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn state_transitions_invalid() {
        use LifecycleState::*;
        assert!(!Ready.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Ready));
        assert!(!Stopping.can_transition_to(Failed));
        assert!(!Stopped.can_transition_to(Ready));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Failed.can_transition_to(Stopped));
        assert!(!Starting.can_transition_to(Stopping));
    }

    #[test]
    fn terminal_states() {
        assert!(LifecycleState::Stopped.is_terminal());
        assert!(LifecycleState::Failed.is_terminal());
        assert!(!LifecycleState::Ready.is_terminal());
        assert!(!LifecycleState::Stopping.is_terminal());
    }

    #[test]
    fn lifecycle_records_history_and_publishes() {
        let lifecycle = Lifecycle::new();
        let rx = lifecycle.subscribe();
        assert_eq!(lifecycle.state(), LifecycleState::Starting);

        lifecycle.transition_to(LifecycleState::Ready, None).unwrap();
        lifecycle
            .transition_to(LifecycleState::Failed, Some("worker exited".to_string()))
            .unwrap();

        assert_eq!(*rx.borrow(), LifecycleState::Failed);
        assert_eq!(lifecycle.transitions().len(), 2);
        assert_eq!(lifecycle.failure_reason().as_deref(), Some("worker exited"));
    }

    #[test]
    fn rejected_transition_reports_current_state() {
        let lifecycle = Lifecycle::new();
        lifecycle.transition_to(LifecycleState::Failed, None).unwrap();
        assert_eq!(
            lifecycle.transition_to(LifecycleState::Ready, None),
            Err(LifecycleState::Failed)
        );
        assert_eq!(lifecycle.transitions().len(), 1);
    }

    #[test]
    fn display_and_serde() {
        assert_eq!(LifecycleState::Stopping.to_string(), "stopping");
        let json = serde_json::to_string(&LifecycleState::Ready).unwrap();
        assert_eq!(json, "\"ready\"");
    }
}
