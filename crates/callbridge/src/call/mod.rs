mod negotiator;
mod orchestrator;

pub use negotiator::{MediaNegotiator, NegotiationError};
pub use orchestrator::{CallOrchestrator, OrchestratorDeps};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CallFailure;
use crate::ids::{CallId, ContextId, DeviceId};
use crate::wake::WakeResult;

/// Lifecycle of one call attempt. `Failed` and `Ended` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Waking,
    AwaitingPeerReady,
    Signaling,
    Connected,
    Ending,
    Failed,
    Ended,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Failed | CallState::Ended)
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Idle, Waking)
            | (Waking, AwaitingPeerReady)
            | (AwaitingPeerReady, Signaling)
            | (Signaling, Connected)
            | (Connected, Ending)
            | (Ending, Ended) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Waking => "waking",
            CallState::AwaitingPeerReady => "awaiting_peer_ready",
            CallState::Signaling => "signaling",
            CallState::Connected => "connected",
            CallState::Ending => "ending",
            CallState::Failed => "failed",
            CallState::Ended => "ended",
        }
    }
}

/// Snapshot of one call attempt, as reported by `CallOrchestrator::status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallAttempt {
    pub id: CallId,
    pub initiator_context_id: ContextId,
    pub initiator_device_id: DeviceId,
    pub target_device_id: DeviceId,
    pub state: CallState,
    /// Present from the end of the wake phase until the attempt terminates.
    pub wake_result: Option<WakeResult>,
    pub failure: Option<CallFailure>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

pub type CallStatus = CallAttempt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn only_listed_transitions_are_allowed() {
        use CallState::*;
        let all = [
            Idle,
            Waking,
            AwaitingPeerReady,
            Signaling,
            Connected,
            Ending,
            Failed,
            Ended,
        ];
        let forward = [
            (Idle, Waking),
            (Waking, AwaitingPeerReady),
            (AwaitingPeerReady, Signaling),
            (Signaling, Connected),
            (Connected, Ending),
            (Ending, Ended),
        ];
        for from in all {
            for to in all {
                let expected = forward.contains(&(from, to)) || (to == Failed && !from.is_terminal());
                assert_eq!(from.can_transition_to(to), expected, "{from:?} -> {to:?}");
            }
        }
    }

    #[test_timeout::timeout]
    fn terminal_states_have_no_exits() {
        assert!(CallState::Failed.is_terminal());
        assert!(CallState::Ended.is_terminal());
        assert!(!CallState::Failed.can_transition_to(CallState::Failed));
        assert!(!CallState::Ended.can_transition_to(CallState::Waking));
        assert_eq!(
            serde_json::to_value(CallState::AwaitingPeerReady).unwrap(),
            "awaiting_peer_ready"
        );
    }
}
