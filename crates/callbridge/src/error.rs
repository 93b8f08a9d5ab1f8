use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::call::CallState;
use crate::ids::{CallId, ContextId, DeviceId};
use crate::ownership::OwnershipDenied;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("relay send buffer is full ({limit} frames queued)")]
    BufferFull { limit: usize },
    #[error("a session for call {0} is already open")]
    SessionExists(CallId),
    #[error("session for call {0} is closed")]
    SessionClosed(CallId),
    #[error("relay client is closed")]
    Closed,
}

/// Why an attempt ended in `Failed`. Lets callers tell a dark screen from a
/// hung-up peer from a retry storm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    WakeVerificationFailed,
    OwnershipSuperseded,
    PeerUnreachable,
    /// Only ever returned synchronously from `invoke`; never stored.
    RetryTooSoon,
    RelayUnavailable,
    DeviceCooldown,
    NegotiationFailed,
    /// Hung up before the call connected.
    Abandoned,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::WakeVerificationFailed => "wake_verification_failed",
            FailureKind::OwnershipSuperseded => "ownership_superseded",
            FailureKind::PeerUnreachable => "peer_unreachable",
            FailureKind::RetryTooSoon => "retry_too_soon",
            FailureKind::RelayUnavailable => "relay_unavailable",
            FailureKind::DeviceCooldown => "device_cooldown",
            FailureKind::NegotiationFailed => "negotiation_failed",
            FailureKind::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallFailure {
    pub kind: FailureKind,
    /// State the attempt was in when it failed.
    pub phase: CallState,
    /// Wake stage that could not be verified, when relevant.
    pub stage: Option<String>,
    pub detail: String,
}

impl CallFailure {
    pub fn new(kind: FailureKind, phase: CallState, detail: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            stage: None,
            detail: detail.into(),
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("call to {target} retried too soon; try again in {retry_after:?}")]
    RetryTooSoon {
        target: DeviceId,
        retry_after: Duration,
    },
    #[error("context {context_id} already has call {call_id} in progress")]
    AttemptInProgress {
        context_id: ContextId,
        call_id: CallId,
    },
    #[error(transparent)]
    Ownership(#[from] OwnershipDenied),
    #[error("unknown call {0}")]
    UnknownCall(CallId),
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition { from: CallState, to: CallState },
    #[error("call {call_id} is {state:?}, not connected")]
    NotConnected { call_id: CallId, state: CallState },
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}
