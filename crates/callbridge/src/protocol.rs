use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CallId, ParticipantId};

/// Kinds of signaling payload exchanged between the two call participants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    /// Target side has joined and can accept an offer
    Ready,
    Heartbeat,
    End,
}

/// Wire envelope. The relay routes on `call_id` only and never looks inside
/// `payload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalMessage {
    pub call_id: CallId,
    /// Per-sender, per-call, starting at 1
    pub sequence: u64,
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

impl SignalMessage {
    pub fn new(call_id: CallId, sequence: u64, kind: SignalKind, payload: serde_json::Value) -> Self {
        Self {
            call_id,
            sequence,
            kind,
            payload,
            sent_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    /// The device that placed the call
    Initiator,
    /// The woken display device
    Target,
}

impl ParticipantRole {
    pub fn peer(self) -> Self {
        match self {
            ParticipantRole::Initiator => ParticipantRole::Target,
            ParticipantRole::Target => ParticipantRole::Initiator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantRole::Initiator => "initiator",
            ParticipantRole::Target => "target",
        }
    }
}

/// Messages sent from a participant to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Declare this connection as `role` for `call_id`
    Join {
        call_id: CallId,
        participant_id: ParticipantId,
        role: ParticipantRole,
    },
    Leave { call_id: CallId },
    /// Forward a signal to the other participant of `message.call_id`
    Signal { message: SignalMessage },
    /// Keepalive for the connection itself
    Ping,
}

impl ClientFrame {
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            ClientFrame::Join { call_id, .. } | ClientFrame::Leave { call_id } => Some(call_id),
            ClientFrame::Signal { message } => Some(&message.call_id),
            ClientFrame::Ping => None,
        }
    }
}

/// Messages sent from the relay to a participant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every connection. `relay_instance` changes when the
    /// relay process restarts and all routing state is lost.
    Welcome { relay_instance: String },
    Joined {
        call_id: CallId,
        role: ParticipantRole,
        peer_present: bool,
    },
    JoinRejected { call_id: CallId, reason: String },
    PeerJoined {
        call_id: CallId,
        role: ParticipantRole,
    },
    PeerLeft {
        call_id: CallId,
        role: ParticipantRole,
    },
    Signal {
        from: ParticipantRole,
        message: SignalMessage,
    },
    Pong,
    Error { message: String },
}

impl ServerFrame {
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            ServerFrame::Joined { call_id, .. }
            | ServerFrame::JoinRejected { call_id, .. }
            | ServerFrame::PeerJoined { call_id, .. }
            | ServerFrame::PeerLeft { call_id, .. } => Some(call_id),
            ServerFrame::Signal { message, .. } => Some(&message.call_id),
            ServerFrame::Welcome { .. } | ServerFrame::Pong | ServerFrame::Error { .. } => None,
        }
    }
}
