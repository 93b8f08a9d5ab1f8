//! Wakes a display device, takes exclusive control of it and carries the
//! call signaling between the initiating context and the device.

pub mod call;
pub mod config;
pub mod device;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod mock;
pub mod ownership;
pub mod protocol;
pub mod relay;
pub mod responder;
pub mod supervisor;
pub mod telemetry;
pub mod wake;

pub use call::{
    CallAttempt, CallOrchestrator, CallState, CallStatus, MediaNegotiator, NegotiationError,
    OrchestratorDeps,
};
pub use config::OrchestratorConfig;
pub use device::DeviceCapabilities;
pub use error::{CallError, CallFailure, FailureKind, RelayError};
pub use ids::{CallId, ContextId, DeviceId, ParticipantId};
pub use ownership::{OwnershipArbiter, OwnershipClaim, Revocation};
pub use relay::{RelayHub, SessionEvent, SignalRelay};
pub use responder::{CallResponder, ResponderHandle, ResponderOutcome};
pub use supervisor::ReconnectSupervisor;
pub use wake::{WakePlan, WakeResult, WakeSequencer};
