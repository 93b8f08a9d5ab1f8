use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::ids::CallId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("negotiation failed: {0}")]
    Failed(String),
}

/// Media-session hooks. Payloads are opaque to the orchestrator and relay;
/// only the negotiator interprets them.
#[async_trait]
pub trait MediaNegotiator: Send + Sync {
    async fn create_offer(&self, call_id: &CallId) -> Result<Value, NegotiationError>;

    async fn accept_answer(&self, call_id: &CallId, answer: &Value) -> Result<(), NegotiationError>;

    async fn create_answer(&self, call_id: &CallId, offer: &Value) -> Result<Value, NegotiationError>;

    async fn add_remote_candidate(
        &self,
        call_id: &CallId,
        candidate: &Value,
    ) -> Result<(), NegotiationError>;

    /// Tear down whatever media state exists for `call_id`.
    async fn close(&self, _call_id: &CallId) {}
}
