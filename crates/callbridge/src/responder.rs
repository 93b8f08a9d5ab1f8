//! Target-side participant. Runs on the display device once the kiosk has
//! loaded the call page: joins the call, announces `ready`, answers the
//! offer and keeps candidates flowing until someone hangs up.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::call::MediaNegotiator;
use crate::error::RelayError;
use crate::ids::CallId;
use crate::protocol::{ParticipantRole, SignalKind};
use crate::relay::{PeerLossReason, SessionEvent, SessionHandle, SignalRelay};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderOutcome {
    Ended { by_peer: bool },
    PeerLost(PeerLossReason),
    Rejected(String),
    Failed(String),
}

pub struct CallResponder {
    relay: SignalRelay,
    negotiator: Arc<dyn MediaNegotiator>,
    session: SessionHandle,
    offer_timeout: Duration,
    hangup: mpsc::UnboundedReceiver<()>,
}

/// Control for a spawned responder.
pub struct ResponderHandle {
    call_id: CallId,
    hangup: mpsc::UnboundedSender<()>,
    task: JoinHandle<ResponderOutcome>,
}

impl ResponderHandle {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn hang_up(&self) {
        let _ = self.hangup.send(());
    }

    pub async fn outcome(self) -> ResponderOutcome {
        self.task
            .await
            .unwrap_or_else(|err| ResponderOutcome::Failed(format!("responder task failed: {err}")))
    }
}

impl CallResponder {
    /// Opens the target session for `call_id` and announces readiness.
    pub fn join(
        relay: SignalRelay,
        negotiator: Arc<dyn MediaNegotiator>,
        call_id: CallId,
        offer_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedSender<()>), RelayError> {
        let session = relay.open_session(call_id, ParticipantRole::Target)?;
        relay.send(&session, SignalKind::Ready, Value::Null)?;
        let (hangup_tx, hangup) = mpsc::unbounded_channel();
        Ok((
            Self {
                relay,
                negotiator,
                session,
                offer_timeout,
                hangup,
            },
            hangup_tx,
        ))
    }

    pub fn spawn(
        relay: SignalRelay,
        negotiator: Arc<dyn MediaNegotiator>,
        call_id: CallId,
        offer_timeout: Duration,
    ) -> Result<ResponderHandle, RelayError> {
        let (responder, hangup) = Self::join(relay, negotiator, call_id.clone(), offer_timeout)?;
        Ok(ResponderHandle {
            call_id,
            hangup,
            task: tokio::spawn(responder.run()),
        })
    }

    pub async fn run(mut self) -> ResponderOutcome {
        let outcome = self.exchange().await;
        info!(
            target = "callbridge::responder",
            call_id = %self.session.call_id(),
            outcome = ?outcome,
            "responder finished"
        );
        let call_id = self.session.call_id().clone();
        self.negotiator.close(&call_id).await;
        self.relay.close(self.session);
        outcome
    }

    fn resend_ready(&self) {
        if let Err(err) = self.relay.send(&self.session, SignalKind::Ready, Value::Null) {
            debug!(target = "callbridge::responder", error = %err, "ready not resent");
        }
    }

    async fn exchange(&mut self) -> ResponderOutcome {
        let call_id = self.session.call_id().clone();
        let offer_deadline = Instant::now() + self.offer_timeout;
        let mut answered = false;

        loop {
            tokio::select! {
                biased;
                _ = self.hangup.recv() => {
                    let _ = self.relay.send(&self.session, SignalKind::End, Value::Null);
                    return ResponderOutcome::Ended { by_peer: false };
                }
                _ = tokio::time::sleep_until(offer_deadline), if !answered => {
                    return ResponderOutcome::Failed("no offer before timeout".into());
                }
                event = self.session.next_event() => match event {
                    Some(SessionEvent::Message { message, .. }) => match message.kind {
                        SignalKind::Offer if !answered => {
                            let answer = match self.negotiator.create_answer(&call_id, &message.payload).await {
                                Ok(answer) => answer,
                                Err(err) => {
                                    let _ = self.relay.send(&self.session, SignalKind::End, Value::Null);
                                    return ResponderOutcome::Failed(err.to_string());
                                }
                            };
                            if let Err(err) = self.relay.send(&self.session, SignalKind::Answer, answer) {
                                return ResponderOutcome::Failed(err.to_string());
                            }
                            answered = true;
                            debug!(target = "callbridge::responder", call_id = %call_id, "offer answered");
                        }
                        SignalKind::IceCandidate => {
                            if let Err(err) = self.negotiator.add_remote_candidate(&call_id, &message.payload).await {
                                warn!(target = "callbridge::responder", error = %err, "remote candidate rejected");
                            }
                        }
                        SignalKind::End => return ResponderOutcome::Ended { by_peer: true },
                        _ => {}
                    },
                    Some(SessionEvent::PeerJoined) | Some(SessionEvent::RelayRestored) if !answered => {
                        self.resend_ready();
                    }
                    Some(SessionEvent::PeerLost { reason }) if answered => {
                        return ResponderOutcome::PeerLost(reason);
                    }
                    Some(SessionEvent::Rejected { reason }) => return ResponderOutcome::Rejected(reason),
                    Some(_) => {}
                    None => return ResponderOutcome::Failed("relay session closed".into()),
                },
            }
        }
    }
}
