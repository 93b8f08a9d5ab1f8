use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CallAttempt, CallState, CallStatus, MediaNegotiator};
use crate::config::CallConfig;
use crate::error::{CallError, CallFailure, FailureKind};
use crate::ids::{CallId, ContextId, DeviceId};
use crate::metrics;
use crate::ownership::{ClaimId, OwnershipArbiter, OwnershipClaim, OwnershipDenied, Revocation};
use crate::protocol::{ParticipantRole, SignalKind};
use crate::relay::{PeerLossReason, SessionEvent, SessionHandle, SignalRelay};
use crate::wake::{WakeError, WakePlan, WakeSequencer};

enum DriverCommand {
    End,
    Candidate(Value),
}

/// How an attempt's driver stopped.
enum Exit {
    Hangup,
    Failed(CallFailure),
    Revoked(Revocation, CallState),
    /// The attempt was already made terminal by someone else.
    Detached,
}

struct AttemptEntry {
    status: watch::Sender<CallAttempt>,
    claim: Option<OwnershipClaim>,
    commands: Option<mpsc::UnboundedSender<DriverCommand>>,
    task: Option<JoinHandle<()>>,
    cleaned: bool,
}

#[derive(Default)]
struct Book {
    attempts: HashMap<CallId, AttemptEntry>,
    /// The one non-terminal attempt this initiating device may have.
    active: Option<CallId>,
    finished: VecDeque<CallId>,
    /// Per target: when the last accepted invoke started.
    last_invoke: HashMap<DeviceId, Instant>,
    /// Per target: when an attempt last became terminal, superseded ones included.
    last_terminal: HashMap<DeviceId, Instant>,
}

/// Collaborators a `CallOrchestrator` drives.
pub struct OrchestratorDeps {
    pub arbiter: Arc<OwnershipArbiter>,
    pub sequencer: Arc<WakeSequencer>,
    pub relay: SignalRelay,
    pub negotiator: Arc<dyn MediaNegotiator>,
}

struct OrchestratorInner {
    device_id: DeviceId,
    config: CallConfig,
    plan: WakePlan,
    arbiter: Arc<OwnershipArbiter>,
    sequencer: Arc<WakeSequencer>,
    relay: SignalRelay,
    negotiator: Arc<dyn MediaNegotiator>,
    book: Mutex<Book>,
    shutting_down: AtomicBool,
}

/// Authoritative lifecycle of call attempts placed from one initiating device.
#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<OrchestratorInner>,
}

fn abandoned(phase: CallState) -> Exit {
    Exit::Failed(CallFailure::new(
        FailureKind::Abandoned,
        phase,
        "hung up before the call connected",
    ))
}

fn failed(kind: FailureKind, phase: CallState, detail: impl Into<String>) -> Exit {
    Exit::Failed(CallFailure::new(kind, phase, detail))
}

impl CallOrchestrator {
    pub fn new(device_id: DeviceId, config: CallConfig, plan: WakePlan, deps: OrchestratorDeps) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                device_id,
                config,
                plan,
                arbiter: deps.arbiter,
                sequencer: deps.sequencer,
                relay: deps.relay,
                negotiator: deps.negotiator,
                book: Mutex::new(Book::default()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    /// Starts a call from `context_id` to `target`.
    ///
    /// Admission runs under one lock. Every invoke must clear the retry
    /// cooldown since the last terminal transition for `target`. A different
    /// context with a live attempt is a takeover and supersedes it
    /// immediately; otherwise the cooldown also runs from the last accepted
    /// invoke, then the one-live-attempt rule applies.
    pub fn invoke(&self, context_id: &ContextId, target: &DeviceId) -> Result<CallId, CallError> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::SeqCst) {
            metrics::CALL_INVOKES.with_label_values(&["shutting_down"]).inc();
            return Err(CallError::ShuttingDown);
        }

        let mut book = inner.book.lock();
        let now = Instant::now();
        let live = book.active.as_ref().and_then(|id| {
            book.attempts
                .get(id)
                .map(|entry| (id.clone(), entry.status.borrow().initiator_context_id.clone()))
        });
        let takeover = live
            .as_ref()
            .is_some_and(|(_, holder)| holder != context_id);

        let window = inner.config.retry_cooldown();
        let terminal_anchor = book.last_terminal.get(target).copied();
        let anchor = if takeover {
            terminal_anchor
        } else {
            terminal_anchor.max(book.last_invoke.get(target).copied())
        };
        if let Some(anchor) = anchor {
            let elapsed = now.saturating_duration_since(anchor);
            if elapsed < window {
                metrics::CALL_INVOKES.with_label_values(&["retry_too_soon"]).inc();
                debug!(
                    target = "callbridge::call",
                    context = %context_id,
                    device = %target,
                    takeover,
                    retry_after_ms = (window - elapsed).as_millis() as u64,
                    "invoke rejected inside retry cooldown"
                );
                return Err(CallError::RetryTooSoon {
                    target: target.clone(),
                    retry_after: window - elapsed,
                });
            }
        }
        if !takeover {
            if let Some((call_id, _)) = live {
                metrics::CALL_INVOKES.with_label_values(&["in_progress"]).inc();
                return Err(CallError::AttemptInProgress {
                    context_id: context_id.clone(),
                    call_id,
                });
            }
        }

        let grant = inner.arbiter.claim(context_id, &inner.device_id).map_err(|err| {
            metrics::CALL_INVOKES.with_label_values(&["denied"]).inc();
            // A finished attempt still powering the target off keeps its claim.
            if let OwnershipDenied::AlreadyHeld { claim_id } = &err {
                let unwinding = book.attempts.iter().find(|(_, entry)| {
                    entry.claim.as_ref().is_some_and(|c| c.claim_id() == *claim_id)
                });
                if let Some((call_id, _)) = unwinding {
                    return CallError::AttemptInProgress {
                        context_id: context_id.clone(),
                        call_id: call_id.clone(),
                    };
                }
            }
            CallError::from(err)
        })?;
        if let Some(superseded) = &grant.superseded {
            inner.fail_superseded(&mut book, superseded.claim_id, grant.claim.claim_id());
        }

        let claim = grant.claim;
        let call_id = CallId::generate();
        let created_at = Utc::now();
        let (status, _) = watch::channel(CallAttempt {
            id: call_id.clone(),
            initiator_context_id: context_id.clone(),
            initiator_device_id: inner.device_id.clone(),
            target_device_id: target.clone(),
            state: CallState::Idle,
            wake_result: None,
            failure: None,
            created_at,
            last_transition_at: created_at,
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        book.attempts.insert(
            call_id.clone(),
            AttemptEntry {
                status,
                claim: Some(claim.clone()),
                commands: Some(commands_tx),
                task: None,
                cleaned: false,
            },
        );
        book.active = Some(call_id.clone());
        book.last_invoke.insert(target.clone(), now);
        inner.record_transition(&mut book, &call_id, CallState::Waking, None)?;

        let task = tokio::spawn(Arc::clone(inner).drive(
            call_id.clone(),
            target.clone(),
            claim,
            commands_rx,
        ));
        if let Some(entry) = book.attempts.get_mut(&call_id) {
            entry.task = Some(task);
        }
        metrics::CALL_INVOKES.with_label_values(&["accepted"]).inc();
        info!(
            target = "callbridge::call",
            call_id = %call_id,
            context = %context_id,
            device = %target,
            takeover,
            "call attempt started"
        );
        Ok(call_id)
    }

    /// Hangs up. Idempotent once the attempt is terminal.
    pub fn end_call(&self, call_id: &CallId) -> Result<(), CallError> {
        let book = self.inner.book.lock();
        let entry = book
            .attempts
            .get(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.clone()))?;
        if entry.status.borrow().state.is_terminal() {
            return Ok(());
        }
        if let Some(commands) = &entry.commands {
            let _ = commands.send(DriverCommand::End);
        }
        Ok(())
    }

    /// Forwards a local ICE candidate to the target.
    pub fn send_candidate(&self, call_id: &CallId, candidate: Value) -> Result<(), CallError> {
        let book = self.inner.book.lock();
        let entry = book
            .attempts
            .get(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.clone()))?;
        let state = entry.status.borrow().state;
        let not_connected = || CallError::NotConnected {
            call_id: call_id.clone(),
            state,
        };
        if !matches!(state, CallState::Signaling | CallState::Connected) {
            return Err(not_connected());
        }
        entry
            .commands
            .as_ref()
            .ok_or_else(not_connected)?
            .send(DriverCommand::Candidate(candidate))
            .map_err(|_| not_connected())
    }

    pub fn status(&self, call_id: &CallId) -> Option<CallStatus> {
        self.inner
            .book
            .lock()
            .attempts
            .get(call_id)
            .map(|entry| entry.status.borrow().clone())
    }

    pub fn watch(&self, call_id: &CallId) -> Option<watch::Receiver<CallStatus>> {
        self.inner
            .book
            .lock()
            .attempts
            .get(call_id)
            .map(|entry| entry.status.subscribe())
    }

    /// The live attempt started by `context_id`, if it still has one.
    pub fn active_call(&self, context_id: &ContextId) -> Option<CallId> {
        let book = self.inner.book.lock();
        let call_id = book.active.as_ref()?;
        let entry = book.attempts.get(call_id)?;
        let owns = entry.status.borrow().initiator_context_id == *context_id;
        owns.then(|| call_id.clone())
    }

    /// Refuses new calls, abandons the live one and stops the relay link.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let (claims, tasks): (Vec<OwnershipClaim>, Vec<JoinHandle<()>>) = {
            let mut book = inner.book.lock();
            let mut claims = Vec::new();
            let mut tasks = Vec::new();
            for entry in book.attempts.values_mut() {
                if let Some(claim) = &entry.claim {
                    claims.push(claim.clone());
                }
                if let Some(task) = entry.task.take() {
                    tasks.push(task);
                }
            }
            (claims, tasks)
        };
        for claim in &claims {
            inner.arbiter.release(claim);
        }
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(inner.config.cancel_grace(), join_all(tasks))
            .await
            .is_err()
        {
            warn!(target = "callbridge::call", "call drivers did not stop in time; aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        inner.relay.shutdown().await;
        info!(target = "callbridge::call", device = %inner.device_id, "orchestrator stopped");
    }
}

impl OrchestratorInner {
    fn transition(
        &self,
        call_id: &CallId,
        to: CallState,
        failure: Option<CallFailure>,
    ) -> Result<CallState, CallError> {
        let mut book = self.book.lock();
        self.record_transition(&mut book, call_id, to, failure)
    }

    fn record_transition(
        &self,
        book: &mut Book,
        call_id: &CallId,
        to: CallState,
        failure: Option<CallFailure>,
    ) -> Result<CallState, CallError> {
        let entry = book
            .attempts
            .get(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.clone()))?;
        let (from, target) = {
            let current = entry.status.borrow();
            (current.state, current.target_device_id.clone())
        };
        if !from.can_transition_to(to) {
            return Err(CallError::InvalidTransition { from, to });
        }
        entry.status.send_modify(|attempt| {
            attempt.state = to;
            attempt.last_transition_at = Utc::now();
            if failure.is_some() {
                attempt.failure = failure.clone();
            }
            if to.is_terminal() {
                attempt.wake_result = None;
            }
        });

        match &failure {
            Some(failure) => warn!(
                target = "callbridge::call",
                call_id = %call_id,
                from = from.as_str(),
                kind = failure.kind.as_str(),
                stage = failure.stage.as_deref().unwrap_or(""),
                detail = %failure.detail,
                "call attempt failed"
            ),
            None => info!(
                target = "callbridge::call",
                call_id = %call_id,
                from = from.as_str(),
                to = to.as_str(),
                "call state changed"
            ),
        }

        if to.is_terminal() {
            if book.active.as_ref() == Some(call_id) {
                book.active = None;
            }
            let outcome = failure.as_ref().map(|f| f.kind.as_str()).unwrap_or("ended");
            metrics::CALL_TERMINAL.with_label_values(&[outcome]).inc();
            book.last_terminal.insert(target, Instant::now());
            book.finished.push_back(call_id.clone());
            self.prune(book);
        }
        Ok(from)
    }

    fn prune(&self, book: &mut Book) {
        while book.finished.len() > self.config.history_limit {
            let Some(oldest) = book.finished.front() else {
                break;
            };
            if !book.attempts.get(oldest).map_or(true, |entry| entry.cleaned) {
                break;
            }
            if let Some(oldest) = book.finished.pop_front() {
                book.attempts.remove(&oldest);
            }
        }
    }

    /// Fails the attempt holding `old` right away; its driver gets
    /// `cancel_grace` to notice before it is aborted.
    fn fail_superseded(self: &Arc<Self>, book: &mut Book, old: ClaimId, by: ClaimId) {
        let Some(call_id) = book
            .attempts
            .iter()
            .find(|(_, entry)| entry.claim.as_ref().is_some_and(|c| c.claim_id() == old))
            .map(|(id, _)| id.clone())
        else {
            return;
        };
        let Some(phase) = book
            .attempts
            .get(&call_id)
            .map(|entry| entry.status.borrow().state)
        else {
            return;
        };
        let failure = CallFailure::new(
            FailureKind::OwnershipSuperseded,
            phase,
            format!("control taken over by claim {by}"),
        );
        if self
            .record_transition(book, &call_id, CallState::Failed, Some(failure))
            .is_err()
        {
            return;
        }
        let task = book.attempts.get_mut(&call_id).and_then(|entry| {
            entry.claim = None;
            entry.commands = None;
            entry.task.take()
        });
        self.relay.close_call(&call_id);

        let inner = Arc::clone(self);
        let grace = self.config.cancel_grace();
        tokio::spawn(async move {
            if let Some(task) = task {
                let abort = task.abort_handle();
                if tokio::time::timeout(grace, task).await.is_err() {
                    warn!(
                        target = "callbridge::call",
                        call_id = %call_id,
                        "superseded attempt did not unwind in time; aborted"
                    );
                    abort.abort();
                }
            }
            inner.cleanup(&call_id, false).await;
        });
    }

    /// Idempotent terminal cleanup: close the relay session and media, power
    /// the target off when asked, then give up the claim.
    async fn cleanup(&self, call_id: &CallId, power_off: bool) {
        let (claim, target) = {
            let mut book = self.book.lock();
            let Some(entry) = book.attempts.get_mut(call_id) else {
                return;
            };
            if entry.cleaned {
                return;
            }
            entry.cleaned = true;
            entry.commands = None;
            let target = entry.status.borrow().target_device_id.clone();
            (entry.claim.take(), target)
        };

        self.relay.close_call(call_id);
        self.negotiator.close(call_id).await;

        if let Some(claim) = claim {
            if power_off {
                match self.sequencer.power_off(&claim, &target).await {
                    Ok(ack) => debug!(
                        target = "callbridge::call",
                        call_id = %call_id,
                        accepted = ack.accepted,
                        "target powered off after call"
                    ),
                    Err(err) => warn!(
                        target = "callbridge::call",
                        call_id = %call_id,
                        error = %err,
                        "post-call power-off failed"
                    ),
                }
            }
            self.arbiter.release(&claim);
        }
    }

    async fn drive(
        self: Arc<Self>,
        call_id: CallId,
        target: DeviceId,
        claim: OwnershipClaim,
        mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    ) {
        let exit = self.run_attempt(&call_id, &target, &claim, &mut commands).await;
        match exit {
            Exit::Hangup => {
                if self.transition(&call_id, CallState::Ending, None).is_ok() {
                    self.cleanup(&call_id, self.config.power_off_on_end).await;
                    let _ = self.transition(&call_id, CallState::Ended, None);
                } else {
                    self.cleanup(&call_id, false).await;
                }
            }
            Exit::Failed(failure) => {
                let power_off = self.config.power_off_on_early_failure
                    && failure.phase != CallState::Connected
                    && !matches!(
                        failure.kind,
                        FailureKind::OwnershipSuperseded | FailureKind::DeviceCooldown
                    );
                let failed = self
                    .transition(&call_id, CallState::Failed, Some(failure))
                    .is_ok();
                self.cleanup(&call_id, failed && power_off).await;
            }
            Exit::Revoked(revocation, phase) => {
                let failure = match revocation {
                    Revocation::Superseded { by } => CallFailure::new(
                        FailureKind::OwnershipSuperseded,
                        phase,
                        format!("control taken over by claim {by}"),
                    ),
                    Revocation::Released | Revocation::Closed => CallFailure::new(
                        FailureKind::Abandoned,
                        phase,
                        "device control was released",
                    ),
                };
                let _ = self.transition(&call_id, CallState::Failed, Some(failure));
                self.cleanup(&call_id, false).await;
            }
            Exit::Detached => self.cleanup(&call_id, false).await,
        }
    }

    fn store_wake_result(&self, call_id: &CallId, result: crate::wake::WakeResult) {
        let book = self.book.lock();
        if let Some(entry) = book.attempts.get(call_id) {
            entry.status.send_modify(|attempt| attempt.wake_result = Some(result));
        }
    }

    fn timed_out(&self, phase: CallState, detail: &str) -> Exit {
        let kind = if self.relay.supervisor().is_connected() {
            FailureKind::PeerUnreachable
        } else {
            FailureKind::RelayUnavailable
        };
        failed(kind, phase, detail)
    }

    async fn apply_candidate(&self, call_id: &CallId, candidate: &Value) {
        if let Err(err) = self.negotiator.add_remote_candidate(call_id, candidate).await {
            warn!(target = "callbridge::call", call_id = %call_id, error = %err, "remote candidate rejected");
        }
    }

    fn forward_candidate(&self, session: &SessionHandle, candidate: Value) {
        if let Err(err) = self.relay.send(session, SignalKind::IceCandidate, candidate) {
            warn!(target = "callbridge::call", call_id = %session.call_id(), error = %err, "local candidate not sent");
        }
    }

    async fn run_attempt(
        &self,
        call_id: &CallId,
        target: &DeviceId,
        claim: &OwnershipClaim,
        commands: &mut mpsc::UnboundedReceiver<DriverCommand>,
    ) -> Exit {
        // Waking
        let wake = {
            let wake = self.sequencer.wake(claim, target, &self.plan, call_id);
            tokio::pin!(wake);
            loop {
                tokio::select! {
                    biased;
                    revocation = claim.revoked() => return Exit::Revoked(revocation, CallState::Waking),
                    command = commands.recv() => match command {
                        Some(DriverCommand::End) => return abandoned(CallState::Waking),
                        Some(DriverCommand::Candidate(_)) => {}
                        None => return Exit::Detached,
                    },
                    result = &mut wake => break result,
                }
            }
        };
        let result = match wake {
            Ok(result) => result,
            Err(WakeError::Cancelled(revocation)) => {
                return Exit::Revoked(revocation, CallState::Waking)
            }
            Err(WakeError::NotOwner { .. }) => {
                return Exit::Revoked(
                    claim.revocation().unwrap_or(Revocation::Released),
                    CallState::Waking,
                )
            }
            Err(err @ WakeError::PowerCycleCooldown { .. }) => {
                return failed(FailureKind::DeviceCooldown, CallState::Waking, err.to_string())
            }
            Err(err) => {
                return failed(FailureKind::WakeVerificationFailed, CallState::Waking, err.to_string())
            }
        };
        let unverified = result
            .failed_stage()
            .map(|stage| (stage.name.clone(), stage.error.clone()));
        let verified = result.overall_verified;
        self.store_wake_result(call_id, result);
        if !verified {
            let (stage, error) = unverified.unwrap_or_else(|| ("unknown".to_string(), None));
            let detail = format!(
                "stage {stage} not verified: {}",
                error.as_deref().unwrap_or("effect not observed")
            );
            return Exit::Failed(
                CallFailure::new(FailureKind::WakeVerificationFailed, CallState::Waking, detail)
                    .with_stage(stage),
            );
        }
        if self
            .transition(call_id, CallState::AwaitingPeerReady, None)
            .is_err()
        {
            return Exit::Detached;
        }

        let mut session = match self
            .relay
            .open_session(call_id.clone(), ParticipantRole::Initiator)
        {
            Ok(session) => session,
            Err(err) => {
                return failed(
                    FailureKind::RelayUnavailable,
                    CallState::AwaitingPeerReady,
                    err.to_string(),
                )
            }
        };

        // AwaitingPeerReady. A relay restart here is not fatal: the target
        // re-announces and resends ready once the link is back.
        let phase = CallState::AwaitingPeerReady;
        let deadline = Instant::now() + self.config.peer_ready_timeout();
        loop {
            tokio::select! {
                biased;
                revocation = claim.revoked() => return Exit::Revoked(revocation, phase),
                command = commands.recv() => match command {
                    Some(DriverCommand::End) => return abandoned(phase),
                    Some(DriverCommand::Candidate(_)) => {}
                    None => return Exit::Detached,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return self.timed_out(phase, "target never reported ready")
                }
                event = session.next_event() => match event {
                    Some(SessionEvent::Message { message, .. }) => match message.kind {
                        SignalKind::Ready => break,
                        SignalKind::End => {
                            return failed(FailureKind::PeerUnreachable, phase, "target hung up before ready")
                        }
                        _ => {}
                    },
                    Some(SessionEvent::PeerLost { reason: PeerLossReason::HeartbeatTimeout }) => {
                        return failed(FailureKind::PeerUnreachable, phase, "target went silent")
                    }
                    Some(SessionEvent::Rejected { reason }) => {
                        return failed(FailureKind::RelayUnavailable, phase, reason)
                    }
                    Some(_) => {}
                    None => return failed(FailureKind::RelayUnavailable, phase, "relay session closed"),
                },
            }
        }
        if self.transition(call_id, CallState::Signaling, None).is_err() {
            return Exit::Detached;
        }

        // Signaling
        let phase = CallState::Signaling;
        let offer = tokio::select! {
            biased;
            revocation = claim.revoked() => return Exit::Revoked(revocation, phase),
            offer = self.negotiator.create_offer(call_id) => offer,
        };
        let offer = match offer {
            Ok(offer) => offer,
            Err(err) => return failed(FailureKind::NegotiationFailed, phase, err.to_string()),
        };
        if let Err(err) = self.relay.send(&session, SignalKind::Offer, offer) {
            return failed(FailureKind::RelayUnavailable, phase, err.to_string());
        }
        let deadline = Instant::now() + self.config.signaling_timeout();
        loop {
            tokio::select! {
                biased;
                revocation = claim.revoked() => return Exit::Revoked(revocation, phase),
                command = commands.recv() => match command {
                    Some(DriverCommand::End) => {
                        let _ = self.relay.send(&session, SignalKind::End, Value::Null);
                        return abandoned(phase);
                    }
                    Some(DriverCommand::Candidate(candidate)) => self.forward_candidate(&session, candidate),
                    None => return Exit::Detached,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return self.timed_out(phase, "no answer from target")
                }
                event = session.next_event() => match event {
                    Some(SessionEvent::Message { message, .. }) => match message.kind {
                        SignalKind::Answer => {
                            match self.negotiator.accept_answer(call_id, &message.payload).await {
                                Ok(()) => break,
                                Err(err) => {
                                    return failed(FailureKind::NegotiationFailed, phase, err.to_string())
                                }
                            }
                        }
                        SignalKind::IceCandidate => self.apply_candidate(call_id, &message.payload).await,
                        SignalKind::End => {
                            return failed(FailureKind::PeerUnreachable, phase, "target hung up during signaling")
                        }
                        _ => {}
                    },
                    Some(SessionEvent::PeerLost { reason }) => {
                        return failed(FailureKind::PeerUnreachable, phase, format!("peer lost: {reason:?}"))
                    }
                    Some(SessionEvent::Rejected { reason }) => {
                        return failed(FailureKind::RelayUnavailable, phase, reason)
                    }
                    Some(_) => {}
                    None => return failed(FailureKind::RelayUnavailable, phase, "relay session closed"),
                },
            }
        }
        if self.transition(call_id, CallState::Connected, None).is_err() {
            return Exit::Detached;
        }

        // Connected
        let phase = CallState::Connected;
        loop {
            tokio::select! {
                biased;
                revocation = claim.revoked() => return Exit::Revoked(revocation, phase),
                command = commands.recv() => match command {
                    Some(DriverCommand::End) => {
                        let _ = self.relay.send(&session, SignalKind::End, Value::Null);
                        return Exit::Hangup;
                    }
                    Some(DriverCommand::Candidate(candidate)) => self.forward_candidate(&session, candidate),
                    None => return Exit::Detached,
                },
                event = session.next_event() => match event {
                    Some(SessionEvent::Message { message, .. }) => match message.kind {
                        SignalKind::End => return Exit::Hangup,
                        SignalKind::IceCandidate => self.apply_candidate(call_id, &message.payload).await,
                        _ => {}
                    },
                    Some(SessionEvent::PeerLost { reason }) => {
                        return failed(FailureKind::PeerUnreachable, phase, format!("peer lost: {reason:?}"))
                    }
                    Some(_) => {}
                    None => return failed(FailureKind::PeerUnreachable, phase, "relay session closed"),
                },
            }
        }
    }
}
