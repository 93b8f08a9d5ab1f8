//! Session-oriented signaling channel between the two participants of a call.
//!
//! Routing is by call id only; payloads are opaque. Each session numbers what
//! it sends and drops anything it has already applied from the peer, so
//! replays after a reconnect are harmless. Heartbeats are exchanged per
//! session and a silent peer is reported once as `PeerLost`.

pub mod hub;
pub mod transport;

pub use hub::{CallSummary, HubConfig, HubStats, LocalConnector, RelayHub};
pub use transport::{RelayConnection, RelayConnector, WebSocketConnector};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{ReconnectConfig, RelayConfig};
use crate::error::RelayError;
use crate::ids::{CallId, ParticipantId};
use crate::metrics;
use crate::protocol::{ClientFrame, ParticipantRole, ServerFrame, SignalKind, SignalMessage};
use crate::supervisor::{LinkEvent, ReconnectSupervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLossReason {
    HeartbeatTimeout,
    RelayRestarted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message {
        from: ParticipantRole,
        message: SignalMessage,
    },
    PeerJoined,
    PeerLeft,
    PeerLost {
        reason: PeerLossReason,
    },
    /// The relay link dropped; frames are buffered until it returns.
    RelayDown,
    RelayRestored,
    Rejected {
        reason: String,
    },
}

/// Tracks which sequence numbers from one sender were already applied.
#[derive(Debug, Default, Clone)]
pub struct SequenceWindow {
    floor: u64,
    ahead: BTreeSet<u64>,
}

impl SequenceWindow {
    /// True the first time `sequence` is seen.
    pub fn accept(&mut self, sequence: u64) -> bool {
        if sequence <= self.floor || self.ahead.contains(&sequence) {
            return false;
        }
        if sequence == self.floor + 1 {
            self.floor = sequence;
            while self.ahead.remove(&(self.floor + 1)) {
                self.floor += 1;
            }
        } else {
            self.ahead.insert(sequence);
        }
        true
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }
}

type MessageCallback = Arc<dyn Fn(ParticipantRole, &SignalMessage) + Send + Sync>;

struct SessionShared {
    call_id: CallId,
    role: ParticipantRole,
    next_sequence: Mutex<u64>,
    windows: Mutex<HashMap<ParticipantRole, SequenceWindow>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    callbacks: Mutex<Vec<MessageCallback>>,
    last_peer_seen: Mutex<Option<Instant>>,
    peer_lost: AtomicBool,
    closed: AtomicBool,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn mark_peer_seen(&self) {
        *self.last_peer_seen.lock() = Some(Instant::now());
        self.peer_lost.store(false, Ordering::SeqCst);
    }
}

/// One open call session. Events arrive in relay order.
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("call_id", &self.shared.call_id)
            .field("role", &self.shared.role)
            .finish()
    }
}

impl SessionHandle {
    pub fn call_id(&self) -> &CallId {
        &self.shared.call_id
    }

    pub fn role(&self) -> ParticipantRole {
        self.shared.role
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }
}

struct RelayInner {
    supervisor: Arc<ReconnectSupervisor>,
    participant_id: ParticipantId,
    config: RelayConfig,
    sessions: DashMap<CallId, Arc<SessionShared>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for RelayInner {
    fn drop(&mut self) {
        self.supervisor.close();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl RelayInner {
    fn send_on(
        &self,
        session: &SessionShared,
        kind: SignalKind,
        payload: Value,
    ) -> Result<u64, RelayError> {
        if session.closed.load(Ordering::SeqCst) {
            return Err(RelayError::SessionClosed(session.call_id.clone()));
        }
        let mut next = session.next_sequence.lock();
        let sequence = *next + 1;
        let message = SignalMessage::new(session.call_id.clone(), sequence, kind, payload);
        self.supervisor.send(ClientFrame::Signal { message })?;
        *next = sequence;
        Ok(sequence)
    }

    fn session(&self, call_id: &CallId) -> Option<Arc<SessionShared>> {
        self.sessions.get(call_id).map(|entry| Arc::clone(entry.value()))
    }

    fn each_session(&self, mut f: impl FnMut(&SessionShared)) {
        let sessions: Vec<Arc<SessionShared>> =
            self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect();
        for session in sessions {
            f(&session);
        }
    }

    fn dispatch(&self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(frame) => self.dispatch_frame(frame),
            LinkEvent::Disconnected { .. } => self.each_session(|s| s.emit(SessionEvent::RelayDown)),
            LinkEvent::Connected { reconnect, .. } => {
                if reconnect {
                    self.each_session(|s| s.emit(SessionEvent::RelayRestored));
                }
            }
            LinkEvent::RelayRestarted { .. } => self.each_session(|s| {
                *s.last_peer_seen.lock() = None;
                s.emit(SessionEvent::PeerLost {
                    reason: PeerLossReason::RelayRestarted,
                });
            }),
        }
    }

    fn dispatch_frame(&self, frame: ServerFrame) {
        let Some(call_id) = frame.call_id().cloned() else {
            if let ServerFrame::Error { message } = frame {
                warn!(target = "callbridge::relay", error = %message, "relay reported an error");
            }
            return;
        };
        let Some(session) = self.session(&call_id) else {
            trace!(target = "callbridge::relay", call_id = %call_id, "frame for unknown call dropped");
            return;
        };

        match frame {
            ServerFrame::Signal { from, message } => {
                if from == session.role || message.call_id != session.call_id {
                    return;
                }
                session.mark_peer_seen();
                let fresh = session
                    .windows
                    .lock()
                    .entry(from)
                    .or_default()
                    .accept(message.sequence);
                if !fresh {
                    metrics::SIGNAL_DUPLICATES.inc();
                    debug!(
                        target = "callbridge::relay",
                        call_id = %call_id,
                        sequence = message.sequence,
                        "duplicate signal ignored"
                    );
                    return;
                }
                if message.kind == SignalKind::Heartbeat {
                    return;
                }
                let callbacks: Vec<MessageCallback> = session.callbacks.lock().clone();
                for callback in callbacks {
                    callback(from, &message);
                }
                session.emit(SessionEvent::Message { from, message });
            }
            ServerFrame::Joined { peer_present, .. } => {
                if peer_present {
                    session.mark_peer_seen();
                    session.emit(SessionEvent::PeerJoined);
                }
            }
            ServerFrame::PeerJoined { role, .. } if role != session.role => {
                session.mark_peer_seen();
                session.emit(SessionEvent::PeerJoined);
            }
            ServerFrame::PeerLeft { role, .. } if role != session.role => {
                session.emit(SessionEvent::PeerLeft);
            }
            ServerFrame::JoinRejected { reason, .. } => {
                warn!(target = "callbridge::relay", call_id = %call_id, reason = %reason, "join rejected");
                session.emit(SessionEvent::Rejected { reason });
            }
            _ => {}
        }
    }

    fn heartbeat_tick(&self) {
        let connected = self.supervisor.is_connected();
        let timeout = self.config.peer_loss_timeout();
        self.each_session(|session| {
            if session.closed.load(Ordering::SeqCst) {
                return;
            }
            if connected {
                if let Err(err) = self.send_on(session, SignalKind::Heartbeat, Value::Null) {
                    debug!(target = "callbridge::relay", call_id = %session.call_id, error = %err, "heartbeat not sent");
                }
            }
            let silent = session
                .last_peer_seen
                .lock()
                .is_some_and(|seen| seen.elapsed() >= timeout);
            if silent && !session.peer_lost.swap(true, Ordering::SeqCst) {
                info!(
                    target = "callbridge::relay",
                    call_id = %session.call_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "peer silent; reporting loss"
                );
                session.emit(SessionEvent::PeerLost {
                    reason: PeerLossReason::HeartbeatTimeout,
                });
            }
        });
    }
}

#[derive(Clone)]
pub struct SignalRelay {
    inner: Arc<RelayInner>,
}

impl SignalRelay {
    pub fn new(
        supervisor: Arc<ReconnectSupervisor>,
        participant_id: ParticipantId,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        let mut events = supervisor
            .take_events()
            .ok_or_else(|| RelayError::Unavailable("link events already taken".into()))?;
        let heartbeat_interval = config.heartbeat_interval();
        let inner = Arc::new(RelayInner {
            supervisor,
            participant_id,
            config,
            sessions: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let weak: Weak<RelayInner> = Arc::downgrade(&inner);
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.dispatch(event);
            }
        });

        let weak: Weak<RelayInner> = Arc::downgrade(&inner);
        let watchdog = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.heartbeat_tick();
            }
        });

        inner.tasks.lock().extend([dispatcher, watchdog]);
        Ok(Self { inner })
    }

    /// Supervised relay link through `connector` plus a fresh participant id.
    pub fn connect(
        connector: Arc<dyn RelayConnector>,
        reconnect: ReconnectConfig,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        let supervisor = ReconnectSupervisor::spawn(connector, reconnect);
        Self::new(supervisor, ParticipantId::generate(), config)
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.inner.participant_id
    }

    pub fn supervisor(&self) -> &Arc<ReconnectSupervisor> {
        &self.inner.supervisor
    }

    pub fn open_session(
        &self,
        call_id: CallId,
        role: ParticipantRole,
    ) -> Result<SessionHandle, RelayError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            call_id: call_id.clone(),
            role,
            next_sequence: Mutex::new(0),
            windows: Mutex::new(HashMap::new()),
            events_tx,
            callbacks: Mutex::new(Vec::new()),
            last_peer_seen: Mutex::new(None),
            peer_lost: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        match self.inner.sessions.entry(call_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RelayError::SessionExists(call_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&shared));
            }
        }
        self.inner.supervisor.announce(
            call_id.clone(),
            ClientFrame::Join {
                call_id: call_id.clone(),
                participant_id: self.inner.participant_id.clone(),
                role,
            },
        );
        debug!(target = "callbridge::relay", call_id = %call_id, role = role.as_str(), "session opened");
        Ok(SessionHandle { shared, events })
    }

    /// Sends one envelope and returns the sequence number it carried.
    pub fn send(
        &self,
        handle: &SessionHandle,
        kind: SignalKind,
        payload: Value,
    ) -> Result<u64, RelayError> {
        self.inner.send_on(&handle.shared, kind, payload)
    }

    /// Calls `callback` for every fresh, non-heartbeat message on the session.
    pub fn on_message<F>(&self, handle: &SessionHandle, callback: F)
    where
        F: Fn(ParticipantRole, &SignalMessage) + Send + Sync + 'static,
    {
        handle.shared.callbacks.lock().push(Arc::new(callback));
    }

    pub fn close(&self, handle: SessionHandle) {
        self.close_call(&handle.shared.call_id);
    }

    /// Closes the session for `call_id`, if one is open.
    pub fn close_call(&self, call_id: &CallId) {
        let Some((_, session)) = self.inner.sessions.remove(call_id) else {
            return;
        };
        session.closed.store(true, Ordering::SeqCst);
        self.inner.supervisor.retract(call_id);
        debug!(target = "callbridge::relay", call_id = %call_id, "session closed");
    }

    pub fn has_session(&self, call_id: &CallId) -> bool {
        self.inner.sessions.contains_key(call_id)
    }

    pub async fn shutdown(&self) {
        let calls: Vec<CallId> = self.inner.sessions.iter().map(|e| e.key().clone()).collect();
        for call_id in calls {
            self.close_call(&call_id);
        }
        self.inner.supervisor.shutdown().await;
    }
}
