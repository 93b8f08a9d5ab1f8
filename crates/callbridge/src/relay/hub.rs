//! Relay-side router. Pairs the two participants of each call, forwards
//! signal envelopes between them and holds frames for a participant that has
//! not joined yet. All state lives in memory; a restart loses it and rotates
//! the instance id announced in `Welcome`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayError;
use crate::ids::{CallId, ParticipantId};
use crate::metrics;
use crate::protocol::{ClientFrame, ParticipantRole, ServerFrame};
use crate::relay::transport::{RelayConnection, RelayConnector};

pub type ConnectionId = u64;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Connections silent for this long are dropped by the sweeper.
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    /// Frames held per absent participant before the oldest are discarded.
    pub pending_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            pending_limit: 256,
        }
    }
}

struct Seat {
    participant_id: ParticipantId,
    connection_id: ConnectionId,
}

#[derive(Default)]
struct Room {
    seats: HashMap<ParticipantRole, Seat>,
    pending: HashMap<ParticipantRole, VecDeque<ServerFrame>>,
}

impl Room {
    fn role_of(&self, connection_id: ConnectionId) -> Option<ParticipantRole> {
        self.seats
            .iter()
            .find(|(_, seat)| seat.connection_id == connection_id)
            .map(|(role, _)| *role)
    }

    fn is_idle(&self) -> bool {
        self.seats.is_empty() && self.pending.values().all(VecDeque::is_empty)
    }
}

struct ConnectionEntry {
    tx: mpsc::UnboundedSender<ServerFrame>,
    calls: HashSet<CallId>,
    last_seen: Instant,
}

struct HubState {
    instance: String,
    available: bool,
    rooms: HashMap<CallId, Room>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

impl HubState {
    fn send(&self, connection_id: ConnectionId, frame: ServerFrame) {
        if let Some(conn) = self.connections.get(&connection_id) {
            let _ = conn.tx.send(frame);
        }
    }

    fn notify_peer(&self, call_id: &CallId, role: ParticipantRole, frame: ServerFrame) {
        if let Some(seat) = self
            .rooms
            .get(call_id)
            .and_then(|room| room.seats.get(&role.peer()))
        {
            self.send(seat.connection_id, frame);
        }
    }

    /// Removes every seat `connection_id` holds and tells the peers.
    fn vacate(&mut self, connection_id: ConnectionId, calls: HashSet<CallId>) {
        for call_id in calls {
            let Some(room) = self.rooms.get_mut(&call_id) else {
                continue;
            };
            let Some(role) = room.role_of(connection_id) else {
                continue;
            };
            room.seats.remove(&role);
            let idle = room.is_idle();
            self.notify_peer(
                &call_id,
                role,
                ServerFrame::PeerLeft {
                    call_id: call_id.clone(),
                    role,
                },
            );
            if idle {
                self.rooms.remove(&call_id);
            }
        }
    }

    fn disconnect(&mut self, connection_id: ConnectionId) -> bool {
        let Some(entry) = self.connections.remove(&connection_id) else {
            return false;
        };
        metrics::HUB_CONNECTIONS.dec();
        self.vacate(connection_id, entry.calls);
        true
    }
}

/// A connection registered with the hub. `frames` yields everything the hub
/// routes to it and ends when the hub drops the connection.
#[derive(Debug)]
pub struct HubAttachment {
    pub connection_id: ConnectionId,
    pub frames: mpsc::UnboundedReceiver<ServerFrame>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantSummary {
    pub role: ParticipantRole,
    pub participant_id: ParticipantId,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedSummary {
    pub for_role: ParticipantRole,
    pub frames: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub call_id: CallId,
    pub relay_instance: String,
    pub participants: Vec<ParticipantSummary>,
    pub queued: Vec<QueuedSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub relay_instance: String,
    pub connections: usize,
    pub calls: usize,
}

struct HubInner {
    config: HubConfig,
    next_connection: AtomicU64,
    state: Mutex<HubState>,
}

#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl RelayHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                next_connection: AtomicU64::new(0),
                state: Mutex::new(HubState {
                    instance: Uuid::new_v4().to_string(),
                    available: true,
                    rooms: HashMap::new(),
                    connections: HashMap::new(),
                }),
            }),
        }
    }

    pub fn instance_id(&self) -> String {
        self.inner.state.lock().instance.clone()
    }

    pub fn attach(&self) -> Result<HubAttachment, RelayError> {
        let mut state = self.inner.state.lock();
        if !state.available {
            return Err(RelayError::Unavailable("relay is not accepting connections".into()));
        }
        let connection_id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, frames) = mpsc::unbounded_channel();
        let _ = tx.send(ServerFrame::Welcome {
            relay_instance: state.instance.clone(),
        });
        state.connections.insert(
            connection_id,
            ConnectionEntry {
                tx,
                calls: HashSet::new(),
                last_seen: Instant::now(),
            },
        );
        metrics::HUB_CONNECTIONS.inc();
        debug!(target = "callbridge::hub", connection_id, "connection attached");
        Ok(HubAttachment {
            connection_id,
            frames,
        })
    }

    /// Routes one client frame. Returns false once the connection is no
    /// longer known to the hub.
    pub fn handle_frame(&self, connection_id: ConnectionId, frame: ClientFrame) -> bool {
        let mut state = self.inner.state.lock();
        match state.connections.get_mut(&connection_id) {
            Some(conn) => conn.last_seen = Instant::now(),
            None => return false,
        }

        match frame {
            ClientFrame::Ping => state.send(connection_id, ServerFrame::Pong),
            ClientFrame::Join {
                call_id,
                participant_id,
                role,
            } => self.join(&mut state, connection_id, call_id, participant_id, role),
            ClientFrame::Leave { call_id } => {
                if let Some(conn) = state.connections.get_mut(&connection_id) {
                    conn.calls.remove(&call_id);
                }
                state.vacate(connection_id, HashSet::from([call_id]));
            }
            ClientFrame::Signal { message } => {
                let call_id = message.call_id.clone();
                let Some(from) = state
                    .rooms
                    .get(&call_id)
                    .and_then(|room| room.role_of(connection_id))
                else {
                    metrics::HUB_FRAMES.with_label_values(&["rejected"]).inc();
                    state.send(
                        connection_id,
                        ServerFrame::Error {
                            message: format!("not joined to call {call_id}"),
                        },
                    );
                    return true;
                };
                let frame = ServerFrame::Signal { from, message };
                let recipient = state
                    .rooms
                    .get(&call_id)
                    .and_then(|room| room.seats.get(&from.peer()))
                    .map(|seat| seat.connection_id);
                match recipient {
                    Some(peer_conn) => {
                        metrics::HUB_FRAMES.with_label_values(&["forwarded"]).inc();
                        state.send(peer_conn, frame);
                    }
                    None => {
                        let limit = self.inner.config.pending_limit;
                        if let Some(room) = state.rooms.get_mut(&call_id) {
                            let queue = room.pending.entry(from.peer()).or_default();
                            if queue.len() >= limit {
                                queue.pop_front();
                                metrics::HUB_FRAMES.with_label_values(&["dropped"]).inc();
                            }
                            queue.push_back(frame);
                            metrics::HUB_FRAMES.with_label_values(&["queued"]).inc();
                        }
                    }
                }
            }
        }
        true
    }

    fn join(
        &self,
        state: &mut HubState,
        connection_id: ConnectionId,
        call_id: CallId,
        participant_id: ParticipantId,
        role: ParticipantRole,
    ) {
        let existing = state
            .rooms
            .get(&call_id)
            .and_then(|room| room.seats.get(&role))
            .map(|seat| (seat.participant_id.clone(), seat.connection_id));
        let replaced = match existing {
            Some((holder, _)) if holder != participant_id => {
                let reason = format!("{} seat is taken", role.as_str());
                warn!(
                    target = "callbridge::hub",
                    call_id = %call_id,
                    role = role.as_str(),
                    "join rejected"
                );
                state.send(connection_id, ServerFrame::JoinRejected { call_id, reason });
                return;
            }
            Some((_, previous)) => Some(previous),
            None => None,
        };
        let room = state.rooms.entry(call_id.clone()).or_default();
        room.seats.insert(
            role,
            Seat {
                participant_id,
                connection_id,
            },
        );
        let peer_present = room.seats.contains_key(&role.peer());
        let queued: Vec<ServerFrame> = room
            .pending
            .remove(&role)
            .map(Vec::from)
            .unwrap_or_default();

        if let Some(old) = replaced.filter(|old| *old != connection_id) {
            if let Some(conn) = state.connections.get_mut(&old) {
                conn.calls.remove(&call_id);
            }
        }
        if let Some(conn) = state.connections.get_mut(&connection_id) {
            conn.calls.insert(call_id.clone());
        }

        info!(
            target = "callbridge::hub",
            call_id = %call_id,
            role = role.as_str(),
            peer_present,
            flushed = queued.len(),
            "participant joined"
        );
        state.send(
            connection_id,
            ServerFrame::Joined {
                call_id: call_id.clone(),
                role,
                peer_present,
            },
        );
        for frame in queued {
            state.send(connection_id, frame);
        }
        state.notify_peer(&call_id, role, ServerFrame::PeerJoined { call_id: call_id.clone(), role });
    }

    /// Delivers `frame` directly to one connection.
    pub fn notify(&self, connection_id: ConnectionId, frame: ServerFrame) {
        self.inner.state.lock().send(connection_id, frame);
    }

    pub fn detach(&self, connection_id: ConnectionId) {
        if self.inner.state.lock().disconnect(connection_id) {
            debug!(target = "callbridge::hub", connection_id, "connection detached");
        }
    }

    /// In-process link to this hub, used by tests and embedded deployments.
    pub fn connect_local(&self) -> Result<RelayConnection, RelayError> {
        let HubAttachment {
            connection_id,
            frames,
        } = self.attach()?;
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if !hub.handle_frame(connection_id, frame) {
                    break;
                }
            }
            hub.detach(connection_id);
        });
        Ok(RelayConnection {
            outbound: outbound_tx,
            inbound: frames,
        })
    }

    pub fn connector(&self) -> LocalConnector {
        LocalConnector { hub: self.clone() }
    }

    /// While unavailable, new connections are refused.
    pub fn set_available(&self, available: bool) {
        self.inner.state.lock().available = available;
    }

    /// Cuts every live connection. Routing state for their seats goes with them.
    pub fn drop_connections(&self) {
        let mut state = self.inner.state.lock();
        let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
        for id in ids {
            state.disconnect(id);
        }
        info!(target = "callbridge::hub", "all connections dropped");
    }

    /// Behaves like a process restart: all state is lost and the instance id changes.
    pub fn restart(&self) {
        let mut state = self.inner.state.lock();
        let dropped = state.connections.len();
        metrics::HUB_CONNECTIONS.sub(dropped as i64);
        state.connections.clear();
        state.rooms.clear();
        state.instance = Uuid::new_v4().to_string();
        info!(
            target = "callbridge::hub",
            relay_instance = %state.instance,
            dropped,
            "relay state reset"
        );
    }

    /// Drops connections silent for longer than `stale_after`. Returns how many.
    pub fn sweep(&self) -> usize {
        let stale_after = self.inner.config.stale_after;
        let mut state = self.inner.state.lock();
        let stale: Vec<ConnectionId> = state
            .connections
            .iter()
            .filter(|(_, conn)| conn.last_seen.elapsed() > stale_after)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            info!(
                target = "callbridge::hub",
                connection_id = id,
                "removing stale connection (heartbeat timeout)"
            );
            state.disconnect(*id);
        }
        stale.len()
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let hub = self.clone();
        let every = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                hub.sweep();
            }
        })
    }

    pub fn call_summary(&self, call_id: &CallId) -> Option<CallSummary> {
        let state = self.inner.state.lock();
        let room = state.rooms.get(call_id)?;
        let participants = room
            .seats
            .iter()
            .map(|(role, seat)| ParticipantSummary {
                role: *role,
                participant_id: seat.participant_id.clone(),
                idle_ms: state
                    .connections
                    .get(&seat.connection_id)
                    .map(|conn| conn.last_seen.elapsed().as_millis() as u64)
                    .unwrap_or_default(),
            })
            .collect();
        let queued = room
            .pending
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(role, queue)| QueuedSummary {
                for_role: *role,
                frames: queue.len(),
            })
            .collect();
        Some(CallSummary {
            call_id: call_id.clone(),
            relay_instance: state.instance.clone(),
            participants,
            queued,
        })
    }

    pub fn stats(&self) -> HubStats {
        let state = self.inner.state.lock();
        HubStats {
            relay_instance: state.instance.clone(),
            connections: state.connections.len(),
            calls: state.rooms.len(),
        }
    }
}

/// `RelayConnector` over an in-process hub.
#[derive(Clone)]
pub struct LocalConnector {
    hub: RelayHub,
}

#[async_trait]
impl RelayConnector for LocalConnector {
    async fn connect(&self) -> Result<RelayConnection, RelayError> {
        self.hub.connect_local()
    }
}
