//! One logical relay link that survives relay restarts and network blips.
//!
//! Frames sent while the link is down are buffered (bounded) and replayed in
//! order once it comes back, after the active call announcements have been
//! re-sent. A changed `Welcome.relay_instance` means the relay lost all its
//! routing state and is reported as `LinkEvent::RelayRestarted`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::error::RelayError;
use crate::ids::CallId;
use crate::metrics;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::relay::transport::RelayConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected { relay_instance: String },
    Backoff { attempt: u32, delay: Duration },
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected {
        relay_instance: String,
        reconnect: bool,
    },
    Disconnected {
        reason: String,
    },
    RelayRestarted {
        previous: String,
        current: String,
    },
    Frame(ServerFrame),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SupervisorStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub reconnect_count: u64,
    pub connects: u64,
    pub last_error: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub buffered: usize,
}

enum Outbound {
    Live(mpsc::UnboundedSender<ClientFrame>),
    Buffering(VecDeque<ClientFrame>),
    Closed,
}

/// `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

struct Shared {
    config: ReconnectConfig,
    announcements: Mutex<BTreeMap<CallId, ClientFrame>>,
    outbound: Mutex<Outbound>,
    stats: Mutex<SupervisorStats>,
    state_tx: watch::Sender<LinkState>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }

    fn record_error(&self, reason: &str) {
        self.stats.lock().last_error = Some(reason.to_string());
    }

    /// Re-sends announcements, replays the buffer and switches to live
    /// sending, all under the outbound lock so nothing interleaves.
    fn go_live(&self, tx: &mpsc::UnboundedSender<ClientFrame>) -> Option<usize> {
        let announcements = self.announcements.lock();
        let mut outbound = self.outbound.lock();
        if matches!(*outbound, Outbound::Closed) {
            return None;
        }
        for join in announcements.values() {
            let _ = tx.send(join.clone());
        }
        let mut replayed = 0;
        if let Outbound::Buffering(queue) = mem::replace(&mut *outbound, Outbound::Live(tx.clone())) {
            for frame in queue {
                if tx.send(frame).is_ok() {
                    replayed += 1;
                }
            }
        }
        let mut stats = self.stats.lock();
        stats.frames_sent += (announcements.len() + replayed) as u64;
        stats.buffered = 0;
        Some(replayed)
    }

    fn go_buffering(&self) {
        let mut outbound = self.outbound.lock();
        if let Outbound::Live(_) = *outbound {
            *outbound = Outbound::Buffering(VecDeque::new());
        }
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

pub struct ReconnectSupervisor {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<LinkState>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectSupervisor {
    pub fn spawn(connector: Arc<dyn RelayConnector>, config: ReconnectConfig) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            announcements: Mutex::new(BTreeMap::new()),
            outbound: Mutex::new(Outbound::Buffering(VecDeque::new())),
            stats: Mutex::new(SupervisorStats::default()),
            state_tx,
            events_tx,
            shutdown,
        });
        let task = tokio::spawn(run(Arc::clone(&shared), connector));
        Arc::new(Self {
            shared,
            state_rx,
            events_rx: Mutex::new(Some(events_rx)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Sends now when connected, otherwise buffers for replay.
    pub fn send(&self, frame: ClientFrame) -> Result<(), RelayError> {
        let limit = self.shared.config.buffer_limit;
        let mut outbound = self.shared.outbound.lock();
        let frame = match &mut *outbound {
            Outbound::Closed => return Err(RelayError::Closed),
            Outbound::Live(tx) => match tx.send(frame) {
                Ok(()) => {
                    self.shared.stats.lock().frames_sent += 1;
                    return Ok(());
                }
                Err(mpsc::error::SendError(frame)) => frame,
            },
            Outbound::Buffering(queue) => {
                if queue.len() >= limit {
                    let mut stats = self.shared.stats.lock();
                    stats.frames_dropped += 1;
                    metrics::RELAY_BUFFER_DROPS.inc();
                    return Err(RelayError::BufferFull { limit });
                }
                queue.push_back(frame);
                self.shared.stats.lock().buffered = queue.len();
                return Ok(());
            }
        };
        // The link died before the run loop noticed.
        *outbound = Outbound::Buffering(VecDeque::from([frame]));
        self.shared.stats.lock().buffered = 1;
        Ok(())
    }

    /// Registers `join` to be re-sent on every (re)connect until retracted.
    pub fn announce(&self, call_id: CallId, join: ClientFrame) {
        let mut announcements = self.shared.announcements.lock();
        announcements.insert(call_id, join.clone());
        let outbound = self.shared.outbound.lock();
        if let Outbound::Live(tx) = &*outbound {
            if tx.send(join).is_ok() {
                self.shared.stats.lock().frames_sent += 1;
            }
        }
    }

    pub fn retract(&self, call_id: &CallId) {
        let mut announcements = self.shared.announcements.lock();
        if announcements.remove(call_id).is_none() {
            return;
        }
        let outbound = self.shared.outbound.lock();
        if let Outbound::Live(tx) = &*outbound {
            let _ = tx.send(ClientFrame::Leave {
                call_id: call_id.clone(),
            });
        }
    }

    /// The link event stream. There is exactly one consumer.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events_rx.lock().take()
    }

    pub fn state(&self) -> LinkState {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state_rx.borrow(), LinkState::Connected { .. })
    }

    pub fn stats(&self) -> SupervisorStats {
        self.shared.stats.lock().clone()
    }

    pub fn close(&self) {
        *self.shared.outbound.lock() = Outbound::Closed;
        self.shared.shutdown.send_replace(true);
        self.shared.set_state(LinkState::Closed);
    }

    /// Closes and waits for the run loop to exit.
    pub async fn shutdown(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

async fn establish(
    connector: &dyn RelayConnector,
    connect_timeout: Duration,
) -> Result<
    (
        mpsc::UnboundedSender<ClientFrame>,
        mpsc::UnboundedReceiver<ServerFrame>,
        String,
    ),
    RelayError,
> {
    let mut conn = tokio::time::timeout(connect_timeout, connector.connect())
        .await
        .map_err(|_| RelayError::Unavailable("connect timed out".into()))??;
    let welcome = tokio::time::timeout(connect_timeout, async {
        while let Some(frame) = conn.inbound.recv().await {
            if let ServerFrame::Welcome { relay_instance } = frame {
                return Some(relay_instance);
            }
        }
        None
    });
    match welcome.await {
        Ok(Some(instance)) => Ok((conn.outbound, conn.inbound, instance)),
        Ok(None) => Err(RelayError::Unavailable(
            "relay closed the connection before welcome".into(),
        )),
        Err(_) => Err(RelayError::Unavailable("no welcome from relay".into())),
    }
}

async fn run(shared: Arc<Shared>, connector: Arc<dyn RelayConnector>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut attempt: u32 = 0;
    let mut last_instance: Option<String> = None;
    let mut has_connected = false;

    'outer: loop {
        if *shutdown.borrow() {
            break;
        }
        shared.set_state(LinkState::Connecting);
        let outcome = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            res = establish(connector.as_ref(), shared.config.connect_timeout()) => res,
        };

        match outcome {
            Ok((tx, mut inbound, relay_instance)) => {
                attempt = 0;
                if let Some(previous) = last_instance.take().filter(|prev| *prev != relay_instance) {
                    warn!(
                        target = "callbridge::supervisor",
                        previous = %previous,
                        current = %relay_instance,
                        "relay restarted; routing state was lost"
                    );
                    shared.emit(LinkEvent::RelayRestarted {
                        previous,
                        current: relay_instance.clone(),
                    });
                }
                last_instance = Some(relay_instance.clone());

                let Some(replayed) = shared.go_live(&tx) else {
                    break;
                };
                let reconnect = has_connected;
                has_connected = true;
                {
                    let mut stats = shared.stats.lock();
                    stats.connects += 1;
                    stats.last_connected_at = Some(Utc::now());
                    if reconnect {
                        stats.reconnect_count += 1;
                        metrics::RELAY_RECONNECTS.inc();
                    }
                }
                info!(
                    target = "callbridge::supervisor",
                    relay_instance = %relay_instance,
                    reconnect,
                    replayed,
                    "relay link up"
                );
                shared.set_state(LinkState::Connected {
                    relay_instance: relay_instance.clone(),
                });
                shared.emit(LinkEvent::Connected {
                    relay_instance,
                    reconnect,
                });

                let reason = loop {
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => break 'outer,
                        frame = inbound.recv() => match frame {
                            Some(frame) => shared.emit(LinkEvent::Frame(frame)),
                            None => break "relay connection closed".to_string(),
                        },
                    }
                };
                shared.go_buffering();
                shared.record_error(&reason);
                warn!(target = "callbridge::supervisor", reason = %reason, "relay link down");
                shared.emit(LinkEvent::Disconnected { reason });
            }
            Err(err) => {
                debug!(
                    target = "callbridge::supervisor",
                    attempt,
                    error = %err,
                    "relay connect failed"
                );
                shared.record_error(&err.to_string());
            }
        }

        let delay = backoff_delay(
            shared.config.base_delay(),
            shared.config.max_delay(),
            attempt,
        );
        attempt = attempt.saturating_add(1);
        shared.set_state(LinkState::Backoff { attempt, delay });
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    *shared.outbound.lock() = Outbound::Closed;
    shared.set_state(LinkState::Closed);
    debug!(target = "callbridge::supervisor", "supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::relay::transport::RelayConnection;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Unreachable {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl RelayConnector for Unreachable {
        async fn connect(&self) -> Result<RelayConnection, RelayError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::Unavailable("connection refused".into()))
        }
    }

    fn config(buffer_limit: usize) -> ReconnectConfig {
        ReconnectConfig {
            base_delay_ms: 100,
            max_delay_ms: 800,
            buffer_limit,
            connect_timeout_ms: 100,
        }
    }

    #[test_timeout::timeout]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(60);
        let delays: Vec<u64> = (0..6).map(|n| backoff_delay(base, max, n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
        assert_eq!(backoff_delay(base, max, 40), max);
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_fails_fast_when_full() {
        let connector = Arc::new(Unreachable {
            attempts: AtomicU32::new(0),
        });
        let supervisor = ReconnectSupervisor::spawn(connector.clone(), config(2));
        for _ in 0..2 {
            supervisor.send(ClientFrame::Ping).unwrap();
        }
        assert_eq!(
            supervisor.send(ClientFrame::Ping),
            Err(RelayError::BufferFull { limit: 2 })
        );
        let stats = supervisor.stats();
        assert_eq!(stats.buffered, 2);
        assert_eq!(stats.frames_dropped, 1);

        // 100 + 200 + 400 + 800 + 800ms of backoff covers five attempts.
        tokio::time::sleep(Duration::from_millis(2_350)).await;
        assert!(connector.attempts.load(Ordering::SeqCst) >= 5);
        assert!(supervisor.stats().last_error.unwrap().contains("refused"));
        assert!(matches!(supervisor.state(), LinkState::Backoff { .. }));

        supervisor.shutdown().await;
        assert_eq!(supervisor.state(), LinkState::Closed);
        assert_eq!(supervisor.send(ClientFrame::Ping), Err(RelayError::Closed));
    }
}
