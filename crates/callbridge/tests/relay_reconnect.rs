use async_trait::async_trait;
use callbridge::config::{ReconnectConfig, RelayConfig};
use callbridge::error::RelayError;
use callbridge::protocol::{ClientFrame, ParticipantRole, SignalKind, SignalMessage};
use callbridge::relay::{
    LocalConnector, PeerLossReason, RelayConnection, RelayConnector, SessionHandle,
};
use callbridge::supervisor::LinkState;
use callbridge::{CallId, ParticipantId, RelayHub, SessionEvent, SignalRelay};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn reconnect(buffer_limit: usize) -> ReconnectConfig {
    ReconnectConfig {
        base_delay_ms: 50,
        max_delay_ms: 400,
        buffer_limit,
        connect_timeout_ms: 200,
    }
}

fn relay_config() -> RelayConfig {
    RelayConfig {
        heartbeat_interval_ms: 1_000,
        peer_loss_timeout_ms: 3_000,
    }
}

fn relay_for(hub: &RelayHub, buffer_limit: usize) -> SignalRelay {
    SignalRelay::connect(Arc::new(hub.connector()), reconnect(buffer_limit), relay_config()).unwrap()
}

async fn link_in(relay: &SignalRelay, connected: bool) {
    let mut state = relay.supervisor().watch_state();
    state
        .wait_for(|state| matches!(state, LinkState::Connected { .. }) == connected)
        .await
        .unwrap();
}

fn drain(session: &mut SessionHandle) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(event) = session.try_next_event() {
        events.push(event);
    }
    events
}

fn candidates(events: &[SessionEvent]) -> Vec<Value> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Message { message, .. } if message.kind == SignalKind::IceCandidate => {
                Some(message.payload.clone())
            }
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn replayed_envelopes_are_applied_once() {
    let hub = RelayHub::default();
    let target = relay_for(&hub, 64);
    let call = CallId::from("c-replay");
    let mut session = target.open_session(call.clone(), ParticipantRole::Target).unwrap();
    let applied = Arc::new(AtomicUsize::new(0));
    {
        let applied = applied.clone();
        target.on_message(&session, move |_, _| {
            applied.fetch_add(1, Ordering::SeqCst);
        });
    }
    link_in(&target, true).await;

    // A bare connection plays the initiator and repeats itself.
    let raw = hub.attach().unwrap();
    hub.handle_frame(
        raw.connection_id,
        ClientFrame::Join {
            call_id: call.clone(),
            participant_id: ParticipantId::from("raw-initiator"),
            role: ParticipantRole::Initiator,
        },
    );
    let offer = SignalMessage::new(call.clone(), 1, SignalKind::Offer, json!({"sdp": "v=0"}));
    for _ in 0..4 {
        hub.handle_frame(raw.connection_id, ClientFrame::Signal { message: offer.clone() });
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let offers: Vec<_> = drain(&mut session)
        .into_iter()
        .filter(|event| matches!(event, SessionEvent::Message { message, .. } if message.kind == SignalKind::Offer))
        .collect();
    assert_eq!(offers.len(), 1);
    assert_eq!(applied.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn messages_stay_within_their_call() {
    let hub = RelayHub::default();
    let initiator = relay_for(&hub, 64);
    let target = relay_for(&hub, 64);
    let first = CallId::from("c-first");
    let second = CallId::from("c-second");

    let a1 = initiator.open_session(first.clone(), ParticipantRole::Initiator).unwrap();
    let a2 = initiator.open_session(second.clone(), ParticipantRole::Initiator).unwrap();
    let mut b1 = target.open_session(first.clone(), ParticipantRole::Target).unwrap();
    let mut b2 = target.open_session(second.clone(), ParticipantRole::Target).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    initiator.send(&a1, SignalKind::IceCandidate, json!({"n": 1})).unwrap();
    initiator.send(&a2, SignalKind::IceCandidate, json!({"n": 2})).unwrap();
    initiator.send(&a1, SignalKind::IceCandidate, json!({"n": 3})).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let first_seen = drain(&mut b1);
    let second_seen = drain(&mut b2);
    assert_eq!(candidates(&first_seen), vec![json!({"n": 1}), json!({"n": 3})]);
    assert_eq!(candidates(&second_seen), vec![json!({"n": 2})]);
    for event in first_seen.iter().chain(second_seen.iter()) {
        if let SessionEvent::Message { message, from } = event {
            assert_eq!(*from, ParticipantRole::Initiator);
            assert!(message.call_id == first || message.call_id == second);
        }
    }
    for event in &first_seen {
        if let SessionEvent::Message { message, .. } = event {
            assert_eq!(message.call_id, first);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn frames_sent_while_down_arrive_in_order_after_reconnect() {
    let hub = RelayHub::default();
    let initiator = relay_for(&hub, 64);
    let target = relay_for(&hub, 64);
    let call = CallId::from("c-outage");

    let a = initiator.open_session(call.clone(), ParticipantRole::Initiator).unwrap();
    let mut b = target.open_session(call.clone(), ParticipantRole::Target).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drain(&mut b);

    hub.set_available(false);
    hub.drop_connections();
    link_in(&initiator, false).await;
    link_in(&target, false).await;

    for n in 0..5 {
        initiator.send(&a, SignalKind::IceCandidate, json!({"n": n})).unwrap();
    }
    assert_eq!(initiator.supervisor().stats().buffered, 5);

    hub.set_available(true);
    link_in(&initiator, true).await;
    link_in(&target, true).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let events = drain(&mut b);
    let expected: Vec<Value> = (0..5).map(|n| json!({"n": n})).collect();
    assert_eq!(candidates(&events), expected);
    assert!(events.contains(&SessionEvent::RelayDown));
    assert!(events.contains(&SessionEvent::RelayRestored));
    assert!(!events
        .iter()
        .any(|event| matches!(event, SessionEvent::PeerLost { .. })));
    assert!(initiator.supervisor().stats().reconnect_count >= 1);
}

#[tokio::test(start_paused = true)]
async fn full_buffer_is_reported_to_the_sender() {
    let hub = RelayHub::default();
    hub.set_available(false);
    let initiator = relay_for(&hub, 3);
    let call = CallId::from("c-overflow");
    let a = initiator.open_session(call.clone(), ParticipantRole::Initiator).unwrap();

    for n in 0..3 {
        initiator.send(&a, SignalKind::IceCandidate, json!({"n": n})).unwrap();
    }
    assert_eq!(
        initiator.send(&a, SignalKind::IceCandidate, json!({"n": 3})),
        Err(RelayError::BufferFull { limit: 3 })
    );
    assert_eq!(initiator.supervisor().stats().frames_dropped, 1);

    let target = relay_for(&hub, 3);
    let mut b = target.open_session(call.clone(), ParticipantRole::Target).unwrap();
    hub.set_available(true);
    link_in(&initiator, true).await;
    link_in(&target, true).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let expected: Vec<Value> = (0..3).map(|n| json!({"n": n})).collect();
    assert_eq!(candidates(&drain(&mut b)), expected);
}

#[tokio::test(start_paused = true)]
async fn relay_restart_surfaces_peer_loss_and_rejoins_calls() {
    let hub = RelayHub::default();
    let initiator = relay_for(&hub, 64);
    let target = relay_for(&hub, 64);
    let call = CallId::from("c-restart");

    let mut a = initiator.open_session(call.clone(), ParticipantRole::Initiator).unwrap();
    let b = target.open_session(call.clone(), ParticipantRole::Target).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    target.send(&b, SignalKind::Ready, Value::Null).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drain(&mut a);
    let before = hub.instance_id();

    hub.restart();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let events = drain(&mut a);
    let lost: Vec<_> = events
        .iter()
        .filter(|event| matches!(event, SessionEvent::PeerLost { .. }))
        .collect();
    assert_eq!(
        lost,
        vec![&SessionEvent::PeerLost {
            reason: PeerLossReason::RelayRestarted
        }]
    );
    let restored = events
        .iter()
        .position(|event| *event == SessionEvent::RelayRestored)
        .expect("link restored");
    let lost_at = events
        .iter()
        .position(|event| matches!(event, SessionEvent::PeerLost { .. }))
        .unwrap();
    assert!(lost_at < restored);

    // Both sides re-announced themselves to the fresh relay.
    let summary = hub.call_summary(&call).expect("call known after restart");
    assert_ne!(summary.relay_instance, before);
    assert_eq!(summary.participants.len(), 2);

    target.send(&b, SignalKind::Ready, Value::Null).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain(&mut a).iter().any(|event| matches!(
        event,
        SessionEvent::Message { message, .. } if message.kind == SignalKind::Ready
    )));
}

struct CountingConnector {
    inner: LocalConnector,
    attempts: Mutex<Vec<Instant>>,
}

#[async_trait]
impl RelayConnector for CountingConnector {
    async fn connect(&self) -> Result<RelayConnection, RelayError> {
        self.attempts.lock().push(Instant::now());
        self.inner.connect().await
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_back_off_exponentially() {
    let hub = RelayHub::default();
    hub.set_available(false);
    let connector = Arc::new(CountingConnector {
        inner: hub.connector(),
        attempts: Mutex::new(Vec::new()),
    });
    let relay = SignalRelay::connect(connector.clone(), reconnect(8), relay_config()).unwrap();

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let attempts = connector.attempts.lock().clone();
    let gaps: Vec<u64> = attempts
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_millis() as u64)
        .collect();
    assert!(gaps.len() >= 4, "gaps {gaps:?}");
    for (gap, expected) in gaps.iter().zip([50u64, 100, 200, 400]) {
        assert!(*gap >= expected && *gap <= expected + 5, "gaps {gaps:?}");
    }

    hub.set_available(true);
    link_in(&relay, true).await;
    relay.shutdown().await;
    assert_eq!(relay.supervisor().state(), LinkState::Closed);
}
