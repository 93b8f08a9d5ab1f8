use callbridge::config::{CallConfig, ReconnectConfig, RelayConfig, WakeConfig};
use callbridge::mock::{DeviceCall, FakeBehavior, FakeDevice, NegotiationStep, ScriptedNegotiator};
use callbridge::wake::CooldownMode;
use callbridge::{
    CallError, CallId, CallOrchestrator, CallResponder, CallState, CallStatus, ContextId,
    DeviceId, FailureKind, OrchestratorDeps, OwnershipArbiter, RelayHub, ResponderHandle,
    ResponderOutcome, SignalRelay, WakePlan, WakeSequencer,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn wake_config() -> WakeConfig {
    WakeConfig {
        verify_attempts: 3,
        verify_interval_ms: 100,
        verify_max_interval_ms: None,
        probe_timeout_ms: 50,
        trigger_timeout_ms: 500,
        power_cycle_cooldown_ms: 2_000,
        cooldown_mode: CooldownMode::Reject,
        content_url_template: "http://kiosk.local/call/{call_id}".to_string(),
    }
}

fn call_config() -> CallConfig {
    CallConfig {
        retry_cooldown_ms: 1_000,
        peer_ready_timeout_ms: 10_000,
        signaling_timeout_ms: 10_000,
        cancel_grace_ms: 500,
        power_off_on_end: true,
        power_off_on_early_failure: false,
        history_limit: 32,
    }
}

fn link_configs() -> (ReconnectConfig, RelayConfig) {
    (
        ReconnectConfig {
            base_delay_ms: 50,
            max_delay_ms: 400,
            buffer_limit: 128,
            connect_timeout_ms: 200,
        },
        RelayConfig {
            heartbeat_interval_ms: 1_000,
            peer_loss_timeout_ms: 3_000,
        },
    )
}

struct Rig {
    hub: RelayHub,
    orchestrator: CallOrchestrator,
    device: Arc<FakeDevice>,
    initiator_media: Arc<ScriptedNegotiator>,
    target_media: Arc<ScriptedNegotiator>,
    target_relay: SignalRelay,
    responders: Arc<Mutex<Vec<ResponderHandle>>>,
    target: DeviceId,
}

impl Rig {
    fn new(behavior: FakeBehavior) -> Self {
        Self::with_config(behavior, call_config())
    }

    fn with_config(behavior: FakeBehavior, call: CallConfig) -> Self {
        let hub = RelayHub::default();
        let (reconnect, relay_cfg) = link_configs();
        let initiator_relay =
            SignalRelay::connect(Arc::new(hub.connector()), reconnect.clone(), relay_cfg.clone())
                .unwrap();
        let target_relay =
            SignalRelay::connect(Arc::new(hub.connector()), reconnect, relay_cfg).unwrap();

        let device = Arc::new(FakeDevice::with_behavior(behavior));
        let arbiter = Arc::new(OwnershipArbiter::new());
        let wake = wake_config();
        let sequencer = Arc::new(WakeSequencer::new(device.clone(), arbiter.clone(), &wake));
        let initiator_media = Arc::new(ScriptedNegotiator::new());
        let target_media = Arc::new(ScriptedNegotiator::new());
        let responders = Arc::new(Mutex::new(Vec::new()));

        // The kiosk page joins the call as soon as the device loads it.
        {
            let relay = target_relay.clone();
            let media = target_media.clone();
            let responders = responders.clone();
            device.on_content_loaded(move |_, url| {
                let call_id = CallId::from(url.rsplit('/').next().unwrap_or_default());
                if let Ok(handle) = CallResponder::spawn(
                    relay.clone(),
                    media.clone(),
                    call_id,
                    Duration::from_secs(30),
                ) {
                    responders.lock().push(handle);
                }
            });
        }

        let orchestrator = CallOrchestrator::new(
            DeviceId::from("phone"),
            call,
            WakePlan::from_config(&wake),
            OrchestratorDeps {
                arbiter,
                sequencer,
                relay: initiator_relay,
                negotiator: initiator_media.clone(),
            },
        );

        Self {
            hub,
            orchestrator,
            device,
            initiator_media,
            target_media,
            target_relay,
            responders,
            target: DeviceId::from("living-room-tv"),
        }
    }

    async fn wait_for(&self, call: &CallId, done: impl Fn(&CallStatus) -> bool) -> CallStatus {
        let mut rx = self.orchestrator.watch(call).expect("call is tracked");
        tokio::time::timeout(Duration::from_secs(60), async {
            let status = rx.wait_for(|status| done(status)).await.expect("status channel open");
            status.clone()
        })
        .await
        .expect("call reached the expected state")
    }

    async fn wait_terminal(&self, call: &CallId) -> CallStatus {
        self.wait_for(call, |status| status.state.is_terminal()).await
    }

    fn take_responder(&self) -> ResponderHandle {
        self.responders.lock().pop().expect("responder was started")
    }
}

#[tokio::test(start_paused = true)]
async fn verified_wake_leads_to_a_connected_call() {
    let rig = Rig::new(FakeBehavior::default());
    let ctx = ContextId::from("tab-1");

    let call = rig.orchestrator.invoke(&ctx, &rig.target).unwrap();
    let status = rig
        .wait_for(&call, |status| status.state == CallState::Connected)
        .await;

    let wake = status.wake_result.expect("wake result kept while live");
    assert!(wake.overall_verified);
    assert_eq!(wake.stages.len(), 3);
    assert!(wake.stages.iter().all(|stage| stage.verified));
    assert_eq!(
        rig.device.calls().iter().filter(|c| matches!(c, DeviceCall::LoadContent(_))).count(),
        1
    );
    assert!(rig.initiator_media.steps().contains(&NegotiationStep::AcceptedAnswer(call.clone())));

    rig.orchestrator
        .send_candidate(&call, json!({"candidate": "candidate:1 1 udp 1 10.0.0.2 5000 typ host"}))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig
        .target_media
        .steps()
        .iter()
        .any(|step| matches!(step, NegotiationStep::RemoteCandidate(id, _) if *id == call)));

    rig.orchestrator.end_call(&call).unwrap();
    let done = rig.wait_terminal(&call).await;
    assert_eq!(done.state, CallState::Ended);
    assert!(done.failure.is_none());
    assert_eq!(rig.device.count(&DeviceCall::PowerOff), 1);

    let outcome = rig.take_responder().outcome().await;
    assert_eq!(outcome, ResponderOutcome::Ended { by_peer: true });
    assert!(rig.orchestrator.active_call(&ctx).is_none());
}

#[tokio::test(start_paused = true)]
async fn unverified_foreground_stops_the_wake_before_content_load() {
    let rig = Rig::new(FakeBehavior {
        foreground_has_no_effect: true,
        ..FakeBehavior::default()
    });

    let call = rig.orchestrator.invoke(&ContextId::from("tab-1"), &rig.target).unwrap();
    let status = rig.wait_terminal(&call).await;

    assert_eq!(status.state, CallState::Failed);
    let failure = status.failure.expect("failure detail");
    assert_eq!(failure.kind, FailureKind::WakeVerificationFailed);
    assert_eq!(failure.phase, CallState::Waking);
    assert_eq!(failure.stage.as_deref(), Some("kiosk-foreground"));

    let calls = rig.device.calls();
    assert!(calls.contains(&DeviceCall::AppForeground));
    assert!(!calls.iter().any(|c| matches!(c, DeviceCall::LoadContent(_))));
    assert_eq!(rig.device.count(&DeviceCall::QueryApp), 3);
    // Early failures leave the display alone unless configured otherwise.
    assert_eq!(rig.device.count(&DeviceCall::PowerOff), 0);
    assert!(rig.responders.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn newer_context_supersedes_the_attempt_in_flight() {
    let rig = Rig::new(FakeBehavior::default());
    let first = ContextId::from("tab-a");
    let second = ContextId::from("tab-b");

    let call_a = rig.orchestrator.invoke(&first, &rig.target).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let call_b = rig.orchestrator.invoke(&second, &rig.target).unwrap();

    let superseded = rig.orchestrator.status(&call_a).unwrap();
    assert_eq!(superseded.state, CallState::Failed);
    let failure = superseded.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::OwnershipSuperseded);
    assert_eq!(failure.phase, CallState::Waking);

    let status = rig
        .wait_for(&call_b, |status| status.state == CallState::Connected)
        .await;
    assert_eq!(status.initiator_context_id, second);
    assert_eq!(rig.orchestrator.active_call(&second), Some(call_b.clone()));
    assert!(rig.orchestrator.active_call(&first).is_none());
    // Only the surviving attempt reached the content stage.
    assert_eq!(
        rig.device.calls().iter().filter(|c| matches!(c, DeviceCall::LoadContent(_))).count(),
        1
    );

    rig.orchestrator.shutdown().await;
    let after = rig.orchestrator.status(&call_b).unwrap();
    assert_eq!(after.state, CallState::Failed);
    assert_eq!(after.failure.unwrap().kind, FailureKind::Abandoned);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn silent_peer_fails_a_connected_call_without_powering_off() {
    let rig = Rig::new(FakeBehavior::default());
    let call = rig.orchestrator.invoke(&ContextId::from("tab-1"), &rig.target).unwrap();
    rig.wait_for(&call, |status| status.state == CallState::Connected)
        .await;

    // The display loses its relay link for good.
    rig.target_relay.supervisor().close();
    let lost_at = Instant::now();

    let status = rig.wait_terminal(&call).await;
    assert_eq!(status.state, CallState::Failed);
    let failure = status.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::PeerUnreachable);
    assert_eq!(failure.phase, CallState::Connected);
    assert!(lost_at.elapsed() >= Duration::from_secs(2));
    assert_eq!(rig.device.count(&DeviceCall::PowerOff), 0);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn retry_storm_after_wake_failure_is_throttled() {
    let rig = Rig::new(FakeBehavior {
        power_on_has_no_effect: true,
        ..FakeBehavior::default()
    });
    let ctx = ContextId::from("tab-1");

    let call = rig.orchestrator.invoke(&ctx, &rig.target).unwrap();
    let status = rig.wait_terminal(&call).await;
    assert_eq!(status.failure.unwrap().kind, FailureKind::WakeVerificationFailed);
    let failed_at = Instant::now();

    let mut accepted = Vec::new();
    let mut throttled = 0;
    for offset_ms in [100u64, 300, 500, 700, 900, 1_100, 1_300] {
        tokio::time::sleep_until(failed_at + Duration::from_millis(offset_ms)).await;
        match rig.orchestrator.invoke(&ctx, &rig.target) {
            Ok(call) => accepted.push((offset_ms, call)),
            Err(CallError::RetryTooSoon { retry_after, .. }) => {
                assert!(retry_after <= Duration::from_secs(1));
                throttled += 1;
            }
            Err(other) => panic!("unexpected invoke error: {other}"),
        }
    }

    assert_eq!(throttled, 6);
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].0, 1_100);
}

#[tokio::test(start_paused = true)]
async fn competing_contexts_never_leave_two_live_attempts() {
    let rig = Rig::new(FakeBehavior {
        probes_before_effect: 1,
        ..FakeBehavior::default()
    });
    let mut accepted = Vec::new();
    let mut throttled = 0;

    for i in 0..8u64 {
        let ctx = ContextId::new(format!("tab-{i}"));
        match rig.orchestrator.invoke(&ctx, &rig.target) {
            Ok(call) => accepted.push((ctx, call)),
            Err(CallError::RetryTooSoon { .. }) => throttled += 1,
            Err(other) => panic!("unexpected invoke error: {other}"),
        }
        let live = accepted
            .iter()
            .filter_map(|(_, call)| rig.orchestrator.status(call))
            .filter(|status| !status.state.is_terminal())
            .count();
        assert_eq!(live, 1, "after invoke {i}");
        tokio::time::sleep(Duration::from_millis(185 * (i % 3 + 1))).await;
    }
    assert!(accepted.len() >= 3);
    assert!(throttled >= 1);

    let ((owner, last), earlier) = accepted.split_last().unwrap();
    for (_, call) in earlier {
        let status = rig.orchestrator.status(call).unwrap();
        assert_eq!(status.failure.unwrap().kind, FailureKind::OwnershipSuperseded);
    }
    let status = rig
        .wait_for(last, |status| status.state == CallState::Connected)
        .await;
    assert_eq!(status.initiator_context_id, *owner);
}

#[tokio::test(start_paused = true)]
async fn alternating_tabs_cannot_dodge_the_retry_cooldown() {
    let rig = Rig::new(FakeBehavior::default());
    let tabs = [ContextId::from("tab-a"), ContextId::from("tab-b")];
    let started = Instant::now();
    let mut accepted = 0;
    let mut throttled = 0;

    for i in 0..10u64 {
        tokio::time::sleep_until(started + Duration::from_millis(50 * i)).await;
        match rig.orchestrator.invoke(&tabs[(i % 2) as usize], &rig.target) {
            Ok(_) => accepted += 1,
            Err(CallError::RetryTooSoon { .. }) => throttled += 1,
            Err(other) => panic!("unexpected invoke error: {other}"),
        }
    }

    // The first takeover supersedes the first attempt; that terminal
    // transition starts the window for everyone.
    assert_eq!(accepted, 2);
    assert_eq!(throttled, 8);
    assert_eq!(rig.device.count(&DeviceCall::PowerOn), 2);

    tokio::time::sleep_until(started + Duration::from_millis(1_100)).await;
    let call = rig.orchestrator.invoke(&tabs[0], &rig.target).unwrap();
    rig.wait_for(&call, |status| status.state == CallState::Connected)
        .await;
}

#[tokio::test(start_paused = true)]
async fn stalled_power_relay_fails_the_wake_and_frees_the_device() {
    let rig = Rig::new(FakeBehavior {
        stall_power_commands: true,
        ..FakeBehavior::default()
    });
    let ctx = ContextId::from("tab-1");

    let call = rig.orchestrator.invoke(&ctx, &rig.target).unwrap();
    tokio::time::sleep(Duration::from_secs(3_600)).await;
    let status = rig.orchestrator.status(&call).unwrap();
    assert_eq!(status.state, CallState::Failed);
    let failure = status.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::WakeVerificationFailed);
    assert_eq!(failure.stage.as_deref(), Some("display-power"));
    assert!(failure.detail.contains("trigger timed out"), "{}", failure.detail);

    // The device lock was released with the failed wake.
    rig.device.update_behavior(|b| b.stall_power_commands = false);
    let retry = rig.orchestrator.invoke(&ctx, &rig.target).unwrap();
    rig.wait_for(&retry, |status| status.state == CallState::Connected)
        .await;
}

#[tokio::test(start_paused = true)]
async fn stalled_power_off_still_releases_device_control() {
    let rig = Rig::new(FakeBehavior::default());
    let ctx = ContextId::from("tab-1");
    let call = rig.orchestrator.invoke(&ctx, &rig.target).unwrap();
    rig.wait_for(&call, |status| status.state == CallState::Connected)
        .await;

    rig.device.update_behavior(|b| b.stall_power_commands = true);
    rig.orchestrator.end_call(&call).unwrap();
    let done = rig.wait_terminal(&call).await;
    assert_eq!(done.state, CallState::Ended);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(rig.device.count(&DeviceCall::PowerOff), 1);
    assert!(rig.orchestrator.active_call(&ctx).is_none());
    assert!(rig.orchestrator.invoke(&ctx, &rig.target).is_ok());
}

#[tokio::test(start_paused = true)]
async fn early_failure_powers_off_when_configured() {
    let rig = Rig::with_config(
        FakeBehavior {
            foreground_has_no_effect: true,
            ..FakeBehavior::default()
        },
        CallConfig {
            power_off_on_early_failure: true,
            ..call_config()
        },
    );

    let call = rig.orchestrator.invoke(&ContextId::from("tab-1"), &rig.target).unwrap();
    let status = rig.wait_terminal(&call).await;
    let failure = status.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::WakeVerificationFailed);
    assert_eq!(failure.phase, CallState::Waking);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.device.count(&DeviceCall::PowerOff), 1);
    assert!(!rig.device.display_on());
}

#[tokio::test(start_paused = true)]
async fn superseded_attempt_never_powers_off_the_shared_display() {
    let rig = Rig::with_config(
        FakeBehavior::default(),
        CallConfig {
            power_off_on_early_failure: true,
            ..call_config()
        },
    );

    let call_a = rig.orchestrator.invoke(&ContextId::from("tab-a"), &rig.target).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let call_b = rig.orchestrator.invoke(&ContextId::from("tab-b"), &rig.target).unwrap();
    rig.wait_for(&call_b, |status| status.state == CallState::Connected)
        .await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let superseded = rig.orchestrator.status(&call_a).unwrap();
    assert_eq!(superseded.failure.unwrap().kind, FailureKind::OwnershipSuperseded);
    assert_eq!(rig.device.count(&DeviceCall::PowerOff), 0);
    assert!(rig.device.display_on());
}

#[tokio::test(start_paused = true)]
async fn power_on_inside_the_power_cycle_window_fails_with_device_cooldown() {
    let rig = Rig::with_config(
        FakeBehavior::default(),
        CallConfig {
            power_off_on_early_failure: true,
            ..call_config()
        },
    );
    let ctx = ContextId::from("tab-1");

    let first = rig.orchestrator.invoke(&ctx, &rig.target).unwrap();
    rig.wait_for(&first, |status| status.state == CallState::Connected)
        .await;
    rig.orchestrator.end_call(&first).unwrap();
    rig.wait_terminal(&first).await;
    // Past the retry cooldown (1s) but inside the power-cycle window (2s).
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(rig.device.count(&DeviceCall::PowerOff), 1);
    let second = rig.orchestrator.invoke(&ctx, &rig.target).unwrap();
    let status = rig.wait_terminal(&second).await;
    assert_eq!(status.state, CallState::Failed);
    let failure = status.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::DeviceCooldown);
    assert_eq!(failure.phase, CallState::Waking);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.device.count(&DeviceCall::PowerOn), 1);
    assert_eq!(rig.device.count(&DeviceCall::PowerOff), 1);
}

#[tokio::test(start_paused = true)]
async fn relay_restart_during_a_connected_call_is_peer_loss() {
    let rig = Rig::new(FakeBehavior::default());
    let call = rig.orchestrator.invoke(&ContextId::from("tab-1"), &rig.target).unwrap();
    rig.wait_for(&call, |status| status.state == CallState::Connected)
        .await;

    let restarted_at = Instant::now();
    rig.hub.restart();
    let status = rig.wait_terminal(&call).await;

    assert_eq!(status.state, CallState::Failed);
    let failure = status.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::PeerUnreachable);
    assert_eq!(failure.phase, CallState::Connected);
    assert!(failure.detail.contains("RelayRestarted"), "{}", failure.detail);
    // Reported on reconnect, well before any heartbeat timeout.
    assert!(restarted_at.elapsed() < Duration::from_secs(1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.device.count(&DeviceCall::PowerOff), 0);
}
