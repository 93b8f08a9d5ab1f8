//! In-memory stand-ins for the device layer and media stack.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::call::{MediaNegotiator, NegotiationError};
use crate::device::{AppState, CapabilityError, CommandAck, DeviceCapabilities, DisplayState};
use crate::ids::{CallId, DeviceId};

/// How a `FakeDevice` misbehaves.
#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    /// Power-on is acknowledged but the panel stays dark.
    pub power_on_has_no_effect: bool,
    pub foreground_has_no_effect: bool,
    pub content_has_no_effect: bool,
    pub refuse_commands: bool,
    pub unreachable: bool,
    /// Probes that still report the old state after an effective trigger.
    pub probes_before_effect: u32,
    pub probe_delay: Option<Duration>,
    /// Power commands are recorded but never answer.
    pub stall_power_commands: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    PowerOn,
    PowerOff,
    QueryDisplay,
    AppForeground,
    LoadContent(String),
    QueryApp,
}

#[derive(Default)]
struct FakeState {
    display_on: bool,
    foreground: bool,
    content_url: Option<String>,
    pending_display: Option<(bool, u32)>,
    pending_foreground: Option<(bool, u32)>,
    pending_content: Option<(Option<String>, u32)>,
    calls: Vec<DeviceCall>,
}

fn settle<T>(current: &mut T, pending: &mut Option<(T, u32)>) {
    match pending.take() {
        Some((value, 0)) => *current = value,
        Some((value, left)) => *pending = Some((value, left - 1)),
        None => {}
    }
}

type ContentHook = Arc<dyn Fn(&DeviceId, &str) + Send + Sync>;

/// A display device with scriptable false positives.
#[derive(Default)]
pub struct FakeDevice {
    behavior: Mutex<FakeBehavior>,
    state: Mutex<FakeState>,
    content_hook: Mutex<Option<ContentHook>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: FakeBehavior) -> Self {
        let device = Self::default();
        *device.behavior.lock() = behavior;
        device
    }

    pub fn update_behavior(&self, f: impl FnOnce(&mut FakeBehavior)) {
        f(&mut self.behavior.lock());
    }

    /// Runs `hook` whenever a content load takes effect.
    pub fn on_content_loaded<F>(&self, hook: F)
    where
        F: Fn(&DeviceId, &str) + Send + Sync + 'static,
    {
        *self.content_hook.lock() = Some(Arc::new(hook));
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &DeviceCall) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn display_on(&self) -> bool {
        self.state.lock().display_on
    }

    fn behavior(&self) -> FakeBehavior {
        self.behavior.lock().clone()
    }

    fn command(
        &self,
        device: &DeviceId,
        call: DeviceCall,
        apply: impl FnOnce(&mut FakeState, &FakeBehavior),
    ) -> Result<CommandAck, CapabilityError> {
        let behavior = self.behavior();
        let mut state = self.state.lock();
        state.calls.push(call);
        if behavior.unreachable {
            return Err(CapabilityError::Unreachable(device.clone()));
        }
        if behavior.refuse_commands {
            return Ok(CommandAck::REFUSED);
        }
        apply(&mut state, &behavior);
        Ok(CommandAck::ACCEPTED)
    }

    async fn stall_power(&self, call: DeviceCall) {
        if self.behavior().stall_power_commands {
            self.state.lock().calls.push(call);
            std::future::pending::<()>().await;
        }
    }

    async fn probe<T>(
        &self,
        device: &DeviceId,
        call: DeviceCall,
        read: impl FnOnce(&mut FakeState) -> T,
    ) -> Result<T, CapabilityError> {
        let behavior = self.behavior();
        if let Some(delay) = behavior.probe_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.calls.push(call);
        if behavior.unreachable {
            return Err(CapabilityError::Unreachable(device.clone()));
        }
        Ok(read(&mut state))
    }
}

#[async_trait]
impl DeviceCapabilities for FakeDevice {
    async fn trigger_power_on(&self, device: &DeviceId) -> Result<CommandAck, CapabilityError> {
        self.stall_power(DeviceCall::PowerOn).await;
        self.command(device, DeviceCall::PowerOn, |state, behavior| {
            if !behavior.power_on_has_no_effect {
                state.pending_display = Some((true, behavior.probes_before_effect));
            }
        })
    }

    async fn trigger_power_off(&self, device: &DeviceId) -> Result<CommandAck, CapabilityError> {
        self.stall_power(DeviceCall::PowerOff).await;
        self.command(device, DeviceCall::PowerOff, |state, _| {
            state.display_on = false;
            state.foreground = false;
            state.content_url = None;
            state.pending_display = None;
            state.pending_foreground = None;
            state.pending_content = None;
        })
    }

    async fn query_display_state(
        &self,
        device: &DeviceId,
    ) -> Result<DisplayState, CapabilityError> {
        self.probe(device, DeviceCall::QueryDisplay, |state| {
            settle(&mut state.display_on, &mut state.pending_display);
            DisplayState {
                on: state.display_on,
            }
        })
        .await
    }

    async fn bring_app_foreground(
        &self,
        device: &DeviceId,
    ) -> Result<CommandAck, CapabilityError> {
        self.command(device, DeviceCall::AppForeground, |state, behavior| {
            if !behavior.foreground_has_no_effect {
                state.pending_foreground = Some((true, behavior.probes_before_effect));
            }
        })
    }

    async fn load_content(&self, device: &DeviceId, url: &str) -> Result<CommandAck, CapabilityError> {
        let mut effective = false;
        let ack = self.command(device, DeviceCall::LoadContent(url.to_string()), |state, behavior| {
            if !behavior.content_has_no_effect {
                state.pending_content = Some((Some(url.to_string()), behavior.probes_before_effect));
                effective = true;
            }
        })?;
        if effective {
            let hook = self.content_hook.lock().clone();
            if let Some(hook) = hook {
                hook(device, url);
            }
        }
        Ok(ack)
    }

    async fn query_app_state(&self, device: &DeviceId) -> Result<AppState, CapabilityError> {
        self.probe(device, DeviceCall::QueryApp, |state| {
            settle(&mut state.foreground, &mut state.pending_foreground);
            settle(&mut state.content_url, &mut state.pending_content);
            AppState {
                foreground: state.foreground,
                content_url: state.content_url.clone(),
            }
        })
        .await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationStep {
    Offer(CallId),
    Answer(CallId),
    AcceptedAnswer(CallId),
    RemoteCandidate(CallId, Value),
    Closed(CallId),
}

/// Produces fake SDP blobs and records what it was asked to do.
#[derive(Default)]
pub struct ScriptedNegotiator {
    fail_offers: AtomicBool,
    reject_answers: AtomicBool,
    steps: Mutex<Vec<NegotiationStep>>,
}

impl ScriptedNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn reject_answers(&self, reject: bool) {
        self.reject_answers.store(reject, Ordering::SeqCst);
    }

    pub fn steps(&self) -> Vec<NegotiationStep> {
        self.steps.lock().clone()
    }

    fn record(&self, step: NegotiationStep) {
        self.steps.lock().push(step);
    }
}

#[async_trait]
impl MediaNegotiator for ScriptedNegotiator {
    async fn create_offer(&self, call_id: &CallId) -> Result<Value, NegotiationError> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(NegotiationError::Failed("no local media".into()));
        }
        self.record(NegotiationStep::Offer(call_id.clone()));
        Ok(json!({"type": "offer", "sdp": format!("v=0 o=initiator {call_id}")}))
    }

    async fn accept_answer(&self, call_id: &CallId, answer: &Value) -> Result<(), NegotiationError> {
        if self.reject_answers.load(Ordering::SeqCst) || answer["type"] != "answer" {
            return Err(NegotiationError::InvalidDescription(answer.to_string()));
        }
        self.record(NegotiationStep::AcceptedAnswer(call_id.clone()));
        Ok(())
    }

    async fn create_answer(&self, call_id: &CallId, offer: &Value) -> Result<Value, NegotiationError> {
        if offer["type"] != "offer" {
            return Err(NegotiationError::InvalidDescription(offer.to_string()));
        }
        self.record(NegotiationStep::Answer(call_id.clone()));
        Ok(json!({"type": "answer", "sdp": format!("v=0 o=target {call_id}")}))
    }

    async fn add_remote_candidate(
        &self,
        call_id: &CallId,
        candidate: &Value,
    ) -> Result<(), NegotiationError> {
        self.record(NegotiationStep::RemoteCandidate(call_id.clone(), candidate.clone()));
        Ok(())
    }

    async fn close(&self, call_id: &CallId) {
        self.record(NegotiationStep::Closed(call_id.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acknowledged_power_on_can_leave_the_display_dark() {
        let device = FakeDevice::with_behavior(FakeBehavior {
            power_on_has_no_effect: true,
            ..FakeBehavior::default()
        });
        let id = DeviceId::from("tv");
        assert_eq!(device.trigger_power_on(&id).await.unwrap(), CommandAck::ACCEPTED);
        assert!(!device.query_display_state(&id).await.unwrap().on);
    }

    #[tokio::test]
    async fn effects_show_up_after_the_scripted_number_of_probes() {
        let device = FakeDevice::with_behavior(FakeBehavior {
            probes_before_effect: 2,
            ..FakeBehavior::default()
        });
        let id = DeviceId::from("tv");
        device.trigger_power_on(&id).await.unwrap();
        let seen: Vec<bool> = {
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(device.query_display_state(&id).await.unwrap().on);
            }
            seen
        };
        assert_eq!(seen, vec![false, false, true]);
        device.trigger_power_off(&id).await.unwrap();
        assert!(!device.display_on());
        assert_eq!(device.count(&DeviceCall::QueryDisplay), 3);
    }
}
