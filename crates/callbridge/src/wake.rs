//! Ordered, verified activation of a target display device.
//!
//! Each stage pairs a trigger with a probe. A stage counts as verified only
//! when the probe observes the physical effect; a trigger the device accepted
//! is recorded but proves nothing on its own (CEC will happily acknowledge a
//! power-on the panel never performs).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WakeConfig;
use crate::device::{CapabilityError, CommandAck, DeviceCapabilities};
use crate::ids::{CallId, DeviceId};
use crate::metrics;
use crate::ownership::{ClaimId, OwnershipArbiter, OwnershipClaim, Revocation};

/// What to do with a power-on that lands inside the power-cycle cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownMode {
    Reject,
    Queue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageTrigger {
    PowerOn,
    AppForeground,
    /// `{call_id}` and `{device_id}` are substituted before loading.
    LoadContent { url_template: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageProbe {
    DisplayOn,
    AppForeground,
    ContentLoaded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyDelay {
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub attempts: u32,
    pub delay: VerifyDelay,
    pub probe_timeout: Duration,
}

impl VerifyPolicy {
    /// Pause before probe number `attempt` (1-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        match &self.delay {
            VerifyDelay::Fixed(delay) => *delay,
            VerifyDelay::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(*max)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeStage {
    pub name: String,
    pub trigger: StageTrigger,
    pub probe: StageProbe,
    pub verify: VerifyPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WakePlan {
    stages: Vec<WakeStage>,
}

impl WakePlan {
    pub fn new(stages: Vec<WakeStage>) -> Self {
        Self { stages }
    }

    /// Power relay and display handshake, kiosk foreground, then content load.
    pub fn from_config(config: &WakeConfig) -> Self {
        let verify = VerifyPolicy {
            attempts: config.verify_attempts.max(1),
            delay: match config.verify_max_interval_ms {
                Some(max) => VerifyDelay::Exponential {
                    initial: Duration::from_millis(config.verify_interval_ms),
                    max: Duration::from_millis(max),
                },
                None => VerifyDelay::Fixed(Duration::from_millis(config.verify_interval_ms)),
            },
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        };
        Self::new(vec![
            WakeStage {
                name: "display-power".to_string(),
                trigger: StageTrigger::PowerOn,
                probe: StageProbe::DisplayOn,
                verify: verify.clone(),
            },
            WakeStage {
                name: "kiosk-foreground".to_string(),
                trigger: StageTrigger::AppForeground,
                probe: StageProbe::AppForeground,
                verify: verify.clone(),
            },
            WakeStage {
                name: "content-load".to_string(),
                trigger: StageTrigger::LoadContent {
                    url_template: config.content_url_template.clone(),
                },
                probe: StageProbe::ContentLoaded,
                verify,
            },
        ])
    }

    pub fn stages(&self) -> &[WakeStage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

pub fn render_content_url(template: &str, call_id: &CallId, device_id: &DeviceId) -> String {
    template
        .replace("{call_id}", call_id.as_str())
        .replace("{device_id}", device_id.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub name: String,
    pub requested_at: DateTime<Utc>,
    /// Set only when the device accepted the trigger.
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub verified: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WakeResult {
    pub device_id: DeviceId,
    pub stages: Vec<StageRecord>,
    pub overall_verified: bool,
}

impl WakeResult {
    /// First stage whose effect was not observed.
    pub fn failed_stage(&self) -> Option<&StageRecord> {
        self.stages.iter().find(|stage| !stage.verified)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WakeError {
    #[error("claim {claim_id} does not own device control for {device_id}")]
    NotOwner { device_id: DeviceId, claim_id: ClaimId },
    #[error("wake cancelled: {0:?}")]
    Cancelled(Revocation),
    #[error("device {device_id} was powered off recently; power-on allowed in {remaining:?}")]
    PowerCycleCooldown {
        device_id: DeviceId,
        remaining: Duration,
    },
    #[error("{command} on {device_id} did not answer within {after:?}")]
    CommandTimeout {
        device_id: DeviceId,
        command: &'static str,
        after: Duration,
    },
    #[error("wake plan has no stages")]
    EmptyPlan,
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// Sole mutator of target device power/display state.
pub struct WakeSequencer {
    device: Arc<dyn DeviceCapabilities>,
    arbiter: Arc<OwnershipArbiter>,
    power_cycle_cooldown: Duration,
    cooldown_mode: CooldownMode,
    trigger_timeout: Duration,
    /// Held for the whole of a wake or power-off on that device.
    slots: DashMap<DeviceId, Arc<AsyncMutex<()>>>,
    last_power_off: DashMap<DeviceId, Instant>,
}

async fn until_revoked<F: Future>(claim: &OwnershipClaim, fut: F) -> Result<F::Output, WakeError> {
    tokio::select! {
        biased;
        revocation = claim.revoked() => Err(WakeError::Cancelled(revocation)),
        out = fut => Ok(out),
    }
}

impl WakeSequencer {
    pub fn new(
        device: Arc<dyn DeviceCapabilities>,
        arbiter: Arc<OwnershipArbiter>,
        config: &WakeConfig,
    ) -> Self {
        Self {
            device,
            arbiter,
            power_cycle_cooldown: config.power_cycle_cooldown(),
            cooldown_mode: config.cooldown_mode,
            trigger_timeout: config.trigger_timeout(),
            slots: DashMap::new(),
            last_power_off: DashMap::new(),
        }
    }

    fn slot(&self, device_id: &DeviceId) -> Arc<AsyncMutex<()>> {
        self.slots
            .entry(device_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn last_power_off(&self, device_id: &DeviceId) -> Option<Instant> {
        self.last_power_off.get(device_id).map(|entry| *entry.value())
    }

    fn ensure_owner(&self, claim: &OwnershipClaim, device_id: &DeviceId) -> Result<(), WakeError> {
        if let Some(revocation) = claim.revocation() {
            return Err(WakeError::Cancelled(revocation));
        }
        if !self.arbiter.is_owner(claim) {
            return Err(WakeError::NotOwner {
                device_id: device_id.clone(),
                claim_id: claim.claim_id(),
            });
        }
        Ok(())
    }

    /// Runs `plan` against `target` on behalf of `claim`.
    ///
    /// Verification failure is a normal `Ok` result with `overall_verified`
    /// unset; errors are reserved for cancellation, ownership loss and the
    /// power-cycle guard.
    pub async fn wake(
        &self,
        claim: &OwnershipClaim,
        target: &DeviceId,
        plan: &WakePlan,
        call_id: &CallId,
    ) -> Result<WakeResult, WakeError> {
        if plan.is_empty() {
            return Err(WakeError::EmptyPlan);
        }
        self.ensure_owner(claim, target)?;

        let slot = self.slot(target);
        let guard = until_revoked(claim, slot.lock_owned()).await?;

        let mut result = WakeResult {
            device_id: target.clone(),
            stages: Vec::with_capacity(plan.len()),
            overall_verified: false,
        };

        for stage in plan.stages() {
            self.ensure_owner(claim, target)?;
            if stage.trigger == StageTrigger::PowerOn {
                self.respect_power_cycle(claim, target, self.last_power_off(target))
                    .await?;
            }

            let record = self.run_stage(claim, target, stage, call_id).await?;
            let verified = record.verified;
            metrics::WAKE_STAGES
                .with_label_values(&[stage.name.as_str(), if verified { "verified" } else { "unverified" }])
                .inc();
            result.stages.push(record);

            if !verified {
                warn!(
                    target = "callbridge::wake",
                    call_id = %call_id,
                    device = %target,
                    stage = %stage.name,
                    "stage effect not observed; halting wake sequence"
                );
                break;
            }
        }
        drop(guard);

        result.overall_verified =
            result.stages.len() == plan.len() && result.stages.iter().all(|s| s.verified);
        info!(
            target = "callbridge::wake",
            call_id = %call_id,
            device = %target,
            verified = result.overall_verified,
            stages_run = result.stages.len(),
            "wake sequence finished"
        );
        Ok(result)
    }

    async fn respect_power_cycle(
        &self,
        claim: &OwnershipClaim,
        target: &DeviceId,
        last_power_off: Option<Instant>,
    ) -> Result<(), WakeError> {
        let Some(off_at) = last_power_off else {
            return Ok(());
        };
        let elapsed = off_at.elapsed();
        if elapsed >= self.power_cycle_cooldown {
            return Ok(());
        }
        let remaining = self.power_cycle_cooldown - elapsed;
        match self.cooldown_mode {
            CooldownMode::Reject => Err(WakeError::PowerCycleCooldown {
                device_id: target.clone(),
                remaining,
            }),
            CooldownMode::Queue => {
                info!(
                    target = "callbridge::wake",
                    device = %target,
                    wait_ms = remaining.as_millis() as u64,
                    "power-on queued behind power-cycle cooldown"
                );
                until_revoked(claim, tokio::time::sleep(remaining)).await
            }
        }
    }

    async fn fire(
        &self,
        trigger: &StageTrigger,
        target: &DeviceId,
        call_id: &CallId,
    ) -> Result<CommandAck, CapabilityError> {
        match trigger {
            StageTrigger::PowerOn => self.device.trigger_power_on(target).await,
            StageTrigger::AppForeground => self.device.bring_app_foreground(target).await,
            StageTrigger::LoadContent { url_template } => {
                let url = render_content_url(url_template, call_id, target);
                self.device.load_content(target, &url).await
            }
        }
    }

    async fn observe(
        &self,
        probe: StageProbe,
        target: &DeviceId,
        expected_url: Option<&str>,
    ) -> Result<bool, CapabilityError> {
        match probe {
            StageProbe::DisplayOn => Ok(self.device.query_display_state(target).await?.on),
            StageProbe::AppForeground => Ok(self.device.query_app_state(target).await?.foreground),
            StageProbe::ContentLoaded => {
                let app = self.device.query_app_state(target).await?;
                Ok(match (expected_url, app.content_url.as_deref()) {
                    (Some(expected), Some(actual)) => expected == actual,
                    (None, Some(_)) => true,
                    (_, None) => false,
                })
            }
        }
    }

    async fn run_stage(
        &self,
        claim: &OwnershipClaim,
        target: &DeviceId,
        stage: &WakeStage,
        call_id: &CallId,
    ) -> Result<StageRecord, WakeError> {
        let mut record = StageRecord {
            name: stage.name.clone(),
            requested_at: Utc::now(),
            acknowledged_at: None,
            verified: false,
            attempts: 0,
            error: None,
        };

        let fire = tokio::time::timeout(
            self.trigger_timeout,
            self.fire(&stage.trigger, target, call_id),
        );
        let trigger_error = match until_revoked(claim, fire).await? {
            Ok(Ok(ack)) if ack.accepted => {
                record.acknowledged_at = Some(Utc::now());
                None
            }
            Ok(Ok(_)) => Some("trigger refused".to_string()),
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(format!("trigger timed out after {:?}", self.trigger_timeout)),
        };
        if let Some(error) = &trigger_error {
            debug!(
                target = "callbridge::wake",
                stage = %stage.name,
                error = %error,
                "trigger not acknowledged; probing anyway"
            );
        }

        let expected_url = match &stage.trigger {
            StageTrigger::LoadContent { url_template } => {
                Some(render_content_url(url_template, call_id, target))
            }
            _ => None,
        };

        let mut probe_error = None;
        for attempt in 1..=stage.verify.attempts {
            until_revoked(claim, tokio::time::sleep(stage.verify.delay_before(attempt))).await?;
            record.attempts = attempt;
            let probe = tokio::time::timeout(
                stage.verify.probe_timeout,
                self.observe(stage.probe, target, expected_url.as_deref()),
            );
            match until_revoked(claim, probe).await? {
                Ok(Ok(true)) => {
                    record.verified = true;
                    debug!(
                        target = "callbridge::wake",
                        stage = %stage.name,
                        attempt,
                        "stage effect observed"
                    );
                    return Ok(record);
                }
                Ok(Ok(false)) => probe_error = Some("effect not observed".to_string()),
                Ok(Err(err)) => probe_error = Some(err.to_string()),
                Err(_) => {
                    probe_error = Some(format!(
                        "probe timed out after {:?}",
                        stage.verify.probe_timeout
                    ))
                }
            }
        }
        record.error = match (trigger_error, probe_error) {
            (Some(trigger), Some(probe)) => Some(format!("{trigger}; {probe}")),
            (trigger, probe) => trigger.or(probe),
        };
        Ok(record)
    }

    /// Powers the target off and starts the power-cycle cooldown.
    pub async fn power_off(
        &self,
        claim: &OwnershipClaim,
        target: &DeviceId,
    ) -> Result<CommandAck, WakeError> {
        self.ensure_owner(claim, target)?;
        let slot = self.slot(target);
        let _guard = until_revoked(claim, slot.lock_owned()).await?;
        self.ensure_owner(claim, target)?;
        let outcome =
            tokio::time::timeout(self.trigger_timeout, self.device.trigger_power_off(target)).await;
        // The CEC race exists once the command is out, answered or not.
        self.last_power_off.insert(target.clone(), Instant::now());
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    target = "callbridge::wake",
                    device = %target,
                    timeout_ms = self.trigger_timeout.as_millis() as u64,
                    "power-off did not answer"
                );
                return Err(WakeError::CommandTimeout {
                    device_id: target.clone(),
                    command: "power-off",
                    after: self.trigger_timeout,
                });
            }
        };
        info!(
            target = "callbridge::wake",
            device = %target,
            accepted = outcome.as_ref().map(|ack| ack.accepted).unwrap_or(false),
            "power-off issued"
        );
        Ok(outcome?)
    }

    /// Time left before `target` may be powered on again, if any. Readable
    /// while a wake or power-off holds the device.
    pub fn power_cycle_remaining(&self, target: &DeviceId) -> Option<Duration> {
        let elapsed = self.last_power_off(target)?.elapsed();
        self.power_cycle_cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}
