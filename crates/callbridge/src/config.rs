use std::env;
use std::time::Duration;

use crate::wake::CooldownMode;

/// Top-level settings for an initiating device. Every value can be overridden
/// through `CALLBRIDGE_*` environment variables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub log_filter: String,
    pub relay_url: String,
    pub call: CallConfig,
    pub wake: WakeConfig,
    pub relay: RelayConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Minimum gap between attempts against the same target device.
    pub retry_cooldown_ms: u64,
    pub peer_ready_timeout_ms: u64,
    pub signaling_timeout_ms: u64,
    /// How long a superseded attempt gets to unwind before its task is aborted.
    pub cancel_grace_ms: u64,
    pub power_off_on_end: bool,
    pub power_off_on_early_failure: bool,
    /// Terminal attempts kept around for status queries.
    pub history_limit: usize,
}

#[derive(Debug, Clone)]
pub struct WakeConfig {
    pub verify_attempts: u32,
    pub verify_interval_ms: u64,
    /// When set, the verify interval doubles after each miss up to this cap.
    pub verify_max_interval_ms: Option<u64>,
    pub probe_timeout_ms: u64,
    /// Upper bound on any single device command (power, foreground, load).
    pub trigger_timeout_ms: u64,
    pub power_cycle_cooldown_ms: u64,
    pub cooldown_mode: CooldownMode,
    pub content_url_template: String,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub heartbeat_interval_ms: u64,
    pub peer_loss_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub buffer_limit: usize,
    pub connect_timeout_ms: u64,
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|val| matches!(val.trim(), "1" | "true" | "TRUE" | "yes" | "on"))
        .unwrap_or(default)
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            log_filter: env::var("RUST_LOG").unwrap_or_else(|_| "info,callbridge=debug".into()),
            relay_url: env::var("CALLBRIDGE_RELAY_URL")
                .unwrap_or_else(|_| "ws://localhost:8090".to_string()),
            call: CallConfig::from_env(),
            wake: WakeConfig::from_env(),
            relay: RelayConfig::from_env(),
            reconnect: ReconnectConfig::from_env(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,callbridge=debug".to_string(),
            relay_url: "ws://localhost:8090".to_string(),
            call: CallConfig::default(),
            wake: WakeConfig::default(),
            relay: RelayConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            retry_cooldown_ms: env_u64("CALLBRIDGE_RETRY_COOLDOWN_MS", d.retry_cooldown_ms),
            peer_ready_timeout_ms: env_u64(
                "CALLBRIDGE_PEER_READY_TIMEOUT_MS",
                d.peer_ready_timeout_ms,
            ),
            signaling_timeout_ms: env_u64("CALLBRIDGE_SIGNALING_TIMEOUT_MS", d.signaling_timeout_ms),
            cancel_grace_ms: env_u64("CALLBRIDGE_CANCEL_GRACE_MS", d.cancel_grace_ms),
            power_off_on_end: env_flag("CALLBRIDGE_POWER_OFF_ON_END", d.power_off_on_end),
            power_off_on_early_failure: env_flag(
                "CALLBRIDGE_POWER_OFF_ON_EARLY_FAILURE",
                d.power_off_on_early_failure,
            ),
            history_limit: env_u64("CALLBRIDGE_HISTORY_LIMIT", d.history_limit as u64) as usize,
        }
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.retry_cooldown_ms)
    }

    pub fn peer_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_ready_timeout_ms)
    }

    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            retry_cooldown_ms: 5_000,
            peer_ready_timeout_ms: 45_000,
            signaling_timeout_ms: 20_000,
            cancel_grace_ms: 2_000,
            power_off_on_end: true,
            power_off_on_early_failure: false,
            history_limit: 32,
        }
    }
}

impl WakeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let cooldown_mode = match env::var("CALLBRIDGE_POWER_COOLDOWN_MODE")
            .unwrap_or_default()
            .as_str()
        {
            "queue" => CooldownMode::Queue,
            "reject" => CooldownMode::Reject,
            _ => d.cooldown_mode,
        };
        Self {
            verify_attempts: env_u64("CALLBRIDGE_VERIFY_ATTEMPTS", d.verify_attempts as u64) as u32,
            verify_interval_ms: env_u64("CALLBRIDGE_VERIFY_INTERVAL_MS", d.verify_interval_ms),
            verify_max_interval_ms: env::var("CALLBRIDGE_VERIFY_MAX_INTERVAL_MS")
                .ok()
                .and_then(|val| val.parse().ok())
                .or(d.verify_max_interval_ms),
            probe_timeout_ms: env_u64("CALLBRIDGE_PROBE_TIMEOUT_MS", d.probe_timeout_ms),
            trigger_timeout_ms: env_u64("CALLBRIDGE_TRIGGER_TIMEOUT_MS", d.trigger_timeout_ms),
            power_cycle_cooldown_ms: env_u64(
                "CALLBRIDGE_POWER_CYCLE_COOLDOWN_MS",
                d.power_cycle_cooldown_ms,
            ),
            cooldown_mode,
            content_url_template: env::var("CALLBRIDGE_CONTENT_URL")
                .unwrap_or(d.content_url_template),
        }
    }

    pub fn power_cycle_cooldown(&self) -> Duration {
        Duration::from_millis(self.power_cycle_cooldown_ms)
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_timeout_ms)
    }
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            verify_attempts: 10,
            verify_interval_ms: 500,
            verify_max_interval_ms: Some(4_000),
            probe_timeout_ms: 2_000,
            trigger_timeout_ms: 5_000,
            power_cycle_cooldown_ms: 10_000,
            cooldown_mode: CooldownMode::Reject,
            content_url_template: "http://localhost:3111/call/{call_id}?device={device_id}"
                .to_string(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            heartbeat_interval_ms: env_u64(
                "CALLBRIDGE_HEARTBEAT_INTERVAL_MS",
                d.heartbeat_interval_ms,
            ),
            peer_loss_timeout_ms: env_u64("CALLBRIDGE_PEER_LOSS_TIMEOUT_MS", d.peer_loss_timeout_ms),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn peer_loss_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_loss_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            peer_loss_timeout_ms: 15_000,
        }
    }
}

impl ReconnectConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_delay_ms: env_u64("CALLBRIDGE_RECONNECT_BASE_MS", d.base_delay_ms),
            max_delay_ms: env_u64("CALLBRIDGE_RECONNECT_MAX_MS", d.max_delay_ms),
            buffer_limit: env_u64("CALLBRIDGE_RELAY_BUFFER_LIMIT", d.buffer_limit as u64) as usize,
            connect_timeout_ms: env_u64("CALLBRIDGE_CONNECT_TIMEOUT_MS", d.connect_timeout_ms),
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
            buffer_limit: 1_000,
            connect_timeout_ms: 5_000,
        }
    }
}
