use std::env;
use std::time::Duration;

use callbridge::relay::HubConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_filter: String,
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
    pub pending_limit: usize,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|val| val.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            port: env_parse("CALLBRIDGE_RELAY_PORT", d.port),
            log_filter: env::var("RUST_LOG").unwrap_or(d.log_filter),
            stale_after_secs: env_parse("CALLBRIDGE_RELAY_STALE_AFTER", d.stale_after_secs),
            sweep_interval_secs: env_parse("CALLBRIDGE_RELAY_SWEEP_INTERVAL", d.sweep_interval_secs),
            pending_limit: env_parse("CALLBRIDGE_RELAY_PENDING_LIMIT", d.pending_limit),
        }
    }

    pub fn hub(&self) -> HubConfig {
        HubConfig {
            stale_after: Duration::from_secs(self.stale_after_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            pending_limit: self.pending_limit.max(1),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8090,
            log_filter: "warn,callbridge=info,callbridge_relay=info".to_string(),
            stale_after_secs: 30,
            sweep_interval_secs: 10,
            pending_limit: 256,
        }
    }
}
