use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::DeviceId;

/// Whether the device layer accepted a command. Acceptance says nothing about
/// whether the physical effect happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    pub accepted: bool,
}

impl CommandAck {
    pub const ACCEPTED: CommandAck = CommandAck { accepted: true };
    pub const REFUSED: CommandAck = CommandAck { accepted: false };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayState {
    pub on: bool,
}

/// What the kiosk app on the target reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppState {
    pub foreground: bool,
    pub content_url: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("device {0} is unreachable")]
    Unreachable(DeviceId),
    #[error("{capability} failed: {message}")]
    Failed {
        capability: &'static str,
        message: String,
    },
    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),
}

/// Black-box device control surface (home-automation scripts, kiosk app API).
/// Every call may be slow or flaky; none of them guarantee an effect.
#[async_trait]
pub trait DeviceCapabilities: Send + Sync {
    async fn trigger_power_on(&self, device: &DeviceId) -> Result<CommandAck, CapabilityError>;

    async fn trigger_power_off(&self, device: &DeviceId) -> Result<CommandAck, CapabilityError>;

    async fn query_display_state(&self, device: &DeviceId)
        -> Result<DisplayState, CapabilityError>;

    async fn bring_app_foreground(&self, device: &DeviceId)
        -> Result<CommandAck, CapabilityError>;

    async fn load_content(
        &self,
        device: &DeviceId,
        url: &str,
    ) -> Result<CommandAck, CapabilityError>;

    async fn query_app_state(&self, device: &DeviceId) -> Result<AppState, CapabilityError>;
}
