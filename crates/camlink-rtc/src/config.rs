use std::time::Duration;

use camlink_common::helpers::{env_duration_ms, env_list};
use camlink_common::Result;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Timing knobs for the control channel and the negotiation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingConfig {
    /// Fixed delay before the single reconnect attempt after a drop.
    pub reconnect_delay: Duration,
    /// Period between `ping` frames while connected.
    pub heartbeat_interval: Duration,
    /// Silence after which a connected channel is treated as dropped.
    /// `None` keeps liveness observational only.
    pub liveness_timeout: Option<Duration>,
    /// Upper bound for every SDP or candidate operation.
    pub negotiation_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness_timeout: Some(DEFAULT_LIVENESS_TIMEOUT),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }
}

impl SignalingConfig {
    /// Defaults overridden by `CAMLINK_*_MS` environment variables.
    ///
    /// `CAMLINK_LIVENESS_TIMEOUT_MS=0` disables the liveness timeout.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(delay) = env_duration_ms("CAMLINK_RECONNECT_DELAY_MS")? {
            config.reconnect_delay = delay;
        }
        if let Some(interval) = env_duration_ms("CAMLINK_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval = interval;
        }
        if let Some(timeout) = env_duration_ms("CAMLINK_LIVENESS_TIMEOUT_MS")? {
            config.liveness_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(timeout) = env_duration_ms("CAMLINK_NEGOTIATION_TIMEOUT_MS")? {
            config.negotiation_timeout = timeout;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(camlink_common::Error::config(
                "heartbeat interval must be greater than zero",
            ));
        }
        if self.negotiation_timeout.is_zero() {
            return Err(camlink_common::Error::config(
                "negotiation timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Media transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    /// STUN/TURN URLs handed to the ICE agent.
    pub ice_servers: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl MediaConfig {
    /// Defaults overridden by `CAMLINK_ICE_SERVERS` (an empty value disables STUN).
    pub fn from_env() -> Self {
        match env_list("CAMLINK_ICE_SERVERS") {
            Some(ice_servers) => Self { ice_servers },
            None => Self::default(),
        }
    }
}
