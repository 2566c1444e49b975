//! JSON wire protocol spoken over the signaling control channel.
//!
//! Every frame is a single JSON object discriminated by its `type` field.
//! Field names are fixed by the server and are camelCase on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Which side of the pairing a device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Camera,
    Viewer,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Camera => f.write_str("camera"),
            Self::Viewer => f.write_str("viewer"),
        }
    }
}

/// Identity of this device on the signaling server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEndpoint {
    pub local_device_id: String,
    pub role: DeviceRole,
}

impl SignalingEndpoint {
    pub fn new(local_device_id: impl Into<String>, role: DeviceRole) -> Self {
        Self {
            local_device_id: local_device_id.into(),
            role,
        }
    }

    /// The registration frame sent as soon as the control channel opens.
    pub fn registration(&self) -> SignalingMessage {
        SignalingMessage::Register {
            device_id: self.local_device_id.clone(),
            device_type: self.role,
        }
    }
}

/// A message on the signaling control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        device_id: String,
        device_type: DeviceRole,
    },

    Offer {
        #[serde(rename = "fromDeviceId")]
        from: String,
        #[serde(rename = "toDeviceId")]
        to: String,
        sdp: String,
    },

    Answer {
        #[serde(rename = "fromDeviceId")]
        from: String,
        #[serde(rename = "toDeviceId")]
        to: String,
        sdp: String,
    },

    IceCandidate {
        #[serde(rename = "fromDeviceId")]
        from: String,
        #[serde(rename = "toDeviceId")]
        to: String,
        candidate: String,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: u16,
        #[serde(rename = "sdpMid")]
        sdp_mid: String,
    },

    DeviceList {
        devices: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    DeviceOnline {
        device_id: String,
        device_name: String,
    },

    #[serde(rename_all = "camelCase")]
    DeviceOffline { device_id: String },

    Ping {
        #[serde(rename = "fromDeviceId")]
        from: String,
    },

    Pong {
        #[serde(rename = "fromDeviceId")]
        from: String,
    },

    GetDevices {
        #[serde(rename = "fromDeviceId")]
        from: String,
    },

    /// Anything that did not match the schema. Never sent.
    #[serde(skip)]
    Unknown { raw: String },
}

impl SignalingMessage {
    /// The wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::DeviceList { .. } => "device-list",
            Self::DeviceOnline { .. } => "device-online",
            Self::DeviceOffline { .. } => "device-offline",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::GetDevices { .. } => "get-devices",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// The remote device a negotiation message originates from.
    pub fn negotiation_peer(&self) -> Option<&str> {
        match self {
            Self::Offer { from, .. } | Self::Answer { from, .. } | Self::IceCandidate { from, .. } => {
                Some(from)
            }
            _ => None,
        }
    }
}

/// Decodes one inbound frame. Malformed or unrecognized input becomes
/// [`SignalingMessage::Unknown`] instead of an error.
pub fn decode(text: &str) -> SignalingMessage {
    match serde_json::from_str::<SignalingMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            debug!("unrecognized signaling frame: {}", err);
            SignalingMessage::Unknown {
                raw: text.to_string(),
            }
        }
    }
}

/// Encodes one outbound frame.
pub fn encode(message: &SignalingMessage) -> Result<String> {
    if let SignalingMessage::Unknown { .. } = message {
        return Err(Error::protocol("unrecognized messages cannot be sent"));
    }
    Ok(serde_json::to_string(message)?)
}
