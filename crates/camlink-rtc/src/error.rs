//! Error taxonomy for the signaling and negotiation layers.

use thiserror::Error;

/// Failures of the control channel to the signaling server.
///
/// Network failures are recovered locally by the reconnect loop. Callers see
/// this type from a best-effort send, or when a config or URL is rejected up front.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling channel is not connected")]
    NotConnected,

    #[error("invalid signaling URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("signaling channel closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] camlink_common::Error),
}

/// Failures while creating or applying session descriptions and candidates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("only the initiating side may create an offer")]
    NotInitiator,

    #[error("invalid negotiation state: {0}")]
    InvalidState(&'static str),

    #[error("peer session is closed")]
    Closed,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("session description failure: {0}")]
    Sdp(String),

    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    #[error("media transport failure: {0}")]
    Media(String),
}

/// Why an inbound message could not be delivered to a peer session.
///
/// Routing failures are logged and dropped by the coordinator; a disconnect
/// may legitimately race with a late message.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no session for device {0}")]
    UnknownDevice(String),

    #[error("message addressed to {0}, not this device")]
    Misaddressed(String),

    #[error("negotiation with {device_id} failed: {source}")]
    Negotiation {
        device_id: String,
        #[source]
        source: NegotiationError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RoutingError {
    pub(crate) fn negotiation(device_id: &str, source: NegotiationError) -> Self {
        Self::Negotiation {
            device_id: device_id.to_string(),
            source,
        }
    }
}
