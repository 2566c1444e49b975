pub mod config;
pub mod coordinator;
pub mod error;
pub mod media;
pub mod node;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::{MediaConfig, SignalingConfig};
pub use coordinator::{Coordinator, CoordinatorInputs, Roster};
pub use error::{NegotiationError, RoutingError, TransportError};
pub use media::{IceCandidate, MediaConnection, MediaConnector, RtcConnector};
pub use node::SignalingNode;
pub use registry::{AggregateStatus, SessionRegistry};
pub use session::{NegotiationState, PeerSession, SessionEvent, SessionEventKind};
pub use transport::{validate_signaling_url, ConnectionStatus, SignalSink, SignalingTransport};

pub use camlink_common::protocol::{DeviceRole, SignalingEndpoint, SignalingMessage};
