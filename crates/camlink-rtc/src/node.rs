use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use camlink_common::protocol::SignalingEndpoint;

use crate::config::SignalingConfig;
use crate::coordinator::{Coordinator, CoordinatorInputs};
use crate::error::TransportError;
use crate::media::MediaConnector;
use crate::registry::SessionRegistry;
use crate::transport::SignalingTransport;

/// A device on the signaling network: control channel, sessions and the
/// dispatch loop between them.
pub struct SignalingNode {
    transport: SignalingTransport,
    coordinator: Arc<Coordinator>,
    dispatch: JoinHandle<()>,
}

impl SignalingNode {
    /// Starts the dispatch loop and dials the signaling server.
    pub fn start(
        server_url: &str,
        endpoint: SignalingEndpoint,
        config: SignalingConfig,
        connector: Arc<dyn MediaConnector>,
    ) -> Result<Self, TransportError> {
        let negotiation_timeout = config.negotiation_timeout;
        let (transport, inbound) = SignalingTransport::new(config)?;
        let (registry, session_events) = SessionRegistry::new(connector, negotiation_timeout);
        let coordinator = Coordinator::new(
            endpoint.clone(),
            Arc::new(transport.clone()),
            Arc::new(registry),
        );
        let dispatch = coordinator.spawn(CoordinatorInputs {
            inbound,
            session_events,
            transport_status: transport.subscribe(),
        });

        if let Err(e) = transport.connect(server_url, endpoint) {
            dispatch.abort();
            return Err(e);
        }
        info!("signaling node started against {}", server_url);

        Ok(Self {
            transport,
            coordinator,
            dispatch,
        })
    }

    pub fn transport(&self) -> &SignalingTransport {
        &self.transport
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.coordinator.registry()
    }

    /// Closes every session, the control channel and the dispatch loop.
    pub fn shutdown(self) {
        self.coordinator.shutdown();
        self.dispatch.abort();
        info!("signaling node stopped");
    }
}
