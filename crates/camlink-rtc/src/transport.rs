//! Persistent control channel to the signaling server.
//!
//! One supervisor task owns the WebSocket: it registers the device, pumps
//! inbound frames into the message stream, drains the outbound queue, sends
//! heartbeats and, after a drop, sleeps once for the reconnect delay before
//! dialling again. `disconnect()` and a new `connect()` abort that task, which
//! cancels the heartbeat and any pending reconnect in one step.

use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use camlink_common::protocol::{decode, encode, SignalingEndpoint, SignalingMessage};

use crate::config::SignalingConfig;
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State of the control channel, or of one peer's media path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Control channel only: the last dial or socket failed.
    Error,
    /// Peer sessions only: ICE could not establish a path.
    Failed,
}

/// Anything that can carry outbound signaling frames.
pub trait SignalSink: Send + Sync {
    /// Best-effort send; frames are dropped, not queued, while disconnected.
    fn send(&self, message: SignalingMessage) -> Result<(), TransportError>;

    /// Releases the channel. The default does nothing.
    fn close(&self) {}
}

/// Handle to the signaling control channel. Cheap to clone.
#[derive(Clone)]
pub struct SignalingTransport {
    shared: Arc<Shared>,
}

struct Shared {
    config: SignalingConfig,
    status: watch::Sender<ConnectionStatus>,
    inbound: mpsc::UnboundedSender<SignalingMessage>,
    link: Mutex<Link>,
}

#[derive(Default)]
struct Link {
    generation: u64,
    supervisor: Option<JoinHandle<()>>,
    outgoing: Option<mpsc::UnboundedSender<WsMessage>>,
}

impl SignalingTransport {
    /// Creates an idle transport and the stream its inbound messages arrive on.
    ///
    /// Rejects configs whose timers could never run, such as a zero heartbeat.
    pub fn new(
        config: SignalingConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingMessage>), TransportError> {
        config.validate()?;
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let shared = Arc::new(Shared {
            config,
            status,
            inbound,
            link: Mutex::new(Link::default()),
        });
        Ok((Self { shared }, inbound_rx))
    }

    /// Opens (or re-opens) the control channel in the background.
    ///
    /// Any previous connection is torn down first, even when the new URL is
    /// then rejected. Network failures never surface here: they show up on the
    /// status stream and are retried. Only a URL that can never work is an error.
    pub fn connect(&self, server_url: &str, endpoint: SignalingEndpoint) -> Result<(), TransportError> {
        self.disconnect();
        validate_signaling_url(server_url)?;

        let mut link = self.shared.link.lock();
        link.generation += 1;
        let supervisor = Supervisor {
            shared: Arc::downgrade(&self.shared),
            config: self.shared.config.clone(),
            url: server_url.to_string(),
            endpoint,
            generation: link.generation,
        };
        link.supervisor = Some(tokio::spawn(supervisor.run()));
        Ok(())
    }

    /// Closes the channel and cancels heartbeat and reconnect timers.
    /// Safe to call any number of times.
    pub fn disconnect(&self) {
        let mut link = self.shared.link.lock();
        link.generation += 1;
        link.outgoing = None;
        if let Some(task) = link.supervisor.take() {
            task.abort();
            info!("signaling transport disconnected");
        }
        self.shared.set_status(ConnectionStatus::Disconnected);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Status change notifications for UI collaborators.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.shared.config
    }
}

impl SignalSink for SignalingTransport {
    fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        let text = encode(&message)?;
        let link = self.shared.link.lock();
        let outgoing = match (&link.outgoing, self.status()) {
            (Some(tx), ConnectionStatus::Connected) => tx,
            (_, status) => {
                warn!(
                    "dropping outbound {} frame: signaling channel is {:?}",
                    message.kind(),
                    status
                );
                return Err(TransportError::NotConnected);
            }
        };
        outgoing
            .send(WsMessage::Text(text))
            .map_err(|_| TransportError::Closed)?;
        debug!("queued outbound {} frame", message.kind());
        Ok(())
    }

    fn close(&self) {
        self.disconnect();
    }
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            info!("signaling status {:?} -> {:?}", previous, status);
        }
    }

    /// Publishes a status on behalf of a supervisor. Stale supervisors are ignored.
    fn publish(&self, generation: u64, status: ConnectionStatus) -> bool {
        let link = self.link.lock();
        if link.generation != generation {
            return false;
        }
        self.set_status(status);
        true
    }

    fn attach(&self, generation: u64, outgoing: mpsc::UnboundedSender<WsMessage>) -> bool {
        let mut link = self.link.lock();
        if link.generation != generation {
            return false;
        }
        link.outgoing = Some(outgoing);
        self.set_status(ConnectionStatus::Connected);
        true
    }

    fn detach(&self, generation: u64) {
        let mut link = self.link.lock();
        if link.generation == generation {
            link.outgoing = None;
        }
    }

    /// The scheduled reconnect only fires if nothing superseded it.
    fn should_reconnect(&self, generation: u64) -> bool {
        let link = self.link.lock();
        link.generation == generation
            && matches!(
                *self.status.borrow(),
                ConnectionStatus::Disconnected | ConnectionStatus::Error
            )
    }
}

/// Why a live connection ended without a socket error.
#[derive(Debug, PartialEq, Eq)]
enum Closure {
    Remote,
    LivenessExpired,
    Released,
}

struct Supervisor {
    shared: Weak<Shared>,
    config: SignalingConfig,
    url: String,
    endpoint: SignalingEndpoint,
    generation: u64,
}

impl Supervisor {
    fn publish(&self, status: ConnectionStatus) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.publish(self.generation, status))
    }

    async fn run(self) {
        loop {
            if !self.publish(ConnectionStatus::Connecting) {
                return;
            }
            info!(
                "connecting to signaling server {} as {} ({})",
                self.url, self.endpoint.local_device_id, self.endpoint.role
            );

            let next = match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    let outcome = self.serve(ws).await;
                    if let Some(shared) = self.shared.upgrade() {
                        shared.detach(self.generation);
                    }
                    match outcome {
                        Ok(Closure::Released) => return,
                        Ok(closure) => {
                            info!("signaling connection ended: {:?}", closure);
                            ConnectionStatus::Disconnected
                        }
                        Err(e) => {
                            error!("signaling connection error: {}", e);
                            ConnectionStatus::Error
                        }
                    }
                }
                Err(e) => {
                    warn!("failed to connect to signaling server {}: {}", self.url, e);
                    ConnectionStatus::Error
                }
            };

            if !self.publish(next) {
                return;
            }
            info!(
                "scheduling signaling reconnect in {:?}",
                self.config.reconnect_delay
            );
            tokio::time::sleep(self.config.reconnect_delay).await;

            match self.shared.upgrade() {
                Some(shared) if shared.should_reconnect(self.generation) => {
                    info!("attempting signaling reconnect");
                }
                _ => {
                    debug!("scheduled reconnect superseded");
                    return;
                }
            }
        }
    }

    async fn serve(&self, ws: WsStream) -> Result<Closure, tungstenite::Error> {
        let (mut write, mut read) = ws.split();

        let registration = encode(&self.endpoint.registration()).map_err(protocol_error)?;
        write.send(WsMessage::Text(registration)).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        match self.shared.upgrade() {
            Some(shared) if shared.attach(self.generation, tx) => {}
            _ => return Ok(Closure::Released),
        }
        info!("registered with signaling server as {}", self.endpoint.local_device_id);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let ping = encode(&SignalingMessage::Ping {
            from: self.endpoint.local_device_id.clone(),
        })
        .map_err(protocol_error)?;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                frame = read.next() => {
                    let Some(frame) = frame else {
                        return Ok(Closure::Remote);
                    };
                    last_seen = Instant::now();
                    match frame? {
                        WsMessage::Text(text) => {
                            let message = decode(&text);
                            if let SignalingMessage::Unknown { raw } = &message {
                                warn!("unrecognized signaling frame ({} bytes)", raw.len());
                            }
                            let Some(shared) = self.shared.upgrade() else {
                                return Ok(Closure::Released);
                            };
                            if shared.inbound.send(message).is_err() {
                                debug!("inbound signaling stream has no receiver");
                            }
                        }
                        WsMessage::Close(frame) => {
                            debug!("signaling server closed the channel: {:?}", frame);
                            return Ok(Closure::Remote);
                        }
                        _ => {}
                    }
                }
                Some(outbound) = rx.recv() => {
                    write.send(outbound).await?;
                }
                _ = heartbeat.tick() => {
                    if let Some(limit) = self.config.liveness_timeout {
                        if last_seen.elapsed() > limit {
                            warn!("no signaling traffic for {:?}, dropping connection", limit);
                            let _ = write.send(WsMessage::Close(None)).await;
                            return Ok(Closure::LivenessExpired);
                        }
                    }
                    debug!("sending heartbeat ping");
                    write.send(WsMessage::Text(ping.clone())).await?;
                }
            }
        }
    }
}

fn protocol_error(err: camlink_common::Error) -> tungstenite::Error {
    tungstenite::Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        err.to_string(),
    ))
}

/// Only `ws://` and `wss://` URLs with a host can ever succeed.
pub fn validate_signaling_url(server_url: &str) -> Result<(), TransportError> {
    let invalid = |reason: &str| TransportError::InvalidUrl {
        url: server_url.to_string(),
        reason: reason.to_string(),
    };
    let parsed = url::Url::parse(server_url.trim()).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(invalid("scheme must be ws or wss"));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use camlink_common::protocol::DeviceRole;

    #[test]
    fn test_validate_signaling_url() {
        assert!(validate_signaling_url("ws://localhost:8080").is_ok());
        assert!(validate_signaling_url("wss://signal.example.com/ws").is_ok());
        assert!(validate_signaling_url("http://localhost:8080").is_err());
        assert!(validate_signaling_url("localhost:8080").is_err());
        assert!(validate_signaling_url("").is_err());
    }

    #[tokio::test]
    async fn test_send_dropped_while_disconnected() {
        let (transport, _inbound) = SignalingTransport::new(SignalingConfig::default()).unwrap();
        let result = transport.send(SignalingMessage::Ping { from: "cam".into() });
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_harmless() {
        let (transport, _inbound) = SignalingTransport::new(SignalingConfig::default()).unwrap();
        transport.disconnect();
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
        transport.disconnect();
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_url_leaves_transport_idle() {
        let (transport, _inbound) = SignalingTransport::new(SignalingConfig::default()).unwrap();
        let endpoint = SignalingEndpoint::new("viewer-1", DeviceRole::Viewer);
        assert!(matches!(
            transport.connect("tcp://nowhere", endpoint),
            Err(TransportError::InvalidUrl { .. })
        ));
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_zero_heartbeat_config_rejected() {
        let config = SignalingConfig {
            heartbeat_interval: Duration::ZERO,
            ..SignalingConfig::default()
        };
        assert!(matches!(
            SignalingTransport::new(config),
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_message_not_sent() {
        let (transport, _inbound) = SignalingTransport::new(SignalingConfig::default()).unwrap();
        let result = transport.send(SignalingMessage::Unknown { raw: "{}".into() });
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }
}
