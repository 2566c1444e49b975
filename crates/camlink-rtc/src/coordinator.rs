//! Routes inbound signaling to peer sessions and session output back onto the
//! control channel.
//!
//! Negotiation messages are handled on one lane per remote device: messages
//! from the same device are processed in arrival order while different devices
//! negotiate concurrently. A lane exits once its queue is drained and no
//! session exists for its device, and is cancelled when the device goes
//! offline or is disconnected locally.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use camlink_common::protocol::{SignalingEndpoint, SignalingMessage};

use crate::error::{NegotiationError, RoutingError, TransportError};
use crate::media::IceCandidate;
use crate::registry::SessionRegistry;
use crate::session::{SessionEvent, SessionEventKind};
use crate::transport::{ConnectionStatus, SignalSink};

/// Online devices known from the signaling server, id to display name.
pub type Roster = BTreeMap<String, String>;

/// The streams a running coordinator consumes.
pub struct CoordinatorInputs {
    pub inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    pub session_events: mpsc::UnboundedReceiver<SessionEvent>,
    pub transport_status: watch::Receiver<ConnectionStatus>,
}

pub struct Coordinator {
    endpoint: SignalingEndpoint,
    sink: Arc<dyn SignalSink>,
    registry: Arc<SessionRegistry>,
    roster: watch::Sender<Roster>,
    unrecognized: Mutex<Option<mpsc::UnboundedSender<String>>>,
    lanes: Mutex<HashMap<String, Lane>>,
    next_lane: AtomicU64,
}

struct Lane {
    id: u64,
    queue: mpsc::UnboundedSender<SignalingMessage>,
    cancelled: Arc<AtomicBool>,
}

impl Lane {
    fn cancel(self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

enum LaneStep {
    Next(SignalingMessage),
    Wait,
    Exit,
}

impl Coordinator {
    pub fn new(
        endpoint: SignalingEndpoint,
        sink: Arc<dyn SignalSink>,
        registry: Arc<SessionRegistry>,
    ) -> Arc<Self> {
        let (roster, _) = watch::channel(Roster::new());
        Arc::new(Self {
            endpoint,
            sink,
            registry,
            roster,
            unrecognized: Mutex::new(None),
            lanes: Mutex::new(HashMap::new()),
            next_lane: AtomicU64::new(0),
        })
    }

    pub fn local_device_id(&self) -> &str {
        &self.endpoint.local_device_id
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Devices currently announced online by the server.
    pub fn roster(&self) -> watch::Receiver<Roster> {
        self.roster.subscribe()
    }

    /// Raw frames whose type this client does not understand.
    pub fn set_unrecognized_sink(&self, sink: mpsc::UnboundedSender<String>) {
        *self.unrecognized.lock() = Some(sink);
    }

    /// Spawns the dispatch loop.
    pub fn spawn(self: &Arc<Self>, inputs: CoordinatorInputs) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(inputs))
    }

    async fn run(self: Arc<Self>, mut inputs: CoordinatorInputs) {
        loop {
            tokio::select! {
                message = inputs.inbound.recv() => {
                    let Some(message) = message else {
                        debug!("inbound signaling stream ended");
                        break;
                    };
                    self.dispatch(message);
                }
                Some(event) = inputs.session_events.recv() => {
                    self.handle_session_event(event);
                }
                changed = inputs.transport_status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *inputs.transport_status.borrow_and_update();
                    if matches!(status, ConnectionStatus::Disconnected | ConnectionStatus::Error) {
                        self.clear_roster();
                    }
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: SignalingMessage) {
        let Some(peer) = message.negotiation_peer().map(str::to_string) else {
            self.handle_control(message);
            return;
        };

        let mut lanes = self.lanes.lock();
        let message = match lanes.get(&peer) {
            Some(lane) => match lane.queue.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };
        let lane = self.spawn_lane(&peer);
        let _ = lane.queue.send(message);
        lanes.insert(peer, lane);
    }

    fn spawn_lane(self: &Arc<Self>, peer: &str) -> Lane {
        let (queue, rx) = mpsc::unbounded_channel();
        let lane = Lane {
            id: self.next_lane.fetch_add(1, Ordering::Relaxed),
            queue,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        tokio::spawn(Arc::clone(self).run_lane(
            peer.to_string(),
            lane.id,
            Arc::clone(&lane.cancelled),
            rx,
        ));
        lane
    }

    async fn run_lane(
        self: Arc<Self>,
        peer: String,
        lane_id: u64,
        cancelled: Arc<AtomicBool>,
        mut rx: mpsc::UnboundedReceiver<SignalingMessage>,
    ) {
        let mut next = rx.recv().await;
        while let Some(message) = next.take() {
            if cancelled.load(Ordering::Acquire) {
                debug!("discarding queued {} frame from {}", message.kind(), peer);
                break;
            }
            if let Err(e) = self.route(message).await {
                warn!("dropping {} message: {}", peer, e);
            }
            if cancelled.load(Ordering::Acquire) {
                // Cancelled mid-route: whatever the route opened is stale.
                if self.registry.remove(&peer) {
                    info!("closed session with departed device {}", peer);
                }
                break;
            }
            next = match self.lane_step(&peer, lane_id, &mut rx) {
                LaneStep::Next(message) => Some(message),
                LaneStep::Wait => rx.recv().await,
                LaneStep::Exit => None,
            };
        }
        debug!("negotiation lane for {} closed", peer);
    }

    /// Decides whether an idle lane keeps waiting. Lanes without a session
    /// unlink themselves; the check runs under the lanes lock so a frame
    /// queued by `dispatch` is never stranded.
    fn lane_step(
        &self,
        peer: &str,
        lane_id: u64,
        rx: &mut mpsc::UnboundedReceiver<SignalingMessage>,
    ) -> LaneStep {
        if self.registry.get(peer).is_some() {
            return LaneStep::Wait;
        }
        let mut lanes = self.lanes.lock();
        match rx.try_recv() {
            Ok(message) => LaneStep::Next(message),
            Err(TryRecvError::Disconnected) => LaneStep::Exit,
            Err(TryRecvError::Empty) => {
                if lanes.get(peer).is_some_and(|lane| lane.id == lane_id) {
                    lanes.remove(peer);
                }
                LaneStep::Exit
            }
        }
    }

    fn cancel_lane(&self, device_id: &str) {
        if let Some(lane) = self.lanes.lock().remove(device_id) {
            lane.cancel();
        }
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Applies one negotiation message to the session it belongs to.
    pub async fn route(&self, message: SignalingMessage) -> Result<(), RoutingError> {
        match message {
            SignalingMessage::Offer { from, to, sdp } => {
                self.check_addressee(&to)?;
                info!("offer received from {}", from);
                let session = self
                    .registry
                    .get_or_create(&from, false)
                    .await
                    .map_err(|e| RoutingError::negotiation(&from, e))?;
                session
                    .apply_remote_description(sdp)
                    .await
                    .map_err(|e| RoutingError::negotiation(&from, e))?;
                let answer = session
                    .create_answer()
                    .await
                    .map_err(|e| RoutingError::negotiation(&from, e))?;
                self.sink.send(SignalingMessage::Answer {
                    from: self.endpoint.local_device_id.clone(),
                    to: from.clone(),
                    sdp: answer,
                })?;
                info!("answer sent to {}", from);
                Ok(())
            }
            SignalingMessage::Answer { from, to, sdp } => {
                self.check_addressee(&to)?;
                let session = self
                    .registry
                    .get(&from)
                    .ok_or_else(|| RoutingError::UnknownDevice(from.clone()))?;
                session
                    .apply_remote_description(sdp)
                    .await
                    .map_err(|e| RoutingError::negotiation(&from, e))?;
                info!("answer from {} applied", from);
                Ok(())
            }
            SignalingMessage::IceCandidate {
                from,
                to,
                candidate,
                sdp_mline_index,
                sdp_mid,
            } => {
                self.check_addressee(&to)?;
                let session = self
                    .registry
                    .get(&from)
                    .ok_or_else(|| RoutingError::UnknownDevice(from.clone()))?;
                session
                    .add_remote_candidate(IceCandidate {
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                    })
                    .await
                    .map_err(|e| RoutingError::negotiation(&from, e))
            }
            other => {
                self.handle_control(other);
                Ok(())
            }
        }
    }

    fn check_addressee(&self, to: &str) -> Result<(), RoutingError> {
        if to == self.endpoint.local_device_id {
            Ok(())
        } else {
            Err(RoutingError::Misaddressed(to.to_string()))
        }
    }

    fn handle_control(&self, message: SignalingMessage) {
        match message {
            SignalingMessage::DeviceList { devices } => {
                let local = &self.endpoint.local_device_id;
                let roster: Roster = devices
                    .into_iter()
                    .filter(|id| id != local)
                    .map(|id| (id.clone(), id))
                    .collect();
                info!("{} devices online", roster.len());
                self.roster.send_replace(roster);
            }
            SignalingMessage::DeviceOnline {
                device_id,
                device_name,
            } => {
                if device_id == self.endpoint.local_device_id {
                    return;
                }
                info!("device online: {} ({})", device_id, device_name);
                self.roster.send_modify(|roster| {
                    roster.insert(device_id, device_name);
                });
            }
            SignalingMessage::DeviceOffline { device_id } => {
                info!("device offline: {}", device_id);
                self.roster.send_modify(|roster| {
                    roster.remove(&device_id);
                });
                self.cancel_lane(&device_id);
                if self.registry.remove(&device_id) {
                    info!("closed session with offline device {}", device_id);
                }
            }
            SignalingMessage::Ping { from } => {
                debug!("ping from {}", from);
                let pong = SignalingMessage::Pong {
                    from: self.endpoint.local_device_id.clone(),
                };
                if let Err(e) = self.sink.send(pong) {
                    debug!("pong not sent: {}", e);
                }
            }
            SignalingMessage::Pong { from } => {
                debug!("pong from {}", from);
            }
            SignalingMessage::Unknown { raw } => {
                let sink = self.unrecognized.lock();
                match sink.as_ref() {
                    Some(tx) => {
                        let _ = tx.send(raw);
                    }
                    None => debug!("ignoring unrecognized signaling frame"),
                }
            }
            other => {
                debug!("ignoring inbound {} frame", other.kind());
            }
        }
    }

    /// Turns session output into outbound frames.
    pub fn handle_session_event(&self, event: SessionEvent) {
        match event.kind {
            SessionEventKind::LocalCandidate(candidate) => {
                let message = SignalingMessage::IceCandidate {
                    from: self.endpoint.local_device_id.clone(),
                    to: event.device_id,
                    candidate: candidate.candidate,
                    sdp_mline_index: candidate.sdp_mline_index,
                    sdp_mid: candidate.sdp_mid,
                };
                if let Err(e) = self.sink.send(message) {
                    warn!("local candidate not sent: {}", e);
                }
            }
            SessionEventKind::StatusChanged(status) => {
                info!("peer {} is now {:?}", event.device_id, status);
            }
        }
    }

    fn clear_roster(&self) {
        self.roster.send_if_modified(|roster| {
            let changed = !roster.is_empty();
            roster.clear();
            changed
        });
    }

    /// Starts a negotiation as initiator, replacing any existing session.
    pub async fn connect_to_device(&self, device_id: &str) -> Result<(), NegotiationError> {
        info!("connecting to device {}", device_id);
        let session = self.registry.create(device_id, true).await?;
        let offer = match session.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("offer for {} failed: {}", device_id, e);
                return Err(e);
            }
        };
        let message = SignalingMessage::Offer {
            from: self.endpoint.local_device_id.clone(),
            to: device_id.to_string(),
            sdp: offer,
        };
        if let Err(e) = self.sink.send(message) {
            warn!("offer to {} not sent: {}", device_id, e);
        }
        Ok(())
    }

    pub fn disconnect_from_device(&self, device_id: &str) -> bool {
        self.cancel_lane(device_id);
        self.registry.remove(device_id)
    }

    pub fn disconnect_all(&self) -> usize {
        let lanes: Vec<Lane> = self.lanes.lock().drain().map(|(_, lane)| lane).collect();
        for lane in lanes {
            lane.cancel();
        }
        self.registry.remove_all()
    }

    pub fn request_device_list(&self) -> Result<(), TransportError> {
        self.sink.send(SignalingMessage::GetDevices {
            from: self.endpoint.local_device_id.clone(),
        })
    }

    /// Closes every session and releases the control channel.
    pub fn shutdown(&self) {
        self.disconnect_all();
        self.sink.close();
        self.clear_roster();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::media::fake::{candidate, FakeConnector, Script};
    use crate::session::NegotiationState;
    use camlink_common::protocol::DeviceRole;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<SignalingMessage>>,
        closed: Mutex<bool>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<SignalingMessage> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl SignalSink for RecordingSink {
        fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
            self.sent.lock().push(message);
            Ok(())
        }

        fn close(&self) {
            *self.closed.lock() = true;
        }
    }

    struct Harness {
        connector: Arc<FakeConnector>,
        sink: Arc<RecordingSink>,
        coordinator: Arc<Coordinator>,
        inbound: mpsc::UnboundedSender<SignalingMessage>,
        status: watch::Sender<ConnectionStatus>,
        _task: JoinHandle<()>,
    }

    fn start(local: &str, role: DeviceRole) -> Harness {
        start_with_timeout(local, role, Duration::from_secs(5))
    }

    fn start_with_timeout(
        local: &str,
        role: DeviceRole,
        negotiation_timeout: Duration,
    ) -> Harness {
        let connector = FakeConnector::new();
        let sink = Arc::new(RecordingSink::default());
        let (registry, session_events) =
            SessionRegistry::new(connector.clone(), negotiation_timeout);
        let coordinator = Coordinator::new(
            SignalingEndpoint::new(local, role),
            sink.clone(),
            Arc::new(registry),
        );
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(ConnectionStatus::Connected);
        let task = coordinator.spawn(CoordinatorInputs {
            inbound: inbound_rx,
            session_events,
            transport_status: status_rx,
        });
        Harness {
            connector,
            sink,
            coordinator,
            inbound,
            status,
            _task: task,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn offer_frame(from: &str, to: &str) -> SignalingMessage {
        SignalingMessage::Offer {
            from: from.into(),
            to: to.into(),
            sdp: "v=0 offer".into(),
        }
    }

    fn candidate_frame(from: &str, to: &str, n: u16) -> SignalingMessage {
        let c = candidate(n);
        SignalingMessage::IceCandidate {
            from: from.into(),
            to: to.into(),
            candidate: c.candidate,
            sdp_mline_index: c.sdp_mline_index,
            sdp_mid: c.sdp_mid,
        }
    }

    #[tokio::test]
    async fn test_viewer_connect_sends_offer() {
        let h = start("viewer-1", DeviceRole::Viewer);
        h.coordinator.connect_to_device("camera-1").await.unwrap();

        assert_eq!(
            h.sink.take(),
            vec![SignalingMessage::Offer {
                from: "viewer-1".into(),
                to: "camera-1".into(),
                sdp: "offer-for-camera-1".into(),
            }]
        );
        let session = h.coordinator.registry().get("camera-1").unwrap();
        assert!(session.is_initiator());
        assert_eq!(session.state(), NegotiationState::Negotiating);
    }

    #[tokio::test]
    async fn test_failed_offer_sends_nothing() {
        let h = start("viewer-1", DeviceRole::Viewer);
        h.connector.script_offers(Script::Fail);

        assert!(h.coordinator.connect_to_device("camera-1").await.is_err());
        assert!(h.sink.take().is_empty());
        let session = h.coordinator.registry().get("camera-1").unwrap();
        assert_eq!(session.status(), ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn test_camera_answers_offer_and_applies_early_candidates() {
        let h = start("camera-1", DeviceRole::Camera);
        h.inbound
            .send(SignalingMessage::Offer {
                from: "viewer-1".into(),
                to: "camera-1".into(),
                sdp: "v=0 offer".into(),
            })
            .unwrap();
        h.inbound.send(candidate_frame("viewer-1", "camera-1", 1)).unwrap();
        settle().await;

        assert_eq!(
            h.sink.take(),
            vec![SignalingMessage::Answer {
                from: "camera-1".into(),
                to: "viewer-1".into(),
                sdp: "answer-for-viewer-1".into(),
            }]
        );
        let fake = h.connector.latest("viewer-1");
        assert_eq!(fake.applied_candidates(), vec![candidate(1)]);

        fake.gather(candidate(2));
        settle().await;
        assert_eq!(h.sink.take(), vec![candidate_frame("camera-1", "viewer-1", 2)]);
    }

    #[tokio::test]
    async fn test_unsolicited_answer_creates_no_session() {
        let h = start("viewer-1", DeviceRole::Viewer);
        h.inbound
            .send(SignalingMessage::Answer {
                from: "camera-9".into(),
                to: "viewer-1".into(),
                sdp: "v=0 answer".into(),
            })
            .unwrap();
        h.inbound.send(candidate_frame("camera-9", "viewer-1", 1)).unwrap();
        settle().await;

        assert!(h.coordinator.registry().is_empty());
        assert_eq!(h.connector.opened(), 0);
        assert!(h.sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_full_initiator_exchange() {
        let h = start("viewer-1", DeviceRole::Viewer);
        h.coordinator.connect_to_device("camera-1").await.unwrap();
        h.sink.take();

        let fake = h.connector.latest("camera-1");
        fake.gather(candidate(1));
        settle().await;
        assert!(h.sink.take().is_empty());

        h.inbound
            .send(SignalingMessage::Answer {
                from: "camera-1".into(),
                to: "viewer-1".into(),
                sdp: "v=0 answer".into(),
            })
            .unwrap();
        settle().await;
        assert_eq!(h.sink.take(), vec![candidate_frame("viewer-1", "camera-1", 1)]);
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let h = start("camera-1", DeviceRole::Camera);
        h.inbound
            .send(SignalingMessage::Ping { from: "gateway".into() })
            .unwrap();
        settle().await;
        assert_eq!(
            h.sink.take(),
            vec![SignalingMessage::Pong { from: "camera-1".into() }]
        );
    }

    #[tokio::test]
    async fn test_roster_tracks_presence() {
        let h = start("viewer-1", DeviceRole::Viewer);
        let roster = h.coordinator.roster();

        h.inbound
            .send(SignalingMessage::DeviceList {
                devices: vec!["viewer-1".into(), "camera-1".into()],
            })
            .unwrap();
        h.inbound
            .send(SignalingMessage::DeviceOnline {
                device_id: "camera-2".into(),
                device_name: "Porch".into(),
            })
            .unwrap();
        settle().await;
        assert_eq!(
            roster.borrow().iter().map(|(k, v)| (k.as_str(), v.as_str())).collect::<Vec<_>>(),
            vec![("camera-1", "camera-1"), ("camera-2", "Porch")]
        );

        h.status.send_replace(ConnectionStatus::Disconnected);
        settle().await;
        assert!(roster.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_device_offline_closes_session() {
        let h = start("viewer-1", DeviceRole::Viewer);
        h.coordinator.connect_to_device("camera-1").await.unwrap();
        let session = h.coordinator.registry().get("camera-1").unwrap();

        h.inbound
            .send(SignalingMessage::DeviceOffline {
                device_id: "camera-1".into(),
            })
            .unwrap();
        settle().await;
        assert!(h.coordinator.registry().is_empty());
        assert_eq!(session.state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_misaddressed_offer_ignored() {
        let h = start("camera-1", DeviceRole::Camera);
        h.inbound
            .send(SignalingMessage::Offer {
                from: "viewer-1".into(),
                to: "camera-2".into(),
                sdp: "v=0 offer".into(),
            })
            .unwrap();
        settle().await;
        assert!(h.coordinator.registry().is_empty());
        assert!(h.sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_frames_forwarded() {
        let h = start("camera-1", DeviceRole::Camera);
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.coordinator.set_unrecognized_sink(tx);
        h.inbound
            .send(SignalingMessage::Unknown {
                raw: r#"{"type":"torch"}"#.into(),
            })
            .unwrap();
        settle().await;
        assert_eq!(rx.try_recv().unwrap(), r#"{"type":"torch"}"#);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let h = start("viewer-1", DeviceRole::Viewer);
        h.coordinator.connect_to_device("camera-1").await.unwrap();
        h.coordinator.connect_to_device("camera-2").await.unwrap();
        assert!(h.coordinator.request_device_list().is_ok());

        h.coordinator.shutdown();
        assert!(h.coordinator.registry().is_empty());
        assert!(*h.sink.closed.lock());
        assert!(!h.coordinator.disconnect_from_device("camera-1"));
    }

    #[tokio::test]
    async fn test_lanes_for_unknown_devices_exit() {
        let h = start("viewer-1", DeviceRole::Viewer);
        for i in 0..1000 {
            let ghost = format!("ghost-{}", i);
            h.inbound
                .send(SignalingMessage::Answer {
                    from: ghost.clone(),
                    to: "viewer-1".into(),
                    sdp: "v=0 answer".into(),
                })
                .unwrap();
            h.inbound.send(candidate_frame(&ghost, "viewer-1", 1)).unwrap();
        }
        h.inbound.send(offer_frame("viewer-2", "camera-9")).unwrap();
        settle().await;

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while h.coordinator.lane_count() > 0 {
                settle().await;
            }
        })
        .await;
        assert!(drained.is_ok(), "{} lanes still alive", h.coordinator.lane_count());
        assert!(h.coordinator.registry().is_empty());
        assert!(h.sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_lane_kept_while_session_lives() {
        let h = start("camera-1", DeviceRole::Camera);
        h.inbound.send(offer_frame("viewer-1", "camera-1")).unwrap();
        settle().await;
        assert_eq!(h.coordinator.lane_count(), 1);

        h.inbound.send(candidate_frame("viewer-1", "camera-1", 1)).unwrap();
        settle().await;
        assert_eq!(h.connector.latest("viewer-1").applied_candidates(), vec![candidate(1)]);

        assert!(h.coordinator.disconnect_from_device("viewer-1"));
        assert_eq!(h.coordinator.lane_count(), 0);
        settle().await;
        assert!(h.coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_all_prunes_lanes() {
        let h = start("camera-1", DeviceRole::Camera);
        h.inbound.send(offer_frame("viewer-1", "camera-1")).unwrap();
        h.inbound.send(offer_frame("viewer-2", "camera-1")).unwrap();
        settle().await;
        assert_eq!(h.coordinator.lane_count(), 2);

        assert_eq!(h.coordinator.disconnect_all(), 2);
        assert_eq!(h.coordinator.lane_count(), 0);
    }

    #[tokio::test]
    async fn test_device_offline_discards_queued_offer() {
        let h = start_with_timeout("camera-1", DeviceRole::Camera, Duration::from_millis(200));
        h.connector.script_opens(Script::Hang);
        h.inbound.send(offer_frame("viewer-1", "camera-1")).unwrap();
        settle().await;

        h.connector.script_opens(Script::Succeed);
        h.inbound.send(offer_frame("viewer-1", "camera-1")).unwrap();
        h.inbound
            .send(SignalingMessage::DeviceOffline {
                device_id: "viewer-1".into(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(h.connector.opened(), 0);
        assert!(h.coordinator.registry().is_empty());
        assert!(h.sink.take().is_empty());
        assert_eq!(h.coordinator.lane_count(), 0);
    }
}
