//! Offer/answer negotiation with a single remote device.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::track::track_local::TrackLocal;

use crate::error::NegotiationError;
use crate::media::{IceCandidate, IceState, MediaConnection, MediaConnector, MediaEvent, SdpKind};
use crate::registry::SessionTable;
use crate::transport::ConnectionStatus;

/// Where a session is in its negotiation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    /// The status a UI should show for this state.
    pub fn status(self) -> ConnectionStatus {
        match self {
            Self::Idle | Self::Negotiating => ConnectionStatus::Connecting,
            Self::Connected => ConnectionStatus::Connected,
            Self::Failed => ConnectionStatus::Failed,
            Self::Closed => ConnectionStatus::Disconnected,
        }
    }
}

/// Something a session needs the outside world to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub device_id: String,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// A local candidate that may now be sent to the remote device.
    LocalCandidate(IceCandidate),
    StatusChanged(ConnectionStatus),
}

struct SessionState {
    phase: NegotiationState,
    has_local_description: bool,
    has_remote_description: bool,
    /// Gathered before the remote description was applied; sent once it is.
    pending_local_candidates: VecDeque<IceCandidate>,
    /// Received before the remote description was applied.
    pending_remote_candidates: VecDeque<IceCandidate>,
}

impl SessionState {
    fn ensure_open(&self) -> Result<(), NegotiationError> {
        match self.phase {
            NegotiationState::Closed => Err(NegotiationError::Closed),
            _ => Ok(()),
        }
    }
}

/// The negotiation and media state for one remote device.
///
/// Operations on a session are serialized; operations on different sessions
/// never wait on each other.
pub struct PeerSession {
    remote_device_id: String,
    is_initiator: bool,
    negotiation_timeout: Duration,
    media: Arc<dyn MediaConnection>,
    events: mpsc::UnboundedSender<SessionEvent>,
    table: Weak<SessionTable>,
    op: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    pub(crate) async fn open(
        remote_device_id: &str,
        is_initiator: bool,
        connector: &dyn MediaConnector,
        negotiation_timeout: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
        table: Weak<SessionTable>,
    ) -> Result<Arc<Self>, NegotiationError> {
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let media = bounded(
            negotiation_timeout,
            "media transport setup",
            connector.open(remote_device_id, media_tx),
        )
        .await?;

        let session = Arc::new(Self {
            remote_device_id: remote_device_id.to_string(),
            is_initiator,
            negotiation_timeout,
            media,
            events,
            table,
            op: tokio::sync::Mutex::new(()),
            state: Mutex::new(SessionState {
                phase: NegotiationState::Idle,
                has_local_description: false,
                has_remote_description: false,
                pending_local_candidates: VecDeque::new(),
                pending_remote_candidates: VecDeque::new(),
            }),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(pump_media_events(Arc::downgrade(&session), media_rx));
        *session.pump.lock() = Some(pump);

        info!(
            "peer session opened with {} ({})",
            remote_device_id,
            if is_initiator { "initiator" } else { "responder" }
        );
        Ok(session)
    }

    pub fn remote_device_id(&self) -> &str {
        &self.remote_device_id
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn state(&self) -> NegotiationState {
        self.state.lock().phase
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    pub fn has_remote_description(&self) -> bool {
        self.state.lock().has_remote_description
    }

    /// Whether a new negotiation in `is_initiator`'s role can reuse this session.
    pub(crate) fn reusable_as(&self, is_initiator: bool) -> bool {
        let state = self.state.lock();
        self.is_initiator == is_initiator
            && !state.has_remote_description
            && !matches!(state.phase, NegotiationState::Failed | NegotiationState::Closed)
    }

    /// Creates the local offer and applies it. Initiator only, once.
    pub async fn create_offer(&self) -> Result<String, NegotiationError> {
        if !self.is_initiator {
            return Err(NegotiationError::NotInitiator);
        }
        let _op = self.op.lock().await;
        let previous = self.begin(|state| {
            if state.has_local_description {
                Err(NegotiationError::InvalidState("offer already created"))
            } else {
                Ok(())
            }
        })?;

        let result = self.bounded("create offer", self.media.create_offer()).await;
        self.finish_local(previous, result)
    }

    /// Answers the applied remote offer. Responder only.
    pub async fn create_answer(&self) -> Result<String, NegotiationError> {
        if self.is_initiator {
            return Err(NegotiationError::InvalidState("the initiator does not answer"));
        }
        let _op = self.op.lock().await;
        let previous = self.begin(|state| {
            if !state.has_remote_description {
                Err(NegotiationError::InvalidState("remote offer not applied"))
            } else if state.has_local_description {
                Err(NegotiationError::InvalidState("answer already created"))
            } else {
                Ok(())
            }
        })?;

        let result = self.bounded("create answer", self.media.create_answer()).await;
        self.finish_local(previous, result)
    }

    /// Applies the remote offer (responder) or answer (initiator), then flushes
    /// both candidate queues.
    pub async fn apply_remote_description(&self, sdp: String) -> Result<(), NegotiationError> {
        let _op = self.op.lock().await;
        let is_initiator = self.is_initiator;
        self.begin(|state| {
            if state.has_remote_description {
                Err(NegotiationError::InvalidState("remote description already applied"))
            } else if is_initiator && !state.has_local_description {
                Err(NegotiationError::InvalidState("answer received before an offer was sent"))
            } else {
                Ok(())
            }
        })?;

        let kind = if self.is_initiator {
            SdpKind::Answer
        } else {
            SdpKind::Offer
        };
        let applied = self
            .bounded(
                "apply remote description",
                self.media.set_remote_description(kind, sdp),
            )
            .await;
        if let Err(e) = applied {
            warn!("remote {} from {} rejected: {}", kind, self.remote_device_id, e);
            let mut state = self.state.lock();
            if state.phase != NegotiationState::Closed {
                self.transition(&mut state, NegotiationState::Failed);
            }
            return Err(e);
        }

        let pending_remote = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            state.has_remote_description = true;
            let pending_local: Vec<_> = state.pending_local_candidates.drain(..).collect();
            if !pending_local.is_empty() {
                debug!(
                    "releasing {} buffered local candidates for {}",
                    pending_local.len(),
                    self.remote_device_id
                );
            }
            for candidate in pending_local {
                self.emit(SessionEventKind::LocalCandidate(candidate));
            }
            std::mem::take(&mut state.pending_remote_candidates)
        };

        for candidate in pending_remote {
            if let Err(e) = self
                .bounded("add ICE candidate", self.media.add_ice_candidate(candidate))
                .await
            {
                warn!("buffered candidate from {} rejected: {}", self.remote_device_id, e);
            }
        }
        Ok(())
    }

    /// Applies a remote candidate, or buffers it until the remote description
    /// is in place.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let _op = self.op.lock().await;
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            if !state.has_remote_description {
                debug!("buffering remote candidate from {}", self.remote_device_id);
                state.pending_remote_candidates.push_back(candidate);
                return Ok(());
            }
        }
        self.bounded("add ICE candidate", self.media.add_ice_candidate(candidate))
            .await
    }

    /// Sends a locally captured track to the remote device.
    pub async fn attach_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), NegotiationError> {
        let _op = self.op.lock().await;
        self.state.lock().ensure_open()?;
        self.bounded("attach track", self.media.attach_track(track))
            .await
    }

    /// Releases the media transport and removes this session from its registry.
    pub fn close(&self) {
        if let Some(table) = self.table.upgrade() {
            let mut table = table.lock();
            let owned = table
                .get(&self.remote_device_id)
                .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), self));
            if owned {
                table.remove(&self.remote_device_id);
            }
        }
        self.shutdown();
    }

    /// Marks the session closed and tears the media transport down in the
    /// background. Returns false if it was already closed.
    pub(crate) fn shutdown(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.phase == NegotiationState::Closed {
                return false;
            }
            state.pending_local_candidates.clear();
            state.pending_remote_candidates.clear();
            self.transition(&mut state, NegotiationState::Closed);
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let media = Arc::clone(&self.media);
        tokio::spawn(async move { media.close().await });
        info!("peer session with {} closed", self.remote_device_id);
        true
    }

    fn begin(
        &self,
        check: impl FnOnce(&SessionState) -> Result<(), NegotiationError>,
    ) -> Result<NegotiationState, NegotiationError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        check(&*state)?;
        let previous = state.phase;
        if previous == NegotiationState::Idle {
            self.transition(&mut state, NegotiationState::Negotiating);
        }
        Ok(previous)
    }

    fn finish_local(
        &self,
        previous: NegotiationState,
        result: Result<String, NegotiationError>,
    ) -> Result<String, NegotiationError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        match result {
            Ok(sdp) => {
                state.has_local_description = true;
                Ok(sdp)
            }
            Err(e) => {
                warn!("local description for {} failed: {}", self.remote_device_id, e);
                if state.phase == NegotiationState::Negotiating {
                    self.transition(&mut state, previous);
                }
                Err(e)
            }
        }
    }

    fn on_media_event(&self, event: MediaEvent) {
        let mut state = self.state.lock();
        if state.phase == NegotiationState::Closed {
            return;
        }
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                if state.has_remote_description {
                    self.emit(SessionEventKind::LocalCandidate(candidate));
                } else {
                    debug!("buffering local candidate for {}", self.remote_device_id);
                    state.pending_local_candidates.push_back(candidate);
                }
            }
            MediaEvent::Ice(ice) => {
                let next = match ice {
                    IceState::Connected => Some(NegotiationState::Connected),
                    IceState::Failed => Some(NegotiationState::Failed),
                    IceState::Disconnected if state.phase == NegotiationState::Connected => {
                        Some(NegotiationState::Negotiating)
                    }
                    IceState::Checking | IceState::Disconnected | IceState::Closed => None,
                };
                if let Some(next) = next {
                    self.transition(&mut state, next);
                }
            }
        }
    }

    fn transition(&self, state: &mut SessionState, next: NegotiationState) {
        let previous = state.phase;
        if previous == next {
            return;
        }
        state.phase = next;
        debug!(
            "session {} {:?} -> {:?}",
            self.remote_device_id, previous, next
        );
        if previous.status() != next.status() {
            self.emit(SessionEventKind::StatusChanged(next.status()));
        }
    }

    fn emit(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            device_id: self.remote_device_id.clone(),
            kind,
        };
        if self.events.send(event).is_err() {
            debug!("no listener for events of session {}", self.remote_device_id);
        }
    }

    async fn bounded<T>(
        &self,
        what: &'static str,
        operation: impl Future<Output = Result<T, NegotiationError>>,
    ) -> Result<T, NegotiationError> {
        bounded(self.negotiation_timeout, what, operation).await
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    what: &'static str,
    operation: impl Future<Output = Result<T, NegotiationError>>,
) -> Result<T, NegotiationError> {
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| NegotiationError::Timeout(what))?
}

async fn pump_media_events(
    session: Weak<PeerSession>,
    mut events: mpsc::UnboundedReceiver<MediaEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.on_media_event(event);
    }
}
