use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::NegotiationError;
use crate::media::MediaConnector;
use crate::session::{PeerSession, SessionEvent};
use crate::transport::ConnectionStatus;

pub(crate) type SessionTable = Mutex<HashMap<String, Arc<PeerSession>>>;

/// Roll-up of every session's status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateStatus {
    pub sessions: usize,
    pub connected: usize,
}

impl AggregateStatus {
    pub fn any_connected(&self) -> bool {
        self.connected > 0
    }
}

/// Owns at most one live peer session per remote device.
pub struct SessionRegistry {
    table: Arc<SessionTable>,
    connector: Arc<dyn MediaConnector>,
    negotiation_timeout: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionRegistry {
    /// Creates an empty registry and the stream its sessions report on.
    pub fn new(
        connector: Arc<dyn MediaConnector>,
        negotiation_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let registry = Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            connector,
            negotiation_timeout,
            events,
        };
        (registry, events_rx)
    }

    async fn open(&self, device_id: &str, is_initiator: bool) -> Result<Arc<PeerSession>, NegotiationError> {
        PeerSession::open(
            device_id,
            is_initiator,
            self.connector.as_ref(),
            self.negotiation_timeout,
            self.events.clone(),
            Arc::downgrade(&self.table),
        )
        .await
    }

    /// Closes any session for `device_id`, then opens a fresh one.
    pub async fn create(
        &self,
        device_id: &str,
        is_initiator: bool,
    ) -> Result<Arc<PeerSession>, NegotiationError> {
        if self.remove(device_id) {
            info!("replacing existing session with {}", device_id);
        }
        let session = self.open(device_id, is_initiator).await?;
        let raced = self
            .table
            .lock()
            .insert(device_id.to_string(), Arc::clone(&session));
        if let Some(raced) = raced {
            debug!("discarding session with {} opened concurrently", device_id);
            raced.shutdown();
        }
        Ok(session)
    }

    /// Returns the session for `device_id` if it can still take a new
    /// negotiation in the requested role, otherwise replaces it.
    pub async fn get_or_create(
        &self,
        device_id: &str,
        is_initiator: bool,
    ) -> Result<Arc<PeerSession>, NegotiationError> {
        if let Some(existing) = self.get(device_id) {
            if existing.reusable_as(is_initiator) {
                return Ok(existing);
            }
            self.retire(device_id, &existing);
        }

        let session = self.open(device_id, is_initiator).await?;
        let (kept, discarded) = {
            let mut table = self.table.lock();
            match table.get(device_id) {
                Some(current) if current.reusable_as(is_initiator) => {
                    (Arc::clone(current), Some(session))
                }
                _ => {
                    let replaced = table.insert(device_id.to_string(), Arc::clone(&session));
                    (session, replaced)
                }
            }
        };
        if let Some(discarded) = discarded {
            debug!("discarding superseded session with {}", device_id);
            discarded.shutdown();
        }
        Ok(kept)
    }

    /// Unlinks `session` if it is still the entry for `device_id` and closes it.
    fn retire(&self, device_id: &str, session: &Arc<PeerSession>) {
        {
            let mut table = self.table.lock();
            if table
                .get(device_id)
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                table.remove(device_id);
            }
        }
        info!("replacing existing session with {}", device_id);
        session.shutdown();
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<PeerSession>> {
        self.table.lock().get(device_id).cloned()
    }

    /// Closes and forgets the session for `device_id`. Returns false if there was none.
    pub fn remove(&self, device_id: &str) -> bool {
        let removed = self.table.lock().remove(device_id);
        match removed {
            Some(session) => {
                session.shutdown();
                true
            }
            None => false,
        }
    }

    /// Closes every session. Returns how many were closed.
    pub fn remove_all(&self) -> usize {
        let drained: Vec<_> = self.table.lock().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.shutdown();
        }
        if !drained.is_empty() {
            info!("closed {} peer sessions", drained.len());
        }
        drained.len()
    }

    /// Per-device status, ordered by device id.
    pub fn snapshot(&self) -> Vec<(String, ConnectionStatus)> {
        let mut statuses: Vec<_> = self
            .table
            .lock()
            .iter()
            .map(|(id, session)| (id.clone(), session.status()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    pub fn aggregate(&self) -> AggregateStatus {
        let table = self.table.lock();
        AggregateStatus {
            sessions: table.len(),
            connected: table
                .values()
                .filter(|s| s.status() == ConnectionStatus::Connected)
                .count(),
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fake::{candidate, FakeConnector, Script};
    use crate::media::IceState;
    use crate::session::{NegotiationState, SessionEventKind};

    fn registry(connector: &Arc<FakeConnector>) -> (SessionRegistry, mpsc::UnboundedReceiver<SessionEvent>) {
        SessionRegistry::new(connector.clone(), Duration::from_secs(5))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_create_replaces_existing_session() {
        let connector = FakeConnector::new();
        let (registry, _events) = registry(&connector);

        let first = registry.create("camera-1", true).await.unwrap();
        let second = registry.create("camera-1", true).await.unwrap();
        settle().await;

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("camera-1").unwrap(), &second));
        assert_eq!(first.state(), NegotiationState::Closed);
        assert!(connector.connections("camera-1")[0].is_closed());
        assert!(!connector.latest("camera-1").is_closed());
    }

    #[tokio::test]
    async fn test_create_closes_previous_before_opening() {
        let connector = FakeConnector::new();
        let (registry, _events) =
            SessionRegistry::new(connector.clone(), Duration::from_millis(50));

        let first = registry.create("camera-1", true).await.unwrap();
        connector.script_opens(Script::Hang);

        let result = registry.create("camera-1", true).await;
        assert_eq!(result.err(), Some(NegotiationError::Timeout("media transport setup")));
        assert_eq!(first.state(), NegotiationState::Closed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stale_responder_closed_before_reopening() {
        let connector = FakeConnector::new();
        let (registry, _events) =
            SessionRegistry::new(connector.clone(), Duration::from_millis(50));

        let first = registry.get_or_create("viewer-1", false).await.unwrap();
        first.apply_remote_description("v=0 offer".into()).await.unwrap();
        connector.script_opens(Script::Fail);

        assert!(registry.get_or_create("viewer-1", false).await.is_err());
        assert_eq!(first.state(), NegotiationState::Closed);
        assert!(registry.get("viewer-1").is_none());
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_fresh_responder() {
        let connector = FakeConnector::new();
        let (registry, _events) = registry(&connector);

        let first = registry.get_or_create("viewer-1", false).await.unwrap();
        let again = registry.get_or_create("viewer-1", false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(connector.opened(), 1);

        first.apply_remote_description("v=0 offer".into()).await.unwrap();
        let renegotiated = registry.get_or_create("viewer-1", false).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &renegotiated));
        assert_eq!(first.state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_closing_replaced_session_keeps_replacement() {
        let connector = FakeConnector::new();
        let (registry, _events) = registry(&connector);

        let first = registry.create("camera-1", true).await.unwrap();
        let second = registry.create("camera-1", true).await.unwrap();
        first.close();
        assert!(Arc::ptr_eq(&registry.get("camera-1").unwrap(), &second));

        second.close();
        assert!(registry.get("camera-1").is_none());
    }

    #[tokio::test]
    async fn test_remove_and_remove_all() {
        let connector = FakeConnector::new();
        let (registry, _events) = registry(&connector);

        registry.create("camera-1", true).await.unwrap();
        registry.create("camera-2", true).await.unwrap();
        registry.create("camera-3", true).await.unwrap();

        assert!(registry.remove("camera-2"));
        assert!(!registry.remove("camera-2"));
        assert_eq!(registry.remove_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.remove_all(), 0);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let connector = FakeConnector::new();
        let (registry, mut events) = registry(&connector);

        let (one, two) = tokio::join!(
            registry.create("camera-1", true),
            registry.create("camera-2", true)
        );
        let (one, two) = (one.unwrap(), two.unwrap());
        one.create_offer().await.unwrap();
        two.create_offer().await.unwrap();
        one.apply_remote_description("v=0 answer-1".into()).await.unwrap();

        tokio::join!(
            async { one.add_remote_candidate(candidate(1)).await.unwrap() },
            async { two.add_remote_candidate(candidate(2)).await.unwrap() },
        );
        assert_eq!(connector.latest("camera-1").applied_candidates(), vec![candidate(1)]);
        assert!(connector.latest("camera-2").applied_candidates().is_empty());

        connector.latest("camera-2").gather(candidate(9));
        connector.latest("camera-1").gather(candidate(3));
        settle().await;
        let event = events.try_recv().unwrap();
        assert_eq!(event.device_id, "camera-1");
        assert_eq!(event.kind, SessionEventKind::LocalCandidate(candidate(3)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_snapshot_and_aggregate() {
        let connector = FakeConnector::new();
        let (registry, _events) = registry(&connector);
        assert!(!registry.aggregate().any_connected());

        let one = registry.create("camera-1", true).await.unwrap();
        registry.create("camera-2", true).await.unwrap();
        one.create_offer().await.unwrap();
        one.apply_remote_description("v=0 answer".into()).await.unwrap();
        connector.latest("camera-1").report(IceState::Connected);
        settle().await;

        assert_eq!(
            registry.snapshot(),
            vec![
                ("camera-1".to_string(), ConnectionStatus::Connected),
                ("camera-2".to_string(), ConnectionStatus::Connecting),
            ]
        );
        let aggregate = registry.aggregate();
        assert_eq!(aggregate.sessions, 2);
        assert!(aggregate.any_connected());
    }
}
