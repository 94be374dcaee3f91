//! Scripted transport for mesh tests.
//!
//! `MockConnector` records every link it opens, every payload fed to those
//! links and every `destroy()` call. Tests drive the other direction by
//! emitting local signals, remote streams, closes and errors on behalf of a
//! link.
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_test_utils::MockConnector;
//!
//! let connector = MockConnector::builder()
//!     .fail_open_for("bob")
//!     .reject_signals_for("mallory")
//!     .build();
//! ```

use common::types::{ConnectionId, ParticipantId};
use mesh_client::registry::Role;
use mesh_client::transport::{
    LinkEvents, LinkParams, MediaStream, PeerConnector, PeerLink, SignalPayload, TransportError,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Media stream handed out by [`MockConnector::emit_remote_stream`].
#[derive(Debug)]
pub struct MockStream {
    id: String,
}

impl MockStream {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl MediaStream for MockStream {
    fn id(&self) -> &str {
        &self.id
    }
}

/// One `open()` call as seen by the connector.
#[derive(Debug, Clone)]
pub struct OpenedLink {
    pub remote_id: ParticipantId,
    pub connection_id: ConnectionId,
    pub role: Role,
    pub ice_servers: Vec<String>,
    pub trickle: bool,
    pub events: LinkEvents,
}

#[derive(Debug, Default)]
struct MockState {
    opened: Vec<OpenedLink>,
    signals: HashMap<ConnectionId, Vec<SignalPayload>>,
    destroy_calls: HashMap<ConnectionId, usize>,
    open_failures: usize,
}

/// Recording transport connector.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
    fail_open: HashSet<ParticipantId>,
    reject_signals: HashSet<ParticipantId>,
    auto_offer: bool,
}

impl MockConnector {
    /// Create a new MockConnector builder.
    #[must_use]
    pub fn builder() -> MockConnectorBuilder {
        MockConnectorBuilder::default()
    }

    /// Connector that opens every link and accepts every payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shareable trait object backed by this mock's recorded state.
    #[must_use]
    pub fn as_connector(&self) -> Arc<dyn PeerConnector> {
        Arc::new(self.clone())
    }

    /// Every link opened so far, in order.
    #[must_use]
    pub fn opened(&self) -> Vec<OpenedLink> {
        self.state.lock().unwrap().opened.clone()
    }

    /// Links opened toward `remote_id`, oldest first.
    #[must_use]
    pub fn opened_for(&self, remote_id: &str) -> Vec<OpenedLink> {
        self.opened()
            .into_iter()
            .filter(|link| link.remote_id.as_str() == remote_id)
            .collect()
    }

    /// Most recent link opened toward `remote_id`.
    #[must_use]
    pub fn latest(&self, remote_id: &str) -> Option<OpenedLink> {
        self.opened_for(remote_id).pop()
    }

    /// Payloads fed to the link instance `connection_id`.
    #[must_use]
    pub fn signals_to(&self, connection_id: ConnectionId) -> Vec<SignalPayload> {
        self.state
            .lock()
            .unwrap()
            .signals
            .get(&connection_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of `destroy()` calls on the link instance `connection_id`.
    #[must_use]
    pub fn destroy_calls(&self, connection_id: ConnectionId) -> usize {
        self.state
            .lock()
            .unwrap()
            .destroy_calls
            .get(&connection_id)
            .copied()
            .unwrap_or(0)
    }

    /// Opened links that have not been destroyed.
    #[must_use]
    pub fn live_links(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .opened
            .iter()
            .filter(|link| !state.destroy_calls.contains_key(&link.connection_id))
            .count()
    }

    /// Number of `open()` calls that were refused.
    #[must_use]
    pub fn open_failures(&self) -> usize {
        self.state.lock().unwrap().open_failures
    }

    /// Emit a local signal from the newest link toward `remote_id`.
    pub fn emit_local_signal(&self, remote_id: &str, payload: SignalPayload) -> bool {
        self.with_latest(remote_id, |events| events.local_signal(payload))
    }

    /// Report a remote stream on the newest link toward `remote_id`.
    pub fn emit_remote_stream(&self, remote_id: &str) -> bool {
        let stream = Arc::new(MockStream::new(format!("stream-{remote_id}")));
        self.with_latest(remote_id, |events| events.remote_stream(stream))
    }

    /// Close the newest link toward `remote_id`.
    pub fn emit_closed(&self, remote_id: &str) -> bool {
        self.with_latest(remote_id, LinkEvents::closed)
    }

    /// Report a transport error on the newest link toward `remote_id`.
    pub fn emit_error(&self, remote_id: &str, error: TransportError) -> bool {
        self.with_latest(remote_id, |events| events.error(error))
    }

    fn with_latest(&self, remote_id: &str, emit: impl FnOnce(&LinkEvents) -> bool) -> bool {
        match self.latest(remote_id) {
            Some(link) => emit(&link.events),
            None => false,
        }
    }
}

impl PeerConnector for MockConnector {
    fn open(&self, params: LinkParams) -> Result<Box<dyn PeerLink>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if self.fail_open.contains(&params.remote_id) {
            state.open_failures += 1;
            return Err(TransportError::OpenFailed(format!(
                "scripted open failure for {}",
                params.remote_id
            )));
        }

        state.opened.push(OpenedLink {
            remote_id: params.remote_id.clone(),
            connection_id: params.connection_id,
            role: params.role,
            ice_servers: params.ice_servers.clone(),
            trickle: params.trickle,
            events: params.events.clone(),
        });
        drop(state);

        if self.auto_offer && params.role == Role::Initiator {
            params
                .events
                .local_signal(SignalPayload::new(json!({ "type": "offer", "sdp": "mock" })));
        }

        Ok(Box::new(MockLink {
            connection_id: params.connection_id,
            reject: self.reject_signals.contains(&params.remote_id),
            destroyed: false,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Builder for MockConnector configuration.
#[derive(Debug, Default)]
pub struct MockConnectorBuilder {
    fail_open: HashSet<ParticipantId>,
    reject_signals: HashSet<ParticipantId>,
    auto_offer: bool,
}

impl MockConnectorBuilder {
    /// Refuse to open links toward `remote_id`.
    #[must_use]
    pub fn fail_open_for(mut self, remote_id: &str) -> Self {
        self.fail_open.insert(ParticipantId::new(remote_id));
        self
    }

    /// Links toward `remote_id` reject every payload as malformed.
    #[must_use]
    pub fn reject_signals_for(mut self, remote_id: &str) -> Self {
        self.reject_signals.insert(ParticipantId::new(remote_id));
        self
    }

    /// Initiator links emit an offer as soon as they open.
    #[must_use]
    pub fn auto_offer(mut self) -> Self {
        self.auto_offer = true;
        self
    }

    /// Build the MockConnector.
    #[must_use]
    pub fn build(self) -> MockConnector {
        MockConnector {
            state: Arc::default(),
            fail_open: self.fail_open,
            reject_signals: self.reject_signals,
            auto_offer: self.auto_offer,
        }
    }
}

#[derive(Debug)]
struct MockLink {
    connection_id: ConnectionId,
    reject: bool,
    destroyed: bool,
    state: Arc<Mutex<MockState>>,
}

impl PeerLink for MockLink {
    fn signal(&mut self, payload: SignalPayload) -> Result<(), TransportError> {
        if self.destroyed {
            return Err(TransportError::Destroyed);
        }
        self.state
            .lock()
            .unwrap()
            .signals
            .entry(self.connection_id)
            .or_default()
            .push(payload);
        if self.reject {
            return Err(TransportError::MalformedSignal(
                "scripted rejection".to_string(),
            ));
        }
        Ok(())
    }

    fn destroy(&mut self) {
        *self
            .state
            .lock()
            .unwrap()
            .destroy_calls
            .entry(self.connection_id)
            .or_default() += 1;
        self.destroyed = true;
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_client::transport::transport_event_channel;

    fn params(remote: &str, role: Role) -> LinkParams {
        let (events, _rx) = transport_event_channel();
        let connection_id = ConnectionId::new();
        LinkParams {
            remote_id: ParticipantId::new(remote),
            connection_id,
            role,
            ice_servers: vec!["stun:example".to_string()],
            trickle: true,
            events: events.scoped(ParticipantId::new(remote), connection_id),
        }
    }

    #[test]
    fn test_mock_connector_records_links() {
        let connector = MockConnector::new();
        let mut link = connector.open(params("bob", Role::Initiator)).unwrap();

        let opened = connector.latest("bob").unwrap();
        assert_eq!(opened.role, Role::Initiator);
        assert_eq!(opened.ice_servers, vec!["stun:example".to_string()]);

        link.signal(SignalPayload::new(json!({ "type": "answer" })))
            .unwrap();
        assert_eq!(connector.signals_to(opened.connection_id).len(), 1);

        link.destroy();
        assert_eq!(connector.destroy_calls(opened.connection_id), 1);
        assert_eq!(connector.live_links(), 0);
    }

    #[test]
    fn test_mock_connector_scripted_failures() {
        let connector = MockConnector::builder()
            .fail_open_for("bob")
            .reject_signals_for("carol")
            .build();

        assert!(connector.open(params("bob", Role::Initiator)).is_err());
        assert_eq!(connector.open_failures(), 1);

        let mut link = connector.open(params("carol", Role::Receiver)).unwrap();
        assert!(matches!(
            link.signal(SignalPayload::new(json!({ "type": "offer" }))),
            Err(TransportError::MalformedSignal(_))
        ));
    }
}
