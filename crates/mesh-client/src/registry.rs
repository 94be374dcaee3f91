//! Peer registry: the authoritative map of remote participant to connection record.
//!
//! The registry is owned by the orchestration core. The presentation layer only
//! ever sees [`MeshSnapshot`]s, which carry states and stream references but
//! never the live record.
//!
//! A record owns its link. Dropping a record (removal, replacement, bulk
//! teardown) destroys the link if it is still alive, so every link is
//! destroyed exactly once no matter which path retires it.

use crate::transport::{MediaStreamHandle, PeerLink};

use common::types::{ConnectionId, ParticipantId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio::time::Instant;

/// Negotiation role, fixed when a record is first created for a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Proposes the session (sends the offer).
    Initiator,
    /// Responds to the initiator's offer.
    Receiver,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Receiver => "receiver",
        }
    }
}

/// Per-participant connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Negotiating; no remote stream yet.
    Connecting,
    /// Remote stream available.
    Connected,
    /// Link closed or errored; no retry scheduled.
    Failed,
    /// Link closed or errored; a backoff timer is pending.
    Retrying,
    /// Retry budget exhausted. Only ever observed in removal notifications.
    Abandoned,
}

impl PeerState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Failed => "failed",
            PeerState::Retrying => "retrying",
            PeerState::Abandoned => "abandoned",
        }
    }

    /// Connecting or connected: signals are forwarded to the link.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, PeerState::Connecting | PeerState::Connected)
    }

    /// Failed or waiting on backoff: signals go through the reconnection policy.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Retrying)
    }
}

/// One remote participant known to the mesh.
pub struct ConnectionRecord {
    remote_id: ParticipantId,
    role: Role,
    connection_id: ConnectionId,
    link: Option<Box<dyn PeerLink>>,
    remote_stream: Option<MediaStreamHandle>,
    state: PeerState,
    reconnect_attempts: u32,
    last_reconnect_at: Option<Instant>,
}

impl ConnectionRecord {
    /// Create a CONNECTING record that owns `link`.
    #[must_use]
    pub fn new(
        remote_id: ParticipantId,
        role: Role,
        connection_id: ConnectionId,
        link: Option<Box<dyn PeerLink>>,
    ) -> Self {
        Self {
            remote_id,
            role,
            connection_id,
            link,
            remote_stream: None,
            state: PeerState::Connecting,
            reconnect_attempts: 0,
            last_reconnect_at: None,
        }
    }

    #[must_use]
    pub fn remote_id(&self) -> &ParticipantId {
        &self.remote_id
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    #[must_use]
    pub fn last_reconnect_at(&self) -> Option<Instant> {
        self.last_reconnect_at
    }

    /// The remote stream, readable only while CONNECTED.
    #[must_use]
    pub fn remote_stream(&self) -> Option<&MediaStreamHandle> {
        if self.state == PeerState::Connected {
            self.remote_stream.as_ref()
        } else {
            None
        }
    }

    /// Whether `connection_id` is the instance this record currently owns.
    #[must_use]
    pub fn owns(&self, connection_id: ConnectionId) -> bool {
        self.connection_id == connection_id
    }

    pub(crate) fn link_mut(&mut self) -> Option<&mut Box<dyn PeerLink>> {
        self.link.as_mut()
    }

    pub(crate) fn set_state(&mut self, state: PeerState) {
        self.state = state;
    }

    /// Bind the remote stream. Returns false if this instance already has one.
    pub(crate) fn bind_stream(&mut self, stream: MediaStreamHandle) -> bool {
        if self.remote_stream.is_some() {
            return false;
        }
        self.remote_stream = Some(stream);
        self.state = PeerState::Connected;
        self.reconnect_attempts = 0;
        self.last_reconnect_at = None;
        true
    }

    /// Swap in a fresh link for a retry: destroys the old one, clears the
    /// stream, counts the attempt.
    pub(crate) fn replace_link(
        &mut self,
        connection_id: ConnectionId,
        link: Option<Box<dyn PeerLink>>,
        now: Instant,
    ) {
        self.destroy_link();
        self.connection_id = connection_id;
        self.link = link;
        self.remote_stream = None;
        self.state = PeerState::Connecting;
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.last_reconnect_at = Some(now);
    }

    /// Destroy the owned link. Idempotent; returns true if a live link was torn down.
    pub(crate) fn destroy_link(&mut self) -> bool {
        match self.link.take() {
            Some(mut link) if !link.is_destroyed() => {
                link.destroy();
                true
            }
            Some(_) => false,
            None => false,
        }
    }

    fn view(&self) -> PeerView {
        PeerView {
            role: self.role,
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            stream: self.remote_stream().cloned(),
        }
    }
}

impl Drop for ConnectionRecord {
    fn drop(&mut self) {
        self.destroy_link();
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("remote_id", &self.remote_id)
            .field("role", &self.role)
            .field("connection_id", &self.connection_id)
            .field("has_link", &self.link.is_some())
            .field("has_stream", &self.remote_stream.is_some())
            .field("state", &self.state)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("last_reconnect_at", &self.last_reconnect_at)
            .finish()
    }
}

/// Read-only view of one peer for the presentation layer.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub role: Role,
    pub state: PeerState,
    pub reconnect_attempts: u32,
    /// Present only when `state` is CONNECTED.
    pub stream: Option<MediaStreamHandle>,
}

/// Immutable snapshot of the whole mesh.
#[derive(Debug, Clone, Default)]
pub struct MeshSnapshot {
    pub peers: BTreeMap<ParticipantId, PeerView>,
}

impl MeshSnapshot {
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[must_use]
    pub fn get(&self, remote_id: &ParticipantId) -> Option<&PeerView> {
        self.peers.get(remote_id)
    }

    /// Number of peers in the given state.
    #[must_use]
    pub fn count_in(&self, state: PeerState) -> usize {
        self.peers.values().filter(|p| p.state == state).count()
    }
}

/// Map of remote participant id to connection record.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    records: HashMap<ParticipantId, ConnectionRecord>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for its participant.
    ///
    /// A replaced record is dropped here, which destroys its link.
    pub fn upsert(&mut self, record: ConnectionRecord) {
        let remote_id = record.remote_id().clone();
        self.records.insert(remote_id, record);
    }

    #[must_use]
    pub fn get(&self, remote_id: &ParticipantId) -> Option<&ConnectionRecord> {
        self.records.get(remote_id)
    }

    pub(crate) fn get_mut(&mut self, remote_id: &ParticipantId) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(remote_id)
    }

    /// Remove a record. The caller receives ownership; dropping it destroys the link.
    pub fn remove(&mut self, remote_id: &ParticipantId) -> Option<ConnectionRecord> {
        self.records.remove(remote_id)
    }

    #[must_use]
    pub fn contains(&self, remote_id: &ParticipantId) -> bool {
        self.records.contains_key(remote_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove every record (bulk teardown).
    pub fn drain(&mut self) -> Vec<ConnectionRecord> {
        self.records.drain().map(|(_, record)| record).collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            peers: self
                .records
                .iter()
                .map(|(id, record)| (id.clone(), record.view()))
                .collect(),
        }
    }
}
