//! Interface to the point-to-point media transport.
//!
//! The transport (ICE, DTLS, codecs, media capture) lives below this crate.
//! The mesh only needs to open a link in a given role, feed it remote
//! signaling payloads, destroy it, and hear back about three things:
//! outbound signaling payloads, the remote media stream, and close/error.
//! Those callbacks are delivered as [`TransportEvent`]s over a channel so the
//! orchestration state machine never runs inside transport code.

use crate::registry::Role;

use common::types::{ConnectionId, ParticipantId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by the transport capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The transport refused to create a link.
    #[error("Failed to open connection: {0}")]
    OpenFailed(String),

    /// A signaling payload could not be applied.
    #[error("Malformed signal: {0}")]
    MalformedSignal(String),

    /// The link was already torn down.
    #[error("Connection already destroyed")]
    Destroyed,

    /// Negotiation or ICE failure.
    #[error("Transport failure: {0}")]
    Other(String),
}

/// Opaque negotiation blob (offer, answer or candidate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(serde_json::Value);

impl SignalPayload {
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }

    /// The `type` field of the payload, if any (`offer`, `answer`, `candidate`).
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(serde_json::Value::as_str)
    }
}

impl From<serde_json::Value> for SignalPayload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// A remote media stream surfaced by the transport.
pub trait MediaStream: Send + Sync + fmt::Debug {
    /// Transport-assigned stream identifier.
    fn id(&self) -> &str;
}

/// Shared reference to a remote media stream.
pub type MediaStreamHandle = Arc<dyn MediaStream>;

/// What happened on one link.
#[derive(Debug, Clone)]
pub enum TransportEventKind {
    /// The link produced a payload that must reach the remote participant.
    LocalSignal(SignalPayload),
    /// The remote media stream is available.
    RemoteStream(MediaStreamHandle),
    /// The link closed.
    Closed,
    /// The link failed.
    Error(TransportError),
}

impl TransportEventKind {
    /// Bounded label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportEventKind::LocalSignal(_) => "local_signal",
            TransportEventKind::RemoteStream(_) => "remote_stream",
            TransportEventKind::Closed => "closed",
            TransportEventKind::Error(_) => "error",
        }
    }
}

/// An event from one link instance.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub remote_id: ParticipantId,
    pub connection_id: ConnectionId,
    pub kind: TransportEventKind,
}

/// Sender half of the transport event channel, owned by a session.
#[derive(Debug, Clone)]
pub struct TransportEventSender {
    sender: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEventSender {
    /// Scope the sender to one link instance.
    #[must_use]
    pub fn scoped(&self, remote_id: ParticipantId, connection_id: ConnectionId) -> LinkEvents {
        LinkEvents {
            remote_id,
            connection_id,
            sender: self.sender.clone(),
        }
    }
}

/// Create the channel a session uses to receive transport events.
#[must_use]
pub fn transport_event_channel() -> (TransportEventSender, mpsc::UnboundedReceiver<TransportEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (TransportEventSender { sender }, receiver)
}

/// Callback surface handed to a link when it is opened.
///
/// Every method returns `false` once the owning session is gone; links may
/// ignore that.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    remote_id: ParticipantId,
    connection_id: ConnectionId,
    sender: mpsc::UnboundedSender<TransportEvent>,
}

impl LinkEvents {
    #[must_use]
    pub fn remote_id(&self) -> &ParticipantId {
        &self.remote_id
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn local_signal(&self, payload: SignalPayload) -> bool {
        self.emit(TransportEventKind::LocalSignal(payload))
    }

    pub fn remote_stream(&self, stream: MediaStreamHandle) -> bool {
        self.emit(TransportEventKind::RemoteStream(stream))
    }

    pub fn closed(&self) -> bool {
        self.emit(TransportEventKind::Closed)
    }

    pub fn error(&self, error: TransportError) -> bool {
        self.emit(TransportEventKind::Error(error))
    }

    fn emit(&self, kind: TransportEventKind) -> bool {
        self.sender
            .send(TransportEvent {
                remote_id: self.remote_id.clone(),
                connection_id: self.connection_id,
                kind,
            })
            .is_ok()
    }
}

/// Everything a connector needs to open one link.
#[derive(Debug, Clone)]
pub struct LinkParams {
    pub remote_id: ParticipantId,
    pub connection_id: ConnectionId,
    pub role: Role,
    pub ice_servers: Vec<String>,
    pub trickle: bool,
    pub events: LinkEvents,
}

/// One live point-to-point connection.
pub trait PeerLink: Send {
    /// Apply a remote signaling payload.
    ///
    /// # Errors
    ///
    /// `MalformedSignal` if the payload cannot be applied, `Destroyed` after
    /// [`PeerLink::destroy`].
    fn signal(&mut self, payload: SignalPayload) -> Result<(), TransportError>;

    /// Tear the link down. Must be idempotent.
    fn destroy(&mut self);

    fn is_destroyed(&self) -> bool;
}

/// Factory for links; the transport capability itself.
pub trait PeerConnector: Send + Sync {
    /// Open a link. Initiator links start negotiating immediately; receiver
    /// links wait for the first remote payload.
    ///
    /// # Errors
    ///
    /// `OpenFailed` if the transport cannot create the link.
    fn open(&self, params: LinkParams) -> Result<Box<dyn PeerLink>, TransportError>;
}
