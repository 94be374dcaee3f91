//! Message types for the mesh actor mailbox.
//!
//! Commands from the signaling bridge and the presentation layer arrive over a
//! bounded `tokio::sync::mpsc` channel. Request-reply uses `tokio::sync::oneshot`.

use crate::registry::MeshSnapshot;
use crate::transport::SignalPayload;

use common::types::{ConnectionId, ParticipantId};
use tokio::sync::oneshot;

/// Messages sent to `MeshActor`.
#[derive(Debug)]
pub enum MeshMessage {
    /// The local user joined; these participants were already present.
    JoinRoom {
        existing: Vec<ParticipantId>,
        /// Receives the registry view after initiating toward `existing`.
        respond_to: oneshot::Sender<MeshSnapshot>,
    },

    /// Someone joined after the local user.
    ParticipantJoined { remote_id: ParticipantId },

    /// Someone left the room.
    ParticipantLeft { remote_id: ParticipantId },

    /// Inbound signaling payload from `remote_id`.
    Signal {
        remote_id: ParticipantId,
        payload: SignalPayload,
    },

    /// Read the current registry view.
    GetSnapshot {
        respond_to: oneshot::Sender<MeshSnapshot>,
    },

    /// A backoff timer fired. Posted by the actor's own timer tasks.
    RetryDue {
        remote_id: ParticipantId,
        connection_id: ConnectionId,
    },

    /// Tear down every connection and stop the actor.
    EndSession {
        /// Receives the number of peers torn down.
        respond_to: oneshot::Sender<usize>,
    },
}

impl MeshMessage {
    /// Message name for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MeshMessage::JoinRoom { .. } => "join_room",
            MeshMessage::ParticipantJoined { .. } => "participant_joined",
            MeshMessage::ParticipantLeft { .. } => "participant_left",
            MeshMessage::Signal { .. } => "signal",
            MeshMessage::GetSnapshot { .. } => "get_snapshot",
            MeshMessage::RetryDue { .. } => "retry_due",
            MeshMessage::EndSession { .. } => "end_session",
        }
    }
}
