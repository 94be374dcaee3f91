//! In-memory room signaling server for simulations and tests.
//!
//! Speaks the same frames a real signaling server does: a connecting client
//! receives `room-joined` with the current members, everyone else receives
//! `user-joined`, `signal` frames are relayed to their target, and a client
//! that disconnects is announced with `user-disconnected`.

use crate::errors::MeshError;
use crate::signaling::{
    ClientEvent, InboundSignal, RoomJoined, RoomParticipant, ServerEvent, UserDisconnected,
    UserJoined,
};

use common::types::{ParticipantId, RoomId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Frame buffer per connected client.
const CLIENT_CHANNEL_BUFFER: usize = 256;

/// The client's side of a relay connection.
#[derive(Debug)]
pub struct RelayConnection {
    /// Frames from the server.
    pub inbound: mpsc::Receiver<String>,
    /// Frames to the server.
    pub outbound: mpsc::Sender<String>,
}

/// Room relay shared by every local participant.
#[derive(Debug, Clone)]
pub struct RoomRelay {
    room_id: RoomId,
    members: Arc<Mutex<BTreeMap<ParticipantId, mpsc::Sender<String>>>>,
    dropped_frames: Arc<AtomicU64>,
}

impl RoomRelay {
    #[must_use]
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            members: Arc::new(Mutex::new(BTreeMap::new())),
            dropped_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Frames that could not be delivered because the recipient hung up.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Current members in id order.
    pub async fn members(&self) -> Vec<ParticipantId> {
        self.members.lock().await.keys().cloned().collect()
    }

    /// Admit `participant_id` and return its connection.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Internal` if the id is already connected.
    pub async fn connect(&self, participant_id: ParticipantId) -> Result<RelayConnection, MeshError> {
        let (to_client, inbound) = mpsc::channel(CLIENT_CHANNEL_BUFFER);
        let (outbound, from_client) = mpsc::channel(CLIENT_CHANNEL_BUFFER);

        let existing: Vec<(ParticipantId, mpsc::Sender<String>)> = {
            let mut members = self.members.lock().await;
            if members.contains_key(&participant_id) {
                return Err(MeshError::Internal(format!(
                    "participant already connected: {participant_id}"
                )));
            }
            let existing = members
                .iter()
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect();
            members.insert(participant_id.clone(), to_client.clone());
            existing
        };

        let joined = ServerEvent::RoomJoined(RoomJoined {
            user_id: participant_id.clone(),
            participants: existing
                .iter()
                .map(|(id, _)| RoomParticipant {
                    id: id.clone(),
                    user_name: Some(id.to_string()),
                    preferred_language: None,
                })
                .collect(),
        })
        .encode()?;
        self.deliver(&to_client, &participant_id, "room-joined", joined)
            .await;

        let announce = ServerEvent::UserJoined(UserJoined {
            user_id: participant_id.clone(),
            user_name: Some(participant_id.to_string()),
            preferred_language: None,
        })
        .encode()?;
        for (id, tx) in &existing {
            self.deliver(tx, id, "user-joined", announce.clone()).await;
        }

        info!(
            target: "mesh.relay",
            room_id = %self.room_id,
            participant_id = %participant_id,
            existing = existing.len(),
            "Participant connected to relay"
        );

        tokio::spawn(self.clone().pump(participant_id, from_client));

        Ok(RelayConnection { inbound, outbound })
    }

    /// Remove `participant_id` and announce the departure.
    pub async fn disconnect(&self, participant_id: &ParticipantId) {
        let remaining: Vec<(ParticipantId, mpsc::Sender<String>)> = {
            let mut members = self.members.lock().await;
            if members.remove(participant_id).is_none() {
                return;
            }
            members
                .iter()
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect()
        };

        let Ok(frame) = ServerEvent::UserDisconnected(UserDisconnected {
            user_id: participant_id.clone(),
        })
        .encode() else {
            return;
        };
        for (id, tx) in &remaining {
            self.deliver(tx, id, "user-disconnected", frame.clone()).await;
        }

        info!(
            target: "mesh.relay",
            room_id = %self.room_id,
            participant_id = %participant_id,
            "Participant left relay"
        );
    }

    /// Relay frames from one client until it hangs up.
    async fn pump(self, sender_id: ParticipantId, mut from_client: mpsc::Receiver<String>) {
        while let Some(text) = from_client.recv().await {
            let ClientEvent::Signal(signal) = match ClientEvent::decode(&text) {
                Ok(event) => event,
                Err(e) => {
                    warn!(target: "mesh.relay", sender = %sender_id, error = %e, "Unreadable client frame");
                    continue;
                }
            };

            if signal.user_id != sender_id {
                warn!(target: "mesh.relay", sender = %sender_id, claimed = %signal.user_id, "Spoofed sender rejected");
                continue;
            }

            let target = self.members.lock().await.get(&signal.target_user_id).cloned();
            let Some(target) = target else {
                debug!(target: "mesh.relay", target_id = %signal.target_user_id, "Signal for absent participant dropped");
                continue;
            };

            let relayed = ServerEvent::Signal(InboundSignal {
                user_id: sender_id.clone(),
                signal: signal.signal,
            })
            .encode();
            match relayed {
                Ok(frame) => {
                    self.deliver(&target, &signal.target_user_id, "signal", frame)
                        .await;
                }
                Err(e) => {
                    warn!(target: "mesh.relay", sender = %sender_id, error = %e, "Signal not encodable");
                }
            }
        }

        self.disconnect(&sender_id).await;
    }

    /// Send one frame to a member. Returns false if the member already hung up.
    async fn deliver(
        &self,
        tx: &mpsc::Sender<String>,
        recipient: &ParticipantId,
        event: &'static str,
        frame: String,
    ) -> bool {
        if tx.send(frame).await.is_ok() {
            return true;
        }
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "mesh.relay",
            room_id = %self.room_id,
            recipient = %recipient,
            event = event,
            "Recipient gone, frame dropped"
        );
        false
    }
}
