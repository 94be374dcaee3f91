//! Signaling wire format and the bridge between a signaling connection and
//! the mesh actor.
//!
//! Frames are JSON objects `{ "event": <name>, "data": <body> }` with
//! camelCase field names. Only the events the mesh consumes are modelled;
//! anything else decodes to [`ServerEvent::Other`] and is ignored.

use crate::actors::MeshActorHandle;
use crate::controller::OutboundSignal;
use crate::errors::MeshError;
use crate::transport::SignalPayload;

use common::types::{ParticipantId, RoomId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const EVENT_ROOM_JOINED: &str = "room-joined";
pub const EVENT_USER_JOINED: &str = "user-joined";
pub const EVENT_USER_DISCONNECTED: &str = "user-disconnected";
pub const EVENT_SIGNAL: &str = "signal";

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// A participant listed in the `room-joined` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomParticipant {
    pub id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    pub user_id: ParticipantId,
    #[serde(default)]
    pub participants: Vec<RoomParticipant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoined {
    pub user_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDisconnected {
    pub user_id: ParticipantId,
}

/// Signal relayed by the server; `user_id` is the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundSignal {
    pub user_id: ParticipantId,
    pub signal: SignalPayload,
}

/// Signal sent to the server for relay to `target_user_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySignal {
    pub signal: SignalPayload,
    pub user_id: ParticipantId,
    pub room_id: RoomId,
    pub target_user_id: ParticipantId,
}

/// Events received from the signaling server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    RoomJoined(RoomJoined),
    UserJoined(UserJoined),
    UserDisconnected(UserDisconnected),
    Signal(InboundSignal),
    /// Any event the mesh does not consume.
    Other(String),
}

impl ServerEvent {
    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Decode` if the frame is not JSON or a known event
    /// has the wrong shape.
    pub fn decode(text: &str) -> Result<Self, MeshError> {
        let frame: Frame = serde_json::from_str(text)?;
        let event = match frame.event.as_str() {
            EVENT_ROOM_JOINED => ServerEvent::RoomJoined(body(frame.data)?),
            EVENT_USER_JOINED => ServerEvent::UserJoined(body(frame.data)?),
            EVENT_USER_DISCONNECTED => ServerEvent::UserDisconnected(body(frame.data)?),
            EVENT_SIGNAL => ServerEvent::Signal(body(frame.data)?),
            _ => ServerEvent::Other(frame.event),
        };
        Ok(event)
    }

    /// Encode as a text frame.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Decode` if serialization fails, or
    /// `MeshError::Internal` for [`ServerEvent::Other`], which has no body.
    pub fn encode(&self) -> Result<String, MeshError> {
        match self {
            ServerEvent::RoomJoined(data) => frame(EVENT_ROOM_JOINED, data),
            ServerEvent::UserJoined(data) => frame(EVENT_USER_JOINED, data),
            ServerEvent::UserDisconnected(data) => frame(EVENT_USER_DISCONNECTED, data),
            ServerEvent::Signal(data) => frame(EVENT_SIGNAL, data),
            ServerEvent::Other(name) => Err(MeshError::Internal(format!(
                "cannot encode opaque event: {name}"
            ))),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            ServerEvent::RoomJoined(_) => EVENT_ROOM_JOINED,
            ServerEvent::UserJoined(_) => EVENT_USER_JOINED,
            ServerEvent::UserDisconnected(_) => EVENT_USER_DISCONNECTED,
            ServerEvent::Signal(_) => EVENT_SIGNAL,
            ServerEvent::Other(name) => name,
        }
    }
}

/// Events sent to the signaling server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Signal(RelaySignal),
}

impl ClientEvent {
    /// # Errors
    ///
    /// Returns `MeshError::Decode` if serialization fails.
    pub fn encode(&self) -> Result<String, MeshError> {
        match self {
            ClientEvent::Signal(data) => frame(EVENT_SIGNAL, data),
        }
    }

    /// # Errors
    ///
    /// Returns `MeshError::Decode` for malformed or unknown frames.
    pub fn decode(text: &str) -> Result<Self, MeshError> {
        let frame: Frame = serde_json::from_str(text)?;
        match frame.event.as_str() {
            EVENT_SIGNAL => Ok(ClientEvent::Signal(body(frame.data)?)),
            other => Err(MeshError::Decode(format!("unknown client event: {other}"))),
        }
    }
}

fn body<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, MeshError> {
    Ok(serde_json::from_value(data)?)
}

fn frame<T: Serialize>(event: &str, data: &T) -> Result<String, MeshError> {
    let frame = Frame {
        event: event.to_string(),
        data: serde_json::to_value(data)?,
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Pumps frames between one signaling connection and one mesh actor.
pub struct SignalingBridge {
    handle: MeshActorHandle,
    room_id: RoomId,
    outbound_signals: mpsc::UnboundedReceiver<OutboundSignal>,
}

impl SignalingBridge {
    /// `outbound_signals` is the receiving half of the channel the actor
    /// was spawned with.
    #[must_use]
    pub fn new(
        handle: MeshActorHandle,
        room_id: RoomId,
        outbound_signals: mpsc::UnboundedReceiver<OutboundSignal>,
    ) -> Self {
        Self {
            handle,
            room_id,
            outbound_signals,
        }
    }

    /// Run until the connection closes, the actor stops, or `cancel_token` fires.
    #[instrument(skip_all, name = "mesh.signaling", fields(local_id = %self.handle.local_id(), room_id = %self.room_id))]
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!(target: "mesh.signaling", "Bridge cancelled");
                    break;
                }

                frame = inbound.recv() => {
                    let Some(text) = frame else {
                        info!(target: "mesh.signaling", "Signaling connection closed");
                        break;
                    };
                    if let Err(e) = self.dispatch(&text).await {
                        if e.is_recoverable() {
                            warn!(target: "mesh.signaling", error = %e, "Inbound frame skipped");
                        } else {
                            info!(target: "mesh.signaling", error = %e, "Mesh actor gone, bridge stopping");
                            break;
                        }
                    }
                }

                signal = self.outbound_signals.recv() => {
                    let Some(signal) = signal else {
                        debug!(target: "mesh.signaling", "Outbound signal channel closed");
                        break;
                    };
                    match self.encode_outbound(signal) {
                        Ok(text) => {
                            if outbound.send(text).await.is_err() {
                                info!(target: "mesh.signaling", "Signaling connection closed");
                                break;
                            }
                        }
                        Err(e) => warn!(target: "mesh.signaling", error = %e, "Outbound signal not encodable"),
                    }
                }
            }
        }
    }

    async fn dispatch(&self, text: &str) -> Result<(), MeshError> {
        let event = ServerEvent::decode(text)?;
        debug!(target: "mesh.signaling", event = event.name(), "Inbound event");

        match event {
            ServerEvent::RoomJoined(joined) => {
                if &joined.user_id != self.handle.local_id() {
                    warn!(
                        target: "mesh.signaling",
                        assigned = %joined.user_id,
                        "Server assigned a different participant id"
                    );
                }
                let existing = joined
                    .participants
                    .into_iter()
                    .filter_map(|p| match ParticipantId::parse(p.id.as_str()) {
                        Ok(id) => Some(id),
                        Err(e) => {
                            warn!(target: "mesh.signaling", error = %e, "Room member skipped");
                            None
                        }
                    })
                    .collect();
                let snapshot = self.handle.join_room(existing).await?;
                info!(target: "mesh.signaling", peers = snapshot.len(), "Room joined");
            }
            ServerEvent::UserJoined(joined) => {
                let remote_id = ParticipantId::parse(joined.user_id.as_str())?;
                self.handle.participant_joined(remote_id).await?;
            }
            ServerEvent::UserDisconnected(left) => {
                let remote_id = ParticipantId::parse(left.user_id.as_str())?;
                self.handle.participant_left(remote_id).await?;
            }
            ServerEvent::Signal(signal) => {
                let remote_id = ParticipantId::parse(signal.user_id.as_str())?;
                self.handle.signal(remote_id, signal.signal).await?;
            }
            ServerEvent::Other(_) => {}
        }
        Ok(())
    }

    fn encode_outbound(&self, signal: OutboundSignal) -> Result<String, MeshError> {
        ClientEvent::Signal(RelaySignal {
            signal: signal.payload,
            user_id: self.handle.local_id().clone(),
            room_id: self.room_id.clone(),
            target_user_id: signal.target,
        })
        .encode()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::{MeshActor, MeshMetrics};
    use crate::config::Config;
    use crate::loopback::LoopbackNetwork;
    use serde_json::json;

    #[test]
    fn test_decode_room_joined() {
        let text = json!({
            "event": "room-joined",
            "data": {
                "userId": "alice",
                "participants": [
                    { "id": "bob", "userName": "Bob", "preferredLanguage": "en",
                      "isAudioEnabled": true, "isVideoEnabled": false },
                    { "id": "carol" }
                ]
            }
        })
        .to_string();

        let ServerEvent::RoomJoined(joined) = ServerEvent::decode(&text).unwrap() else {
            panic!("expected room-joined");
        };
        assert_eq!(joined.user_id.as_str(), "alice");
        assert_eq!(joined.participants.len(), 2);
        let bob = joined.participants.first().unwrap();
        assert_eq!(bob.user_name.as_deref(), Some("Bob"));
        assert_eq!(joined.participants.get(1).unwrap().id.as_str(), "carol");
    }

    #[test]
    fn test_decode_signal_keeps_payload_opaque() {
        let text = json!({
            "event": "signal",
            "data": { "userId": "bob", "signal": { "type": "offer", "sdp": "v=0" } }
        })
        .to_string();

        let ServerEvent::Signal(signal) = ServerEvent::decode(&text).unwrap() else {
            panic!("expected signal");
        };
        assert_eq!(signal.user_id.as_str(), "bob");
        assert_eq!(signal.signal.kind(), Some("offer"));
        assert_eq!(signal.signal.as_value()["sdp"], "v=0");
    }

    #[test]
    fn test_decode_unknown_event() {
        let text = r#"{"event":"translated-message","data":{"text":"hola"}}"#;
        assert_eq!(
            ServerEvent::decode(text).unwrap(),
            ServerEvent::Other("translated-message".to_string())
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            ServerEvent::decode("not json"),
            Err(MeshError::Decode(_))
        ));
        // Known event, wrong shape.
        assert!(matches!(
            ServerEvent::decode(r#"{"event":"user-disconnected","data":{}}"#),
            Err(MeshError::Decode(_))
        ));
    }

    #[test]
    fn test_encode_client_signal_field_names() {
        let event = ClientEvent::Signal(RelaySignal {
            signal: SignalPayload::new(json!({ "type": "answer" })),
            user_id: ParticipantId::new("alice"),
            room_id: RoomId::new("room-1"),
            target_user_id: ParticipantId::new("bob"),
        });

        let value: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "signal");
        assert_eq!(value["data"]["userId"], "alice");
        assert_eq!(value["data"]["roomId"], "room-1");
        assert_eq!(value["data"]["targetUserId"], "bob");
        assert_eq!(value["data"]["signal"]["type"], "answer");
    }

    #[test]
    fn test_encode_other_is_rejected() {
        assert!(ServerEvent::Other("x".to_string()).encode().is_err());
    }

    #[tokio::test]
    async fn test_blank_ids_are_skipped_and_ids_trimmed() {
        let network = LoopbackNetwork::new();
        let local = ParticipantId::new("alice");
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (handle, _task) = MeshActor::spawn(
            local.clone(),
            network.connector(local),
            &Config::default(),
            outbound_tx,
            CancellationToken::new(),
            MeshMetrics::new(),
        );

        let (frames_tx, frames_rx) = mpsc::channel(16);
        let (out_tx, _out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let bridge = SignalingBridge::new(handle.clone(), RoomId::new("room-1"), outbound_rx);
        let bridge_task = tokio::spawn(bridge.run(frames_rx, out_tx, cancel.clone()));

        let frames = [
            json!({ "event": "room-joined", "data": {
                "userId": "alice",
                "participants": [{ "id": "  " }, { "id": " bob " }]
            }}),
            json!({ "event": "user-joined", "data": { "userId": "" } }),
            json!({ "event": "signal", "data": { "userId": " ", "signal": { "type": "offer" } } }),
            json!({ "event": "user-joined", "data": { "userId": "carol" } }),
        ];
        for frame in frames {
            frames_tx.send(frame.to_string()).await.unwrap();
        }

        // The bridge survives the bad frames and forwards the good ones.
        let mut snapshots = handle.subscribe();
        let snapshot = loop {
            let current = snapshots.borrow_and_update().clone();
            if current.len() == 2 {
                break current;
            }
            snapshots.changed().await.unwrap();
        };
        assert!(snapshot.get(&ParticipantId::new("bob")).is_some());
        assert!(snapshot.get(&ParticipantId::new("carol")).is_some());
        assert!(snapshot.get(&ParticipantId::new("")).is_none());
        assert!(snapshot.get(&ParticipantId::new(" ")).is_none());

        cancel.cancel();
        bridge_task.await.unwrap();
        handle.cancel();
    }
}
