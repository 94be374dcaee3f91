//! In-process transport for simulations and tests.
//!
//! Every participant gets a [`LoopbackConnector`] from a shared
//! [`LoopbackNetwork`]. Links do not talk to each other directly: whatever a
//! link emits goes back through its session as an outbound signal, so the
//! signaling path is exercised end to end. The network only tracks the live
//! instance per (local, remote) pair so failures can be injected.
//!
//! Negotiation is a two-message exchange:
//! - an initiator link emits `{"type":"offer"}` on open
//! - a link fed an offer emits `{"type":"answer"}` and reports the remote stream
//! - an initiator link fed an answer reports the remote stream
//!
//! With trickle enabled, offers and answers are followed by one candidate.

use crate::registry::Role;
use crate::transport::{
    LinkEvents, LinkParams, MediaStream, PeerConnector, PeerLink, SignalPayload, TransportError,
};

use common::types::{ConnectionId, ParticipantId};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Media stream produced by a loopback link.
#[derive(Debug)]
pub struct LoopbackStream {
    id: String,
}

impl MediaStream for LoopbackStream {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug)]
struct LinkEntry {
    connection_id: ConnectionId,
    events: LinkEvents,
    destroyed: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct NetworkState {
    /// Live link per (local, remote).
    links: HashMap<(ParticipantId, ParticipantId), LinkEntry>,
}

/// Shared registry of loopback links across local sessions.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    opened: Arc<AtomicU64>,
    destroyed: Arc<AtomicU64>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector for the session whose local participant is `local_id`.
    #[must_use]
    pub fn connector(&self, local_id: ParticipantId) -> Arc<dyn PeerConnector> {
        Arc::new(LoopbackConnector {
            local_id,
            network: self.clone(),
        })
    }

    /// Close both ends of the pair. Returns how many live links were closed.
    pub fn sever(&self, a: &ParticipantId, b: &ParticipantId) -> usize {
        let closed: Vec<LinkEvents> = {
            let Ok(state) = self.state.lock() else {
                return 0;
            };
            let live: Vec<LinkEvents> = [(a.clone(), b.clone()), (b.clone(), a.clone())]
                .iter()
                .filter_map(|key| state.links.get(key))
                .filter(|entry| !entry.destroyed.load(Ordering::SeqCst))
                .map(|entry| entry.events.clone())
                .collect();
            live
        };

        // Emit outside the lock.
        for events in &closed {
            events.closed();
        }

        info!(
            target: "mesh.loopback",
            a = %a,
            b = %b,
            closed = closed.len(),
            "Severed link pair"
        );
        closed.len()
    }

    /// Number of links currently open on the network.
    #[must_use]
    pub fn live_links(&self) -> usize {
        self.state
            .lock()
            .map(|state| {
                state
                    .links
                    .values()
                    .filter(|entry| !entry.destroyed.load(Ordering::SeqCst))
                    .count()
            })
            .unwrap_or(0)
    }

    #[must_use]
    pub fn links_opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn links_destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn register(&self, local: ParticipantId, remote: ParticipantId, entry: LinkEntry) {
        if let Ok(mut state) = self.state.lock() {
            state.links.insert((local, remote), entry);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn unregister(&self, local: &ParticipantId, remote: &ParticipantId, connection_id: ConnectionId) {
        if let Ok(mut state) = self.state.lock() {
            let key = (local.clone(), remote.clone());
            if state
                .links
                .get(&key)
                .is_some_and(|entry| entry.connection_id == connection_id)
            {
                state.links.remove(&key);
            }
        }
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// [`PeerConnector`] backed by a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackConnector {
    local_id: ParticipantId,
    network: LoopbackNetwork,
}

impl PeerConnector for LoopbackConnector {
    fn open(&self, params: LinkParams) -> Result<Box<dyn PeerLink>, TransportError> {
        let LinkParams {
            remote_id,
            connection_id,
            role,
            trickle,
            events,
            ..
        } = params;

        let destroyed = Arc::new(AtomicBool::new(false));
        self.network.register(
            self.local_id.clone(),
            remote_id.clone(),
            LinkEntry {
                connection_id,
                events: events.clone(),
                destroyed: Arc::clone(&destroyed),
            },
        );

        let link = LoopbackLink {
            local_id: self.local_id.clone(),
            remote_id,
            connection_id,
            role,
            trickle,
            events,
            destroyed,
            network: self.network.clone(),
        };

        debug!(
            target: "mesh.loopback",
            local_id = %link.local_id,
            remote_id = %link.remote_id,
            role = role.as_str(),
            "Loopback link opened"
        );

        if role == Role::Initiator {
            link.emit_description("offer");
        }
        Ok(Box::new(link))
    }
}

/// One end of a loopback pair.
#[derive(Debug)]
pub struct LoopbackLink {
    local_id: ParticipantId,
    remote_id: ParticipantId,
    connection_id: ConnectionId,
    role: Role,
    trickle: bool,
    events: LinkEvents,
    destroyed: Arc<AtomicBool>,
    network: LoopbackNetwork,
}

impl LoopbackLink {
    fn emit_description(&self, kind: &str) {
        self.events.local_signal(SignalPayload::new(json!({
            "type": kind,
            "sdp": format!("loopback {} -> {}", self.local_id, self.remote_id),
        })));
        if self.trickle {
            self.events.local_signal(SignalPayload::new(json!({
                "type": "candidate",
                "candidate": {
                    "candidate": format!("candidate:loopback {}", self.local_id),
                    "sdpMid": "0",
                    "sdpMLineIndex": 0,
                },
            })));
        }
    }

    fn report_stream(&self) {
        self.events.remote_stream(Arc::new(LoopbackStream {
            id: format!("{}:{}", self.remote_id, self.connection_id),
        }));
    }
}

impl PeerLink for LoopbackLink {
    fn signal(&mut self, payload: SignalPayload) -> Result<(), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }

        match payload.kind() {
            Some("offer") => {
                self.emit_description("answer");
                self.report_stream();
                Ok(())
            }
            Some("answer") if self.role == Role::Initiator => {
                self.report_stream();
                Ok(())
            }
            // Answers to a receiver and candidates need no action here.
            Some("answer" | "candidate") => Ok(()),
            Some(other) => Err(TransportError::MalformedSignal(format!(
                "unknown signal type: {other}"
            ))),
            None => Err(TransportError::MalformedSignal(
                "signal has no type".to_string(),
            )),
        }
    }

    fn destroy(&mut self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.network
            .unregister(&self.local_id, &self.remote_id, self.connection_id);
        debug!(
            target: "mesh.loopback",
            local_id = %self.local_id,
            remote_id = %self.remote_id,
            "Loopback link destroyed"
        );
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
