//! `MeshController` - the orchestration state machine for one room session.
//!
//! Turns membership events, inbound signals and transport events into
//! registry mutations plus a list of [`Effect`]s for the caller to execute.
//! The controller never sleeps, spawns or sends on a channel itself; time is
//! passed in as `now`, and timers are requested with [`Effect::ScheduleRetry`].
//!
//! # Per-participant lifecycle
//!
//! ```text
//! ABSENT ──joined/snapshot──▶ CONNECTING(initiator) ─┐
//! ABSENT ──first signal────▶ CONNECTING(receiver) ──┤
//!                                                    ├─stream──▶ CONNECTED
//!            CONNECTING | CONNECTED ──close/error──▶ FAILED
//!            FAILED ──budget left──▶ RETRYING ──backoff elapsed──▶ CONNECTING(same role)
//!            FAILED ──budget spent──▶ ABANDONED (removed)
//! ```
//!
//! A newcomer initiates toward everyone in its room snapshot, and members
//! already present initiate toward the newcomer when they see it join. Both
//! offers of a pair may cross; the transport answers whichever arrives and the
//! first stream wins.

use crate::actors::metrics::MeshMetrics;
use crate::observability::metrics as obs;
use crate::policy::{ReconnectPolicy, RetryDecision};
use crate::registry::{ConnectionRecord, MeshSnapshot, PeerRegistry, PeerState, Role};
use crate::transport::{
    LinkParams, MediaStreamHandle, PeerConnector, SignalPayload, TransportError, TransportEvent,
    TransportEventKind, TransportEventSender,
};

use common::types::{ConnectionId, ParticipantId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A signaling payload that must be delivered to exactly one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub target: ParticipantId,
    pub payload: SignalPayload,
}

/// Why a peer left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The remote participant left the room.
    Left,
    /// The retry budget ran out ("connection lost").
    Abandoned,
    /// The local session ended.
    SessionEnded,
}

impl RemovalReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Left => "left",
            RemovalReason::Abandoned => "abandoned",
            RemovalReason::SessionEnded => "session_ended",
        }
    }
}

/// Notification for the presentation layer.
#[derive(Debug, Clone)]
pub enum MeshNotification {
    /// A peer reached CONNECTED and its stream can be rendered.
    StreamAvailable {
        remote_id: ParticipantId,
        stream: MediaStreamHandle,
    },
    /// A peer was removed from the registry.
    Removed {
        remote_id: ParticipantId,
        reason: RemovalReason,
        final_state: PeerState,
        reconnect_attempts: u32,
    },
}

/// Side effect requested by the controller.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Send a payload over the signaling channel.
    SendSignal(OutboundSignal),
    /// Post a retry for `remote_id` after `delay`, tagged with the failed instance.
    ScheduleRetry {
        remote_id: ParticipantId,
        connection_id: ConnectionId,
        delay: Duration,
    },
    /// Drop any pending retry timer for `remote_id`.
    CancelRetry { remote_id: ParticipantId },
    /// Tell the presentation layer something changed.
    Notify(MeshNotification),
}

/// What asked for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryTrigger {
    Signal,
    Timer,
}

/// Settings the controller needs from the session configuration.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub policy: ReconnectPolicy,
    pub auto_reconnect: bool,
    pub ice_servers: Vec<String>,
    pub trickle: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        let config = crate::config::Config::default();
        Self::from(&config)
    }
}

impl From<&crate::config::Config> for ControllerSettings {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            policy: config.reconnect_policy(),
            auto_reconnect: config.auto_reconnect,
            ice_servers: config.ice_servers.clone(),
            trickle: config.trickle,
        }
    }
}

/// The orchestration core for one room session.
pub struct MeshController {
    local_id: ParticipantId,
    registry: PeerRegistry,
    connector: Arc<dyn PeerConnector>,
    events: TransportEventSender,
    settings: ControllerSettings,
    metrics: Arc<MeshMetrics>,
    changed: bool,
}

impl MeshController {
    #[must_use]
    pub fn new(
        local_id: ParticipantId,
        connector: Arc<dyn PeerConnector>,
        events: TransportEventSender,
        settings: ControllerSettings,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            local_id,
            registry: PeerRegistry::new(),
            connector,
            events,
            settings,
            metrics,
            changed: false,
        }
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    #[must_use]
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    #[must_use]
    pub fn snapshot(&self) -> MeshSnapshot {
        self.registry.snapshot()
    }

    /// Returns whether the registry changed since the last call, and clears the flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    /// Local user joined; initiate toward everyone already present.
    pub fn join_room<I>(&mut self, existing: I, now: Instant) -> Vec<Effect>
    where
        I: IntoIterator<Item = ParticipantId>,
    {
        let mut effects = Vec::new();
        let mut count = 0usize;
        for remote_id in existing {
            count += 1;
            effects.extend(self.participant_joined(remote_id, now));
        }
        info!(
            target: "mesh.controller",
            local_id = %self.local_id,
            existing = count,
            peers = self.registry.len(),
            "Joined room"
        );
        effects
    }

    /// A participant joined after us; initiate toward them.
    pub fn participant_joined(&mut self, remote_id: ParticipantId, now: Instant) -> Vec<Effect> {
        if remote_id == self.local_id {
            return Vec::new();
        }

        let mut effects = Vec::new();
        if let Some(record) = self.registry.get(&remote_id) {
            if record.state().is_live() {
                debug!(
                    target: "mesh.controller",
                    remote_id = %remote_id,
                    state = record.state().as_str(),
                    "Peer already exists, ignoring duplicate join"
                );
                return effects;
            }
            // Failed record for someone who re-joined: start a fresh cycle.
            effects.push(Effect::CancelRetry {
                remote_id: remote_id.clone(),
            });
        }

        self.create(remote_id, Role::Initiator, None, now, &mut effects);
        effects
    }

    /// A participant left; tear down immediately regardless of state.
    pub fn participant_left(&mut self, remote_id: &ParticipantId) -> Vec<Effect> {
        let Some(record) = self.registry.remove(remote_id) else {
            return Vec::new();
        };
        self.changed = true;

        info!(
            target: "mesh.controller",
            remote_id = %remote_id,
            state = record.state().as_str(),
            "Participant left, peer removed"
        );

        let effects = vec![
            Effect::CancelRetry {
                remote_id: remote_id.clone(),
            },
            Effect::Notify(MeshNotification::Removed {
                remote_id: remote_id.clone(),
                reason: RemovalReason::Left,
                final_state: record.state(),
                reconnect_attempts: record.reconnect_attempts(),
            }),
        ];
        self.retire(record, RemovalReason::Left);
        effects
    }

    /// Route an inbound signaling payload.
    pub fn route_signal(
        &mut self,
        remote_id: ParticipantId,
        payload: SignalPayload,
        now: Instant,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if remote_id == self.local_id {
            obs::record_signal_dropped("self");
            return effects;
        }

        let state = self.registry.get(&remote_id).map(ConnectionRecord::state);
        match state {
            None => {
                self.create(remote_id, Role::Receiver, Some(payload), now, &mut effects);
            }
            Some(state) if state.is_live() => {
                self.forward(&remote_id, payload, now, &mut effects);
            }
            Some(_) => {
                // Stale negotiation for a dead instance cannot be replayed.
                debug!(
                    target: "mesh.controller",
                    remote_id = %remote_id,
                    kind = payload.kind().unwrap_or("unknown"),
                    "Signal for failed peer discarded, evaluating reconnection"
                );
                obs::record_signal_dropped("failed_peer");
                self.attempt_retry(&remote_id, RetryTrigger::Signal, now, &mut effects);
            }
        }
        effects
    }

    /// Handle a callback from a link.
    pub fn on_transport_event(&mut self, event: TransportEvent, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        let TransportEvent {
            remote_id,
            connection_id,
            kind,
        } = event;

        let Some(record) = self.registry.get_mut(&remote_id) else {
            debug!(
                target: "mesh.controller",
                remote_id = %remote_id,
                event = kind.as_str(),
                "Transport event for unknown peer ignored"
            );
            obs::record_signal_dropped("unknown_peer");
            return effects;
        };

        if !record.owns(connection_id) {
            debug!(
                target: "mesh.controller",
                remote_id = %remote_id,
                connection_id = %connection_id,
                event = kind.as_str(),
                "Transport event from superseded connection ignored"
            );
            obs::record_signal_dropped("superseded");
            return effects;
        }

        match kind {
            TransportEventKind::LocalSignal(payload) => {
                if record.state().is_live() {
                    effects.push(Effect::SendSignal(OutboundSignal {
                        target: remote_id,
                        payload,
                    }));
                } else {
                    obs::record_signal_dropped("not_live");
                }
            }
            TransportEventKind::RemoteStream(stream) => {
                if record.state().is_live() && record.bind_stream(Arc::clone(&stream)) {
                    self.changed = true;
                    obs::record_state_transition(PeerState::Connected);
                    info!(
                        target: "mesh.controller",
                        remote_id = %remote_id,
                        stream_id = stream.id(),
                        role = record.role().as_str(),
                        "Peer connected, remote stream bound"
                    );
                    effects.push(Effect::Notify(MeshNotification::StreamAvailable {
                        remote_id,
                        stream,
                    }));
                }
            }
            TransportEventKind::Closed => {
                if record.state().is_live() {
                    self.fail(&remote_id, "closed", now, &mut effects);
                }
            }
            TransportEventKind::Error(error) => {
                if record.state().is_live() {
                    debug!(
                        target: "mesh.controller",
                        remote_id = %remote_id,
                        error = %error,
                        "Transport error"
                    );
                    self.fail(&remote_id, "error", now, &mut effects);
                }
            }
        }
        effects
    }

    /// A backoff timer fired for the instance `connection_id`.
    pub fn retry_due(
        &mut self,
        remote_id: &ParticipantId,
        connection_id: ConnectionId,
        now: Instant,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let current = self
            .registry
            .get(remote_id)
            .filter(|r| r.owns(connection_id) && r.state().is_failed());
        if current.is_none() {
            debug!(
                target: "mesh.controller",
                remote_id = %remote_id,
                "Stale retry timer ignored"
            );
            return effects;
        }
        self.attempt_retry(remote_id, RetryTrigger::Timer, now, &mut effects);
        effects
    }

    /// Bulk teardown: destroy every link once and report each removal.
    pub fn teardown(&mut self) -> Vec<Effect> {
        let records = self.registry.drain();
        if !records.is_empty() {
            self.changed = true;
        }

        let mut effects = Vec::with_capacity(records.len());
        for record in records {
            effects.push(Effect::Notify(MeshNotification::Removed {
                remote_id: record.remote_id().clone(),
                reason: RemovalReason::SessionEnded,
                final_state: record.state(),
                reconnect_attempts: record.reconnect_attempts(),
            }));
            self.retire(record, RemovalReason::SessionEnded);
        }

        info!(
            target: "mesh.controller",
            local_id = %self.local_id,
            removed = effects.len(),
            "Mesh torn down"
        );
        effects
    }

    fn create(
        &mut self,
        remote_id: ParticipantId,
        role: Role,
        seed: Option<SignalPayload>,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        let connection_id = ConnectionId::new();
        let link = self.open_link(&remote_id, connection_id, role);
        let opened = link.is_some();

        debug!(
            target: "mesh.controller",
            remote_id = %remote_id,
            role = role.as_str(),
            connection_id = %connection_id,
            "Creating peer"
        );

        self.registry.upsert(ConnectionRecord::new(
            remote_id.clone(),
            role,
            connection_id,
            link,
        ));
        self.changed = true;
        obs::record_state_transition(PeerState::Connecting);

        if !opened {
            self.fail(&remote_id, "open_failed", now, effects);
            return;
        }

        if let Some(payload) = seed {
            self.forward(&remote_id, payload, now, effects);
        }
    }

    fn open_link(
        &self,
        remote_id: &ParticipantId,
        connection_id: ConnectionId,
        role: Role,
    ) -> Option<Box<dyn crate::transport::PeerLink>> {
        let params = LinkParams {
            remote_id: remote_id.clone(),
            connection_id,
            role,
            ice_servers: self.settings.ice_servers.clone(),
            trickle: self.settings.trickle,
            events: self.events.scoped(remote_id.clone(), connection_id),
        };

        match self.connector.open(params) {
            Ok(link) => {
                self.metrics.connection_opened();
                obs::record_connection_opened(role.as_str());
                Some(link)
            }
            Err(error) => {
                warn!(
                    target: "mesh.controller",
                    remote_id = %remote_id,
                    error = %error,
                    "Transport refused to open connection"
                );
                None
            }
        }
    }

    fn forward(
        &mut self,
        remote_id: &ParticipantId,
        payload: SignalPayload,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        let Some(link) = self
            .registry
            .get_mut(remote_id)
            .and_then(ConnectionRecord::link_mut)
        else {
            obs::record_signal_dropped("no_link");
            return;
        };

        if link.is_destroyed() {
            // Racing with teardown; not an error.
            obs::record_signal_dropped("destroyed");
            return;
        }

        match link.signal(payload) {
            Ok(()) => {}
            Err(TransportError::Destroyed) => {
                obs::record_signal_dropped("destroyed");
            }
            Err(error) => {
                warn!(
                    target: "mesh.controller",
                    remote_id = %remote_id,
                    error = %error,
                    "Signal rejected by connection, treating as transport failure"
                );
                self.fail(remote_id, "rejected_signal", now, effects);
            }
        }
    }

    fn fail(
        &mut self,
        remote_id: &ParticipantId,
        cause: &'static str,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        let policy = self.settings.policy;
        let auto_reconnect = self.settings.auto_reconnect;

        let Some(record) = self.registry.get_mut(remote_id) else {
            return;
        };

        if record.destroy_link() {
            self.metrics.connection_destroyed();
        }
        record.set_state(PeerState::Failed);
        self.changed = true;
        obs::record_state_transition(PeerState::Failed);

        let attempts = record.reconnect_attempts();
        info!(
            target: "mesh.controller",
            remote_id = %remote_id,
            cause = cause,
            attempts = attempts,
            max_attempts = policy.max_attempts(),
            "Peer connection failed"
        );

        let last_reconnect_at = record.last_reconnect_at();
        match policy.evaluate(attempts, last_reconnect_at, now) {
            RetryDecision::Abandon => self.abandon(remote_id, effects),
            RetryDecision::Retry | RetryDecision::Wait(_) if auto_reconnect => {
                let delay = policy.retry_delay(attempts, last_reconnect_at, now);
                record.set_state(PeerState::Retrying);
                obs::record_state_transition(PeerState::Retrying);
                obs::record_backoff_delay(delay);
                effects.push(Effect::ScheduleRetry {
                    remote_id: remote_id.clone(),
                    connection_id: record.connection_id(),
                    delay,
                });
            }
            RetryDecision::Retry | RetryDecision::Wait(_) => {}
        }
    }

    fn attempt_retry(
        &mut self,
        remote_id: &ParticipantId,
        trigger: RetryTrigger,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        let policy = self.settings.policy;
        let Some(record) = self.registry.get(remote_id) else {
            return;
        };

        match policy.evaluate(record.reconnect_attempts(), record.last_reconnect_at(), now) {
            RetryDecision::Abandon => self.abandon(remote_id, effects),
            RetryDecision::Wait(remaining) => {
                debug!(
                    target: "mesh.controller",
                    remote_id = %remote_id,
                    remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                    "Inside backoff window, retry skipped"
                );
                obs::record_signal_dropped("backoff");
                if trigger == RetryTrigger::Timer {
                    effects.push(Effect::ScheduleRetry {
                        remote_id: remote_id.clone(),
                        connection_id: record.connection_id(),
                        delay: remaining,
                    });
                }
            }
            RetryDecision::Retry => {
                let role = record.role();
                if trigger == RetryTrigger::Signal && record.state() == PeerState::Retrying {
                    effects.push(Effect::CancelRetry {
                        remote_id: remote_id.clone(),
                    });
                }
                self.recreate(remote_id, role, now, effects);
            }
        }
    }

    fn recreate(
        &mut self,
        remote_id: &ParticipantId,
        role: Role,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        let connection_id = ConnectionId::new();
        let link = self.open_link(remote_id, connection_id, role);
        let opened = link.is_some();

        let Some(record) = self.registry.get_mut(remote_id) else {
            return;
        };
        record.replace_link(connection_id, link, now);
        self.changed = true;
        self.metrics.reconnect_attempted();
        obs::record_reconnect_attempt(role.as_str());
        obs::record_state_transition(PeerState::Connecting);

        info!(
            target: "mesh.controller",
            remote_id = %remote_id,
            role = role.as_str(),
            attempt = record.reconnect_attempts(),
            max_attempts = self.settings.policy.max_attempts(),
            "Reconnecting peer"
        );

        if !opened {
            self.fail(remote_id, "open_failed", now, effects);
        }
    }

    fn abandon(&mut self, remote_id: &ParticipantId, effects: &mut Vec<Effect>) {
        let Some(record) = self.registry.remove(remote_id) else {
            return;
        };
        self.changed = true;

        warn!(
            target: "mesh.controller",
            remote_id = %remote_id,
            attempts = record.reconnect_attempts(),
            "Retry budget exhausted, peer abandoned"
        );

        effects.push(Effect::CancelRetry {
            remote_id: remote_id.clone(),
        });
        effects.push(Effect::Notify(MeshNotification::Removed {
            remote_id: remote_id.clone(),
            reason: RemovalReason::Abandoned,
            final_state: PeerState::Abandoned,
            reconnect_attempts: record.reconnect_attempts(),
        }));
        self.retire(record, RemovalReason::Abandoned);
    }

    fn retire(&self, mut record: ConnectionRecord, reason: RemovalReason) {
        if record.destroy_link() {
            self.metrics.connection_destroyed();
        }
        if reason == RemovalReason::Abandoned {
            self.metrics.peer_abandoned();
        }
        obs::record_peer_removed(reason.as_str());
        obs::set_peers_active(self.registry.len());
    }
}
