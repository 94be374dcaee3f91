//! Test fixtures: ids, payloads, configs and a controller harness.

use crate::mock_connector::MockConnector;

use common::types::ParticipantId;
use mesh_client::actors::MeshMetrics;
use mesh_client::config::Config;
use mesh_client::controller::{
    ControllerSettings, Effect, MeshController, MeshNotification, OutboundSignal, RemovalReason,
};
use mesh_client::policy::ReconnectPolicy;
use mesh_client::transport::{transport_event_channel, SignalPayload, TransportEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[must_use]
pub fn pid(id: &str) -> ParticipantId {
    ParticipantId::new(id)
}

#[must_use]
pub fn offer() -> SignalPayload {
    SignalPayload::new(json!({ "type": "offer", "sdp": "v=0 offer" }))
}

#[must_use]
pub fn answer() -> SignalPayload {
    SignalPayload::new(json!({ "type": "answer", "sdp": "v=0 answer" }))
}

#[must_use]
pub fn candidate() -> SignalPayload {
    SignalPayload::new(json!({
        "type": "candidate",
        "candidate": { "candidate": "candidate:1 1 udp 1 127.0.0.1 9 typ host", "sdpMid": "0" }
    }))
}

/// Config with defaults (3 attempts, 1s base delay, auto reconnect).
#[must_use]
pub fn test_config() -> Config {
    Config::default()
}

/// Controller settings with the default policy.
#[must_use]
pub fn test_settings(auto_reconnect: bool) -> ControllerSettings {
    ControllerSettings {
        policy: ReconnectPolicy::default(),
        auto_reconnect,
        ..ControllerSettings::default()
    }
}

/// A `MeshController` wired to a `MockConnector` with a manual clock.
pub struct ControllerHarness {
    pub controller: MeshController,
    pub connector: MockConnector,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub metrics: Arc<MeshMetrics>,
    pub now: Instant,
}

impl ControllerHarness {
    #[must_use]
    pub fn new(local_id: &str, connector: &MockConnector) -> Self {
        Self::with_settings(local_id, connector, test_settings(true))
    }

    #[must_use]
    pub fn with_settings(
        local_id: &str,
        connector: &MockConnector,
        settings: ControllerSettings,
    ) -> Self {
        let (events_tx, events) = transport_event_channel();
        let metrics = MeshMetrics::new();
        let controller = MeshController::new(
            pid(local_id),
            connector.as_connector(),
            events_tx,
            settings,
            Arc::clone(&metrics),
        );
        Self {
            controller,
            connector: connector.clone(),
            events,
            metrics,
            now: Instant::now(),
        }
    }

    /// Move the manual clock forward.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Feed every queued transport event to the controller.
    pub fn pump(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            effects.extend(self.controller.on_transport_event(event, self.now));
        }
        effects
    }

    /// Close the newest link toward `remote_id` and process the result.
    pub fn fail(&mut self, remote_id: &str) -> Vec<Effect> {
        assert!(self.connector.emit_closed(remote_id), "no link toward {remote_id}");
        self.pump()
    }

    /// Report a remote stream on the newest link toward `remote_id`.
    pub fn connect(&mut self, remote_id: &str) -> Vec<Effect> {
        assert!(self.connector.emit_remote_stream(remote_id), "no link toward {remote_id}");
        self.pump()
    }

    /// Fire the retry timer the controller last scheduled for `remote_id`.
    pub fn fire_retry(&mut self, remote_id: &str, scheduled: &[Effect]) -> Vec<Effect> {
        let (connection_id, delay) = scheduled
            .iter()
            .find_map(|effect| match effect {
                Effect::ScheduleRetry {
                    remote_id: id,
                    connection_id,
                    delay,
                } if id.as_str() == remote_id => Some((*connection_id, *delay)),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no retry scheduled for {remote_id}"));
        self.advance(delay);
        self.controller.retry_due(&pid(remote_id), connection_id, self.now)
    }
}

/// Signals the controller asked to send.
#[must_use]
pub fn sent_signals(effects: &[Effect]) -> Vec<OutboundSignal> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::SendSignal(signal) => Some(signal.clone()),
            _ => None,
        })
        .collect()
}

/// Retry delays the controller scheduled, by peer.
#[must_use]
pub fn scheduled_retries(effects: &[Effect]) -> Vec<(ParticipantId, Duration)> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::ScheduleRetry {
                remote_id, delay, ..
            } => Some((remote_id.clone(), *delay)),
            _ => None,
        })
        .collect()
}

/// Removal notifications, by peer.
#[must_use]
pub fn removals(effects: &[Effect]) -> Vec<(ParticipantId, RemovalReason)> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::Notify(MeshNotification::Removed {
                remote_id, reason, ..
            }) => Some((remote_id.clone(), *reason)),
            _ => None,
        })
        .collect()
}

/// Peers whose stream became available.
#[must_use]
pub fn streams_available(effects: &[Effect]) -> Vec<ParticipantId> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::Notify(MeshNotification::StreamAvailable { remote_id, .. }) => {
                Some(remote_id.clone())
            }
            _ => None,
        })
        .collect()
}
