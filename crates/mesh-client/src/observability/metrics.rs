//! Metrics definitions for the peer mesh.
//!
//! All metrics follow Prometheus naming conventions:
//! - `mesh_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded; participant ids never appear as label values.
//! - `role`: 2 values (initiator, receiver)
//! - `state`: 5 values (connecting, connected, failed, retrying, abandoned)
//! - `reason`: bounded removal and drop reasons (< 10 values each)

use crate::registry::PeerState;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return its handle for rendering.
///
/// Backoff buckets cover the default schedule (1s, 2s, 4s) with headroom for
/// a larger base delay.
///
/// # Errors
///
/// Returns error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("mesh_backoff_delay_seconds".to_string()),
            &[0.1, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0],
        )
        .map_err(|e| format!("Failed to set backoff delay buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Set the number of peers in the registry.
///
/// Metric: `mesh_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_peers_active").set(count as f64);
}

/// Record a link being opened for a peer.
///
/// Metric: `mesh_connections_opened_total`
/// Labels: `role`
pub fn record_connection_opened(role: &str) {
    counter!("mesh_connections_opened_total", "role" => role.to_string()).increment(1);
}

/// Record a reconnection attempt.
///
/// Metric: `mesh_reconnect_attempts_total`
/// Labels: `role`
pub fn record_reconnect_attempt(role: &str) {
    counter!("mesh_reconnect_attempts_total", "role" => role.to_string()).increment(1);
}

/// Record a peer leaving the registry.
///
/// Metric: `mesh_peers_removed_total`
/// Labels: `reason` (left, abandoned, session_ended)
pub fn record_peer_removed(reason: &str) {
    counter!("mesh_peers_removed_total", "reason" => reason.to_string()).increment(1);
}

/// Record a signal or transport event that was not acted on.
///
/// Metric: `mesh_signals_dropped_total`
/// Labels: `reason` (self, failed_peer, backoff, superseded, unknown_peer,
/// not_live, no_link, destroyed)
pub fn record_signal_dropped(reason: &str) {
    counter!("mesh_signals_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Record a peer entering `state`.
///
/// Metric: `mesh_peer_transitions_total`
/// Labels: `state`
pub fn record_state_transition(state: PeerState) {
    counter!("mesh_peer_transitions_total", "state" => state.as_str()).increment(1);
}

/// Record a scheduled backoff delay.
///
/// Metric: `mesh_backoff_delay_seconds`
pub fn record_backoff_delay(delay: Duration) {
    histogram!("mesh_backoff_delay_seconds").record(delay.as_secs_f64());
}

/// Set the command mailbox depth of the session actor.
///
/// Metric: `mesh_actor_mailbox_depth`
pub fn set_mailbox_depth(depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_actor_mailbox_depth").set(depth as f64);
}
