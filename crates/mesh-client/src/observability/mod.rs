//! Observability for the peer mesh.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `mesh_peers_active` | Gauge | none | Records in the registry |
//! | `mesh_connections_opened_total` | Counter | `role` | Links opened, including reconnects |
//! | `mesh_reconnect_attempts_total` | Counter | `role` | Reconnection attempts |
//! | `mesh_peers_removed_total` | Counter | `reason` | Peers leaving the registry |
//! | `mesh_signals_dropped_total` | Counter | `reason` | Inputs that were not acted on |
//! | `mesh_peer_transitions_total` | Counter | `state` | Lifecycle transitions |
//! | `mesh_backoff_delay_seconds` | Histogram | none | Scheduled retry delays |
//! | `mesh_actor_mailbox_depth` | Gauge | none | Session actor backpressure |

pub mod metrics;

pub use metrics::init_metrics_recorder;
