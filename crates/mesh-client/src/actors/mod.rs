//! Actor wrapper around the mesh controller.
//!
//! One `MeshActor` task per room session. It owns the controller and serializes
//! every input onto a single loop:
//!
//! ```text
//! SignalingBridge ─┐
//! presentation   ──┼─ mpsc (bounded) ──▶ MeshActor ──▶ MeshController
//! backoff timers ──┘                       ▲   │
//! transport links ── mpsc (unbounded) ─────┘   ├─ outbound signals
//!                                              ├─ watch<MeshSnapshot>
//!                                              └─ broadcast<MeshNotification>
//! ```
//!
//! Cancelling the session token cancels every backoff timer (child tokens).

pub mod mesh;
pub mod messages;
pub mod metrics;

pub use mesh::{MeshActor, MeshActorHandle};
pub use messages::MeshMessage;
pub use metrics::{MailboxLevel, MailboxMonitor, MeshMetrics, MeshMetricsSnapshot};
