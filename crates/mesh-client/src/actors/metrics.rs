//! Mailbox monitoring and in-process counters for the mesh actor.
//!
//! | Queue    | Normal | Warning | Critical |
//! |----------|--------|---------|----------|
//! | Commands | < 100  | 100-500 | > 500    |
//!
//! Counters here are readable by tests and the simulator without a metrics
//! recorder installed; the Prometheus side lives in `observability::metrics`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for the mesh actor.
pub const MAILBOX_NORMAL: usize = 100;
pub const MAILBOX_WARNING: usize = 500;

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    /// Below normal threshold.
    Normal,
    /// Between normal and warning thresholds.
    Warning,
    /// Above warning threshold.
    Critical,
}

/// Tracks command queue depth for one session actor.
#[derive(Debug)]
pub struct MailboxMonitor {
    session_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Record a command being queued.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);

        match level_for_depth(new_depth) {
            MailboxLevel::Critical => {
                warn!(
                    target: "mesh.actor.mailbox",
                    session_id = %self.session_id,
                    depth = new_depth,
                    threshold = MAILBOX_WARNING,
                    "Mailbox depth critical"
                );
            }
            MailboxLevel::Warning if new_depth == MAILBOX_NORMAL + 1 => {
                debug!(
                    target: "mesh.actor.mailbox",
                    session_id = %self.session_id,
                    depth = new_depth,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }
    }

    /// Record a command being taken off the queue.
    pub fn record_dequeue(&self) {
        // Saturate: a dequeue may race an enqueue that has not been counted yet.
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            });
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a command that never reached the actor.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            target: "mesh.actor.mailbox",
            session_id = %self.session_id,
            dropped = dropped,
            "Command dropped, mailbox closed or full"
        );
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        level_for_depth(self.current_depth())
    }
}

fn level_for_depth(depth: usize) -> MailboxLevel {
    if depth > MAILBOX_WARNING {
        MailboxLevel::Critical
    } else if depth > MAILBOX_NORMAL {
        MailboxLevel::Warning
    } else {
        MailboxLevel::Normal
    }
}

/// Lock-free counters shared between the actor, its controller and readers.
#[derive(Debug, Default)]
pub struct MeshMetrics {
    /// Links currently open (opened minus destroyed).
    pub active_links: AtomicUsize,
    /// Links ever opened, including reconnects.
    pub connections_opened: AtomicU64,
    /// Reconnection attempts started.
    pub reconnect_attempts: AtomicU64,
    /// Peers removed after exhausting the retry budget.
    pub peers_abandoned: AtomicU64,
    /// Commands and transport events handled by the actor.
    pub messages_processed: AtomicU64,
}

/// Point-in-time copy of [`MeshMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshMetricsSnapshot {
    pub active_links: usize,
    pub connections_opened: u64,
    pub reconnect_attempts: u64,
    pub peers_abandoned: u64,
    pub messages_processed: u64,
}

impl MeshMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_opened(&self) {
        self.active_links.fetch_add(1, Ordering::Relaxed);
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_destroyed(&self) {
        let _ = self
            .active_links
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn reconnect_attempted(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_abandoned(&self) {
        self.peers_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn active_links(&self) -> usize {
        self.active_links.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MeshMetricsSnapshot {
        MeshMetricsSnapshot {
            active_links: self.active_links.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            peers_abandoned: self.peers_abandoned.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_monitor_enqueue_dequeue() {
        let monitor = MailboxMonitor::new("alice");
        assert_eq!(monitor.current_depth(), 0);

        monitor.record_enqueue();
        monitor.record_enqueue();
        monitor.record_enqueue();
        assert_eq!(monitor.current_depth(), 3);
        assert_eq!(monitor.peak_depth(), 3);

        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 2);
        assert_eq!(monitor.peak_depth(), 3);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[test]
    fn test_mailbox_dequeue_never_underflows() {
        let monitor = MailboxMonitor::new("alice");
        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 0);
    }

    #[test]
    fn test_mailbox_levels() {
        let monitor = MailboxMonitor::new("alice");
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);

        for _ in 0..150 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        for _ in 0..400 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
    }

    #[test]
    fn test_mailbox_drop() {
        let monitor = MailboxMonitor::new("alice");
        monitor.record_drop();
        monitor.record_drop();
        assert_eq!(monitor.messages_dropped(), 2);
    }

    #[test]
    fn test_mesh_metrics_links() {
        let metrics = MeshMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_destroyed();
        metrics.reconnect_attempted();
        metrics.peer_abandoned();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_links, 1);
        assert_eq!(snapshot.connections_opened, 2);
        assert_eq!(snapshot.reconnect_attempts, 1);
        assert_eq!(snapshot.peers_abandoned, 1);
    }

    #[test]
    fn test_mesh_metrics_destroy_saturates() {
        let metrics = MeshMetrics::new();
        metrics.connection_destroyed();
        assert_eq!(metrics.active_links(), 0);
    }
}
