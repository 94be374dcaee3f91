//! `MeshActor` - one task per room session.
//!
//! Serializes membership events, inbound signals, transport callbacks and
//! backoff timers onto a single loop that owns the [`MeshController`].
//! Backoff timers are child tasks whose tokens descend from the session token,
//! so cancelling the session stops them all.

use crate::actors::messages::MeshMessage;
use crate::actors::metrics::{MailboxMonitor, MeshMetrics};
use crate::config::Config;
use crate::controller::{ControllerSettings, Effect, MeshController, MeshNotification, OutboundSignal};
use crate::errors::MeshError;
use crate::observability::metrics as obs;
use crate::registry::MeshSnapshot;
use crate::transport::{transport_event_channel, PeerConnector, SignalPayload, TransportEvent};

use common::types::{ConnectionId, ParticipantId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Capacity of the notification broadcast channel.
const NOTIFICATION_BUFFER: usize = 64;

/// Handle to a `MeshActor`.
#[derive(Clone)]
pub struct MeshActorHandle {
    sender: mpsc::Sender<MeshMessage>,
    cancel_token: CancellationToken,
    local_id: ParticipantId,
    snapshots: watch::Receiver<MeshSnapshot>,
    notifications: broadcast::Sender<MeshNotification>,
    mailbox: Arc<MailboxMonitor>,
    metrics: Arc<MeshMetrics>,
}

impl MeshActorHandle {
    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Local user joined the room; initiate toward everyone already present.
    pub async fn join_room(&self, existing: Vec<ParticipantId>) -> Result<MeshSnapshot, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(MeshMessage::JoinRoom {
            existing,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| MeshError::ChannelClosed(format!("response receive failed: {e}")))
    }

    /// A participant joined after the local user.
    pub async fn participant_joined(&self, remote_id: ParticipantId) -> Result<(), MeshError> {
        self.send(MeshMessage::ParticipantJoined { remote_id }).await
    }

    /// A participant left the room.
    pub async fn participant_left(&self, remote_id: ParticipantId) -> Result<(), MeshError> {
        self.send(MeshMessage::ParticipantLeft { remote_id }).await
    }

    /// Deliver an inbound signaling payload.
    pub async fn signal(
        &self,
        remote_id: ParticipantId,
        payload: SignalPayload,
    ) -> Result<(), MeshError> {
        self.send(MeshMessage::Signal { remote_id, payload }).await
    }

    /// Read the registry view after every queued message has been handled.
    pub async fn snapshot(&self) -> Result<MeshSnapshot, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(MeshMessage::GetSnapshot { respond_to: tx }).await?;

        rx.await
            .map_err(|e| MeshError::ChannelClosed(format!("response receive failed: {e}")))
    }

    /// Subscribe to registry views, republished after every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MeshSnapshot> {
        self.snapshots.clone()
    }

    /// Subscribe to stream and removal notifications.
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<MeshNotification> {
        self.notifications.subscribe()
    }

    /// Tear down every connection and stop the actor.
    ///
    /// Returns the number of peers that were torn down.
    pub async fn end_session(&self) -> Result<usize, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(MeshMessage::EndSession { respond_to: tx }).await?;

        rx.await
            .map_err(|e| MeshError::ChannelClosed(format!("response receive failed: {e}")))
    }

    /// Cancel the session without waiting for a reply.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MeshMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn mailbox(&self) -> &MailboxMonitor {
        &self.mailbox
    }

    async fn send(&self, message: MeshMessage) -> Result<(), MeshError> {
        // Count before sending so the actor's dequeue never runs ahead.
        self.mailbox.record_enqueue();
        match self.sender.send(message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mailbox.record_dequeue();
                self.mailbox.record_drop();
                Err(MeshError::ChannelClosed(format!("channel send failed: {e}")))
            }
        }
    }
}

/// Pending backoff timer for one peer.
struct RetryTimer {
    connection_id: ConnectionId,
    cancel_token: CancellationToken,
}

/// The `MeshActor` implementation.
pub struct MeshActor {
    local_id: ParticipantId,
    receiver: mpsc::Receiver<MeshMessage>,
    /// Used by timer tasks to post `RetryDue`; does not keep the mailbox open.
    weak_sender: mpsc::WeakSender<MeshMessage>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Outbound signals for the signaling bridge.
    outbound: mpsc::UnboundedSender<OutboundSignal>,
    cancel_token: CancellationToken,
    controller: MeshController,
    timers: HashMap<ParticipantId, RetryTimer>,
    snapshots: watch::Sender<MeshSnapshot>,
    notifications: broadcast::Sender<MeshNotification>,
    mailbox: Arc<MailboxMonitor>,
    metrics: Arc<MeshMetrics>,
}

impl MeshActor {
    /// Spawn a session actor for `local_id`.
    ///
    /// Signals the controller wants delivered to remote participants are
    /// written to `outbound`. Returns a handle and the task join handle.
    pub fn spawn(
        local_id: ParticipantId,
        connector: Arc<dyn PeerConnector>,
        config: &Config,
        outbound: mpsc::UnboundedSender<OutboundSignal>,
        cancel_token: CancellationToken,
        metrics: Arc<MeshMetrics>,
    ) -> (MeshActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.mailbox_capacity);
        let (events_tx, transport_events) = transport_event_channel();
        let (snapshots, snapshot_rx) = watch::channel(MeshSnapshot::default());
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(local_id.as_str()));

        let controller = MeshController::new(
            local_id.clone(),
            connector,
            events_tx,
            ControllerSettings::from(config),
            Arc::clone(&metrics),
        );

        let actor = Self {
            local_id: local_id.clone(),
            receiver,
            weak_sender: sender.downgrade(),
            transport_events,
            outbound,
            cancel_token: cancel_token.clone(),
            controller,
            timers: HashMap::new(),
            snapshots,
            notifications: notifications.clone(),
            mailbox: Arc::clone(&mailbox),
            metrics: Arc::clone(&metrics),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = MeshActorHandle {
            sender,
            cancel_token,
            local_id,
            snapshots: snapshot_rx,
            notifications,
            mailbox,
            metrics,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "mesh.actor", fields(local_id = %self.local_id))]
    async fn run(mut self) {
        info!(
            target: "mesh.actor",
            local_id = %self.local_id,
            "MeshActor started"
        );

        loop {
            tokio::select! {
                // Cancellation first, then transport callbacks ahead of commands
                // queued after them.
                biased;

                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "mesh.actor",
                        local_id = %self.local_id,
                        "MeshActor received cancellation signal"
                    );
                    self.shutdown();
                    break;
                }

                Some(event) = self.transport_events.recv() => {
                    let effects = self.controller.on_transport_event(event, Instant::now());
                    self.apply(effects);
                    self.metrics.record_message_processed();
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        info!(
                            target: "mesh.actor",
                            local_id = %self.local_id,
                            "MeshActor channel closed, exiting"
                        );
                        self.shutdown();
                        break;
                    };

                    self.mailbox.record_dequeue();
                    obs::set_mailbox_depth(self.mailbox.current_depth());
                    let keep_running = self.handle_message(message);
                    self.metrics.record_message_processed();
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        info!(
            target: "mesh.actor",
            local_id = %self.local_id,
            messages_processed = self.mailbox.messages_processed(),
            "MeshActor stopped"
        );
    }

    /// Handle one command. Returns false once the session has ended.
    fn handle_message(&mut self, message: MeshMessage) -> bool {
        debug!(
            target: "mesh.actor",
            local_id = %self.local_id,
            message = message.as_str(),
            "Handling message"
        );

        let now = Instant::now();
        match message {
            MeshMessage::JoinRoom {
                existing,
                respond_to,
            } => {
                let effects = self.controller.join_room(existing, now);
                self.apply(effects);
                let _ = respond_to.send(self.controller.snapshot());
            }
            MeshMessage::ParticipantJoined { remote_id } => {
                let effects = self.controller.participant_joined(remote_id, now);
                self.apply(effects);
            }
            MeshMessage::ParticipantLeft { remote_id } => {
                let effects = self.controller.participant_left(&remote_id);
                self.apply(effects);
            }
            MeshMessage::Signal { remote_id, payload } => {
                let effects = self.controller.route_signal(remote_id, payload, now);
                self.apply(effects);
            }
            MeshMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.controller.snapshot());
            }
            MeshMessage::RetryDue {
                remote_id,
                connection_id,
            } => {
                if self
                    .timers
                    .get(&remote_id)
                    .is_some_and(|t| t.connection_id == connection_id)
                {
                    self.timers.remove(&remote_id);
                }
                let effects = self.controller.retry_due(&remote_id, connection_id, now);
                self.apply(effects);
            }
            MeshMessage::EndSession { respond_to } => {
                let removed = self.shutdown();
                let _ = respond_to.send(removed);
                return false;
            }
        }
        true
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::SendSignal(signal) => {
                    if self.outbound.send(signal).is_err() {
                        debug!(
                            target: "mesh.actor",
                            local_id = %self.local_id,
                            "Signaling channel closed, outbound signal dropped"
                        );
                        obs::record_signal_dropped("signaling_closed");
                    }
                }
                Effect::ScheduleRetry {
                    remote_id,
                    connection_id,
                    delay,
                } => self.schedule_retry(remote_id, connection_id, delay),
                Effect::CancelRetry { remote_id } => {
                    if let Some(timer) = self.timers.remove(&remote_id) {
                        timer.cancel_token.cancel();
                    }
                }
                Effect::Notify(notification) => {
                    // No subscribers is not an error.
                    let _ = self.notifications.send(notification);
                }
            }
        }

        if self.controller.take_changed() {
            let snapshot = self.controller.snapshot();
            obs::set_peers_active(snapshot.len());
            self.snapshots.send_replace(snapshot);
        }
    }

    fn schedule_retry(&mut self, remote_id: ParticipantId, connection_id: ConnectionId, delay: Duration) {
        if let Some(previous) = self.timers.remove(&remote_id) {
            previous.cancel_token.cancel();
        }

        debug!(
            target: "mesh.actor",
            remote_id = %remote_id,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnection"
        );

        let cancel_token = self.cancel_token.child_token();
        let timer_token = cancel_token.clone();
        let weak_sender = self.weak_sender.clone();
        let message = MeshMessage::RetryDue {
            remote_id: remote_id.clone(),
            connection_id,
        };
        let mailbox = Arc::clone(&self.mailbox);

        tokio::spawn(async move {
            tokio::select! {
                () = timer_token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Some(sender) = weak_sender.upgrade() {
                        mailbox.record_enqueue();
                        if sender.send(message).await.is_err() {
                            mailbox.record_dequeue();
                        }
                    }
                }
            }
        });

        self.timers.insert(
            remote_id,
            RetryTimer {
                connection_id,
                cancel_token,
            },
        );
    }

    /// Destroy every connection and cancel every timer. Returns peers removed.
    fn shutdown(&mut self) -> usize {
        for (_, timer) in self.timers.drain() {
            timer.cancel_token.cancel();
        }

        let effects = self.controller.teardown();
        let removed = effects.len();
        self.apply(effects);
        self.timers.clear();
        removed
    }
}
