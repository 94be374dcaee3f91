//! End-to-end lifecycle scenarios for the mesh controller.
//!
//! Most tests drive the controller directly with a manual clock. The last
//! group runs full sessions over the loopback transport and the in-memory
//! relay.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::types::RoomId;
use mesh_client::actors::{MeshActor, MeshActorHandle, MeshMetrics};
use mesh_client::config::Config;
use mesh_client::controller::{MeshNotification, RemovalReason};
use mesh_client::loopback::LoopbackNetwork;
use mesh_client::registry::{ConnectionRecord, PeerState, Role};
use mesh_client::relay::RoomRelay;
use mesh_client::signaling::SignalingBridge;
use mesh_test_utils::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[test]
fn join_empty_room_creates_nothing() {
    let connector = MockConnector::builder().auto_offer().build();
    let mut h = ControllerHarness::new("p", &connector);

    let effects = h.controller.join_room(Vec::new(), h.now);
    assert!(effects.is_empty());
    assert!(h.pump().is_empty());
    assert!(h.controller.registry().is_empty());
    assert!(connector.opened().is_empty());
}

#[test]
fn signal_from_unknown_creates_receiver() {
    let connector = MockConnector::new();
    let mut h = ControllerHarness::new("p", &connector);

    h.controller.route_signal(pid("x"), offer(), h.now);

    assert_eq!(h.controller.registry().len(), 1);
    let record = h.controller.registry().get(&pid("x")).unwrap();
    assert_eq!(record.role(), Role::Receiver);
    assert_eq!(record.state(), PeerState::Connecting);

    let opened = connector.opened_for("x");
    assert_eq!(opened.len(), 1);
    assert_eq!(
        connector.signals_to(opened.first().unwrap().connection_id),
        vec![offer()]
    );
}

#[test]
fn followup_signals_reuse_connection() {
    let connector = MockConnector::new();
    let mut h = ControllerHarness::new("p", &connector);

    h.controller.route_signal(pid("x"), offer(), h.now);
    h.controller.route_signal(pid("x"), candidate(), h.now);

    let opened = connector.opened_for("x");
    assert_eq!(opened.len(), 1);
    assert_eq!(
        connector.signals_to(opened.first().unwrap().connection_id),
        vec![offer(), candidate()]
    );
}

#[test]
fn retry_budget_exhausted_then_fresh_receiver_cycle() {
    let connector = MockConnector::new();
    let mut h = ControllerHarness::new("p", &connector);

    h.controller.participant_joined(pid("y"), h.now);

    let mut delays = Vec::new();
    for attempt in 0..3u32 {
        let effects = h.fail("y");
        let scheduled = scheduled_retries(&effects);
        assert_eq!(scheduled.len(), 1, "attempt {attempt}");
        delays.push(scheduled.first().unwrap().1);

        h.fire_retry("y", &effects);
        let record = h.controller.registry().get(&pid("y")).unwrap();
        assert_eq!(record.reconnect_attempts(), attempt + 1);
        assert_eq!(record.role(), Role::Initiator);
    }
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );

    // Fourth failure abandons.
    let effects = h.fail("y");
    assert_eq!(removals(&effects), vec![(pid("y"), RemovalReason::Abandoned)]);
    assert!(scheduled_retries(&effects).is_empty());
    assert!(!h.controller.registry().contains(&pid("y")));

    // Every instance was destroyed exactly once.
    let opened = connector.opened_for("y");
    assert_eq!(opened.len(), 4);
    for link in &opened {
        assert_eq!(connector.destroy_calls(link.connection_id), 1);
    }

    // A later signal starts over as receiver.
    h.controller.route_signal(pid("y"), offer(), h.now);
    let record = h.controller.registry().get(&pid("y")).unwrap();
    assert_eq!(record.role(), Role::Receiver);
    assert_eq!(record.reconnect_attempts(), 0);
    assert_eq!(record.state(), PeerState::Connecting);
}

#[test]
fn connected_resets_attempts() {
    let connector = MockConnector::new();
    let mut h = ControllerHarness::new("p", &connector);

    h.controller.participant_joined(pid("y"), h.now);
    let effects = h.fail("y");
    h.fire_retry("y", &effects);
    assert_eq!(
        h.controller
            .registry()
            .get(&pid("y"))
            .map(ConnectionRecord::reconnect_attempts),
        Some(1)
    );

    let effects = h.connect("y");
    assert_eq!(streams_available(&effects), vec![pid("y")]);
    let record = h.controller.registry().get(&pid("y")).unwrap();
    assert_eq!(record.state(), PeerState::Connected);
    assert_eq!(record.reconnect_attempts(), 0);
    assert_eq!(record.last_reconnect_at(), None);
}

#[test]
fn leave_while_retrying() {
    let connector = MockConnector::new();
    let mut h = ControllerHarness::new("p", &connector);

    h.controller.participant_joined(pid("z"), h.now);
    let failed = h.fail("z");
    assert_eq!(
        h.controller.registry().get(&pid("z")).map(ConnectionRecord::state),
        Some(PeerState::Retrying)
    );

    let effects = h.controller.participant_left(&pid("z"));
    assert_eq!(removals(&effects), vec![(pid("z"), RemovalReason::Left)]);
    assert!(!h.controller.registry().contains(&pid("z")));

    // The pending timer is stale now.
    assert!(h.fire_retry("z", &failed).is_empty());
    assert!(!h.controller.registry().contains(&pid("z")));

    // A stray signal is treated as unknown.
    h.controller.route_signal(pid("z"), answer(), h.now);
    let record = h.controller.registry().get(&pid("z")).unwrap();
    assert_eq!(record.role(), Role::Receiver);
    assert_eq!(record.reconnect_attempts(), 0);
}

#[test]
fn backoff_gates_signal_driven_retry() {
    let connector = MockConnector::new();
    let mut h = ControllerHarness::with_settings("p", &connector, test_settings(false));

    h.controller.participant_joined(pid("y"), h.now);
    h.fail("y");

    // Attempt 0 with no previous retry: eligible immediately.
    h.controller.route_signal(pid("y"), offer(), h.now);
    assert_eq!(connector.opened_for("y").len(), 2);

    // Fails again; next retry needs 2s since the last one.
    h.fail("y");
    h.advance(Duration::from_millis(1999));
    h.controller.route_signal(pid("y"), offer(), h.now);
    assert_eq!(connector.opened_for("y").len(), 2);
    let record = h.controller.registry().get(&pid("y")).unwrap();
    assert_eq!(record.state(), PeerState::Failed);
    assert_eq!(record.reconnect_attempts(), 1);

    h.advance(Duration::from_millis(1));
    h.controller.route_signal(pid("y"), offer(), h.now);
    assert_eq!(connector.opened_for("y").len(), 3);
    assert_eq!(
        h.controller
            .registry()
            .get(&pid("y"))
            .map(ConnectionRecord::reconnect_attempts),
        Some(2)
    );

    // Discarded payloads never reach the new instance.
    let latest = connector.latest("y").unwrap();
    assert!(connector.signals_to(latest.connection_id).is_empty());
}

#[test]
fn open_failure_counts_as_transport_failure() {
    let connector = MockConnector::builder().fail_open_for("y").build();
    let mut h = ControllerHarness::new("p", &connector);

    let effects = h.controller.participant_joined(pid("y"), h.now);
    assert_eq!(scheduled_retries(&effects), vec![(pid("y"), Duration::from_secs(1))]);
    assert_eq!(connector.open_failures(), 1);

    // Every retry fails to open too, until the budget runs out.
    let mut effects = effects;
    for _ in 0..3 {
        effects = h.fire_retry("y", &effects);
    }
    assert_eq!(removals(&effects), vec![(pid("y"), RemovalReason::Abandoned)]);
    assert_eq!(connector.open_failures(), 4);
}

#[test]
fn rejected_signal_counts_as_transport_failure() {
    let connector = MockConnector::builder().reject_signals_for("m").build();
    let mut h = ControllerHarness::new("p", &connector);

    let effects = h.controller.route_signal(pid("m"), offer(), h.now);
    assert_eq!(scheduled_retries(&effects).len(), 1);
    assert_eq!(
        h.controller.registry().get(&pid("m")).map(ConnectionRecord::state),
        Some(PeerState::Retrying)
    );
}

#[test]
fn stream_from_superseded_instance_is_not_bound() {
    let connector = MockConnector::new();
    let mut h = ControllerHarness::new("p", &connector);

    h.controller.participant_joined(pid("y"), h.now);
    let failed = h.fail("y");
    h.fire_retry("y", &failed);

    let opened = connector.opened_for("y");
    assert_eq!(opened.len(), 2);
    let old = opened.first().unwrap();

    assert!(old
        .events
        .remote_stream(Arc::new(MockStream::new("late-stream"))));
    let effects = h.pump();
    assert!(streams_available(&effects).is_empty());

    let record = h.controller.registry().get(&pid("y")).unwrap();
    assert_eq!(record.state(), PeerState::Connecting);
    assert!(record.remote_stream().is_none());
    assert_eq!(record.connection_id(), opened.get(1).unwrap().connection_id);
}

#[test]
fn retry_timer_waits_only_for_the_rest_of_the_window() {
    let connector = MockConnector::new();
    let mut h = ControllerHarness::new("p", &connector);

    h.controller.participant_joined(pid("y"), h.now);
    let failed = h.fail("y");
    h.fire_retry("y", &failed);

    // Second instance survives 1.5s of its 2s window before failing.
    h.advance(Duration::from_millis(1500));
    let effects = h.fail("y");
    assert_eq!(
        scheduled_retries(&effects),
        vec![(pid("y"), Duration::from_millis(500))]
    );

    // Failing after the window has passed retries on the next tick.
    h.fire_retry("y", &effects);
    h.advance(Duration::from_secs(10));
    let effects = h.fail("y");
    assert_eq!(scheduled_retries(&effects), vec![(pid("y"), Duration::ZERO)]);
}

// ---------------------------------------------------------------------------
// Full sessions over loopback
// ---------------------------------------------------------------------------

struct Session {
    handle: MeshActorHandle,
    actor: JoinHandle<()>,
    bridge: JoinHandle<()>,
}

async fn join(
    id: &str,
    network: &LoopbackNetwork,
    relay: &RoomRelay,
    cancel_token: &CancellationToken,
) -> Session {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (handle, actor) = MeshActor::spawn(
        pid(id),
        network.connector(pid(id)),
        &Config::default(),
        outbound_tx,
        cancel_token.child_token(),
        MeshMetrics::new(),
    );
    let connection = relay.connect(pid(id)).await.unwrap();
    let bridge = SignalingBridge::new(handle.clone(), relay.room_id().clone(), outbound_rx);
    let bridge = tokio::spawn(bridge.run(
        connection.inbound,
        connection.outbound,
        cancel_token.child_token(),
    ));
    Session {
        handle,
        actor,
        bridge,
    }
}

async fn wait_connected(handle: &MeshActorHandle, expected: usize) {
    let mut view = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let snapshot = view.borrow_and_update();
                if snapshot.len() == expected && snapshot.count_in(PeerState::Connected) == expected
                {
                    return;
                }
            }
            view.changed().await.unwrap();
        }
    })
    .await
    .expect("mesh did not converge");
}

#[tokio::test]
async fn two_participants_connect_over_loopback() {
    let network = LoopbackNetwork::new();
    let relay = RoomRelay::new(RoomId::new("room-b"));
    let cancel_token = CancellationToken::new();

    let p = join("p", &network, &relay, &cancel_token).await;
    let q = join("q", &network, &relay, &cancel_token).await;

    wait_connected(&p.handle, 1).await;
    wait_connected(&q.handle, 1).await;

    let p_view = p.handle.snapshot().await.unwrap();
    let q_view = q.handle.snapshot().await.unwrap();
    assert_eq!(p_view.get(&pid("q")).unwrap().role, Role::Initiator);
    assert_eq!(q_view.get(&pid("p")).unwrap().role, Role::Initiator);
    assert!(p_view.get(&pid("q")).unwrap().stream.is_some());

    // Exactly one connection per side.
    assert_eq!(network.links_opened(), 2);
    assert_eq!(network.live_links(), 2);

    p.handle.end_session().await.unwrap();
    q.handle.end_session().await.unwrap();
    cancel_token.cancel();
    for session in [p, q] {
        session.actor.await.unwrap();
        session.bridge.await.unwrap();
    }
    assert_eq!(network.live_links(), 0);
}

#[tokio::test]
async fn departure_reaches_remaining_participant() {
    let network = LoopbackNetwork::new();
    let relay = RoomRelay::new(RoomId::new("room-b"));
    let cancel_token = CancellationToken::new();

    let p = join("p", &network, &relay, &cancel_token).await;
    let q = join("q", &network, &relay, &cancel_token).await;
    wait_connected(&p.handle, 1).await;

    let mut notifications = p.handle.notifications();
    relay.disconnect(&pid("q")).await;

    let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    match notification {
        MeshNotification::Removed {
            remote_id, reason, ..
        } => {
            assert_eq!(remote_id, pid("q"));
            assert_eq!(reason, RemovalReason::Left);
        }
        other => panic!("unexpected notification: {other:?}"),
    }
    assert!(p.handle.snapshot().await.unwrap().is_empty());

    cancel_token.cancel();
    p.actor.await.unwrap();
    q.actor.await.unwrap();
}

#[tokio::test]
async fn reconnects_after_sever() {
    let network = LoopbackNetwork::new();
    let relay = RoomRelay::new(RoomId::new("room-b"));
    let cancel_token = CancellationToken::new();

    let p = join("p", &network, &relay, &cancel_token).await;
    let q = join("q", &network, &relay, &cancel_token).await;
    wait_connected(&p.handle, 1).await;
    wait_connected(&q.handle, 1).await;

    assert_eq!(network.sever(&pid("p"), &pid("q")), 2);
    // Both sides retry after the 1s base delay.

    wait_connected(&p.handle, 1).await;
    wait_connected(&q.handle, 1).await;
    assert_eq!(network.live_links(), 2);
    assert!(network.links_opened() >= 4);

    cancel_token.cancel();
    p.actor.await.unwrap();
    q.actor.await.unwrap();
}
