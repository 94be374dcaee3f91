//! Mesh simulator
//!
//! Runs N participants in one process: each has its own `MeshActor`, talks to
//! an in-memory room relay through a `SignalingBridge`, and opens loopback
//! links to every other participant.
//!
//! # Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Admit participants one at a time (each newcomer initiates toward everyone present)
//! 4. Wait for every pair to reach CONNECTED
//! 5. Optionally sever one pair and wait for reconnection
//! 6. Print every participant's view and the rendered metrics
//! 7. End every session (also on Ctrl-C)

#![warn(clippy::pedantic)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::types::{ParticipantId, RoomId};
use mesh_client::actors::{MeshActor, MeshActorHandle, MeshMetrics};
use mesh_client::config::Config;
use mesh_client::loopback::LoopbackNetwork;
use mesh_client::observability::init_metrics_recorder;
use mesh_client::registry::PeerState;
use mesh_client::relay::RoomRelay;
use mesh_client::signaling::SignalingBridge;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for the mesh to converge.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Poll interval while waiting for convergence.
const SETTLE_POLL: Duration = Duration::from_millis(50);

struct SimParticipant {
    handle: MeshActorHandle,
    actor_task: JoinHandle<()>,
    bridge_task: JoinHandle<()>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh=info,mesh_client=info,mesh_sim=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting mesh simulator");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        participants = config.sim_participants,
        sever = config.sim_sever,
        max_reconnect_attempts = config.max_reconnect_attempts,
        reconnect_base_delay_ms = u64::try_from(config.reconnect_base_delay.as_millis()).unwrap_or(u64::MAX),
        auto_reconnect = config.auto_reconnect,
        "Configuration loaded successfully"
    );

    let prometheus_handle = init_metrics_recorder()
        .map_err(anyhow::Error::msg)
        .context("metrics recorder")?;

    let cancel_token = CancellationToken::new();
    let network = LoopbackNetwork::new();
    let relay = RoomRelay::new(RoomId::new("sim-room"));
    let metrics = MeshMetrics::new();

    let mut participants = Vec::with_capacity(config.sim_participants);

    let outcome = tokio::select! {
        result = run_simulation(&config, &network, &relay, &metrics, &cancel_token, &mut participants) => result,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl-C, ending sessions");
            Ok(())
        }
    };

    for participant in &participants {
        match participant.handle.end_session().await {
            Ok(removed) => info!(
                participant = %participant.handle.local_id(),
                removed,
                "Session ended"
            ),
            Err(e) => warn!(participant = %participant.handle.local_id(), error = %e, "Session already gone"),
        }
    }
    cancel_token.cancel();
    for participant in participants {
        let _ = participant.actor_task.await;
        let _ = participant.bridge_task.await;
    }

    println!("{}", prometheus_handle.render());
    info!(
        links_opened = network.links_opened(),
        links_destroyed = network.links_destroyed(),
        "Mesh simulator stopped"
    );

    outcome
}

async fn run_simulation(
    config: &Config,
    network: &LoopbackNetwork,
    relay: &RoomRelay,
    metrics: &Arc<MeshMetrics>,
    cancel_token: &CancellationToken,
    participants: &mut Vec<SimParticipant>,
) -> Result<()> {
    for index in 1..=config.sim_participants {
        let id = ParticipantId::new(format!("participant-{index}"));
        participants.push(admit(id, config, network, relay, metrics, cancel_token).await?);
    }

    let expected = config.sim_participants.saturating_sub(1);
    if settle(participants, expected).await {
        info!(peers_per_participant = expected, "Mesh converged");
    } else {
        warn!("Mesh did not converge before timeout");
    }

    if config.sim_sever {
        if let [first, second, ..] = participants.as_slice() {
            let closed = network.sever(first.handle.local_id(), second.handle.local_id());
            info!(
                a = %first.handle.local_id(),
                b = %second.handle.local_id(),
                closed,
                "Severed link to exercise reconnection"
            );
            // Give both sides time to observe the failure before polling.
            tokio::time::sleep(SETTLE_POLL).await;
            if settle(participants, expected).await {
                info!("Mesh reconverged after sever");
            } else {
                warn!("Mesh did not reconverge before timeout");
            }
        }
    }

    for participant in participants.iter() {
        let snapshot = participant.handle.snapshot().await?;
        println!("{}:", participant.handle.local_id());
        for (remote_id, view) in &snapshot.peers {
            println!(
                "  {remote_id:<16} {:<10} role={:<9} attempts={} stream={}",
                view.state.as_str(),
                view.role.as_str(),
                view.reconnect_attempts,
                view.stream.as_ref().map_or("-", |s| s.id()),
            );
        }
    }

    let counters = metrics.snapshot();
    info!(
        active_links = counters.active_links,
        connections_opened = counters.connections_opened,
        reconnect_attempts = counters.reconnect_attempts,
        peers_abandoned = counters.peers_abandoned,
        "Mesh counters"
    );

    Ok(())
}

async fn admit(
    id: ParticipantId,
    config: &Config,
    network: &LoopbackNetwork,
    relay: &RoomRelay,
    metrics: &Arc<MeshMetrics>,
    cancel_token: &CancellationToken,
) -> Result<SimParticipant> {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (handle, actor_task) = MeshActor::spawn(
        id.clone(),
        network.connector(id.clone()),
        config,
        outbound_tx,
        cancel_token.child_token(),
        Arc::clone(metrics),
    );

    let connection = relay
        .connect(id.clone())
        .await
        .with_context(|| format!("relay connect for {id}"))?;

    let bridge = SignalingBridge::new(handle.clone(), relay.room_id().clone(), outbound_rx);
    let bridge_task = tokio::spawn(bridge.run(
        connection.inbound,
        connection.outbound,
        cancel_token.child_token(),
    ));

    Ok(SimParticipant {
        handle,
        actor_task,
        bridge_task,
    })
}

/// Wait until every participant sees `expected` connected peers.
async fn settle(participants: &[SimParticipant], expected: usize) -> bool {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        let mut converged = true;
        for participant in participants {
            let view = participant.handle.subscribe().borrow().clone();
            if view.len() != expected || view.count_in(PeerState::Connected) != expected {
                converged = false;
                break;
            }
        }
        if converged {
            return true;
        }
        tokio::time::sleep(SETTLE_POLL).await;
    }
    false
}
