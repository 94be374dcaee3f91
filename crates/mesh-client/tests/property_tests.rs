//! Property tests: random interleavings of room events, signals, transport
//! callbacks and timer firings must keep the mesh invariants.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use common::types::{ConnectionId, ParticipantId};
use mesh_client::controller::Effect;
use mesh_client::policy::ReconnectPolicy;
use mesh_client::registry::{PeerState, Role};
use mesh_client::transport::{SignalPayload, TransportError};
use mesh_test_utils::*;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

const LOCAL: &str = "me";
const IDS: [&str; 5] = ["a", "b", "c", "d", LOCAL];

#[derive(Debug, Clone)]
enum Op {
    Join(usize),
    JoinRoom(Vec<usize>),
    Leave(usize),
    Signal(usize, u8),
    Close(usize),
    Error(usize),
    Stream(usize),
    Advance(u64),
    FireRetry(usize),
}

fn op() -> impl Strategy<Value = Op> {
    let id = 0..IDS.len();
    prop_oneof![
        id.clone().prop_map(Op::Join),
        prop::collection::vec(id.clone(), 0..4).prop_map(Op::JoinRoom),
        id.clone().prop_map(Op::Leave),
        (id.clone(), 0u8..4).prop_map(|(i, k)| Op::Signal(i, k)),
        id.clone().prop_map(Op::Close),
        id.clone().prop_map(Op::Error),
        id.clone().prop_map(Op::Stream),
        (0u64..5000).prop_map(Op::Advance),
        id.prop_map(Op::FireRetry),
    ]
}

fn payload(kind: u8) -> SignalPayload {
    match kind {
        0 => offer(),
        1 => answer(),
        2 => candidate(),
        _ => SignalPayload::new(json!({ "type": "renegotiate" })),
    }
}

#[derive(Debug, Clone, Copy)]
struct Observed {
    role: Role,
    state: PeerState,
    attempts: u32,
    last_attempt_at: Option<Instant>,
}

fn observe(harness: &ControllerHarness) -> HashMap<ParticipantId, Observed> {
    let registry = harness.controller.registry();
    IDS.iter()
        .filter_map(|id| {
            registry.get(&pid(id)).map(|record| {
                (
                    pid(id),
                    Observed {
                        role: record.role(),
                        state: record.state(),
                        attempts: record.reconnect_attempts(),
                        last_attempt_at: record.last_reconnect_at(),
                    },
                )
            })
        })
        .collect()
}

/// Retries pending in the timer table, as the actor would hold them.
#[derive(Default)]
struct Timers(HashMap<ParticipantId, (ConnectionId, Instant)>);

impl Timers {
    fn apply(&mut self, effects: &[Effect], now: Instant) {
        for effect in effects {
            match effect {
                Effect::ScheduleRetry {
                    remote_id,
                    connection_id,
                    delay,
                } => {
                    self.0
                        .insert(remote_id.clone(), (*connection_id, now + *delay));
                }
                Effect::CancelRetry { remote_id } => {
                    self.0.remove(remote_id);
                }
                _ => {}
            }
        }
    }
}

fn step(harness: &mut ControllerHarness, timers: &mut Timers, op: &Op) -> Vec<Effect> {
    let mut effects = match op {
        Op::Join(i) => harness
            .controller
            .participant_joined(pid(IDS[*i]), harness.now),
        Op::JoinRoom(ids) => harness
            .controller
            .join_room(ids.iter().map(|i| pid(IDS[*i])), harness.now),
        Op::Leave(i) => harness.controller.participant_left(&pid(IDS[*i])),
        Op::Signal(i, kind) => {
            harness
                .controller
                .route_signal(pid(IDS[*i]), payload(*kind), harness.now)
        }
        Op::Close(i) => {
            harness.connector.emit_closed(IDS[*i]);
            Vec::new()
        }
        Op::Error(i) => {
            harness
                .connector
                .emit_error(IDS[*i], TransportError::Other("ice failed".into()));
            Vec::new()
        }
        Op::Stream(i) => {
            harness.connector.emit_remote_stream(IDS[*i]);
            Vec::new()
        }
        Op::Advance(ms) => {
            harness.advance(Duration::from_millis(*ms));
            Vec::new()
        }
        Op::FireRetry(i) => match timers.0.remove(&pid(IDS[*i])) {
            Some((connection_id, due)) => {
                if due > harness.now {
                    harness.now = due;
                }
                harness
                    .controller
                    .retry_due(&pid(IDS[*i]), connection_id, harness.now)
            }
            None => Vec::new(),
        },
    };
    timers.apply(&effects, harness.now);
    let pumped = harness.pump();
    timers.apply(&pumped, harness.now);
    effects.extend(pumped);
    effects
}

fn starts_fresh_cycle(op: &Op, id: &ParticipantId) -> bool {
    match op {
        Op::Join(i) => pid(IDS[*i]) == *id,
        Op::JoinRoom(ids) => ids.iter().any(|i| pid(IDS[*i]) == *id),
        _ => false,
    }
}

fn check_step(
    policy: &ReconnectPolicy,
    op: &Op,
    before: &HashMap<ParticipantId, Observed>,
    after: &HashMap<ParticipantId, Observed>,
    now: Instant,
) -> Result<(), TestCaseError> {
    prop_assert!(!after.contains_key(&pid(LOCAL)), "local id got a record");

    for (id, current) in after {
        prop_assert!(
            current.attempts <= policy.max_attempts(),
            "{id} exceeded the retry budget: {current:?}"
        );

        let Some(previous) = before.get(id) else {
            continue;
        };
        if starts_fresh_cycle(op, id) {
            continue;
        }

        prop_assert_eq!(previous.role, current.role, "role changed for {}", id);

        if current.state == PeerState::Connected {
            prop_assert_eq!(current.attempts, 0);
            continue;
        }

        prop_assert!(
            current.attempts == previous.attempts || current.attempts == previous.attempts + 1,
            "{id} attempts jumped: {previous:?} -> {current:?}"
        );

        if current.attempts == previous.attempts + 1 {
            prop_assert_eq!(current.last_attempt_at, Some(now));
            if let Some(last) = previous.last_attempt_at {
                let gap = now.saturating_duration_since(last);
                prop_assert!(
                    gap >= policy.backoff_delay(previous.attempts),
                    "{id} retried after {gap:?} at attempt {}",
                    previous.attempts
                );
            }
        }
    }
    Ok(())
}

fn check_links(harness: &ControllerHarness) -> Result<(), TestCaseError> {
    for link in harness.connector.opened() {
        prop_assert!(
            harness.connector.destroy_calls(link.connection_id) <= 1,
            "link {:?} destroyed twice",
            link.connection_id
        );
    }
    let live_records = harness
        .controller
        .registry()
        .snapshot()
        .peers
        .values()
        .filter(|view| view.state.is_live())
        .count();
    prop_assert!(harness.connector.live_links() >= live_records);
    Ok(())
}

fn run_ops(ops: &[Op], auto_reconnect: bool) -> Result<(), TestCaseError> {
    let connector = MockConnector::builder().auto_offer().build();
    let mut harness =
        ControllerHarness::with_settings(LOCAL, &connector, test_settings(auto_reconnect));
    let policy = ReconnectPolicy::default();
    let mut timers = Timers::default();

    for op in ops {
        let before = observe(&harness);
        let effects = step(&mut harness, &mut timers, op);
        let after = observe(&harness);

        check_step(&policy, op, &before, &after, harness.now)?;
        check_links(&harness)?;

        for signal in sent_signals(&effects) {
            prop_assert_ne!(signal.target.as_str(), LOCAL);
        }
        if !auto_reconnect {
            prop_assert!(scheduled_retries(&effects).is_empty());
        }
    }

    harness.controller.teardown();
    prop_assert!(harness.controller.registry().is_empty());
    prop_assert_eq!(harness.connector.live_links(), 0);
    for link in harness.connector.opened() {
        prop_assert_eq!(harness.connector.destroy_calls(link.connection_id), 1);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn mesh_invariants_hold_with_auto_reconnect(ops in prop::collection::vec(op(), 1..60)) {
        run_ops(&ops, true)?;
    }

    #[test]
    fn mesh_invariants_hold_with_manual_reconnect(ops in prop::collection::vec(op(), 1..60)) {
        run_ops(&ops, false)?;
    }

    #[test]
    fn backoff_delay_doubles_from_base(attempts in 0u32..8, base_ms in 1u64..5000) {
        let policy = ReconnectPolicy::new(3, Duration::from_millis(base_ms));
        prop_assert_eq!(
            policy.backoff_delay(attempts),
            Duration::from_millis(base_ms * 2u64.pow(attempts))
        );
    }
}
