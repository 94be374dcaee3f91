//! Peer mesh orchestration for a browser-style video room.
//!
//! Every participant holds one direct media connection to every other
//! participant. This crate decides who initiates each connection, routes
//! signaling payloads to the right connection instance, recovers failed
//! connections with bounded exponential backoff, and exposes remote streams
//! once they are available.
//!
//! # Architecture
//!
//! ```text
//! SignalingBridge (wire frames)
//! └── MeshActor (one per room session, serializes every input)
//!     └── MeshController (synchronous state machine)
//!         ├── PeerRegistry (remote id -> ConnectionRecord)
//!         ├── ReconnectPolicy (attempt cap + backoff)
//!         └── PeerConnector / PeerLink (transport capability)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Session actor, mailbox and counters
//! - [`controller`] - Lifecycle, signal routing and stream binding
//! - [`registry`] - Connection records and snapshots
//! - [`policy`] - Reconnection policy
//! - [`transport`] - Transport capability traits and events
//! - [`signaling`] - Wire format and the signaling bridge
//! - [`loopback`] / [`relay`] - In-process transport and signaling server
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types

pub mod actors;
pub mod config;
pub mod controller;
pub mod errors;
pub mod loopback;
pub mod observability;
pub mod policy;
pub mod registry;
pub mod relay;
pub mod signaling;
pub mod transport;
