//! # Mesh Test Utilities
//!
//! Mocks and fixtures for testing the mesh client without a real transport.
//!
//! ## Modules
//!
//! - `mock_connector` - Scripted transport that records every link it opens
//! - `fixtures` - Ids, signal payloads, configs and a controller harness
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mesh_test_utils::*;
//!
//! let connector = MockConnector::builder().reject_signals_for("mallory").build();
//! let mut harness = ControllerHarness::new("alice", &connector);
//! harness.controller.participant_joined(pid("bob"), harness.now);
//! assert_eq!(connector.opened_for("bob").len(), 1);
//! ```

pub mod fixtures;
pub mod mock_connector;

pub use fixtures::*;
pub use mock_connector::{MockConnector, MockConnectorBuilder, MockStream, OpenedLink};
