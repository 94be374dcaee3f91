//! Mesh client configuration.
//!
//! Configuration is loaded from environment variables with defaults that
//! match the reconnection policy constants.

use crate::policy::ReconnectPolicy;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default maximum reconnection attempts before a peer is abandoned.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff, in milliseconds.
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1000;

/// Default STUN servers handed to the transport.
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Default actor mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 500;

/// Default number of simulated participants for `mesh-sim`.
pub const DEFAULT_SIM_PARTICIPANTS: usize = 3;

/// Mesh client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Retry budget per participant (default: 3).
    pub max_reconnect_attempts: u32,

    /// Base delay for exponential backoff (default: 1s).
    pub reconnect_base_delay: Duration,

    /// Retry automatically on a backoff timer after a failure (default: true).
    /// When false, a failed peer only retries when a signal arrives for it.
    pub auto_reconnect: bool,

    /// ICE server URLs passed to the transport on open.
    pub ice_servers: Vec<String>,

    /// Whether the transport should trickle candidates (default: true).
    pub trickle: bool,

    /// Bound of the actor command mailbox (default: 500).
    pub mailbox_capacity: usize,

    /// Participants spawned by `mesh-sim` (default: 3).
    pub sim_participants: usize,

    /// Whether `mesh-sim` severs one link after the mesh settles.
    pub sim_sever: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            auto_reconnect: true,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| (*s).to_string()).collect(),
            trickle: true,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            sim_participants: DEFAULT_SIM_PARTICIPANTS,
            sim_sever: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let max_reconnect_attempts = parse_var(
            vars,
            "MESH_MAX_RECONNECT_ATTEMPTS",
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
        )?;

        let base_delay_ms = parse_var(
            vars,
            "MESH_RECONNECT_BASE_DELAY_MS",
            DEFAULT_RECONNECT_BASE_DELAY_MS,
        )?;
        if base_delay_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "MESH_RECONNECT_BASE_DELAY_MS must be greater than 0".to_string(),
            ));
        }

        let auto_reconnect = parse_bool(vars, "MESH_AUTO_RECONNECT", true)?;
        let trickle = parse_bool(vars, "MESH_TRICKLE", true)?;

        let ice_servers = match vars.get("MESH_ICE_SERVERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
            None => DEFAULT_ICE_SERVERS.iter().map(|s| (*s).to_string()).collect(),
        };

        let mailbox_capacity =
            parse_var(vars, "MESH_MAILBOX_CAPACITY", DEFAULT_MAILBOX_CAPACITY)?;
        if mailbox_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "MESH_MAILBOX_CAPACITY must be greater than 0".to_string(),
            ));
        }

        let sim_participants =
            parse_var(vars, "MESH_SIM_PARTICIPANTS", DEFAULT_SIM_PARTICIPANTS)?;
        let sim_sever = parse_bool(vars, "MESH_SIM_SEVER", false)?;

        Ok(Config {
            max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(base_delay_ms),
            auto_reconnect,
            ice_servers,
            trickle,
            mailbox_capacity,
            sim_participants,
            sim_sever,
        })
    }

    /// The reconnection policy described by this configuration.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.max_reconnect_attempts, self.reconnect_base_delay)
    }
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
        None => Ok(default),
    }
}

fn parse_bool(
    vars: &HashMap<String, String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(name).map(|s| s.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" || v == "1" || v == "yes" => Ok(true),
        Some(v) if v == "false" || v == "0" || v == "no" => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue(format!("{name}={v}"))),
    }
}
