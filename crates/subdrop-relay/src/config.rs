//! Relay configuration.

use crate::guard::GuardConfig;
use std::net::SocketAddr;
use subdrop_proto::DEFAULT_PORT;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the signaling listener binds to.
    pub bind_addr: SocketAddr,
    /// Abuse guard limits.
    pub guard: GuardConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            guard: GuardConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Loopback configuration on an ephemeral port, for tests.
    pub fn loopback() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }
}
