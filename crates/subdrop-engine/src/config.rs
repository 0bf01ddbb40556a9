//! Engine configuration.

use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address of the signaling relay.
    pub relay_addr: SocketAddr,
    /// Stable client id persisted across restarts.
    pub client_id: String,
    /// Saved display name, if any; the relay generates one otherwise.
    pub device_name: Option<String>,
    /// How long to wait for a peer's accept/reject decision.
    pub handshake_timeout: Duration,
    /// How long to wait for the data channel to come up.
    pub channel_open_timeout: Duration,
    /// How long a departed peer is kept for a possible reconnect.
    pub grace_window: Duration,
    /// Delay between consecutive chunks, keeping the channel responsive.
    pub chunk_pacing: Duration,
    /// Concurrent outbound transfers allowed at once.
    pub max_concurrent_transfers: usize,
    /// Adapt chunk size to observed throughput instead of a fixed size.
    pub adaptive_chunks: bool,
}

impl EngineConfig {
    /// Configuration with default timings for the given relay.
    pub fn new(relay_addr: SocketAddr) -> Self {
        Self {
            relay_addr,
            client_id: fresh_client_id(),
            device_name: None,
            handshake_timeout: Duration::from_secs(30),
            channel_open_timeout: Duration::from_secs(10),
            grace_window: Duration::from_secs(4),
            chunk_pacing: Duration::from_millis(10),
            max_concurrent_transfers: 3,
            adaptive_chunks: true,
        }
    }
}

/// Generate a stable client id for a first run.
pub fn fresh_client_id() -> String {
    format!("client_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timings() {
        let config = EngineConfig::new("127.0.0.1:3002".parse().unwrap());
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.channel_open_timeout, Duration::from_secs(10));
        assert_eq!(config.grace_window, Duration::from_secs(4));
        assert_eq!(config.max_concurrent_transfers, 3);
    }

    #[test]
    fn client_ids_are_unique() {
        assert_ne!(fresh_client_id(), fresh_client_id());
        assert!(fresh_client_id().starts_with("client_"));
    }
}
