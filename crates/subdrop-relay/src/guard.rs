//! Per-connection abuse guard.
//!
//! A fixed-window event counter per connection: exceeding the cap flips a
//! temporary block, after which the counter resets. Every inbound signaling
//! event is checked before dispatch; a blocked connection receives an
//! explicit rejection and no further processing. Guard state is torn down
//! when the connection goes away.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use subdrop_proto::message::ConnectionId;

/// Abuse guard limits.
#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    /// Events accepted per window.
    pub max_events: u32,
    /// Window duration.
    pub window: Duration,
    /// Block duration once the cap is exceeded.
    pub block: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_events: 100,
            window: Duration::from_secs(60),
            block: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Entry {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

/// Sliding-window rate limiter keyed by connection id.
#[derive(Debug)]
pub struct AbuseGuard {
    config: GuardConfig,
    entries: HashMap<ConnectionId, Entry>,
}

impl AbuseGuard {
    /// Create a guard with the given limits.
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Admit or reject one event from `conn`.
    pub fn check(&mut self, conn: ConnectionId) -> bool {
        self.check_at(conn, Instant::now())
    }

    fn check_at(&mut self, conn: ConnectionId, now: Instant) -> bool {
        let entry = self.entries.entry(conn).or_insert(Entry {
            count: 0,
            window_start: now,
            blocked_until: None,
        });

        if let Some(until) = entry.blocked_until {
            if now < until {
                return false;
            }
            // Block elapsed: counter resets with a fresh window.
            entry.blocked_until = None;
            entry.count = 0;
            entry.window_start = now;
        }

        if now.duration_since(entry.window_start) > self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;
        if entry.count > self.config.max_events {
            entry.blocked_until = Some(now + self.config.block);
            return false;
        }
        true
    }

    /// Tear down state for a disconnected connection.
    pub fn remove(&mut self, conn: ConnectionId) {
        self.entries.remove(&conn);
    }

    /// Number of connections currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
