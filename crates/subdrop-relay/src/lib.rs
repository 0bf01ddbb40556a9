//! Subdrop signaling relay.
//!
//! The always-on coordination service: groups connecting peers into rooms by
//! network locality, forwards session-negotiation and transfer-handshake
//! messages between peers in the same room, and gates every inbound event
//! through a per-connection rate limiter. The relay never carries file
//! bytes; all transfer state lives in the two endpoints.

pub mod config;
pub mod guard;
pub mod http;
pub mod name_gen;
pub mod rooms;
pub mod server;

pub use config::RelayConfig;
pub use guard::{AbuseGuard, GuardConfig};
pub use rooms::{room_key, RoomIndex};
pub use server::{RelayError, RelayServer};
