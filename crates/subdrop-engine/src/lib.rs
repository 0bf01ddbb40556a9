//! Subdrop peer transport engine.
//!
//! Everything a device needs beyond the relay: session negotiation and
//! direct peer channels, accept/reject file handshakes, chunked transfers
//! with adaptive sizing, batches, chat with history and unread counts, the
//! optional password layer, and the reconnect grace window. The embedding
//! application drives an [`EngineHandle`] and consumes [`EngineEvent`]s; all
//! engine state lives in one actor task.

pub mod batch;
pub mod chunker;
pub mod config;
pub mod engine;
pub mod error;
pub mod pending;
pub mod registry;
pub mod session;
pub mod transfer;

pub use config::EngineConfig;
pub use engine::{
    connect, ChannelWriter, EngineEvent, EngineHandle, TransferDirection, MAX_DECRYPT_ATTEMPTS,
};
pub use error::EngineError;
pub use registry::{Peer, Presence};
pub use transfer::{OutgoingFile, ReceivedFile};
