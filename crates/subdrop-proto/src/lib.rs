//! Shared wire model for Subdrop.
//!
//! Everything that crosses a socket lives here: the signaling vocabulary
//! exchanged with the relay ([`message::SignalMessage`]), the framing used on
//! peer data channels ([`frame`]), the length-prefixed codec ([`codec`]), and
//! the input sanitizers the relay applies to every free-text field
//! ([`sanitize`]).

pub mod codec;
pub mod frame;
pub mod message;
pub mod sanitize;

pub use codec::CodecError;
pub use frame::{ChannelControl, ChannelFrame};
pub use message::{
    Candidate, ChatPayload, ConnectionId, FileMeta, PeerInfo, SessionDescription, SignalMessage,
};

/// Default chunk size for streamed transfers (bytes).
pub const DEFAULT_CHUNK_SIZE: usize = 16_384;

/// Smallest chunk size the adaptive policy may choose (bytes).
pub const MIN_CHUNK_SIZE: usize = 4_096;

/// Largest chunk size the adaptive policy may choose (bytes).
pub const MAX_CHUNK_SIZE: usize = 1_048_576;

/// Default signaling port, overridable via `SUBDROP_PORT`.
pub const DEFAULT_PORT: u16 = 3002;
