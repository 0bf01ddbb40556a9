//! Engine error taxonomy.

use subdrop_proto::codec::CodecError;
use thiserror::Error;

/// Failures surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The relay rejected an event because this connection is rate limited.
    #[error("relay rate limit: {0}")]
    RateLimited(String),

    /// The peer did not answer a file or batch request in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The peer declined the file.
    #[error("file declined by peer")]
    HandshakeRejected,

    /// The peer declined the whole batch; nothing was sent.
    #[error("batch declined by peer")]
    BatchRejected,

    /// The peer did not answer a batch request in time.
    #[error("batch handshake timed out")]
    BatchTimeout,

    /// The data channel could not be opened in time.
    #[error("channel open timed out")]
    ChannelOpenTimeout,

    /// The peer-to-peer channel failed mid-transfer.
    #[error("channel closed")]
    ChannelClosed,

    /// The peer sent frames that violate the transfer protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No known peer with the given connection id.
    #[error("unknown peer")]
    PeerNotFound,

    /// Wrong password for a stored encrypted file.
    #[error("decryption failed, {attempts_left} attempts left")]
    Decryption { attempts_left: u32 },

    /// The encrypted file was discarded after too many failed attempts.
    #[error("encrypted file discarded")]
    FileDiscarded,

    /// No stored encrypted file with that id.
    #[error("no such pending encrypted file")]
    NoSuchFile,

    /// The engine actor has shut down.
    #[error("engine stopped")]
    Stopped,

    /// Signaling or channel codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Local file or socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Password-based sealing failure.
    #[error(transparent)]
    Crypto(#[from] subdrop_crypto::CryptoError),
}
