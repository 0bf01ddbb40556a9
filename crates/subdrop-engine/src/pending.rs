//! Correlation of handshake responses.
//!
//! A file request has no wire-level correlation id; its response is matched
//! by the responding connection. Batch responses carry the batch id. Each
//! outstanding request parks a oneshot that the signaling loop resolves when
//! the matching response arrives; timeouts remove their own entry so a late
//! response after a timeout is dropped instead of waking a stale waiter.

use std::collections::HashMap;
use subdrop_proto::message::ConnectionId;
use tokio::sync::oneshot;

/// What kind of decision is awaited.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PendingKind {
    /// Single-file accept/reject from the target.
    FileResponse,
    /// Batch accept/reject, correlated by batch id.
    BatchResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    kind: PendingKind,
    peer: ConnectionId,
}

/// Outstanding accept/reject decisions.
#[derive(Debug, Default)]
pub struct PendingMap {
    waiting: HashMap<Key, oneshot::Sender<bool>>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a waiter for a decision from `peer`. A prior waiter for the same
    /// key is dropped, which fails its receiver.
    pub fn register(&mut self, kind: PendingKind, peer: ConnectionId) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(Key { kind, peer }, tx);
        rx
    }

    /// Resolve a waiter with the peer's decision. Returns false when nothing
    /// was waiting (late or unsolicited response).
    pub fn resolve(&mut self, kind: PendingKind, peer: ConnectionId, accepted: bool) -> bool {
        match self.waiting.remove(&Key { kind, peer }) {
            Some(tx) => tx.send(accepted).is_ok(),
            None => false,
        }
    }

    /// Drop a waiter that timed out.
    pub fn cancel(&mut self, kind: PendingKind, peer: ConnectionId) {
        self.waiting.remove(&Key { kind, peer });
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
