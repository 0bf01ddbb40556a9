//! Peer registry.
//!
//! Peers are keyed by their stable client id so a reconnect (new connection
//! id) lands on the same entry. A departed peer lingers in a grace state for
//! a short window; if the same client id comes back in time the entry is
//! revived with its chat history and unread count intact, otherwise it is
//! dropped. Grace timers carry a generation number so a timer armed before a
//! reconnect can never evict the revived entry.

use std::collections::HashMap;
use subdrop_proto::message::{ChatPayload, ConnectionId, PeerInfo};
use uuid::Uuid;

/// Presence of one peer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Connected and addressable.
    Active,
    /// Disconnected, inside the reconnect grace window.
    Grace { generation: u64 },
}

/// One known peer, durable across reconnects.
#[derive(Debug, Clone)]
pub struct Peer {
    pub client_id: String,
    pub connection_id: ConnectionId,
    pub device_id: Uuid,
    pub device_name: String,
    pub presence: Presence,
    pub chat: Vec<ChatPayload>,
    pub unread: usize,
}

/// What happened when a peer announcement was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    New,
    Reconnected,
    Refreshed,
}

/// All peers known to the engine, keyed by stable client id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
    by_connection: HashMap<ConnectionId, String>,
    selected: Option<String>,
    next_generation: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `peer-joined` or `peers-list` announcement.
    ///
    /// Peers that never announced a client id are keyed by their connection
    /// id instead; such entries cannot survive a reconnect.
    pub fn upsert(&mut self, info: &PeerInfo) -> Arrival {
        let key = info
            .client_id
            .clone()
            .unwrap_or_else(|| info.connection_id.to_string());

        let arrival = match self.peers.get(&key) {
            None => Arrival::New,
            Some(peer) if matches!(peer.presence, Presence::Grace { .. }) => Arrival::Reconnected,
            Some(_) => Arrival::Refreshed,
        };

        let entry = self.peers.entry(key.clone()).or_insert_with(|| Peer {
            client_id: key.clone(),
            connection_id: info.connection_id,
            device_id: info.device_id,
            device_name: info.device_name.clone(),
            presence: Presence::Active,
            chat: Vec::new(),
            unread: 0,
        });
        self.by_connection.remove(&entry.connection_id);
        entry.connection_id = info.connection_id;
        entry.device_id = info.device_id;
        entry.device_name = info.device_name.clone();
        entry.presence = Presence::Active;
        self.by_connection.insert(info.connection_id, key);
        arrival
    }

    /// Mark a departed connection as in-grace. Returns the client id and the
    /// generation the caller should arm its expiry timer with.
    pub fn begin_grace(&mut self, conn: ConnectionId) -> Option<(String, u64)> {
        let key = self.by_connection.get(&conn)?.clone();
        let peer = self.peers.get_mut(&key)?;
        self.next_generation += 1;
        let generation = self.next_generation;
        peer.presence = Presence::Grace { generation };
        Some((key, generation))
    }

    /// Drop a peer whose grace window expired, unless it was revived or a
    /// newer departure re-armed the timer. Returns the removed peer.
    pub fn expire_grace(&mut self, client_id: &str, generation: u64) -> Option<Peer> {
        let peer = self.peers.get(client_id)?;
        if peer.presence != (Presence::Grace { generation }) {
            return None;
        }
        let peer = self.peers.remove(client_id)?;
        self.by_connection.remove(&peer.connection_id);
        if self.selected.as_deref() == Some(client_id) {
            self.selected = None;
        }
        Some(peer)
    }

    /// Record a rename. Returns the old name.
    pub fn rename(&mut self, conn: ConnectionId, new_name: &str) -> Option<String> {
        let key = self.by_connection.get(&conn)?;
        let peer = self.peers.get_mut(key)?;
        let old = std::mem::replace(&mut peer.device_name, new_name.to_string());
        Some(old)
    }

    /// Append a chat message to the conversation with `client_id`. Messages
    /// from the peer count as unread unless that conversation is selected.
    pub fn push_chat(&mut self, client_id: &str, message: ChatPayload) {
        let selected = self.selected.as_deref() == Some(client_id);
        if let Some(peer) = self.peers.get_mut(client_id) {
            if !message.is_own && !selected {
                peer.unread += 1;
            }
            peer.chat.push(message);
        }
    }

    /// Select a conversation, clearing its unread count.
    pub fn select(&mut self, client_id: Option<&str>) {
        self.selected = client_id.map(str::to_string);
        if let Some(id) = client_id {
            if let Some(peer) = self.peers.get_mut(id) {
                peer.unread = 0;
            }
        }
    }

    /// Clear the unread count for one conversation.
    pub fn mark_read(&mut self, client_id: &str) {
        if let Some(peer) = self.peers.get_mut(client_id) {
            peer.unread = 0;
        }
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn get(&self, client_id: &str) -> Option<&Peer> {
        self.peers.get(client_id)
    }

    pub fn by_connection(&self, conn: ConnectionId) -> Option<&Peer> {
        let key = self.by_connection.get(&conn)?;
        self.peers.get(key)
    }

    pub fn client_id_of(&self, conn: ConnectionId) -> Option<&str> {
        self.by_connection.get(&conn).map(String::as_str)
    }

    /// Snapshot of all active peers.
    pub fn active(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .values()
            .filter(|p| p.presence == Presence::Active)
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.device_name.cmp(&b.device_name));
        peers
    }
}
