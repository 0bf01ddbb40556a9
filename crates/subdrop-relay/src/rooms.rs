//! Locality room index.
//!
//! A room is the set of connections considered "nearby": the key is derived
//! from the first three octets of the peer's IPv4 address (IPv4-mapped IPv6
//! included). Unparseable addresses share a sentinel room. Rooms exist only
//! in memory and are deleted when the last member leaves.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use subdrop_proto::message::ConnectionId;

/// Sentinel room for addresses that don't map to an IPv4 subnet.
pub const UNKNOWN_ROOM: &str = "room_unknown";

/// Derive the room key for a peer address.
pub fn room_key(ip: IpAddr) -> String {
    let v4 = match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    };
    match v4 {
        Some(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("room_{a}.{b}.{c}")
        }
        None => UNKNOWN_ROOM.to_string(),
    }
}

/// Room membership, with a reverse index from connection to room.
#[derive(Debug, Default)]
pub struct RoomIndex {
    rooms: HashMap<String, HashSet<ConnectionId>>,
    membership: HashMap<ConnectionId, String>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a connection to a room, creating it on first use.
    pub fn join(&mut self, key: &str, conn: ConnectionId) {
        self.rooms.entry(key.to_string()).or_default().insert(conn);
        self.membership.insert(conn, key.to_string());
    }

    /// Remove a connection; an emptied room is deleted. Returns the room the
    /// connection was in, if any.
    pub fn leave(&mut self, conn: ConnectionId) -> Option<String> {
        let key = self.membership.remove(&conn)?;
        if let Some(members) = self.rooms.get_mut(&key) {
            members.remove(&conn);
            if members.is_empty() {
                self.rooms.remove(&key);
            }
        }
        Some(key)
    }

    /// Current members of a room.
    pub fn members(&self, key: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Room a connection belongs to.
    pub fn room_of(&self, conn: ConnectionId) -> Option<&str> {
        self.membership.get(&conn).map(String::as_str)
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn same_subnet_same_room() {
        let a = room_key("192.168.1.10".parse().unwrap());
        let b = room_key("192.168.1.200".parse().unwrap());
        assert_eq!(a, b);
        assert_eq!(a, "room_192.168.1");
    }

    #[test]
    fn different_subnet_different_room() {
        let a = room_key("192.168.1.10".parse().unwrap());
        let c = room_key("10.0.0.5".parse().unwrap());
        assert_ne!(a, c);
        assert_eq!(c, "room_10.0.0");
    }

    #[test]
    fn ipv4_mapped_ipv6_uses_subnet() {
        let mapped = room_key("::ffff:192.168.1.4".parse().unwrap());
        assert_eq!(mapped, "room_192.168.1");
    }

    #[test]
    fn plain_ipv6_falls_back_to_sentinel() {
        assert_eq!(room_key("fe80::1".parse().unwrap()), UNKNOWN_ROOM);
    }

    #[test]
    fn empty_room_is_deleted() {
        let mut index = RoomIndex::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.join("room_192.168.1", a);
        index.join("room_192.168.1", b);
        assert_eq!(index.room_count(), 1);

        index.leave(a);
        assert_eq!(index.room_count(), 1);
        assert_eq!(index.members("room_192.168.1"), vec![b]);

        assert_eq!(index.leave(b).as_deref(), Some("room_192.168.1"));
        assert_eq!(index.room_count(), 0);
    }

    #[test]
    fn leave_unknown_connection_is_noop() {
        let mut index = RoomIndex::new();
        assert_eq!(index.leave(Uuid::new_v4()), None);
    }
}
