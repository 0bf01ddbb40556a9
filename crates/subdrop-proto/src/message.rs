//! Signaling message definitions.
//!
//! One serde enum tagged by `event` covers the whole relay vocabulary, in
//! both directions. Client-to-relay messages name their destination in
//! `target`; the relay annotates forwarded copies with `from` and never
//! inspects the rest of the payload beyond sanitizing free text.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

/// Ephemeral, relay-assigned identifier of one signaling connection.
///
/// Changes on every reconnect; the addressable unit for forwarding and for
/// peer sessions. The durable identity of a device is its client id, an
/// opaque string the device generates once and persists locally.
pub type ConnectionId = Uuid;

/// A peer as announced in `peers-list` / `peer-joined`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Relay-assigned device id for this connection.
    pub device_id: Uuid,
    /// Display name (generated or user-chosen).
    pub device_name: String,
    /// Addressable connection id.
    pub connection_id: ConnectionId,
    /// Stable client id, if the device announced one.
    #[serde(default)]
    pub client_id: Option<String>,
}

/// File manifest entry used in batch requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub relative_path: String,
}

/// A chat message as carried on the wire and stored per conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub id: String,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub from_connection: Option<ConnectionId>,
    pub from_name: String,
    pub is_own: bool,
}

/// Session description exchanged in `session-offer` / `session-answer`.
///
/// The initiator listens on one or more candidate addresses and proves
/// ownership of the session with the token; the dialer writes the raw token
/// bytes as its first payload on the new channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    /// 16-byte session token, hex-encoded.
    pub token: String,
    /// Candidate addresses the offering side is reachable on.
    pub addrs: Vec<SocketAddr>,
}

/// A transport candidate forwarded independently of the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub addr: SocketAddr,
}

/// The signaling vocabulary.
///
/// Variant names are the kebab-case wire event names; fields serialize
/// camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    /// First message from a connecting client: stable id plus an optional
    /// saved display name.
    ClientInit {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },

    /// Relay's reply to `client-init` with the assigned identity.
    DeviceInfo { device_id: Uuid, device_name: String },

    /// Current room membership, sent once after `client-init`.
    PeersList { peers: Vec<PeerInfo> },

    /// Broadcast to the room when a peer finishes initialization.
    PeerJoined { peer: PeerInfo },

    /// Broadcast to the room when a peer disconnects.
    PeerLeft {
        connection_id: ConnectionId,
        device_id: Uuid,
    },

    /// Client asks to rename itself.
    ChangeDeviceName { new_name: String },

    /// Relay confirms the rename to the requesting client.
    DeviceNameUpdated { device_id: Uuid, device_name: String },

    /// Broadcast to the rest of the room after a rename.
    PeerNameChanged {
        connection_id: ConnectionId,
        device_name: String,
        old_name: String,
    },

    /// Session negotiation: offer, forwarded verbatim.
    SessionOffer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionId>,
        sdp: SessionDescription,
    },

    /// Session negotiation: answer, forwarded verbatim.
    SessionAnswer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionId>,
        sdp: SessionDescription,
    },

    /// Additional transport candidate; may arrive before or after the answer.
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionId>,
        candidate: Candidate,
    },

    /// Transfer handshake: ask the target to accept one file.
    FileRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionId>,
        file_name: String,
        file_size: u64,
        #[serde(default)]
        relative_path: String,
        from_name: String,
    },

    /// Transfer handshake: the target's accept/reject decision.
    FileResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionId>,
        accepted: bool,
    },

    /// Batch handshake: one decision covers every file in the manifest.
    BatchFileRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionId>,
        files: Vec<FileMeta>,
        from_name: String,
        batch_id: String,
    },

    /// Batch handshake response, correlated by `batch_id`.
    BatchFileResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionId>,
        accepted: bool,
        batch_id: String,
    },

    /// Sender-side progress telemetry, advisory only.
    TransferProgress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionId>,
        progress: f64,
        file_name: String,
    },

    /// Chat message relayed when no data channel is open.
    ChatMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ConnectionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ConnectionId>,
        message: ChatPayload,
    },

    /// Relay-side rejection or failure notice (rate limiting, bad target).
    Error { message: String },
}

impl SignalMessage {
    /// Destination connection id for forwardable messages.
    pub fn target(&self) -> Option<ConnectionId> {
        match self {
            SignalMessage::SessionOffer { target, .. }
            | SignalMessage::SessionAnswer { target, .. }
            | SignalMessage::IceCandidate { target, .. }
            | SignalMessage::FileRequest { target, .. }
            | SignalMessage::FileResponse { target, .. }
            | SignalMessage::BatchFileRequest { target, .. }
            | SignalMessage::BatchFileResponse { target, .. }
            | SignalMessage::TransferProgress { target, .. }
            | SignalMessage::ChatMessage { target, .. } => *target,
            _ => None,
        }
    }

    /// Wire event name, for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalMessage::ClientInit { .. } => "client-init",
            SignalMessage::DeviceInfo { .. } => "device-info",
            SignalMessage::PeersList { .. } => "peers-list",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft { .. } => "peer-left",
            SignalMessage::ChangeDeviceName { .. } => "change-device-name",
            SignalMessage::DeviceNameUpdated { .. } => "device-name-updated",
            SignalMessage::PeerNameChanged { .. } => "peer-name-changed",
            SignalMessage::SessionOffer { .. } => "session-offer",
            SignalMessage::SessionAnswer { .. } => "session-answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::FileRequest { .. } => "file-request",
            SignalMessage::FileResponse { .. } => "file-response",
            SignalMessage::BatchFileRequest { .. } => "batch-file-request",
            SignalMessage::BatchFileResponse { .. } => "batch-file-response",
            SignalMessage::TransferProgress { .. } => "transfer-progress",
            SignalMessage::ChatMessage { .. } => "chat-message",
            SignalMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_init_round_trip() {
        let msg = SignalMessage::ClientInit {
            client_id: "client_abc".into(),
            device_name: Some("Quiet Otter".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"event\":\"client-init\""));
        assert!(json.contains("\"clientId\""));
        let back: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn file_request_round_trip() {
        let msg = SignalMessage::FileRequest {
            target: Some(Uuid::new_v4()),
            from: None,
            file_name: "report.pdf".into(),
            file_size: 1024,
            relative_path: "docs/report.pdf".into(),
            from_name: "Swift Fox".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"fileName\":\"report.pdf\""));
        assert!(!json.contains("\"from\":null"));
        let back: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn batch_response_round_trip() {
        let msg = SignalMessage::BatchFileResponse {
            target: None,
            from: Some(Uuid::new_v4()),
            accepted: false,
            batch_id: "batch_17".into(),
        };
        let back: SignalMessage =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn session_offer_carries_addrs() {
        let msg = SignalMessage::SessionOffer {
            target: Some(Uuid::new_v4()),
            from: None,
            sdp: SessionDescription {
                token: "00ff".into(),
                addrs: vec!["192.168.1.4:49152".parse().unwrap()],
            },
        };
        let back: SignalMessage =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn target_accessor() {
        let id = Uuid::new_v4();
        let msg = SignalMessage::FileResponse {
            target: Some(id),
            from: None,
            accepted: true,
        };
        assert_eq!(msg.target(), Some(id));
        let msg = SignalMessage::PeersList { peers: vec![] };
        assert_eq!(msg.target(), None);
    }

    #[test]
    fn event_names_match_wire() {
        let msg = SignalMessage::Error {
            message: "Rate limit exceeded. Please wait.".into(),
        };
        assert_eq!(msg.event_name(), "error");
        let msg = SignalMessage::ChangeDeviceName {
            new_name: "Desk".into(),
        };
        assert_eq!(msg.event_name(), "change-device-name");
    }
}
