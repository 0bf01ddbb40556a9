//! Signaling relay server.
//!
//! One TCP connection per client carrying length-prefixed JSON frames. The
//! relay is stateless with respect to transfers: it assigns identities,
//! tracks room membership, and forwards targeted messages after sanitizing
//! free text. A failing handler or socket only ever affects its own
//! connection.

use crate::config::RelayConfig;
use crate::guard::AbuseGuard;
use crate::http;
use crate::name_gen;
use crate::rooms::{room_key, RoomIndex};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use subdrop_proto::codec::{read_signal, write_signal, CodecError};
use subdrop_proto::message::{ConnectionId, PeerInfo, SignalMessage};
use subdrop_proto::sanitize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Relay failures.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Listener or socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// One registered signaling connection.
struct ClientEntry {
    tx: mpsc::UnboundedSender<SignalMessage>,
    info: ClientInfo,
}

#[derive(Debug, Clone)]
struct ClientInfo {
    room: String,
    device_id: Option<Uuid>,
    device_name: Option<String>,
    client_id: Option<String>,
}

struct RelayState {
    clients: DashMap<ConnectionId, ClientEntry>,
    rooms: Mutex<RoomIndex>,
    guard: Mutex<AbuseGuard>,
}

/// The signaling relay.
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the signaling listener.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(RelayState {
                clients: DashMap::new(),
                rooms: Mutex::new(RoomIndex::new()),
                guard: Mutex::new(AbuseGuard::new(config.guard)),
            }),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of registered signaling connections.
    pub fn client_count(&self) -> usize {
        self.state.clients.len()
    }

    /// Accept loop. Runs until the listener fails fatally.
    pub async fn run(self) -> Result<(), RelayError> {
        info!(addr = %self.local_addr, "signaling relay listening");
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(state, stream, peer).await {
                            debug!(%peer, error = %e, "connection ended");
                        }
                    });
                }
                Err(e) => {
                    // Transient accept errors must not take the relay down.
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

async fn handle_connection(
    state: Arc<RelayState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), CodecError> {
    // Signaling frames always start with a length byte of zero; an ASCII 'G'
    // means a plain HTTP probe of the health endpoint.
    let mut probe = [0u8; 1];
    let n = stream.peek(&mut probe).await?;
    if n == 1 && probe[0] == b'G' {
        return Ok(http::serve(stream).await?);
    }

    let conn_id = Uuid::new_v4();
    let room = room_key(peer.ip());
    debug!(%conn_id, %peer, %room, "client connected");

    let (mut rd, mut wr) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();

    state.clients.insert(
        conn_id,
        ClientEntry {
            tx,
            info: ClientInfo {
                room: room.clone(),
                device_id: None,
                device_name: None,
                client_id: None,
            },
        },
    );
    state.rooms.lock().await.join(&room, conn_id);

    // Writer task: drains the outbound queue; ends when the entry (and with
    // it the last sender) is dropped.
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write_signal(&mut wr, &msg).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    loop {
        let msg = match read_signal(&mut rd).await {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%conn_id, error = %e, "read ended");
                break;
            }
        };

        if !state.guard.lock().await.check(conn_id) {
            debug!(%conn_id, "rate limit exceeded");
            send_to(
                &state,
                conn_id,
                SignalMessage::Error {
                    message: "Rate limit exceeded. Please wait.".into(),
                },
            );
            continue;
        }

        dispatch(&state, conn_id, msg).await;
    }

    disconnect(&state, conn_id).await;
    Ok(())
}

/// Route one admitted event. Errors here are per-connection and logged.
async fn dispatch(state: &Arc<RelayState>, from: ConnectionId, msg: SignalMessage) {
    match msg {
        SignalMessage::ClientInit {
            client_id,
            device_name,
        } => handle_client_init(state, from, client_id, device_name).await,

        SignalMessage::ChangeDeviceName { new_name } => {
            handle_rename(state, from, new_name).await
        }

        SignalMessage::SessionOffer { target, sdp, .. } => forward(
            state,
            target,
            SignalMessage::SessionOffer {
                target: None,
                from: Some(from),
                sdp,
            },
        ),

        SignalMessage::SessionAnswer { target, sdp, .. } => forward(
            state,
            target,
            SignalMessage::SessionAnswer {
                target: None,
                from: Some(from),
                sdp,
            },
        ),

        SignalMessage::IceCandidate {
            target, candidate, ..
        } => forward(
            state,
            target,
            SignalMessage::IceCandidate {
                target: None,
                from: Some(from),
                candidate,
            },
        ),

        SignalMessage::FileRequest {
            target,
            file_name,
            file_size,
            relative_path,
            from_name,
            ..
        } => forward(
            state,
            target,
            SignalMessage::FileRequest {
                target: None,
                from: Some(from),
                file_name: sanitize::file_name(&file_name),
                file_size,
                relative_path: sanitize::relative_path(&relative_path),
                from_name: sanitize::device_name(&from_name),
            },
        ),

        SignalMessage::FileResponse {
            target, accepted, ..
        } => forward(
            state,
            target,
            SignalMessage::FileResponse {
                target: None,
                from: Some(from),
                accepted,
            },
        ),

        SignalMessage::BatchFileRequest {
            target,
            files,
            from_name,
            batch_id,
            ..
        } => {
            let files = files
                .into_iter()
                .map(|f| subdrop_proto::message::FileMeta {
                    file_name: sanitize::file_name(&f.file_name),
                    file_size: f.file_size,
                    relative_path: sanitize::relative_path(&f.relative_path),
                })
                .collect();
            forward(
                state,
                target,
                SignalMessage::BatchFileRequest {
                    target: None,
                    from: Some(from),
                    files,
                    from_name: sanitize::device_name(&from_name),
                    batch_id,
                },
            );
        }

        SignalMessage::BatchFileResponse {
            target,
            accepted,
            batch_id,
            ..
        } => forward(
            state,
            target,
            SignalMessage::BatchFileResponse {
                target: None,
                from: Some(from),
                accepted,
                batch_id,
            },
        ),

        SignalMessage::TransferProgress {
            target,
            progress,
            file_name,
            ..
        } => forward(
            state,
            target,
            SignalMessage::TransferProgress {
                target: None,
                from: Some(from),
                progress: sanitize::clamp_progress(progress),
                file_name: sanitize::file_name(&file_name),
            },
        ),

        SignalMessage::ChatMessage {
            target, mut message, ..
        } => {
            message.text = sanitize::chat_text(&message.text);
            message.from_connection = Some(from);
            forward(
                state,
                target,
                SignalMessage::ChatMessage {
                    target: None,
                    from: Some(from),
                    message,
                },
            );
        }

        // Server-originated events arriving from a client are ignored.
        other => debug!(event = other.event_name(), %from, "ignoring event"),
    }
}

async fn handle_client_init(
    state: &Arc<RelayState>,
    conn_id: ConnectionId,
    client_id: String,
    device_name: Option<String>,
) {
    let device_name = device_name
        .as_deref()
        .map(sanitize::device_name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(name_gen::random_device_name);
    let device_id = Uuid::new_v4();

    let room = {
        let Some(mut entry) = state.clients.get_mut(&conn_id) else {
            return;
        };
        entry.info.device_id = Some(device_id);
        entry.info.device_name = Some(device_name.clone());
        entry.info.client_id = Some(client_id.clone());
        entry.info.room.clone()
    };

    // One active connection per stable client id per room: a reconnect
    // supersedes any lingering connection with the same id.
    let stale: Vec<ConnectionId> = state
        .clients
        .iter()
        .filter(|e| {
            *e.key() != conn_id
                && e.value().info.room == room
                && e.value().info.client_id.as_deref() == Some(client_id.as_str())
        })
        .map(|e| *e.key())
        .collect();
    for old in stale {
        debug!(%old, %conn_id, "superseding stale connection");
        disconnect(state, old).await;
    }

    info!(%conn_id, client_id, device_name, "client initialized");

    send_to(
        state,
        conn_id,
        SignalMessage::DeviceInfo {
            device_id,
            device_name: device_name.clone(),
        },
    );

    let members = state.rooms.lock().await.members(&room);
    let peers: Vec<PeerInfo> = members
        .iter()
        .filter(|id| **id != conn_id)
        .filter_map(|id| {
            let entry = state.clients.get(id)?;
            let info = &entry.info;
            Some(PeerInfo {
                device_id: info.device_id?,
                device_name: info.device_name.clone()?,
                connection_id: *id,
                client_id: info.client_id.clone(),
            })
        })
        .collect();
    send_to(state, conn_id, SignalMessage::PeersList { peers });

    broadcast(
        state,
        &room,
        Some(conn_id),
        SignalMessage::PeerJoined {
            peer: PeerInfo {
                device_id,
                device_name,
                connection_id: conn_id,
                client_id: Some(client_id),
            },
        },
    )
    .await;
}

async fn handle_rename(state: &Arc<RelayState>, conn_id: ConnectionId, new_name: String) {
    let new_name = sanitize::device_name(&new_name);
    if new_name.is_empty() {
        return;
    }

    let (room, device_id, old_name) = {
        let Some(mut entry) = state.clients.get_mut(&conn_id) else {
            return;
        };
        let Some(device_id) = entry.info.device_id else {
            return;
        };
        let old_name = entry.info.device_name.clone().unwrap_or_default();
        entry.info.device_name = Some(new_name.clone());
        (entry.info.room.clone(), device_id, old_name)
    };

    debug!(%conn_id, old_name, new_name, "device renamed");

    send_to(
        state,
        conn_id,
        SignalMessage::DeviceNameUpdated {
            device_id,
            device_name: new_name.clone(),
        },
    );
    broadcast(
        state,
        &room,
        Some(conn_id),
        SignalMessage::PeerNameChanged {
            connection_id: conn_id,
            device_name: new_name,
            old_name,
        },
    )
    .await;
}

/// Remove a connection from all relay state and notify its room.
async fn disconnect(state: &Arc<RelayState>, conn_id: ConnectionId) {
    state.guard.lock().await.remove(conn_id);
    let Some((_, entry)) = state.clients.remove(&conn_id) else {
        return;
    };
    state.rooms.lock().await.leave(conn_id);
    debug!(%conn_id, room = entry.info.room, "client disconnected");

    if let Some(device_id) = entry.info.device_id {
        broadcast(
            state,
            &entry.info.room,
            None,
            SignalMessage::PeerLeft {
                connection_id: conn_id,
                device_id,
            },
        )
        .await;
    }
}

/// Forward a relayed message to its target, dropping it silently when the
/// target is missing or gone (the reference behavior).
fn forward(state: &Arc<RelayState>, target: Option<ConnectionId>, msg: SignalMessage) {
    let Some(target) = target else { return };
    send_to(state, target, msg);
}

fn send_to(state: &Arc<RelayState>, conn_id: ConnectionId, msg: SignalMessage) {
    if let Some(entry) = state.clients.get(&conn_id) {
        let _ = entry.tx.send(msg);
    }
}

async fn broadcast(
    state: &Arc<RelayState>,
    room: &str,
    except: Option<ConnectionId>,
    msg: SignalMessage,
) {
    let members = state.rooms.lock().await.members(room);
    for member in members {
        if Some(member) == except {
            continue;
        }
        send_to(state, member, msg.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardConfig;
    use std::time::Duration;

    async fn start_relay() -> SocketAddr {
        start_relay_with(RelayConfig::loopback()).await
    }

    async fn start_relay_with(config: RelayConfig) -> SocketAddr {
        let server = RelayServer::bind(config).await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run());
        addr
    }

    async fn init_client(addr: SocketAddr, client_id: &str, name: Option<&str>) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_signal(
            &mut stream,
            &SignalMessage::ClientInit {
                client_id: client_id.into(),
                device_name: name.map(Into::into),
            },
        )
        .await
        .unwrap();
        stream
    }

    #[tokio::test]
    async fn client_init_yields_identity_and_peer_list() {
        let addr = start_relay().await;
        let mut a = init_client(addr, "client_a", Some("Desk")).await;

        let device_info = read_signal(&mut a).await.unwrap();
        match device_info {
            SignalMessage::DeviceInfo { device_name, .. } => assert_eq!(device_name, "Desk"),
            other => panic!("expected device-info, got {other:?}"),
        }
        match read_signal(&mut a).await.unwrap() {
            SignalMessage::PeersList { peers } => assert!(peers.is_empty()),
            other => panic!("expected peers-list, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_name_gets_generated_word_pair() {
        let addr = start_relay().await;
        let mut a = init_client(addr, "client_a", None).await;
        match read_signal(&mut a).await.unwrap() {
            SignalMessage::DeviceInfo { device_name, .. } => {
                assert!(device_name.contains(' '), "generated name: {device_name}");
            }
            other => panic!("expected device-info, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_client_sees_first_and_join_is_broadcast() {
        let addr = start_relay().await;
        let mut a = init_client(addr, "client_a", Some("Alpha")).await;
        let _ = read_signal(&mut a).await.unwrap(); // device-info
        let _ = read_signal(&mut a).await.unwrap(); // peers-list

        let mut b = init_client(addr, "client_b", Some("Beta")).await;
        let _ = read_signal(&mut b).await.unwrap();
        match read_signal(&mut b).await.unwrap() {
            SignalMessage::PeersList { peers } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].device_name, "Alpha");
            }
            other => panic!("expected peers-list, got {other:?}"),
        }

        match read_signal(&mut a).await.unwrap() {
            SignalMessage::PeerJoined { peer } => assert_eq!(peer.device_name, "Beta"),
            other => panic!("expected peer-joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_request_is_forwarded_sanitized() {
        let addr = start_relay().await;
        let mut a = init_client(addr, "client_a", Some("Alpha")).await;
        let _ = read_signal(&mut a).await.unwrap();
        let _ = read_signal(&mut a).await.unwrap();

        let mut b = init_client(addr, "client_b", Some("Beta")).await;
        let _ = read_signal(&mut b).await.unwrap();
        let a_conn = match read_signal(&mut b).await.unwrap() {
            SignalMessage::PeersList { peers } => peers[0].connection_id,
            other => panic!("expected peers-list, got {other:?}"),
        };

        match read_signal(&mut a).await.unwrap() {
            SignalMessage::PeerJoined { .. } => {}
            other => panic!("expected peer-joined, got {other:?}"),
        }

        write_signal(
            &mut b,
            &SignalMessage::FileRequest {
                target: Some(a_conn),
                from: None,
                file_name: "../../etc/passwd".into(),
                file_size: 12,
                relative_path: String::new(),
                from_name: "Beta".into(),
            },
        )
        .await
        .unwrap();

        // Wait: B's own conn id is what A sees as the join notice's target...
        match read_signal(&mut a).await.unwrap() {
            SignalMessage::FileRequest {
                file_name, from, ..
            } => {
                assert_eq!(file_name, "etcpasswd");
                assert!(from.is_some());
            }
            other => panic!("expected file-request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limited_connection_gets_error_signal() {
        let mut config = RelayConfig::loopback();
        config.guard = GuardConfig {
            max_events: 3,
            window: Duration::from_secs(60),
            block: Duration::from_secs(60),
        };
        let addr = start_relay_with(config).await;

        let mut a = init_client(addr, "client_a", Some("Alpha")).await;
        let _ = read_signal(&mut a).await.unwrap();
        let _ = read_signal(&mut a).await.unwrap();

        // Three more events exhaust the cap; the next gets the rejection.
        for _ in 0..3 {
            write_signal(
                &mut a,
                &SignalMessage::ChangeDeviceName {
                    new_name: "Spam".into(),
                },
            )
            .await
            .unwrap();
        }
        // Drain the rename confirmations (2 allowed renames after init).
        let mut saw_error = false;
        for _ in 0..8 {
            match tokio::time::timeout(Duration::from_secs(2), read_signal(&mut a)).await {
                Ok(Ok(SignalMessage::Error { message })) => {
                    assert!(message.contains("Rate limit"));
                    saw_error = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn status_endpoint_on_signaling_port() {
        let addr = start_relay().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /status HTTP/1.1\r\nHost: x\r\nOrigin: http://192.168.1.5:3000\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut response)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200"), "{text}");
        assert!(text.contains(r#"{"status":true}"#));
        assert!(text.contains("Access-Control-Allow-Origin: http://192.168.1.5:3000"));
    }

    #[tokio::test]
    async fn disconnect_broadcasts_peer_left() {
        let addr = start_relay().await;
        let mut a = init_client(addr, "client_a", Some("Alpha")).await;
        let _ = read_signal(&mut a).await.unwrap();
        let _ = read_signal(&mut a).await.unwrap();

        let b = init_client(addr, "client_b", Some("Beta")).await;
        match read_signal(&mut a).await.unwrap() {
            SignalMessage::PeerJoined { .. } => {}
            other => panic!("expected peer-joined, got {other:?}"),
        }

        drop(b);
        match tokio::time::timeout(Duration::from_secs(2), read_signal(&mut a))
            .await
            .unwrap()
            .unwrap()
        {
            SignalMessage::PeerLeft { .. } => {}
            other => panic!("expected peer-left, got {other:?}"),
        }
    }
}
