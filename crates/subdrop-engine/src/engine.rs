//! The engine actor.
//!
//! One task owns all mutable state: the peer registry, open channels,
//! outstanding handshakes and stored encrypted files. Everything else talks
//! to it through commands; transfers run as spawned tasks that come back to
//! the actor for the channel writer and for handshake resolution. Events
//! stream out on an unbounded channel for the embedding application.

use crate::batch::{manifest, new_batch_id};
use crate::chunker::{AdaptiveChunk, ChunkPolicy, FixedChunk};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pending::{PendingKind, PendingMap};
use crate::registry::{Arrival, Peer, PeerRegistry};
use crate::session::{self, SessionToken};
use crate::transfer::{send_file_over, OutgoingFile, ReceiveState, ReceivedFile};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subdrop_crypto::{decrypt, is_encrypted_name, original_name, seal_file};
use subdrop_proto::codec::{read_channel_frame, read_signal, write_channel_frame, write_signal};
use subdrop_proto::frame::{ChannelControl, ChannelFrame};
use subdrop_proto::message::{
    ChatPayload, ConnectionId, FileMeta, SessionDescription, SignalMessage,
};
use subdrop_proto::sanitize;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared writer half of an open peer channel.
pub type ChannelWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Failed decryption attempts allowed before a stored file is discarded.
pub const MAX_DECRYPT_ATTEMPTS: u32 = 3;

/// Which end of a transfer a progress figure describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Inbound,
    Outbound,
}

/// Events the engine emits to the embedding application.
#[derive(Debug)]
pub enum EngineEvent {
    /// The relay assigned this device its identity.
    Connected {
        device_id: Uuid,
        device_name: String,
    },
    /// The relay connection dropped; open peer channels keep working.
    Disconnected,
    /// A peer is visible in the room. `reconnected` marks a return inside
    /// the grace window.
    PeerJoined { peer: Peer, reconnected: bool },
    /// A peer disconnected and entered its grace window.
    PeerLeft { client_id: String },
    /// A departed peer did not come back in time and was dropped.
    PeerExpired { client_id: String },
    PeerRenamed {
        client_id: String,
        old_name: String,
        device_name: String,
    },
    /// Our own rename was confirmed.
    NameUpdated { device_name: String },
    /// A peer asks to send one file; answer with `respond_file`.
    IncomingFile {
        from: ConnectionId,
        from_name: String,
        file_name: String,
        file_size: u64,
        relative_path: String,
    },
    /// A peer asks to send a batch; answer with `respond_batch`.
    IncomingBatch {
        from: ConnectionId,
        from_name: String,
        batch_id: String,
        files: Vec<FileMeta>,
    },
    Progress {
        peer: ConnectionId,
        file_name: String,
        progress: f64,
        direction: TransferDirection,
    },
    /// A plaintext file finished arriving.
    FileReceived {
        from: ConnectionId,
        file: ReceivedFile,
    },
    /// An encrypted file finished arriving; unlock it with `try_decrypt`.
    EncryptedFileReceived {
        from: ConnectionId,
        id: String,
        file_name: String,
    },
    ChatReceived {
        client_id: String,
        message: ChatPayload,
    },
    TransferFailed {
        peer: ConnectionId,
        file_name: String,
        reason: String,
    },
    /// The relay rejected an event (rate limiting, mostly).
    RelayError { message: String },
}

enum Command {
    SendFile {
        target: ConnectionId,
        file: OutgoingFile,
        password: Option<String>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SendBatch {
        target: ConnectionId,
        files: Vec<OutgoingFile>,
        password: Option<String>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SendChat {
        target: ConnectionId,
        text: String,
        reply: oneshot::Sender<Result<ChatPayload, EngineError>>,
    },
    RespondFile {
        to: ConnectionId,
        accepted: bool,
    },
    RespondBatch {
        to: ConnectionId,
        batch_id: String,
        accepted: bool,
    },
    ChangeName {
        new_name: String,
    },
    SelectPeer {
        client_id: Option<String>,
    },
    MarkRead {
        client_id: String,
    },
    TryDecrypt {
        id: String,
        password: String,
        reply: oneshot::Sender<Result<ReceivedFile, EngineError>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<Peer>>,
    },
    ChatHistory {
        client_id: String,
        reply: oneshot::Sender<Vec<ChatPayload>>,
    },
    Shutdown,

    // Internal: spawned tasks and the relay reader come back through these.
    EnsureChannel {
        target: ConnectionId,
        reply: oneshot::Sender<Result<ChannelWriter, EngineError>>,
    },
    CancelPending {
        kind: PendingKind,
        peer: ConnectionId,
    },
    SignalIn(SignalMessage),
    RelayDown,
    ChannelUp {
        peer: ConnectionId,
        epoch: u64,
        stream: TcpStream,
    },
    ChannelFailed {
        peer: ConnectionId,
        epoch: u64,
        timed_out: bool,
    },
    Frame {
        peer: ConnectionId,
        frame: ChannelFrame,
    },
    ChannelDown {
        peer: ConnectionId,
        epoch: u64,
    },
    GraceExpired {
        client_id: String,
        generation: u64,
    },
}

enum ChannelState {
    Opening {
        candidates: Option<mpsc::Sender<std::net::SocketAddr>>,
    },
    Ready(ChannelWriter),
}

struct Session {
    epoch: u64,
    state: ChannelState,
    waiters: Vec<oneshot::Sender<Result<ChannelWriter, EngineError>>>,
}

struct PendingEncrypted {
    file: ReceivedFile,
    attempts: u32,
}

/// Cloneable context handed to spawned transfer tasks.
#[derive(Clone)]
struct TaskCtx {
    cmd_tx: mpsc::UnboundedSender<Command>,
    relay_tx: mpsc::UnboundedSender<SignalMessage>,
    events: mpsc::UnboundedSender<EngineEvent>,
    queue: Arc<Semaphore>,
    handshake_timeout: Duration,
    pacing: Duration,
    adaptive: bool,
}

struct Actor {
    config: EngineConfig,
    local_ip: IpAddr,
    relay_tx: mpsc::UnboundedSender<SignalMessage>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<EngineEvent>,
    registry: PeerRegistry,
    pending: PendingMap,
    sessions: HashMap<ConnectionId, Session>,
    receives: HashMap<ConnectionId, ReceiveState>,
    encrypted: HashMap<String, PendingEncrypted>,
    queue: Arc<Semaphore>,
    device_id: Option<Uuid>,
    device_name: String,
    next_epoch: u64,
}

/// Connect to the relay and start the engine.
///
/// Returns the command handle and the event stream. The `client-init`
/// handshake is sent immediately; the `Connected` event confirms it.
pub async fn connect(
    config: EngineConfig,
) -> Result<(EngineHandle, mpsc::UnboundedReceiver<EngineEvent>), EngineError> {
    let stream = TcpStream::connect(config.relay_addr).await?;
    let local_ip = stream.local_addr()?.ip();
    let (mut rd, mut wr) = stream.into_split();

    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<SignalMessage>();
    tokio::spawn(async move {
        while let Some(msg) = relay_rx.recv().await {
            if write_signal(&mut wr, &msg).await.is_err() {
                break;
            }
        }
    });

    relay_tx
        .send(SignalMessage::ClientInit {
            client_id: config.client_id.clone(),
            device_name: config.device_name.clone(),
        })
        .map_err(|_| EngineError::Stopped)?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let reader_cmd = cmd_tx.clone();
    tokio::spawn(async move {
        loop {
            match read_signal(&mut rd).await {
                Ok(msg) => {
                    if reader_cmd.send(Command::SignalIn(msg)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "relay connection ended");
                    let _ = reader_cmd.send(Command::RelayDown);
                    break;
                }
            }
        }
    });

    let actor = Actor {
        local_ip,
        relay_tx,
        cmd_tx: cmd_tx.clone(),
        events: event_tx,
        registry: PeerRegistry::new(),
        pending: PendingMap::new(),
        sessions: HashMap::new(),
        receives: HashMap::new(),
        encrypted: HashMap::new(),
        queue: Arc::new(Semaphore::new(config.max_concurrent_transfers.max(1))),
        device_id: None,
        device_name: config.device_name.clone().unwrap_or_default(),
        next_epoch: 0,
        config,
    };
    tokio::spawn(actor.run(cmd_rx));

    Ok((EngineHandle { cmd_tx }, event_rx))
}

/// Handle for driving a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    fn send_cmd(&self, cmd: Command) -> Result<(), EngineError> {
        self.cmd_tx.send(cmd).map_err(|_| EngineError::Stopped)
    }

    /// Offer one in-memory file to a peer and stream it once accepted.
    ///
    /// Resolves when the transfer finished, the peer declined, or a timeout
    /// or channel failure killed it.
    pub async fn send_file(
        &self,
        target: ConnectionId,
        file: OutgoingFile,
        password: Option<String>,
    ) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::SendFile {
            target,
            file,
            password,
            reply: tx,
        })?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Read a file from disk and send it.
    pub async fn send_path(
        &self,
        target: ConnectionId,
        path: &Path,
        password: Option<String>,
    ) -> Result<(), EngineError> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        self.send_file(
            target,
            OutgoingFile {
                relative_path: file_name.clone(),
                file_name,
                data,
            },
            password,
        )
        .await
    }

    /// Offer a batch of files under one accept/reject decision.
    ///
    /// A rejection moves zero bytes; an accepted batch streams its files
    /// sequentially over one channel.
    pub async fn send_batch(
        &self,
        target: ConnectionId,
        files: Vec<OutgoingFile>,
        password: Option<String>,
    ) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::SendBatch {
            target,
            files,
            password,
            reply: tx,
        })?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Send a chat message: over the open channel if there is one, via the
    /// relay otherwise. Returns the stored payload.
    pub async fn send_chat(
        &self,
        target: ConnectionId,
        text: impl Into<String>,
    ) -> Result<ChatPayload, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::SendChat {
            target,
            text: text.into(),
            reply: tx,
        })?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Answer an `IncomingFile` event.
    pub fn respond_file(&self, to: ConnectionId, accepted: bool) -> Result<(), EngineError> {
        self.send_cmd(Command::RespondFile { to, accepted })
    }

    /// Answer an `IncomingBatch` event.
    pub fn respond_batch(
        &self,
        to: ConnectionId,
        batch_id: impl Into<String>,
        accepted: bool,
    ) -> Result<(), EngineError> {
        self.send_cmd(Command::RespondBatch {
            to,
            batch_id: batch_id.into(),
            accepted,
        })
    }

    /// Ask the relay to rename this device.
    pub fn change_name(&self, new_name: impl Into<String>) -> Result<(), EngineError> {
        self.send_cmd(Command::ChangeName {
            new_name: new_name.into(),
        })
    }

    /// Select the conversation shown to the user, clearing its unread count.
    pub fn select_peer(&self, client_id: Option<String>) -> Result<(), EngineError> {
        self.send_cmd(Command::SelectPeer { client_id })
    }

    /// Clear the unread count for one conversation.
    pub fn mark_read(&self, client_id: impl Into<String>) -> Result<(), EngineError> {
        self.send_cmd(Command::MarkRead {
            client_id: client_id.into(),
        })
    }

    /// Attempt to unlock a stored encrypted file.
    ///
    /// After [`MAX_DECRYPT_ATTEMPTS`] failures the file is discarded.
    pub async fn try_decrypt(
        &self,
        id: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<ReceivedFile, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::TryDecrypt {
            id: id.into(),
            password: password.into(),
            reply: tx,
        })?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Snapshot of the currently active peers.
    pub async fn peers(&self) -> Result<Vec<Peer>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::Peers { reply: tx })?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Stored conversation with one peer.
    pub async fn chat_history(
        &self,
        client_id: impl Into<String>,
    ) -> Result<Vec<ChatPayload>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send_cmd(Command::ChatHistory {
            client_id: client_id.into(),
            reply: tx,
        })?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Stop the actor. Open transfers fail with `Stopped`.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

impl Actor {
    async fn run(mut self, mut cmds: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = cmds.recv().await {
            if matches!(cmd, Command::Shutdown) {
                break;
            }
            self.handle(cmd).await;
        }
        debug!("engine actor stopped");
    }

    fn task_ctx(&self) -> TaskCtx {
        TaskCtx {
            cmd_tx: self.cmd_tx.clone(),
            relay_tx: self.relay_tx.clone(),
            events: self.events.clone(),
            queue: self.queue.clone(),
            handshake_timeout: self.config.handshake_timeout,
            pacing: self.config.chunk_pacing,
            adaptive: self.config.adaptive_chunks,
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::SendFile {
                target,
                file,
                password,
                reply,
            } => self.start_send_file(target, file, password, reply),

            Command::SendBatch {
                target,
                files,
                password,
                reply,
            } => self.start_send_batch(target, files, password, reply),

            Command::SendChat {
                target,
                text,
                reply,
            } => self.start_send_chat(target, text, reply),

            Command::RespondFile { to, accepted } => {
                let _ = self.relay_tx.send(SignalMessage::FileResponse {
                    target: Some(to),
                    from: None,
                    accepted,
                });
            }

            Command::RespondBatch {
                to,
                batch_id,
                accepted,
            } => {
                let _ = self.relay_tx.send(SignalMessage::BatchFileResponse {
                    target: Some(to),
                    from: None,
                    accepted,
                    batch_id,
                });
            }

            Command::ChangeName { new_name } => {
                let _ = self
                    .relay_tx
                    .send(SignalMessage::ChangeDeviceName { new_name });
            }

            Command::SelectPeer { client_id } => self.registry.select(client_id.as_deref()),

            Command::MarkRead { client_id } => self.registry.mark_read(&client_id),

            Command::TryDecrypt {
                id,
                password,
                reply,
            } => {
                let _ = reply.send(self.try_decrypt(id, &password));
            }

            Command::Peers { reply } => {
                let _ = reply.send(self.registry.active());
            }

            Command::ChatHistory { client_id, reply } => {
                let chat = self
                    .registry
                    .get(&client_id)
                    .map(|p| p.chat.clone())
                    .unwrap_or_default();
                let _ = reply.send(chat);
            }

            Command::EnsureChannel { target, reply } => self.ensure_channel(target, reply).await,

            Command::CancelPending { kind, peer } => self.pending.cancel(kind, peer),

            Command::SignalIn(msg) => self.on_signal(msg),

            Command::RelayDown => self.emit(EngineEvent::Disconnected),

            Command::ChannelUp {
                peer,
                epoch,
                stream,
            } => self.on_channel_up(peer, epoch, stream),

            Command::ChannelFailed {
                peer,
                epoch,
                timed_out,
            } => self.on_channel_failed(peer, epoch, timed_out),

            Command::Frame { peer, frame } => self.on_frame(peer, frame),

            Command::ChannelDown { peer, epoch } => self.on_channel_down(peer, epoch),

            Command::GraceExpired {
                client_id,
                generation,
            } => {
                if self.registry.expire_grace(&client_id, generation).is_some() {
                    debug!(client_id, "grace window expired");
                    self.emit(EngineEvent::PeerExpired { client_id });
                }
            }

            Command::Shutdown => {}
        }
    }

    // ---- outbound transfers ------------------------------------------------

    fn start_send_file(
        &mut self,
        target: ConnectionId,
        file: OutgoingFile,
        password: Option<String>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    ) {
        let sealed = match seal_file(&file.file_name, file.data, password.as_deref()) {
            Ok(sealed) => sealed,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        let out = OutgoingFile {
            file_name: sealed.file_name,
            relative_path: file.relative_path,
            data: sealed.data,
        };

        let rx = self.pending.register(PendingKind::FileResponse, target);
        let _ = self.relay_tx.send(SignalMessage::FileRequest {
            target: Some(target),
            from: None,
            file_name: out.file_name.clone(),
            file_size: out.data.len() as u64,
            relative_path: out.relative_path.clone(),
            from_name: self.device_name.clone(),
        });

        let ctx = self.task_ctx();
        tokio::spawn(async move {
            let result = run_single_transfer(&ctx, target, out, rx).await;
            let _ = reply.send(result);
        });
    }

    fn start_send_batch(
        &mut self,
        target: ConnectionId,
        files: Vec<OutgoingFile>,
        password: Option<String>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    ) {
        let mut sealed_files = Vec::with_capacity(files.len());
        for file in files {
            match seal_file(&file.file_name, file.data, password.as_deref()) {
                Ok(sealed) => sealed_files.push(OutgoingFile {
                    file_name: sealed.file_name,
                    relative_path: file.relative_path,
                    data: sealed.data,
                }),
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                    return;
                }
            }
        }

        let batch_id = new_batch_id();
        let rx = self
            .pending
            .register(PendingKind::BatchResponse(batch_id.clone()), target);
        let _ = self.relay_tx.send(SignalMessage::BatchFileRequest {
            target: Some(target),
            from: None,
            files: manifest(&sealed_files),
            from_name: self.device_name.clone(),
            batch_id: batch_id.clone(),
        });

        let ctx = self.task_ctx();
        tokio::spawn(async move {
            let result = run_batch_transfer(&ctx, target, batch_id, sealed_files, rx).await;
            let _ = reply.send(result);
        });
    }

    // ---- chat --------------------------------------------------------------

    fn start_send_chat(
        &mut self,
        target: ConnectionId,
        text: String,
        reply: oneshot::Sender<Result<ChatPayload, EngineError>>,
    ) {
        let payload = ChatPayload {
            id: Uuid::new_v4().to_string(),
            text,
            timestamp: now_millis(),
            from_connection: None,
            from_name: self.device_name.clone(),
            is_own: true,
        };

        match self.sessions.get(&target).map(|s| &s.state) {
            Some(ChannelState::Ready(writer)) => {
                let writer = writer.clone();
                let frame = ChannelFrame::Control(ChannelControl::ChatMessage {
                    message: payload.clone(),
                });
                tokio::spawn(async move {
                    let mut w = writer.lock().await;
                    if let Err(e) = write_channel_frame(&mut *w, &frame).await {
                        debug!(error = %e, "chat over channel failed");
                    }
                });
            }
            _ => {
                let _ = self.relay_tx.send(SignalMessage::ChatMessage {
                    target: Some(target),
                    from: None,
                    message: payload.clone(),
                });
            }
        }

        if let Some(client_id) = self.registry.client_id_of(target).map(str::to_string) {
            self.registry.push_chat(&client_id, payload.clone());
        }
        let _ = reply.send(Ok(payload));
    }

    fn incoming_chat(&mut self, peer: ConnectionId, mut message: ChatPayload) {
        // Channel chat bypasses the relay sanitizer, so sanitize here too.
        message.text = sanitize::chat_text(&message.text);
        message.is_own = false;
        message.from_connection = Some(peer);

        let Some(client_id) = self.registry.client_id_of(peer).map(str::to_string) else {
            debug!(%peer, "chat from unknown peer dropped");
            return;
        };
        self.registry.push_chat(&client_id, message.clone());
        self.emit(EngineEvent::ChatReceived { client_id, message });
    }

    // ---- encrypted file store ----------------------------------------------

    fn try_decrypt(&mut self, id: String, password: &str) -> Result<ReceivedFile, EngineError> {
        let Some(mut entry) = self.encrypted.remove(&id) else {
            return Err(EngineError::NoSuchFile);
        };
        match decrypt(&entry.file.data, password) {
            Ok(plain) => Ok(ReceivedFile {
                file_name: original_name(&entry.file.file_name).to_string(),
                relative_path: original_name(&entry.file.relative_path).to_string(),
                data: plain,
            }),
            Err(_) => {
                entry.attempts += 1;
                if entry.attempts >= MAX_DECRYPT_ATTEMPTS {
                    warn!(id, "encrypted file discarded after repeated failures");
                    Err(EngineError::FileDiscarded)
                } else {
                    let attempts_left = MAX_DECRYPT_ATTEMPTS - entry.attempts;
                    self.encrypted.insert(id, entry);
                    Err(EngineError::Decryption { attempts_left })
                }
            }
        }
    }

    // ---- channels ----------------------------------------------------------

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    async fn ensure_channel(
        &mut self,
        target: ConnectionId,
        reply: oneshot::Sender<Result<ChannelWriter, EngineError>>,
    ) {
        match self.sessions.get_mut(&target) {
            Some(session) => match &session.state {
                ChannelState::Ready(writer) => {
                    let _ = reply.send(Ok(writer.clone()));
                }
                ChannelState::Opening { .. } => session.waiters.push(reply),
            },
            None => self.start_offer(target, reply).await,
        }
    }

    async fn start_offer(
        &mut self,
        target: ConnectionId,
        reply: oneshot::Sender<Result<ChannelWriter, EngineError>>,
    ) {
        let token = SessionToken::generate();
        let (listener, advertise) = match session::bind_offer_listener(self.local_ip).await {
            Ok(bound) => bound,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let epoch = self.bump_epoch();
        let cmd_tx = self.cmd_tx.clone();
        let deadline = self.config.channel_open_timeout;
        tokio::spawn(async move {
            match session::accept_with_token(listener, token, deadline).await {
                Ok(stream) => {
                    let _ = cmd_tx.send(Command::ChannelUp {
                        peer: target,
                        epoch,
                        stream,
                    });
                }
                Err(e) => {
                    let _ = cmd_tx.send(Command::ChannelFailed {
                        peer: target,
                        epoch,
                        timed_out: matches!(e, EngineError::ChannelOpenTimeout),
                    });
                }
            }
        });

        debug!(%target, %advertise, "offering channel");
        let _ = self.relay_tx.send(SignalMessage::SessionOffer {
            target: Some(target),
            from: None,
            sdp: SessionDescription {
                token: token.to_hex(),
                addrs: vec![advertise],
            },
        });

        self.sessions.insert(
            target,
            Session {
                epoch,
                state: ChannelState::Opening { candidates: None },
                waiters: vec![reply],
            },
        );
    }

    fn on_offer(&mut self, peer: ConnectionId, sdp: SessionDescription) {
        let Some(token) = SessionToken::from_hex(&sdp.token) else {
            warn!(%peer, "offer with malformed token");
            return;
        };

        // A re-offer supersedes whatever we had; carried-over waiters get
        // resolved by the new dial attempt.
        let waiters = self
            .sessions
            .remove(&peer)
            .map(|s| s.waiters)
            .unwrap_or_default();

        let epoch = self.bump_epoch();
        let (cand_tx, cand_rx) = mpsc::channel(8);
        for addr in sdp.addrs {
            let _ = cand_tx.try_send(addr);
        }

        let cmd_tx = self.cmd_tx.clone();
        let deadline = self.config.channel_open_timeout;
        tokio::spawn(async move {
            match session::dial_with_token(cand_rx, token, deadline).await {
                Ok(stream) => {
                    let _ = cmd_tx.send(Command::ChannelUp {
                        peer,
                        epoch,
                        stream,
                    });
                }
                Err(e) => {
                    let _ = cmd_tx.send(Command::ChannelFailed {
                        peer,
                        epoch,
                        timed_out: matches!(e, EngineError::ChannelOpenTimeout),
                    });
                }
            }
        });

        let _ = self.relay_tx.send(SignalMessage::SessionAnswer {
            target: Some(peer),
            from: None,
            sdp: SessionDescription {
                token: sdp.token,
                addrs: Vec::new(),
            },
        });

        self.sessions.insert(
            peer,
            Session {
                epoch,
                state: ChannelState::Opening {
                    candidates: Some(cand_tx),
                },
                waiters,
            },
        );
    }

    fn on_channel_up(&mut self, peer: ConnectionId, epoch: u64, stream: TcpStream) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        if session.epoch != epoch {
            debug!(%peer, "stale channel discarded");
            return;
        }

        let (mut rd, wr) = stream.into_split();
        let writer: ChannelWriter = Arc::new(Mutex::new(wr));

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_channel_frame(&mut rd).await {
                    Ok(frame) => {
                        if cmd_tx.send(Command::Frame { peer, frame }).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        let _ = cmd_tx.send(Command::ChannelDown { peer, epoch });
                        break;
                    }
                }
            }
        });

        info!(%peer, "peer channel open");
        session.state = ChannelState::Ready(writer.clone());
        for waiter in session.waiters.drain(..) {
            let _ = waiter.send(Ok(writer.clone()));
        }
    }

    fn on_channel_failed(&mut self, peer: ConnectionId, epoch: u64, timed_out: bool) {
        let Some(session) = self.sessions.get(&peer) else {
            return;
        };
        if session.epoch != epoch {
            return;
        }
        warn!(%peer, timed_out, "channel open failed");
        if let Some(session) = self.sessions.remove(&peer) {
            for waiter in session.waiters {
                let err = if timed_out {
                    EngineError::ChannelOpenTimeout
                } else {
                    EngineError::ChannelClosed
                };
                let _ = waiter.send(Err(err));
            }
        }
    }

    fn on_channel_down(&mut self, peer: ConnectionId, epoch: u64) {
        match self.sessions.get(&peer) {
            Some(session) if session.epoch == epoch => {
                self.sessions.remove(&peer);
            }
            _ => return,
        }
        debug!(%peer, "peer channel closed");
        if let Some(mut state) = self.receives.remove(&peer) {
            if let Some(file_name) = state.on_channel_closed() {
                self.emit(EngineEvent::TransferFailed {
                    peer,
                    file_name,
                    reason: "channel closed mid-transfer".into(),
                });
            }
        }
    }

    fn drop_session(&mut self, peer: ConnectionId) {
        if let Some(session) = self.sessions.remove(&peer) {
            for waiter in session.waiters {
                let _ = waiter.send(Err(EngineError::ChannelClosed));
            }
        }
        self.receives.remove(&peer);
    }

    // ---- channel frames ----------------------------------------------------

    fn on_frame(&mut self, peer: ConnectionId, frame: ChannelFrame) {
        match frame {
            ChannelFrame::Control(ChannelControl::FileInfo {
                file_name,
                file_size,
                relative_path,
            }) => {
                let state = self.receives.entry(peer).or_default();
                if let Err(e) = state.on_file_info(file_name.clone(), file_size, relative_path) {
                    self.emit(EngineEvent::TransferFailed {
                        peer,
                        file_name,
                        reason: e.to_string(),
                    });
                }
            }

            ChannelFrame::Chunk(chunk) => {
                let state = self.receives.entry(peer).or_default();
                let file_name = state.current_name().unwrap_or_default().to_string();
                match state.on_chunk(&chunk) {
                    Ok(()) => {
                        if let Some(progress) = state.progress() {
                            self.emit(EngineEvent::Progress {
                                peer,
                                file_name,
                                progress,
                                direction: TransferDirection::Inbound,
                            });
                        }
                    }
                    Err(e) => self.emit(EngineEvent::TransferFailed {
                        peer,
                        file_name,
                        reason: e.to_string(),
                    }),
                }
            }

            ChannelFrame::Control(ChannelControl::FileComplete) => {
                let state = self.receives.entry(peer).or_default();
                match state.on_complete() {
                    Ok(file) => self.finish_received(peer, file),
                    Err(e) => self.emit(EngineEvent::TransferFailed {
                        peer,
                        file_name: String::new(),
                        reason: e.to_string(),
                    }),
                }
            }

            ChannelFrame::Control(ChannelControl::ChatMessage { message }) => {
                self.incoming_chat(peer, message)
            }
        }
    }

    fn finish_received(&mut self, peer: ConnectionId, file: ReceivedFile) {
        if is_encrypted_name(&file.file_name) {
            let id = Uuid::new_v4().to_string();
            let file_name = file.file_name.clone();
            self.encrypted
                .insert(id.clone(), PendingEncrypted { file, attempts: 0 });
            self.emit(EngineEvent::EncryptedFileReceived {
                from: peer,
                id,
                file_name,
            });
        } else {
            info!(%peer, file = file.file_name, bytes = file.data.len(), "file received");
            self.emit(EngineEvent::FileReceived { from: peer, file });
        }
    }

    // ---- signaling ---------------------------------------------------------

    fn on_signal(&mut self, msg: SignalMessage) {
        match msg {
            SignalMessage::DeviceInfo {
                device_id,
                device_name,
            } => {
                self.device_id = Some(device_id);
                self.device_name = device_name.clone();
                self.emit(EngineEvent::Connected {
                    device_id,
                    device_name,
                });
            }

            SignalMessage::PeersList { peers } => {
                for info in peers {
                    self.apply_peer(&info);
                }
            }

            SignalMessage::PeerJoined { peer } => self.apply_peer(&peer),

            SignalMessage::PeerLeft { connection_id, .. } => {
                self.drop_session(connection_id);
                if let Some((client_id, generation)) = self.registry.begin_grace(connection_id) {
                    self.emit(EngineEvent::PeerLeft {
                        client_id: client_id.clone(),
                    });
                    let cmd_tx = self.cmd_tx.clone();
                    let grace = self.config.grace_window;
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        let _ = cmd_tx.send(Command::GraceExpired {
                            client_id,
                            generation,
                        });
                    });
                }
            }

            SignalMessage::PeerNameChanged {
                connection_id,
                device_name,
                ..
            } => {
                let client_id = self
                    .registry
                    .client_id_of(connection_id)
                    .map(str::to_string);
                if let (Some(client_id), Some(old_name)) = (
                    client_id,
                    self.registry.rename(connection_id, &device_name),
                ) {
                    self.emit(EngineEvent::PeerRenamed {
                        client_id,
                        old_name,
                        device_name,
                    });
                }
            }

            SignalMessage::DeviceNameUpdated { device_name, .. } => {
                self.device_name = device_name.clone();
                self.emit(EngineEvent::NameUpdated { device_name });
            }

            SignalMessage::SessionOffer { from, sdp, .. } => {
                if let Some(peer) = from {
                    self.on_offer(peer, sdp);
                }
            }

            SignalMessage::SessionAnswer { from, .. } => {
                // The accept task is already waiting on the listener.
                debug!(?from, "session answer received");
            }

            SignalMessage::IceCandidate {
                from, candidate, ..
            } => {
                if let Some(peer) = from {
                    if let Some(Session {
                        state: ChannelState::Opening {
                            candidates: Some(tx),
                        },
                        ..
                    }) = self.sessions.get(&peer)
                    {
                        let _ = tx.try_send(candidate.addr);
                    }
                }
            }

            SignalMessage::FileRequest {
                from,
                file_name,
                file_size,
                relative_path,
                from_name,
                ..
            } => {
                if let Some(from) = from {
                    self.emit(EngineEvent::IncomingFile {
                        from,
                        from_name,
                        file_name,
                        file_size,
                        relative_path,
                    });
                }
            }

            SignalMessage::FileResponse { from, accepted, .. } => {
                if let Some(from) = from {
                    if !self
                        .pending
                        .resolve(PendingKind::FileResponse, from, accepted)
                    {
                        debug!(%from, "unsolicited file response");
                    }
                }
            }

            SignalMessage::BatchFileRequest {
                from,
                files,
                from_name,
                batch_id,
                ..
            } => {
                if let Some(from) = from {
                    self.emit(EngineEvent::IncomingBatch {
                        from,
                        from_name,
                        batch_id,
                        files,
                    });
                }
            }

            SignalMessage::BatchFileResponse {
                from,
                accepted,
                batch_id,
                ..
            } => {
                if let Some(from) = from {
                    if !self
                        .pending
                        .resolve(PendingKind::BatchResponse(batch_id), from, accepted)
                    {
                        debug!(%from, "unsolicited batch response");
                    }
                }
            }

            SignalMessage::TransferProgress {
                from,
                progress,
                file_name,
                ..
            } => {
                if let Some(from) = from {
                    self.emit(EngineEvent::Progress {
                        peer: from,
                        file_name,
                        progress,
                        direction: TransferDirection::Inbound,
                    });
                }
            }

            SignalMessage::ChatMessage { from, message, .. } => {
                if let Some(from) = from {
                    self.incoming_chat(from, message);
                }
            }

            SignalMessage::Error { message } => {
                warn!(message, "relay error");
                self.emit(EngineEvent::RelayError { message });
            }

            // Client-to-relay messages never come back at us.
            other => debug!(event = other.event_name(), "unexpected relay message"),
        }
    }

    fn apply_peer(&mut self, info: &subdrop_proto::message::PeerInfo) {
        let arrival = self.registry.upsert(info);
        let Some(peer) = self.registry.by_connection(info.connection_id).cloned() else {
            return;
        };
        match arrival {
            Arrival::New => self.emit(EngineEvent::PeerJoined {
                peer,
                reconnected: false,
            }),
            Arrival::Reconnected => self.emit(EngineEvent::PeerJoined {
                peer,
                reconnected: true,
            }),
            Arrival::Refreshed => {}
        }
    }
}

// ---- spawned transfer tasks ------------------------------------------------

async fn run_single_transfer(
    ctx: &TaskCtx,
    target: ConnectionId,
    file: OutgoingFile,
    decision: oneshot::Receiver<bool>,
) -> Result<(), EngineError> {
    let accepted = await_decision(ctx, PendingKind::FileResponse, target, decision).await?;
    if !accepted {
        return Err(EngineError::HandshakeRejected);
    }

    let _permit = ctx
        .queue
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| EngineError::Stopped)?;
    let writer = open_channel(ctx, target).await?;

    match stream_file(ctx, target, &file, writer).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = ctx.events.send(EngineEvent::TransferFailed {
                peer: target,
                file_name: file.file_name.clone(),
                reason: e.to_string(),
            });
            Err(e)
        }
    }
}

async fn run_batch_transfer(
    ctx: &TaskCtx,
    target: ConnectionId,
    batch_id: String,
    files: Vec<OutgoingFile>,
    decision: oneshot::Receiver<bool>,
) -> Result<(), EngineError> {
    let kind = PendingKind::BatchResponse(batch_id);
    let accepted = match await_decision(ctx, kind, target, decision).await {
        Err(EngineError::HandshakeTimeout) => return Err(EngineError::BatchTimeout),
        other => other?,
    };
    if !accepted {
        // All or nothing: a rejected batch sends zero bytes.
        return Err(EngineError::BatchRejected);
    }

    let _permit = ctx
        .queue
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| EngineError::Stopped)?;
    let writer = open_channel(ctx, target).await?;

    for file in &files {
        if let Err(e) = stream_file(ctx, target, file, writer.clone()).await {
            let _ = ctx.events.send(EngineEvent::TransferFailed {
                peer: target,
                file_name: file.file_name.clone(),
                reason: e.to_string(),
            });
            return Err(e);
        }
    }
    Ok(())
}

async fn await_decision(
    ctx: &TaskCtx,
    kind: PendingKind,
    target: ConnectionId,
    decision: oneshot::Receiver<bool>,
) -> Result<bool, EngineError> {
    match timeout(ctx.handshake_timeout, decision).await {
        Err(_) => {
            let _ = ctx.cmd_tx.send(Command::CancelPending { kind, peer: target });
            Err(EngineError::HandshakeTimeout)
        }
        Ok(Err(_)) => Err(EngineError::Stopped),
        Ok(Ok(accepted)) => Ok(accepted),
    }
}

async fn open_channel(ctx: &TaskCtx, target: ConnectionId) -> Result<ChannelWriter, EngineError> {
    let (tx, rx) = oneshot::channel();
    ctx.cmd_tx
        .send(Command::EnsureChannel { target, reply: tx })
        .map_err(|_| EngineError::Stopped)?;
    rx.await.map_err(|_| EngineError::Stopped)?
}

async fn stream_file(
    ctx: &TaskCtx,
    target: ConnectionId,
    file: &OutgoingFile,
    writer: ChannelWriter,
) -> Result<(), EngineError> {
    let mut policy: Box<dyn ChunkPolicy> = if ctx.adaptive {
        Box::new(AdaptiveChunk::default())
    } else {
        Box::new(FixedChunk::default())
    };

    let relay_tx = ctx.relay_tx.clone();
    let events = ctx.events.clone();
    let file_name = file.file_name.clone();
    send_file_over(writer, file, policy.as_mut(), ctx.pacing, |progress| {
        let _ = relay_tx.send(SignalMessage::TransferProgress {
            target: Some(target),
            from: None,
            progress,
            file_name: file_name.clone(),
        });
        let _ = events.send(EngineEvent::Progress {
            peer: target,
            file_name: file_name.clone(),
            progress,
            direction: TransferDirection::Outbound,
        });
    })
    .await
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
