//! Session orchestrator: the single event loop of the client.
//!
//! Owns the peer registry, the incoming-file receiver, the upload tracker
//! and the message log. Nothing else mutates them; every other task talks
//! to the loop through channels:
//!
//! ```text
//!  SignalingChannel ──SignalEvent──┐
//!  Transport callbacks ─TransportEvent─┤
//!  Sender tasks ──TransferEvent────┼──► Orchestrator ──AppEvent──► presenter
//!  Presenter ──Command─────────────┘
//! ```
//!
//! Offer/answer tie-break: whoever receives `ROOM_MEMBERS` (the newcomer)
//! initiates toward every listed member; whoever receives
//! `NEW_PEER_IN_ROOM` waits for the newcomer's offer. Exactly one offer
//! per pair.

use crate::core::config::{DATA_CHANNEL_LABEL, RECEIVER_WINDOW_BYTES};
use crate::core::connection::{
    PeerSession, Role, SessionState, Transport, TransportEvent, TransportEventKind,
};
use crate::core::message_log::{FileHandle, FileRecord, Message, MessageLog};
use crate::core::peer_registry::{Displaced, PeerRegistry, PeerSummary};
use crate::core::pipeline::frame::{ChatFrame, ControlFrame, Frame};
use crate::core::pipeline::receiver::{store_completed, ChunkOutcome, FileReceiver};
use crate::core::pipeline::sender::{OutgoingFile, PeerOutbox, StreamTask, TransferEvent};
use crate::core::pipeline::uploads::UploadTracker;
use crate::core::signaling::{Envelope, PeerId, PeerInfo, SignalEvent, SignalingChannel};
use crate::utils::paths::format_size;
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Commands issued by the presenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendChat(String),
    SendFile(PathBuf),
    CancelUpload { file_id: String, peer_id: PeerId },
    /// Close every session and forget the remembered login.
    Disconnect,
    Quit,
}

/// Notifications for the presenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    MessageAppended(Message),
    RosterChanged(Vec<PeerSummary>),
    UploadProgress {
        file_id: String,
        peer_id: PeerId,
        filename: String,
        progress: u8,
        complete: bool,
    },
    UploadRemoved { file_id: String, peer_id: PeerId },
    RelayStatus(String),
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Quit,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub username: String,
    pub room: String,
    /// Where received files are written; `None` keeps them in memory.
    pub downloads: Option<PathBuf>,
}

/// Receivers for the events the orchestrator posts to itself.
pub struct Loopback {
    pub transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    pub transfer_rx: mpsc::UnboundedReceiver<TransferEvent>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    local_id: Option<PeerId>,
    transport: Arc<dyn Transport>,
    signaling: SignalingChannel,
    registry: PeerRegistry,
    receiver: FileReceiver,
    uploads: UploadTracker,
    /// One upload queue per peer with a live session.
    outboxes: HashMap<PeerId, PeerOutbox>,
    log: MessageLog,
    app_tx: mpsc::UnboundedSender<AppEvent>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transfer_tx: mpsc::UnboundedSender<TransferEvent>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn Transport>,
        signaling: SignalingChannel,
        app_tx: mpsc::UnboundedSender<AppEvent>,
    ) -> (Self, Loopback) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            config,
            local_id: None,
            transport,
            signaling,
            registry: PeerRegistry::new(),
            receiver: FileReceiver::new(),
            uploads: UploadTracker::new(),
            outboxes: HashMap::new(),
            log: MessageLog::new(),
            app_tx,
            transport_tx,
            transfer_tx,
        };
        (
            orchestrator,
            Loopback {
                transport_rx,
                transfer_rx,
            },
        )
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn uploads(&self) -> &UploadTracker {
        &self.uploads
    }

    /// Run until `/quit`, `/disconnect`, shutdown or the presenter going away.
    pub async fn run(
        mut self,
        mut loopback: Loopback,
        mut signal_rx: mpsc::UnboundedReceiver<SignalEvent>,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        sos: SignalOfStop,
    ) -> Exit {
        info!(event = "orchestrator_started", user = %self.config.username, room = %self.config.room, "Session orchestrator running");

        let exit = loop {
            tokio::select! {
                _ = sos.wait() => break Exit::Quit,
                Some(event) = signal_rx.recv() => self.handle_signal(event).await,
                Some(event) = loopback.transport_rx.recv() => self.handle_transport(event).await,
                Some(event) = loopback.transfer_rx.recv() => self.handle_transfer(event),
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if let Some(exit) = self.handle_command(command).await {
                            break exit;
                        }
                    }
                    None => break Exit::Quit,
                },
            }
        };

        self.shutdown().await;
        info!(event = "orchestrator_stopped", exit = ?exit, "Session orchestrator stopped");
        exit
    }

    // ── Relay ────────────────────────────────────────────────────────────

    pub async fn handle_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Envelope(envelope) => self.handle_envelope(envelope).await,
            SignalEvent::Disconnected => {
                self.emit(AppEvent::RelayStatus("disconnected".into()));
                self.system("Disconnected from server");
            }
            SignalEvent::Reconnecting { attempt, delay } => {
                self.emit(AppEvent::RelayStatus(format!(
                    "reconnecting (attempt {attempt}, in {:.1}s)",
                    delay.as_secs_f64()
                )));
            }
            SignalEvent::Reconnected => {
                self.emit(AppEvent::RelayStatus("connected".into()));
                self.system("Reconnected to server");
            }
            SignalEvent::GaveUp => {
                self.emit(AppEvent::RelayStatus("offline".into()));
                self.system("Could not reach the server; direct connections stay open");
            }
        }
    }

    pub async fn handle_envelope(&mut self, envelope: Envelope) {
        let seq = self.registry.next_seq();
        let from = envelope.from_peer().map(str::to_string);

        match envelope {
            Envelope::AuthSuccess { username, peer_id, .. } => {
                let local = peer_id.filter(|id| !id.is_empty()).unwrap_or(username);
                info!(event = "relay_authenticated", local_id = %local, "Authenticated with relay");
                self.local_id = Some(local);
                self.signaling.send(Envelope::join_room(&self.config.room));
                self.emit(AppEvent::RelayStatus("connected".into()));
                self.system(format!("Joined room: {}", self.config.room));
            }
            Envelope::AuthError { message, .. } => {
                let reason = if message.is_empty() { "unknown error".to_string() } else { message };
                self.system(format!("Authentication failed: {reason}"));
            }
            Envelope::RoomMembers { members, .. } => {
                debug!(event = "room_members", count = members.len(), "Room members received");
                for member in members {
                    if self.is_self(&member) {
                        continue;
                    }
                    self.open_session(member, Role::Initiator, seq).await;
                }
            }
            Envelope::NewPeerInRoom { peer, .. } => {
                if self.is_self(&peer) {
                    return;
                }
                self.system(format!("{} joined the room", peer.username));
                self.open_session(peer, Role::Responder, seq).await;
            }
            Envelope::SdpOffer { sdp, .. } => {
                let Some(peer_id) = from else { return drop_unrouted("SDP_OFFER") };
                self.registry.touch(&peer_id, seq);
                let Some(session) = self.registry.get(&peer_id) else {
                    debug!(event = "sdp_offer_unknown_peer", peer = %peer_id, "Offer for unknown peer dropped");
                    return;
                };
                match session.accept_offer(sdp).await {
                    Ok(answer) => self.signaling.send(Envelope::answer(&peer_id, answer)),
                    Err(e) => warn!(event = "sdp_answer_failure", peer = %peer_id, error = %e, "Failed to answer offer"),
                }
            }
            Envelope::SdpAnswer { sdp, .. } => {
                let Some(peer_id) = from else { return drop_unrouted("SDP_ANSWER") };
                self.registry.touch(&peer_id, seq);
                let Some(session) = self.registry.get(&peer_id) else {
                    debug!(event = "sdp_answer_unknown_peer", peer = %peer_id, "Answer for unknown peer dropped");
                    return;
                };
                if let Err(e) = session.accept_answer(sdp).await {
                    warn!(event = "sdp_remote_failure", peer = %peer_id, error = %e, "Failed to apply answer");
                }
            }
            Envelope::IceCandidate { ice_candidate, .. } => {
                let Some(peer_id) = from else { return drop_unrouted("ICE_CANDIDATE") };
                self.registry.touch(&peer_id, seq);
                let Some(session) = self.registry.get(&peer_id) else {
                    return;
                };
                if let Err(e) = session.add_remote_candidate(ice_candidate).await {
                    warn!(event = "ice_candidate_failure", peer = %peer_id, error = %e, "Failed to add remote candidate");
                }
            }
            other => {
                debug!(event = "relay_envelope_ignored", kind = other.kind(), "Envelope not handled by the client");
            }
        }
    }

    fn is_self(&self, peer: &PeerInfo) -> bool {
        self.local_id.as_deref() == Some(peer.id.as_str()) || peer.username == self.config.username
    }

    async fn open_session(&mut self, peer: PeerInfo, role: Role, seq: u64) {
        let name = peer.username.clone();
        let session =
            match PeerSession::open(self.transport.as_ref(), peer, role, seq, &self.transport_tx).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(event = "session_open_failure", peer = %name, error = %e, "Failed to create peer connection");
                    self.system(format!("Failed to connect to [{name}]"));
                    return;
                }
            };
        let peer_id = session.peer_id.clone();

        let outcome = self.registry.insert(session);
        for (mut old, why) in outcome.displaced {
            old.close().await;
            self.forget_peer_transfers(&old.peer_id);
            if why == Displaced::SameName {
                self.system(format!("[{}] reconnected; replacing previous session", old.display_name));
            }
        }
        if let Some(mut rejected) = outcome.rejected {
            rejected.close().await;
            return;
        }

        if role == Role::Initiator {
            if let Some(session) = self.registry.get(&peer_id) {
                match session.start_offer().await {
                    Ok(offer) => {
                        info!(event = "sdp_offer_sent", peer = %peer_id, label = DATA_CHANNEL_LABEL, "Sending offer");
                        self.signaling.send(Envelope::offer(&peer_id, offer));
                    }
                    Err(e) => warn!(event = "sdp_offer_failure", peer = %peer_id, error = %e, "Failed to create offer"),
                }
            }
        }
        self.publish_roster();
    }

    // ── Direct connections ───────────────────────────────────────────────

    pub async fn handle_transport(&mut self, event: TransportEvent) {
        let TransportEvent {
            peer_id,
            session_id,
            kind,
        } = event;

        let Some(session) = self.registry.current_mut(&peer_id, session_id) else {
            debug!(event = "transport_stale_event", peer = %peer_id, session = %session_id, kind = ?kind, "Event from replaced session ignored");
            if let TransportEventKind::ChannelOpen(channel) = kind {
                channel.close().await;
            }
            return;
        };

        match kind {
            TransportEventKind::LocalCandidate(candidate) => {
                self.signaling.send(Envelope::candidate(&peer_id, candidate));
            }
            TransportEventKind::StateChanged(link) => match session.apply_link_state(link) {
                Ok(Some(SessionState::Connected)) => {
                    let name = session.display_name.clone();
                    self.system(format!("Connected to [{name}]"));
                    self.publish_roster();
                }
                Ok(Some(SessionState::Disconnected)) => {
                    let name = session.display_name.clone();
                    self.evict(&peer_id, format!("Disconnected from [{name}]")).await;
                }
                Ok(_) => {}
                Err(e) => debug!(event = "transport_state_ignored", peer = %peer_id, link = %link, error = %e, "State report ignored"),
            },
            TransportEventKind::ChannelOpen(channel) => {
                session.attach_channel(channel);
                self.publish_roster();
            }
            TransportEventKind::ChannelClosed => {
                session.detach_channel();
                self.publish_roster();
            }
            TransportEventKind::Text(text) => self.handle_text(&peer_id, &text).await,
            TransportEventKind::Binary(chunk) => {
                if let ChunkOutcome::Appended { ack: Some(ack) } = self.receiver.on_chunk(&peer_id, chunk) {
                    self.send_control(&peer_id, &ack).await;
                }
            }
            TransportEventKind::NegotiationTimeout => {
                if session.state() == SessionState::Connecting {
                    let name = session.display_name.clone();
                    let _ = session.advance(SessionState::Disconnected);
                    warn!(event = "session_negotiation_timeout", peer = %peer_id, "Negotiation timed out");
                    self.evict(&peer_id, format!("Connection to [{name}] timed out")).await;
                }
            }
        }
    }

    async fn handle_text(&mut self, peer_id: &str, text: &str) {
        let author = self.registry.display_name(peer_id);
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = "dc_frame_dropped", peer = %peer_id, error = %e, "Dropping unrecognized frame");
                return;
            }
        };

        match frame {
            Frame::Chat(chat) => {
                self.append(Message::chat(author, chat.content, false));
            }
            Frame::Control(ControlFrame::FileMeta {
                filename,
                size,
                mime,
                file_id,
                window,
            }) => {
                let ack = self
                    .receiver
                    .on_meta(peer_id, &filename, size, &mime, file_id.as_deref(), window);
                if let Some(ack) = ack {
                    self.send_control(peer_id, &ack).await;
                }
            }
            Frame::Control(ControlFrame::FileEnd { filename, file_id }) => {
                let Some(done) = self.receiver.on_end(peer_id, &filename, file_id.as_deref()) else {
                    return;
                };
                let handle = match store_completed(&done, self.config.downloads.as_deref()).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(event = "download_save_failure", file = %done.filename, error = %e, "Failed to save file; keeping it in memory");
                        self.system(format!("Failed to save file: {}", done.filename));
                        FileHandle::Memory(done.data.clone())
                    }
                };
                let record = FileRecord {
                    file_id: done.file_id.clone().unwrap_or_default(),
                    filename: done.filename.clone(),
                    mime: done.mime.clone(),
                    size: done.data.len() as u64,
                    own: false,
                    handle,
                };
                self.append(Message::file(
                    author,
                    format!("Sent you a file: {}", done.filename),
                    record,
                ));
            }
            Frame::Control(ControlFrame::FileCancel { filename, file_id }) => {
                if let Some(name) = self.receiver.on_cancel(peer_id, &filename, file_id.as_deref()) {
                    self.system(format!("[{author}] cancelled {name}"));
                }
            }
            Frame::Control(ControlFrame::FileWindow { file_id, received }) => {
                self.uploads.ack(&file_id, peer_id, received);
            }
        }
    }

    async fn send_control(&self, peer_id: &str, frame: &ControlFrame) {
        let Some(channel) = self.registry.get(peer_id).and_then(|s| s.open_channel()) else {
            return;
        };
        match frame.encode() {
            Ok(text) => {
                if let Err(e) = channel.send_text(text).await {
                    debug!(event = "dc_control_send_failure", peer = %peer_id, error = %e, "Failed to send control frame");
                }
            }
            Err(e) => warn!(event = "dc_control_encode_failure", error = %e, "Failed to encode control frame"),
        }
    }

    /// Remove a session for good: close it, drop its transfers, notify.
    async fn evict(&mut self, peer_id: &str, notice: String) {
        if let Some(mut session) = self.registry.remove(peer_id) {
            session.close().await;
        }
        self.forget_peer_transfers(peer_id);
        self.system(notice);
        self.publish_roster();
    }

    fn forget_peer_transfers(&mut self, peer_id: &str) {
        self.receiver.drop_peer(peer_id);
        // Queued streams still drain, but their stop tokens are set below.
        self.outboxes.remove(peer_id);
        for file_id in self.uploads.cancel_peer(peer_id) {
            self.emit(AppEvent::UploadRemoved {
                file_id,
                peer_id: peer_id.to_string(),
            });
        }
    }

    // ── Uploads ──────────────────────────────────────────────────────────

    pub fn handle_transfer(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                file_id,
                peer_id,
                progress,
                complete,
            } => {
                let filename = self.uploads.filename(&file_id).map(str::to_string);
                let Some(progress) = self.uploads.record_progress(&file_id, &peer_id, progress, complete) else {
                    return;
                };
                self.emit(AppEvent::UploadProgress {
                    file_id: file_id.clone(),
                    peer_id,
                    filename: filename.unwrap_or_default(),
                    progress,
                    complete,
                });
                if complete {
                    self.uploads.settle(&file_id);
                }
            }
            TransferEvent::Failed {
                file_id,
                peer_id,
                error,
            } => {
                let filename = self.uploads.filename(&file_id).map(str::to_string);
                if self.uploads.finish(&file_id, &peer_id) {
                    self.emit(AppEvent::UploadRemoved {
                        file_id: file_id.clone(),
                        peer_id: peer_id.clone(),
                    });
                }
                debug!(event = "upload_failed", file = %file_id, peer = %peer_id, error = %error, "Upload task failed");
                let name = self.registry.display_name(&peer_id);
                self.system(format!(
                    "Failed to send file: {} to [{name}]",
                    filename.unwrap_or(file_id)
                ));
            }
            TransferEvent::Cancelled { file_id, peer_id } => {
                if self.uploads.finish(&file_id, &peer_id) {
                    self.emit(AppEvent::UploadRemoved { file_id, peer_id });
                }
            }
        }
    }

    // ── Presenter commands ───────────────────────────────────────────────

    /// Returns `Some(exit)` when the loop should stop.
    pub async fn handle_command(&mut self, command: Command) -> Option<Exit> {
        match command {
            Command::SendChat(text) => {
                self.send_chat(text).await;
                None
            }
            Command::SendFile(path) => {
                self.send_file(&path).await;
                None
            }
            Command::CancelUpload { file_id, peer_id } => {
                match self.uploads.cancel(&file_id, &peer_id) {
                    Some(name) => {
                        info!(event = "upload_cancel_requested", file = %name, peer = %peer_id, "Cancelling upload");
                        self.emit(AppEvent::UploadRemoved { file_id, peer_id });
                    }
                    None => debug!(event = "upload_cancel_unknown", file = %file_id, peer = %peer_id, "No such upload"),
                }
                None
            }
            Command::Disconnect => Some(Exit::Disconnected),
            Command::Quit => Some(Exit::Quit),
        }
    }

    async fn send_chat(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }

        let channels = self.registry.open_channels();
        if channels.is_empty() {
            self.system("No peers connected - message not sent");
            return;
        }

        let message = Message::chat(self.config.username.clone(), text.clone(), true);
        let frame = match ChatFrame::new(text, message.timestamp).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = "chat_encode_failure", error = %e, "Failed to encode chat message");
                return;
            }
        };
        for (peer_id, channel) in channels {
            if let Err(e) = channel.send_text(frame.clone()).await {
                warn!(event = "chat_send_failure", peer = %peer_id, error = %e, "Failed to send chat message");
            }
        }
        self.append(message);
    }

    async fn send_file(&mut self, path: &Path) {
        let channels = self.registry.open_channels();
        if channels.is_empty() {
            self.system("No peers connected - files not sent");
            return;
        }

        let data = match tokio::fs::read(path).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                warn!(event = "upload_read_failure", path = %path.display(), error = %e, "Failed to read file");
                self.system(format!("Failed to read file: {}", path.display()));
                return;
            }
        };
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let file = Arc::new(OutgoingFile::new(filename, data));
        info!(
            event = "upload_started",
            file = %file.filename,
            size = %format_size(file.size()),
            peers = channels.len(),
            "Sending file"
        );

        self.append(Message::file(
            self.config.username.clone(),
            format!("Sent file: {}", file.filename),
            FileRecord {
                file_id: file.file_id.clone(),
                filename: file.filename.clone(),
                mime: file.mime.clone(),
                size: file.size(),
                own: true,
                handle: FileHandle::Path(path.to_path_buf()),
            },
        ));

        let peer_ids: Vec<PeerId> = channels.iter().map(|(id, _)| id.clone()).collect();
        let handles = self
            .uploads
            .register(&file.file_id, &file.filename, &peer_ids);

        for (handle, (_, channel)) in handles.into_iter().zip(channels) {
            let task = StreamTask {
                file: file.clone(),
                peer_id: handle.peer_id,
                channel,
                acks: handle.acks,
                window: Some(RECEIVER_WINDOW_BYTES),
                stop: handle.stop,
                events: self.transfer_tx.clone(),
            };
            let outbox = self
                .outboxes
                .entry(task.peer_id.clone())
                .or_insert_with_key(|peer_id| PeerOutbox::spawn(peer_id.clone()));
            if let Err(task) = outbox.push(task) {
                warn!(event = "upload_queue_gone", peer = %task.peer_id, file = %task.file.filename, "Upload queue stopped; file not sent");
                self.outboxes.remove(&task.peer_id);
                self.uploads.finish(&task.file.file_id, &task.peer_id);
            }
        }
    }

    async fn shutdown(&mut self) {
        debug!(
            event = "orchestrator_shutdown",
            peers = self.registry.len(),
            uploads = self.uploads.len(),
            open_downloads = self.receiver.open_transfers(),
            messages = self.log.len(),
            "Closing sessions"
        );
        self.uploads.stop_all();
        self.outboxes.clear();
        for mut session in self.registry.drain() {
            session.close().await;
        }
        self.publish_roster();
    }

    // ── Presenter output ─────────────────────────────────────────────────

    fn append(&mut self, message: Message) {
        if let Some(stored) = self.log.append(message) {
            let stored = stored.clone();
            self.emit(AppEvent::MessageAppended(stored));
        }
    }

    fn system(&mut self, text: impl Into<String>) {
        self.append(Message::system(text));
    }

    fn publish_roster(&self) {
        self.emit(AppEvent::RosterChanged(self.registry.summaries()));
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.app_tx.send(event);
    }
}

fn drop_unrouted(kind: &str) {
    warn!(event = "relay_unrouted", kind, "Envelope without fromPeerId dropped");
}
