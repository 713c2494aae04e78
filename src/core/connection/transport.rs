//! Direct-connection transport seam.
//!
//! The orchestrator only sees these traits. Production uses the webrtc-rs
//! implementation in [`super::webrtc`]; tests use the in-memory mock.
//! Every callback from the transport is turned into a [`TransportEvent`]
//! posted to the orchestrator's queue, tagged with the peer and the
//! session that produced it.

use crate::core::signaling::{IceCandidate, PeerId, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Connection state reported by the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// States that end a session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("data channel is not open")]
    ChannelClosed,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("transport setup failed: {0}")]
    Setup(String),
}

pub enum TransportEventKind {
    /// A local ICE candidate to trickle to the remote peer.
    LocalCandidate(IceCandidate),
    StateChanged(LinkState),
    /// The ordered data channel is open and ready for traffic.
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelClosed,
    Text(String),
    Binary(Bytes),
    /// Posted by the session timer when negotiation took too long.
    NegotiationTimeout,
}

impl fmt::Debug for TransportEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            Self::ChannelOpen(dc) => f.debug_tuple("ChannelOpen").field(&dc.label()).finish(),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::Text(t) => f.debug_tuple("Text").field(&t.len()).finish(),
            Self::Binary(b) => f.debug_tuple("Binary").field(&b.len()).finish(),
            Self::NegotiationTimeout => f.write_str("NegotiationTimeout"),
        }
    }
}

#[derive(Debug)]
pub struct TransportEvent {
    pub peer_id: PeerId,
    pub session_id: Uuid,
    pub kind: TransportEventKind,
}

/// Sender half handed to a connection so its callbacks can post events.
#[derive(Debug, Clone)]
pub struct EventSink {
    peer_id: PeerId,
    session_id: Uuid,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(peer_id: PeerId, session_id: Uuid, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            peer_id,
            session_id,
            tx,
        }
    }

    pub fn post(&self, kind: TransportEventKind) {
        let _ = self.tx.send(TransportEvent {
            peer_id: self.peer_id.clone(),
            session_id: self.session_id,
            kind,
        });
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

/// An ordered, reliable message channel to one peer.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;

    /// Bytes queued locally and not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    async fn close(&self);
}

/// One negotiated (or negotiating) direct connection.
#[async_trait]
pub trait DirectConnection: Send + Sync {
    /// Create the ordered data channel. It is announced with
    /// `ChannelOpen` once usable.
    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer and install it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Candidates received before the remote description are held and
    /// applied once it is set.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Factory for direct connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn DirectConnection>, TransportError>;
}
