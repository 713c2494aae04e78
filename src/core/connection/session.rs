//! Per-peer session: owns the direct connection and its data channel and
//! enforces the connection lifecycle.
//!
//! ```text
//! connecting ──► connected ──► disconnected
//!      └─────────────────────────────▲
//! ```
//!
//! `disconnected` is terminal. A reconnecting peer always gets a brand-new
//! session (new `session_id`), so events from the old one can be told apart.

use super::transport::{
    DataChannel, DirectConnection, EventSink, LinkState, Transport, TransportError, TransportEvent,
    TransportEventKind,
};
use crate::core::config::{DATA_CHANNEL_LABEL, NEGOTIATION_TIMEOUT};
use crate::core::signaling::{IceCandidate, PeerId, PeerInfo, SessionDescription};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        })
    }
}

/// Which side produces the SDP offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Joined after the peer: creates the channel and sends the offer.
    Initiator,
    /// Was already in the room: only answers.
    Responder,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: SessionState, to: SessionState },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct PeerSession {
    pub peer_id: PeerId,
    pub display_name: String,
    pub role: Role,
    pub session_id: Uuid,
    pub created_at: Instant,
    /// Registry sequence number of the last signaling envelope for this peer.
    pub last_signal: u64,
    state: SessionState,
    connection: Arc<dyn DirectConnection>,
    channel: Option<Arc<dyn DataChannel>>,
    negotiation_timer: Option<JoinHandle<()>>,
}

impl PeerSession {
    /// Create a session in `connecting` and arm its negotiation timer.
    pub async fn open(
        transport: &dyn Transport,
        peer: PeerInfo,
        role: Role,
        seq: u64,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, SessionError> {
        Self::open_with_timeout(transport, peer, role, seq, events, NEGOTIATION_TIMEOUT).await
    }

    pub async fn open_with_timeout(
        transport: &dyn Transport,
        peer: PeerInfo,
        role: Role,
        seq: u64,
        events: &mpsc::UnboundedSender<TransportEvent>,
        negotiation_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let session_id = Uuid::new_v4();
        let sink = EventSink::new(peer.id.clone(), session_id, events.clone());
        let connection = transport.connect(sink.clone()).await?;

        let negotiation_timer = tokio::spawn(async move {
            tokio::time::sleep(negotiation_timeout).await;
            sink.post(TransportEventKind::NegotiationTimeout);
        });

        debug!(
            event = "session_created",
            peer = %peer.id,
            name = %peer.username,
            role = ?role,
            session = %session_id,
            "Peer session created"
        );

        Ok(Self {
            peer_id: peer.id,
            display_name: peer.username,
            role,
            session_id,
            created_at: Instant::now(),
            last_signal: seq,
            state: SessionState::Connecting,
            connection,
            channel: None,
            negotiation_timer: Some(negotiation_timer),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `to`. Re-entering the current state is a no-op (`Ok(false)`);
    /// any move the lifecycle does not allow is rejected.
    pub fn advance(&mut self, to: SessionState) -> Result<bool, SessionError> {
        use SessionState::*;
        match (self.state, to) {
            (from, to) if from == to => Ok(false),
            (Connecting, Connected) | (Connecting, Disconnected) | (Connected, Disconnected) => {
                info!(
                    event = "session_transition",
                    peer = %self.peer_id,
                    from = %self.state,
                    to = %to,
                    "Peer session state change"
                );
                self.state = to;
                if to != Connecting {
                    self.disarm_timer();
                }
                Ok(true)
            }
            (from, to) => {
                warn!(event = "session_illegal_transition", peer = %self.peer_id, from = %from, to = %to, "Rejected session transition");
                Err(SessionError::IllegalTransition { from, to })
            }
        }
    }

    /// Map a link state report onto the lifecycle. Returns the new state
    /// when it changed.
    pub fn apply_link_state(&mut self, link: LinkState) -> Result<Option<SessionState>, SessionError> {
        let target = match link {
            LinkState::Connected => SessionState::Connected,
            s if s.is_terminal() => SessionState::Disconnected,
            _ => return Ok(None),
        };
        Ok(self.advance(target)?.then_some(target))
    }

    /// Initiator side: create the data channel and produce the offer.
    pub async fn start_offer(&self) -> Result<SessionDescription, SessionError> {
        self.connection.create_data_channel(DATA_CHANNEL_LABEL).await?;
        Ok(self.connection.create_offer().await?)
    }

    /// Responder side: apply the remote offer and produce the answer.
    pub async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, SessionError> {
        self.connection.set_remote_description(offer).await?;
        Ok(self.connection.create_answer().await?)
    }

    pub async fn accept_answer(&self, answer: SessionDescription) -> Result<(), SessionError> {
        Ok(self.connection.set_remote_description(answer).await?)
    }

    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        Ok(self.connection.add_ice_candidate(candidate).await?)
    }

    pub fn attach_channel(&mut self, channel: Arc<dyn DataChannel>) {
        self.channel = Some(channel);
    }

    pub fn detach_channel(&mut self) {
        self.channel = None;
    }

    /// The data channel when it is open.
    pub fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.as_ref().filter(|c| c.is_open()).cloned()
    }

    pub fn channel_open(&self) -> bool {
        self.open_channel().is_some()
    }

    /// Tear down the channel and the connection. Does not change the
    /// lifecycle state; callers evict the session right after.
    pub async fn close(&mut self) {
        debug!(
            event = "session_closed",
            peer = %self.peer_id,
            session = %self.session_id,
            age_ms = self.created_at.elapsed().as_millis() as u64,
            "Peer session closed"
        );
        self.disarm_timer();
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.connection.close().await;
    }

    fn disarm_timer(&mut self) {
        if let Some(timer) = self.negotiation_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.disarm_timer();
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer_id", &self.peer_id)
            .field("display_name", &self.display_name)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("session_id", &self.session_id)
            .field("last_signal", &self.last_signal)
            .field("channel_open", &self.channel_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::mock::{Call, MockTransport};

    fn bob() -> PeerInfo {
        PeerInfo {
            id: "u-bob".into(),
            username: "bob".into(),
        }
    }

    async fn session(role: Role) -> (PeerSession, Arc<MockTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let transport = MockTransport::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let s = PeerSession::open(transport.as_ref(), bob(), role, 1, &tx).await.unwrap();
        (s, transport, rx)
    }

    #[tokio::test]
    async fn lifecycle_only_moves_forward() {
        let (mut s, _t, _rx) = session(Role::Initiator).await;
        assert_eq!(s.state(), SessionState::Connecting);

        assert_eq!(s.apply_link_state(LinkState::Connecting).unwrap(), None);
        assert_eq!(s.apply_link_state(LinkState::Connected).unwrap(), Some(SessionState::Connected));
        assert_eq!(s.apply_link_state(LinkState::Connected).unwrap(), None);
        assert_eq!(s.apply_link_state(LinkState::Failed).unwrap(), Some(SessionState::Disconnected));

        assert!(matches!(
            s.advance(SessionState::Connected),
            Err(SessionError::IllegalTransition { .. })
        ));
        assert!(matches!(
            s.advance(SessionState::Connecting),
            Err(SessionError::IllegalTransition { .. })
        ));
        assert_eq!(s.apply_link_state(LinkState::Closed).unwrap(), None);
        assert_eq!(s.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn connecting_can_fail_directly() {
        let (mut s, _t, _rx) = session(Role::Responder).await;
        assert!(s.advance(SessionState::Disconnected).unwrap());
        assert!(s.apply_link_state(LinkState::Connected).is_err());
    }

    #[tokio::test]
    async fn initiator_creates_channel_before_offer() {
        let (s, t, _rx) = session(Role::Initiator).await;
        let offer = s.start_offer().await.unwrap();
        assert_eq!(offer.sdp, "mock-offer");
        let calls = t.connection("u-bob").unwrap().calls();
        assert_eq!(
            calls,
            vec![Call::CreateDataChannel(DATA_CHANNEL_LABEL.into()), Call::CreateOffer]
        );
    }

    #[tokio::test]
    async fn responder_sets_remote_then_answers() {
        let (s, t, _rx) = session(Role::Responder).await;
        let answer = s.accept_offer(SessionDescription::offer("remote")).await.unwrap();
        assert_eq!(answer, SessionDescription::answer("mock-answer"));
        assert_eq!(
            t.connection("u-bob").unwrap().calls(),
            vec![Call::SetRemote(SessionDescription::offer("remote")), Call::CreateAnswer]
        );
    }

    #[tokio::test]
    async fn negotiation_timer_posts_event_for_this_session() {
        let transport = MockTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let s = PeerSession::open_with_timeout(
            transport.as_ref(),
            bob(),
            Role::Initiator,
            1,
            &tx,
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.session_id, s.session_id);
        assert!(matches!(ev.kind, TransportEventKind::NegotiationTimeout));
    }

    #[tokio::test]
    async fn connected_disarms_timer() {
        let transport = MockTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = PeerSession::open_with_timeout(
            transport.as_ref(),
            bob(),
            Role::Initiator,
            1,
            &tx,
            Duration::from_millis(30),
        )
        .await
        .unwrap();
        s.advance(SessionState::Connected).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }
}
