//! webrtc-rs implementation of the transport seam.
//!
//! - One `RTCPeerConnection` per peer session, trickle ICE.
//! - One ordered, reliable data channel (`chat`) carrying JSON text frames
//!   and raw binary chunks.
//! - Every callback posts a [`TransportEvent`]; no callback touches
//!   orchestrator state.

use super::transport::{
    DataChannel, DirectConnection, EventSink, LinkState, Transport, TransportError,
    TransportEventKind,
};
use crate::core::signaling::{IceCandidate, SessionDescription};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn negotiation(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

// ── Transport ────────────────────────────────────────────────────────────────

/// Builds peer connections from one shared webrtc-rs API object.
pub struct WebRtcTransport {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcTransport {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        let mut me = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut me)?;
        let api = APIBuilder::new()
            .with_media_engine(me)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn DirectConnection>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?,
        );

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => sink.post(TransportEventKind::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Err(e) => warn!(event = "ice_candidate_encode_failure", peer = %sink.peer_id(), error = %e, "Failed to encode local candidate"),
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", peer = %sink.peer_id(), "WebRTC connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", peer = %sink.peer_id(), "WebRTC connection failed");
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(event = "webrtc_disconnected", peer = %sink.peer_id(), "WebRTC connection lost");
                    }
                    _ => debug!(event = "webrtc_state", peer = %sink.peer_id(), state = %state, "WebRTC state change"),
                }
                if let Some(state) = link_state(state) {
                    sink.post(TransportEventKind::StateChanged(state));
                }
            })
        }));

        // Responder side: the remote creates the channel.
        let sink = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = sink.clone();
            Box::pin(async move {
                info!(event = "dc_announced", peer = %sink.peer_id(), label = %dc.label(), "Remote data channel announced");
                attach_channel_handlers(dc, sink);
            })
        }));

        Ok(Arc::new(WebRtcConnection {
            pc,
            events,
            remote_set: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
        }))
    }
}

/// Wire `on_open` / `on_message` / `on_close` of a data channel to the
/// event sink.
fn attach_channel_handlers(dc: Arc<RTCDataChannel>, sink: EventSink) {
    let open_dc = dc.clone();
    let open_sink = sink.clone();
    dc.on_open(Box::new(move || {
        let dc = open_dc.clone();
        let sink = open_sink.clone();
        Box::pin(async move {
            info!(event = "dc_open", peer = %sink.peer_id(), label = %dc.label(), "Data channel open");
            sink.post(TransportEventKind::ChannelOpen(Arc::new(RtcDataChannel { inner: dc })));
        })
    }));

    let msg_sink = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = msg_sink.clone();
        Box::pin(async move {
            if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => sink.post(TransportEventKind::Text(text)),
                    Err(_) => warn!(event = "dc_invalid_utf8", peer = %sink.peer_id(), "Dropping non UTF-8 text frame"),
                }
            } else {
                sink.post(TransportEventKind::Binary(msg.data));
            }
        })
    }));

    dc.on_close(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            info!(event = "dc_closed", peer = %sink.peer_id(), "Data channel closed");
            sink.post(TransportEventKind::ChannelClosed);
        })
    }));
}

// ── Connection ───────────────────────────────────────────────────────────────

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: EventSink,
    remote_set: AtomicBool,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

#[async_trait]
impl DirectConnection for WebRtcConnection {
    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        attach_channel_handlers(dc, self.events.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(negotiation)?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await.map_err(negotiation)?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        use crate::core::signaling::envelope::SdpKind;
        let desc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(negotiation)?;
        self.pc.set_remote_description(desc).await.map_err(negotiation)?;
        self.remote_set.store(true, Ordering::Release);

        let pending: Vec<_> = std::mem::take(&mut *self.pending_candidates.lock().await);
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!(event = "ice_candidate_failure", peer = %self.events.peer_id(), error = %e, "Failed to apply queued candidate");
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        if !self.remote_set.load(Ordering::Acquire) {
            self.pending_candidates.lock().await.push(init);
            return Ok(());
        }
        self.pc.add_ice_candidate(init).await.map_err(negotiation)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(event = "webrtc_close_failure", peer = %self.events.peer_id(), error = %e, "Error while closing peer connection");
        }
    }
}

// ── Data channel ─────────────────────────────────────────────────────────────

struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.inner
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount().await
    }

    async fn close(&self) {
        let _ = self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_peer_connection_states() {
        assert_eq!(link_state(RTCPeerConnectionState::Connected), Some(LinkState::Connected));
        assert_eq!(link_state(RTCPeerConnectionState::Failed), Some(LinkState::Failed));
        assert_eq!(link_state(RTCPeerConnectionState::Unspecified), None);
        assert!(LinkState::Closed.is_terminal());
        assert!(!LinkState::Connecting.is_terminal());
    }

    #[tokio::test]
    async fn offer_is_produced_without_network() {
        let transport = WebRtcTransport::new(Vec::new()).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = EventSink::new("peer-b".into(), uuid::Uuid::new_v4(), tx);
        let conn = transport.connect(sink).await.unwrap();
        conn.create_data_channel("chat").await.unwrap();
        let offer = conn.create_offer().await.unwrap();
        assert!(offer.sdp.starts_with("v=0"));
        conn.close().await;
    }
}
