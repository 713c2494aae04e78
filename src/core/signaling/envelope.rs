//! Relay envelopes: one JSON object per WebSocket text frame.
//!
//! The relay only looks at `type` and `toPeerId`; everything else is
//! payload it forwards untouched. It stamps `fromPeerId` on every relayed
//! SDP/ICE envelope, so inbound signaling always carries the sender.

use serde::{Deserialize, Serialize};

/// Relay-issued identifier of a connected participant.
pub type PeerId = String;

/// Session description as exchanged on the wire (`{type, sdp}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Basic info the relay publishes for each room member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub username: String,
}

/// Every message exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Envelope {
    /// First frame on every connection.
    Identify { username: String },
    JoinRoom { room_id: String },
    SdpOffer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<PeerId>,
        to_peer_id: PeerId,
        sdp: SessionDescription,
    },
    SdpAnswer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<PeerId>,
        to_peer_id: PeerId,
        sdp: SessionDescription,
    },
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<PeerId>,
        to_peer_id: PeerId,
        ice_candidate: IceCandidate,
    },
    /// Legacy relay-side chat; the relay only logs it. Chat travels P2P.
    ChatMessage { content: String },
    AuthSuccess {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    AuthError {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    RoomMembers {
        #[serde(default)]
        room_id: String,
        #[serde(default)]
        members: Vec<PeerInfo>,
    },
    NewPeerInRoom {
        #[serde(default)]
        room_id: String,
        peer: PeerInfo,
    },
}

impl Envelope {
    pub fn identify(username: impl Into<String>) -> Self {
        Self::Identify {
            username: username.into(),
        }
    }

    pub fn join_room(room_id: impl Into<String>) -> Self {
        Self::JoinRoom {
            room_id: room_id.into(),
        }
    }

    pub fn offer(to: impl Into<PeerId>, sdp: SessionDescription) -> Self {
        Self::SdpOffer {
            from_peer_id: None,
            to_peer_id: to.into(),
            sdp,
        }
    }

    pub fn answer(to: impl Into<PeerId>, sdp: SessionDescription) -> Self {
        Self::SdpAnswer {
            from_peer_id: None,
            to_peer_id: to.into(),
            sdp,
        }
    }

    pub fn candidate(to: impl Into<PeerId>, ice_candidate: IceCandidate) -> Self {
        Self::IceCandidate {
            from_peer_id: None,
            to_peer_id: to.into(),
            ice_candidate,
        }
    }

    /// Wire name of the envelope kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "IDENTIFY",
            Self::JoinRoom { .. } => "JOIN_ROOM",
            Self::SdpOffer { .. } => "SDP_OFFER",
            Self::SdpAnswer { .. } => "SDP_ANSWER",
            Self::IceCandidate { .. } => "ICE_CANDIDATE",
            Self::ChatMessage { .. } => "CHAT_MESSAGE",
            Self::AuthSuccess { .. } => "AUTH_SUCCESS",
            Self::AuthError { .. } => "AUTH_ERROR",
            Self::RoomMembers { .. } => "ROOM_MEMBERS",
            Self::NewPeerInRoom { .. } => "NEW_PEER_IN_ROOM",
        }
    }

    /// Sender of a relayed SDP/ICE envelope, when present and non-empty.
    pub fn from_peer(&self) -> Option<&str> {
        match self {
            Self::SdpOffer { from_peer_id, .. }
            | Self::SdpAnswer { from_peer_id, .. }
            | Self::IceCandidate { from_peer_id, .. } => {
                from_peer_id.as_deref().filter(|id| !id.is_empty())
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
