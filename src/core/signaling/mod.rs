//! Relay signaling: envelope codec and the WebSocket channel task.

pub mod channel;
pub mod envelope;

pub use channel::{SignalEvent, SignalingChannel, SignalingConfig};
pub use envelope::{Envelope, IceCandidate, PeerId, PeerInfo, SessionDescription};
