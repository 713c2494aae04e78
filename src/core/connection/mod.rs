//! Direct peer connections: transport seam, webrtc-rs backend, per-peer session.

#[cfg(test)]
pub mod mock;
pub mod session;
pub mod transport;
pub mod webrtc;

pub use session::{PeerSession, Role, SessionState};
pub use transport::{DataChannel, Transport, TransportError, TransportEvent, TransportEventKind};
