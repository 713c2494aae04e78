//! Live peer registry: the only owner of [`PeerSession`]s.
//!
//! Keyed by relay-issued `PeerId`. Owned by the orchestrator task and
//! passed by `&mut` into every handler; nothing else mutates membership.
//!
//! Two dedup rules apply on insert:
//! - same `PeerId`: the old session is replaced.
//! - same display name, different `PeerId`: the most recently signaled
//!   session wins. The relay forbids duplicate usernames among live
//!   clients, so this only happens when a peer reconnects before its old
//!   session was torn down.

use crate::core::connection::{DataChannel, PeerSession, SessionState};
use crate::core::signaling::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Roster entry published to the presenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub display_name: String,
    pub state: SessionState,
    pub channel_open: bool,
}

/// Why a session left the registry during an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Displaced {
    /// A new session for the same `PeerId`.
    SamePeer,
    /// A newer session for the same display name.
    SameName,
}

#[derive(Debug, Default)]
pub struct InsertOutcome {
    /// Sessions removed to make room; the caller must close them.
    pub displaced: Vec<(PeerSession, Displaced)>,
    /// Set when the new session lost the name tie-break; the caller must
    /// close it.
    pub rejected: Option<PeerSession>,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    sessions: HashMap<PeerId, PeerSession>,
    seq: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next signaling sequence number. Strictly increasing.
    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Record that a signaling envelope for `peer_id` was just processed.
    pub fn touch(&mut self, peer_id: &str, seq: u64) {
        if let Some(session) = self.sessions.get_mut(peer_id) {
            session.last_signal = session.last_signal.max(seq);
        }
    }

    pub fn insert(&mut self, session: PeerSession) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();

        let rival = self
            .sessions
            .values()
            .find(|s| s.peer_id != session.peer_id && s.display_name == session.display_name)
            .map(|s| (s.peer_id.clone(), s.last_signal));

        if let Some((rival_id, rival_seq)) = rival {
            if session.last_signal < rival_seq {
                debug!(
                    event = "registry_insert_rejected",
                    peer = %session.peer_id,
                    name = %session.display_name,
                    rival = %rival_id,
                    "Newer session with the same name already present"
                );
                outcome.rejected = Some(session);
                return outcome;
            }
            if let Some(old) = self.sessions.remove(&rival_id) {
                info!(
                    event = "registry_name_evict",
                    name = %old.display_name,
                    old_peer = %old.peer_id,
                    new_peer = %session.peer_id,
                    "Replacing session for reconnected peer"
                );
                outcome.displaced.push((old, Displaced::SameName));
            }
        }

        if let Some(old) = self.sessions.remove(&session.peer_id) {
            debug!(event = "registry_replace", peer = %old.peer_id, "Replacing session for same peer id");
            outcome.displaced.push((old, Displaced::SamePeer));
        }

        self.sessions.insert(session.peer_id.clone(), session);
        outcome
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerSession> {
        self.sessions.get(peer_id)
    }

    /// The session for `peer_id` only when it is the one identified by
    /// `session_id`; events of replaced sessions resolve to `None`.
    pub fn current_mut(&mut self, peer_id: &str, session_id: Uuid) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(peer_id)
            .filter(|s| s.session_id == session_id)
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerSession> {
        self.sessions.remove(peer_id)
    }

    pub fn drain(&mut self) -> Vec<PeerSession> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn display_name(&self, peer_id: &str) -> String {
        self.sessions
            .get(peer_id)
            .map(|s| s.display_name.clone())
            .unwrap_or_else(|| peer_id.to_string())
    }

    /// Every peer with an open data channel.
    pub fn open_channels(&self) -> Vec<(PeerId, Arc<dyn DataChannel>)> {
        let mut open: Vec<_> = self
            .sessions
            .values()
            .filter_map(|s| s.open_channel().map(|c| (s.peer_id.clone(), c)))
            .collect();
        open.sort_by(|a, b| a.0.cmp(&b.0));
        open
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut roster: Vec<_> = self
            .sessions
            .values()
            .map(|s| PeerSummary {
                peer_id: s.peer_id.clone(),
                display_name: s.display_name.clone(),
                state: s.state(),
                channel_open: s.channel_open(),
            })
            .collect();
        roster.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.peer_id.cmp(&b.peer_id)));
        roster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::mock::MockTransport;
    use crate::core::connection::{Role, TransportEvent};
    use crate::core::signaling::PeerInfo;
    use tokio::sync::mpsc;

    async fn make(
        transport: &MockTransport,
        tx: &mpsc::UnboundedSender<TransportEvent>,
        id: &str,
        name: &str,
        seq: u64,
    ) -> PeerSession {
        let peer = PeerInfo {
            id: id.into(),
            username: name.into(),
        };
        PeerSession::open(transport, peer, Role::Responder, seq, tx).await.unwrap()
    }

    #[tokio::test]
    async fn same_peer_id_replaces() {
        let t = MockTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut reg = PeerRegistry::new();

        let first = make(&t, &tx, "p1", "bob", 1).await;
        let first_id = first.session_id;
        assert!(reg.insert(first).displaced.is_empty());

        let out = reg.insert(make(&t, &tx, "p1", "bob", 2).await);
        assert_eq!(out.displaced.len(), 1);
        assert_eq!(out.displaced[0].1, Displaced::SamePeer);
        assert_eq!(out.displaced[0].0.session_id, first_id);
        assert_eq!(reg.len(), 1);
        assert!(reg.current_mut("p1", first_id).is_none());
    }

    #[tokio::test]
    async fn newer_signal_wins_name_collision() {
        let t = MockTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut reg = PeerRegistry::new();

        reg.insert(make(&t, &tx, "old", "bob", 3).await);
        let out = reg.insert(make(&t, &tx, "new", "bob", 5).await);

        assert_eq!(out.displaced.len(), 1);
        assert_eq!(out.displaced[0].1, Displaced::SameName);
        assert!(reg.get("old").is_none());
        assert!(reg.get("new").is_some());
    }

    #[tokio::test]
    async fn stale_session_loses_name_collision() {
        let t = MockTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut reg = PeerRegistry::new();

        reg.insert(make(&t, &tx, "current", "bob", 7).await);
        let out = reg.insert(make(&t, &tx, "late", "bob", 4).await);

        assert!(out.displaced.is_empty());
        assert_eq!(out.rejected.as_ref().map(|s| s.peer_id.clone()), Some("late".to_string()));
        assert!(reg.get("current").is_some());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn roster_is_sorted_and_sequence_increases() {
        let t = MockTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut reg = PeerRegistry::new();

        let a = reg.next_seq();
        let b = reg.next_seq();
        assert!(b > a);

        reg.insert(make(&t, &tx, "p2", "zoe", a).await);
        reg.insert(make(&t, &tx, "p1", "amy", b).await);
        reg.touch("p2", 10);
        assert_eq!(reg.get("p2").unwrap().last_signal, 10);

        let names: Vec<_> = reg.summaries().into_iter().map(|s| s.display_name).collect();
        assert_eq!(names, vec!["amy", "zoe"]);
        assert!(reg.open_channels().is_empty());
        assert_eq!(reg.display_name("nobody"), "nobody");
    }
}
