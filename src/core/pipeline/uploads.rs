//! Bookkeeping for outgoing transfers: per-recipient progress, cancel
//! tokens and ack channels. Owned by the orchestrator.

use crate::core::signaling::PeerId;
use crate::utils::sos::SignalOfStop;
use std::collections::HashMap;
use tokio::sync::watch;

#[derive(Debug)]
pub struct RecipientProgress {
    pub progress: u8,
    pub complete: bool,
    stop: SignalOfStop,
    acks: watch::Sender<Option<u64>>,
}

#[derive(Debug)]
pub struct OutgoingTransfer {
    pub file_id: String,
    pub filename: String,
    pub recipients: HashMap<PeerId, RecipientProgress>,
}

/// Handles given to one recipient's stream task.
#[derive(Debug)]
pub struct RecipientHandles {
    pub peer_id: PeerId,
    pub stop: SignalOfStop,
    pub acks: watch::Receiver<Option<u64>>,
}

#[derive(Debug, Default)]
pub struct UploadTracker {
    transfers: HashMap<String, OutgoingTransfer>,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the transfer record and one progress entry per recipient.
    pub fn register(
        &mut self,
        file_id: &str,
        filename: &str,
        peers: &[PeerId],
    ) -> Vec<RecipientHandles> {
        let mut recipients = HashMap::new();
        let mut handles = Vec::with_capacity(peers.len());
        for peer_id in peers {
            let stop = SignalOfStop::new();
            let (tx, rx) = watch::channel(None);
            recipients.insert(
                peer_id.clone(),
                RecipientProgress {
                    progress: 0,
                    complete: false,
                    stop: stop.clone(),
                    acks: tx,
                },
            );
            handles.push(RecipientHandles {
                peer_id: peer_id.clone(),
                stop,
                acks: rx,
            });
        }
        self.transfers.insert(
            file_id.to_string(),
            OutgoingTransfer {
                file_id: file_id.to_string(),
                filename: filename.to_string(),
                recipients,
            },
        );
        handles
    }

    pub fn filename(&self, file_id: &str) -> Option<&str> {
        self.transfers.get(file_id).map(|t| t.filename.as_str())
    }

    /// Record a progress report. Returns the value to publish (never lower
    /// than the last one), or `None` when the record no longer exists.
    pub fn record_progress(&mut self, file_id: &str, peer_id: &str, progress: u8, complete: bool) -> Option<u8> {
        let entry = self.transfers.get_mut(file_id)?.recipients.get_mut(peer_id)?;
        if entry.complete {
            return None;
        }
        entry.progress = entry.progress.max(progress);
        entry.complete = complete;
        Some(entry.progress)
    }

    /// Forward a receiver ack to the stream task.
    pub fn ack(&self, file_id: &str, peer_id: &str, received: u64) {
        if let Some(entry) = self.transfers.get(file_id).and_then(|t| t.recipients.get(peer_id)) {
            entry.acks.send_if_modified(|acked| {
                if acked.is_none_or(|a| received > a) {
                    *acked = Some(received);
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Stop one recipient's stream and drop its record. Returns the
    /// filename when the record existed.
    pub fn cancel(&mut self, file_id: &str, peer_id: &str) -> Option<String> {
        let transfer = self.transfers.get_mut(file_id)?;
        let entry = transfer.recipients.remove(peer_id)?;
        entry.stop.cancel();
        let filename = transfer.filename.clone();
        self.prune(file_id);
        Some(filename)
    }

    /// Drop a recipient's record after its stream ended (failed or
    /// cancelled remotely).
    pub fn finish(&mut self, file_id: &str, peer_id: &str) -> bool {
        let removed = self
            .transfers
            .get_mut(file_id)
            .and_then(|t| t.recipients.remove(peer_id))
            .is_some();
        self.prune(file_id);
        removed
    }

    /// Stop every stream to `peer_id`. Returns the affected file ids.
    pub fn cancel_peer(&mut self, peer_id: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .transfers
            .values()
            .filter(|t| t.recipients.contains_key(peer_id))
            .map(|t| t.file_id.clone())
            .collect();
        for id in &ids {
            self.cancel(id, peer_id);
        }
        ids
    }

    pub fn stop_all(&mut self) {
        for transfer in self.transfers.values() {
            for entry in transfer.recipients.values() {
                entry.stop.cancel();
            }
        }
        self.transfers.clear();
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Remove the transfer once no recipient is still streaming.
    fn prune(&mut self, file_id: &str) {
        let done = self
            .transfers
            .get(file_id)
            .is_some_and(|t| t.recipients.values().all(|r| r.complete));
        if done {
            self.transfers.remove(file_id);
        }
    }

    /// Called after a completion report.
    pub fn settle(&mut self, file_id: &str) {
        self.prune(file_id);
    }
}
