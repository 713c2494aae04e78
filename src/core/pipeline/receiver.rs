//! Incoming file reassembly.
//!
//! Buffers are keyed by `(sender, fileId)`, falling back to
//! `(sender, filename)` for peers that do not send a `fileId`. Binary
//! frames carry no header, so each chunk is appended to the most recently
//! opened unfinished buffer of its sender. Two transfers from the same
//! sender at once are therefore not disambiguated.
//!
//! Completion markers live in a bounded LRU stamped with the time of
//! completion; a `FILE_END` whose marker is younger than the dedup window
//! is dropped.

use crate::core::config::{
    COMPLETION_DEDUP_CAPACITY, COMPLETION_DEDUP_WINDOW, RECEIVER_ACK_INTERVAL_BYTES,
};
use crate::core::message_log::FileHandle;
use crate::core::pipeline::frame::ControlFrame;
use crate::core::signaling::PeerId;
use crate::utils::atomic_write::atomic_write;
use crate::utils::paths::{sanitize_file_name, unique_path};
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransferKey {
    FileId(String),
    Filename(String),
}

impl TransferKey {
    pub fn new(file_id: Option<&str>, filename: &str) -> Self {
        match file_id.filter(|id| !id.is_empty()) {
            Some(id) => Self::FileId(id.to_string()),
            None => Self::Filename(filename.to_string()),
        }
    }
}

#[derive(Debug)]
struct IncomingBuffer {
    key: TransferKey,
    file_id: Option<String>,
    filename: String,
    mime: String,
    size: u64,
    chunks: Vec<Bytes>,
    received: u64,
    /// Sender supports flow control; acks are due.
    acked: Option<u64>,
}

/// A fully reassembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub sender: PeerId,
    pub file_id: Option<String>,
    pub filename: String,
    pub mime: String,
    pub data: Bytes,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Appended; `ack` is a `FILE_WINDOW` frame to send back, if one is due.
    Appended { ack: Option<ControlFrame> },
    /// No open buffer for this sender.
    Orphan,
}

pub struct FileReceiver {
    /// Per sender, open buffers in the order they were opened.
    buffers: HashMap<PeerId, Vec<IncomingBuffer>>,
    completed: LruCache<(PeerId, TransferKey), Instant>,
    dedup_window: Duration,
}

impl Default for FileReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl FileReceiver {
    pub fn new() -> Self {
        Self::with_dedup(COMPLETION_DEDUP_CAPACITY, COMPLETION_DEDUP_WINDOW)
    }

    pub fn with_dedup(capacity: usize, window: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            buffers: HashMap::new(),
            completed: LruCache::new(capacity),
            dedup_window: window,
        }
    }

    /// Open a buffer for an announced file. Returns the initial
    /// `FILE_WINDOW` ack when the sender advertised a window.
    pub fn on_meta(
        &mut self,
        sender: &str,
        filename: &str,
        size: u64,
        mime: &str,
        file_id: Option<&str>,
        window: Option<u64>,
    ) -> Option<ControlFrame> {
        let key = TransferKey::new(file_id, filename);
        let stack = self.buffers.entry(sender.to_string()).or_default();

        // A repeated META restarts that transfer.
        stack.retain(|b| b.key != key);

        info!(event = "download_started", peer = %sender, file = %filename, size, "Receiving file");
        let ack = match (window, file_id) {
            (Some(_), Some(id)) => Some(ControlFrame::FileWindow {
                file_id: id.to_string(),
                received: 0,
            }),
            _ => None,
        };

        stack.push(IncomingBuffer {
            key,
            file_id: file_id.map(str::to_string),
            filename: filename.to_string(),
            mime: mime.to_string(),
            size,
            chunks: Vec::new(),
            received: 0,
            acked: ack.as_ref().map(|_| 0),
        });
        ack
    }

    pub fn on_chunk(&mut self, sender: &str, chunk: Bytes) -> ChunkOutcome {
        let Some(buffer) = self.buffers.get_mut(sender).and_then(|s| s.last_mut()) else {
            warn!(event = "download_orphan_chunk", peer = %sender, bytes = chunk.len(), "Chunk without an open transfer dropped");
            return ChunkOutcome::Orphan;
        };

        buffer.received += chunk.len() as u64;
        buffer.chunks.push(chunk);

        let ack = match (buffer.acked, &buffer.file_id) {
            (Some(last), Some(id)) if buffer.received - last >= RECEIVER_ACK_INTERVAL_BYTES => {
                buffer.acked = Some(buffer.received);
                Some(ControlFrame::FileWindow {
                    file_id: id.clone(),
                    received: buffer.received,
                })
            }
            _ => None,
        };
        ChunkOutcome::Appended { ack }
    }

    /// Close the matching buffer and reassemble it. `None` when no buffer
    /// matches or the completion is a duplicate.
    pub fn on_end(&mut self, sender: &str, filename: &str, file_id: Option<&str>) -> Option<CompletedFile> {
        self.on_end_at(sender, filename, file_id, Instant::now())
    }

    fn on_end_at(
        &mut self,
        sender: &str,
        filename: &str,
        file_id: Option<&str>,
        now: Instant,
    ) -> Option<CompletedFile> {
        let key = TransferKey::new(file_id, filename);
        let marker = (sender.to_string(), key.clone());

        let buffer = self.take_buffer(sender, &key);

        if let Some(done_at) = self.completed.get(&marker) {
            if now.duration_since(*done_at) < self.dedup_window {
                debug!(event = "download_duplicate_end", peer = %sender, file = %filename, "Duplicate FILE_END ignored");
                return None;
            }
        }

        let Some(buffer) = buffer else {
            debug!(event = "download_unknown_end", peer = %sender, file = %filename, "FILE_END without an open transfer");
            return None;
        };

        if buffer.received != buffer.size {
            warn!(
                event = "download_size_mismatch",
                peer = %sender,
                file = %buffer.filename,
                announced = buffer.size,
                received = buffer.received,
                "Received size differs from announced size"
            );
        }

        self.completed.put(marker, now);

        let mut data = BytesMut::with_capacity(buffer.received as usize);
        for chunk in &buffer.chunks {
            data.extend_from_slice(chunk);
        }

        info!(event = "download_complete", peer = %sender, file = %buffer.filename, bytes = buffer.received, "File received");
        Some(CompletedFile {
            sender: sender.to_string(),
            file_id: buffer.file_id,
            filename: buffer.filename,
            mime: buffer.mime,
            data: data.freeze(),
        })
    }

    /// Discard a transfer the sender cancelled. Returns its filename.
    pub fn on_cancel(&mut self, sender: &str, filename: &str, file_id: Option<&str>) -> Option<String> {
        let key = TransferKey::new(file_id, filename);
        self.take_buffer(sender, &key).map(|b| b.filename)
    }

    /// Drop every open buffer of a peer. Returns how many were dropped.
    pub fn drop_peer(&mut self, sender: &str) -> usize {
        let dropped = self.buffers.remove(sender).map_or(0, |s| s.len());
        if dropped > 0 {
            debug!(event = "download_peer_dropped", peer = %sender, dropped, "Discarded unfinished transfers");
        }
        dropped
    }

    pub fn open_transfers(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }

    fn take_buffer(&mut self, sender: &str, key: &TransferKey) -> Option<IncomingBuffer> {
        let stack = self.buffers.get_mut(sender)?;
        let idx = stack.iter().rposition(|b| &b.key == key)?;
        let buffer = stack.remove(idx);
        if stack.is_empty() {
            self.buffers.remove(sender);
        }
        Some(buffer)
    }
}

/// Persist a completed file. With a downloads directory the bytes are
/// written under a sanitized, collision-free name; otherwise they stay in
/// memory.
pub async fn store_completed(file: &CompletedFile, downloads: Option<&Path>) -> Result<FileHandle> {
    let Some(dir) = downloads else {
        return Ok(FileHandle::Memory(file.data.clone()));
    };

    let dir = dir.to_path_buf();
    let name = sanitize_file_name(&file.filename);
    let data = file.data.clone();
    let path: PathBuf = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = unique_path(&dir, &name);
        atomic_write(&path, &data)?;
        Ok(path)
    })
    .await
    .context("download writer task failed")??;

    info!(event = "download_saved", peer = %file.sender, mime = %file.mime, path = %path.display(), "File saved");
    Ok(FileHandle::Path(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(rx: &mut FileReceiver, sender: &str, data: &[u8]) {
        for chunk in data.chunks(crate::core::config::CHUNK_SIZE) {
            assert!(matches!(
                rx.on_chunk(sender, Bytes::copy_from_slice(chunk)),
                ChunkOutcome::Appended { .. }
            ));
        }
    }

    #[test]
    fn reassembles_in_arrival_order() {
        let data: Vec<u8> = (0..40000u32).map(|i| (i % 253) as u8).collect();
        let mut rx = FileReceiver::new();
        rx.on_meta("alice", "a.bin", 40000, "application/octet-stream", Some("f1"), None);
        feed(&mut rx, "alice", &data);

        let done = rx.on_end("alice", "a.bin", Some("f1")).unwrap();
        assert_eq!(done.data, Bytes::from(data));
        assert_eq!(rx.open_transfers(), 0);
    }

    #[test]
    fn empty_file_round_trips() {
        let mut rx = FileReceiver::new();
        rx.on_meta("alice", "empty", 0, "", Some("f0"), None);
        let done = rx.on_end("alice", "empty", Some("f0")).unwrap();
        assert!(done.data.is_empty());
    }

    #[test]
    fn duplicate_end_yields_one_completion() {
        let mut rx = FileReceiver::new();
        rx.on_meta("alice", "a.txt", 3, "text/plain", Some("f1"), None);
        feed(&mut rx, "alice", b"abc");
        assert!(rx.on_end("alice", "a.txt", Some("f1")).is_some());
        assert!(rx.on_end("alice", "a.txt", Some("f1")).is_none());

        // A resend of the same transfer inside the window is also dropped.
        rx.on_meta("alice", "a.txt", 3, "text/plain", Some("f1"), None);
        feed(&mut rx, "alice", b"abc");
        assert!(rx.on_end("alice", "a.txt", Some("f1")).is_none());
        assert_eq!(rx.open_transfers(), 0);
    }

    #[test]
    fn expired_marker_allows_new_completion() {
        let mut rx = FileReceiver::with_dedup(4, Duration::from_secs(60));
        let t0 = Instant::now();
        rx.on_meta("alice", "a.txt", 1, "", Some("f1"), None);
        feed(&mut rx, "alice", b"x");
        assert!(rx.on_end_at("alice", "a.txt", Some("f1"), t0).is_some());

        rx.on_meta("alice", "a.txt", 1, "", Some("f1"), None);
        feed(&mut rx, "alice", b"x");
        let later = t0 + Duration::from_secs(61);
        assert!(rx.on_end_at("alice", "a.txt", Some("f1"), later).is_some());
    }

    #[test]
    fn filename_fallback_and_sender_isolation() {
        let mut rx = FileReceiver::new();
        rx.on_meta("alice", "same.txt", 2, "", None, None);
        rx.on_meta("bob", "same.txt", 2, "", None, None);
        feed(&mut rx, "alice", b"AA");
        feed(&mut rx, "bob", b"BB");

        assert_eq!(rx.on_end("bob", "same.txt", None).unwrap().data, Bytes::from_static(b"BB"));
        assert_eq!(rx.on_end("alice", "same.txt", None).unwrap().data, Bytes::from_static(b"AA"));
    }

    #[test]
    fn chunks_route_to_latest_open_buffer() {
        let mut rx = FileReceiver::new();
        rx.on_meta("alice", "one", 1, "", Some("1"), None);
        feed(&mut rx, "alice", b"1");
        rx.on_meta("alice", "two", 1, "", Some("2"), None);
        feed(&mut rx, "alice", b"2");

        assert_eq!(rx.on_end("alice", "two", Some("2")).unwrap().data, Bytes::from_static(b"2"));
        assert_eq!(rx.on_end("alice", "one", Some("1")).unwrap().data, Bytes::from_static(b"1"));
    }

    #[test]
    fn orphan_chunks_and_unknown_end_are_dropped() {
        let mut rx = FileReceiver::new();
        assert_eq!(rx.on_chunk("eve", Bytes::from_static(b"x")), ChunkOutcome::Orphan);
        assert!(rx.on_end("eve", "nothing", Some("f")).is_none());
    }

    #[test]
    fn cancel_and_peer_drop_discard_buffers() {
        let mut rx = FileReceiver::new();
        rx.on_meta("alice", "a", 10, "", Some("f1"), None);
        assert_eq!(rx.on_cancel("alice", "a", Some("f1")).as_deref(), Some("a"));
        assert!(rx.on_end("alice", "a", Some("f1")).is_none());

        rx.on_meta("bob", "b", 10, "", Some("f2"), None);
        assert_eq!(rx.drop_peer("bob"), 1);
        assert_eq!(rx.open_transfers(), 0);
    }

    #[test]
    fn window_acks_every_interval() {
        let mut rx = FileReceiver::new();
        let first = rx.on_meta("alice", "big", 3 << 20, "", Some("f"), Some(4 << 20));
        assert_eq!(
            first,
            Some(ControlFrame::FileWindow {
                file_id: "f".into(),
                received: 0
            })
        );

        let mut acks = Vec::new();
        for _ in 0..((3 << 20) / crate::core::config::CHUNK_SIZE) {
            if let ChunkOutcome::Appended { ack: Some(ControlFrame::FileWindow { received, .. }) } =
                rx.on_chunk("alice", Bytes::from(vec![0u8; crate::core::config::CHUNK_SIZE]))
            {
                acks.push(received);
            }
        }
        assert_eq!(acks, vec![1 << 20, 2 << 20, 3 << 20]);

        // Legacy senders get no acks.
        assert_eq!(rx.on_meta("bob", "x", 1, "", Some("g"), None), None);
    }

    #[tokio::test]
    async fn stores_to_downloads_or_memory() {
        let file = CompletedFile {
            sender: "alice".into(),
            file_id: Some("f".into()),
            filename: "../evil/report.txt".into(),
            mime: "text/plain".into(),
            data: Bytes::from_static(b"hello"),
        };

        match store_completed(&file, None).await.unwrap() {
            FileHandle::Memory(bytes) => assert_eq!(bytes, file.data),
            other => panic!("unexpected {other:?}"),
        }

        let dir = tempfile::tempdir().unwrap();
        let first = store_completed(&file, Some(dir.path())).await.unwrap();
        let second = store_completed(&file, Some(dir.path())).await.unwrap();
        assert_eq!(first, FileHandle::Path(dir.path().join("report.txt")));
        assert_eq!(second, FileHandle::Path(dir.path().join("report (1).txt")));
        assert_eq!(std::fs::read(dir.path().join("report.txt")).unwrap(), b"hello");
    }
}
