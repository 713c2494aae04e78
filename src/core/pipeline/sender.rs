//! Outgoing file streaming, one task per recipient and file.
//!
//! ```text
//!  FILE_META ─► chunk 0 ─► chunk 1 ─► ... ─► (100%) ─► FILE_END
//!                  ▲ progress reported before every chunk
//! ```
//!
//! Chunks carry no header, so streams to the same peer must not overlap:
//! every [`StreamTask`] for a peer goes through that peer's [`PeerOutbox`],
//! which runs them one after the other.
//!
//! All recipients share one [`Bytes`] buffer; chunks are zero-copy slices.
//! Before each chunk the task waits for two things:
//! - the channel's `buffered_amount` is under the high watermark;
//! - once the receiver has acked at least once, unacknowledged bytes fit
//!   in the advertised window.
//!
//! Tasks never touch orchestrator state. They report through
//! [`TransferEvent`]s.

use crate::core::config::{
    CHUNK_SIZE, DC_BUFFERED_AMOUNT_HIGH, DC_BUFFER_DRAIN_TIMEOUT, DC_BUFFER_POLL_INTERVAL,
};
use crate::core::connection::{DataChannel, TransportError};
use crate::core::pipeline::frame::ControlFrame;
use crate::core::signaling::PeerId;
use crate::utils::paths::guess_mime;
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reports from sender tasks to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress {
        file_id: String,
        peer_id: PeerId,
        progress: u8,
        complete: bool,
    },
    Failed {
        file_id: String,
        peer_id: PeerId,
        error: String,
    },
    Cancelled {
        file_id: String,
        peer_id: PeerId,
    },
}

/// A file being sent, shared by every recipient task.
#[derive(Debug)]
pub struct OutgoingFile {
    pub file_id: String,
    pub filename: String,
    pub mime: String,
    pub data: Bytes,
}

impl OutgoingFile {
    pub fn new(filename: impl Into<String>, data: Bytes) -> Self {
        let filename = filename.into();
        Self {
            file_id: Uuid::new_v4().to_string(),
            mime: guess_mime(&filename),
            filename,
            data,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn meta(&self, window: Option<u64>) -> ControlFrame {
        ControlFrame::FileMeta {
            filename: self.filename.clone(),
            size: self.size(),
            mime: self.mime.clone(),
            file_id: Some(self.file_id.clone()),
            window,
        }
    }

    pub fn end(&self) -> ControlFrame {
        ControlFrame::FileEnd {
            filename: self.filename.clone(),
            file_id: Some(self.file_id.clone()),
        }
    }

    pub fn cancel(&self) -> ControlFrame {
        ControlFrame::FileCancel {
            filename: self.filename.clone(),
            file_id: Some(self.file_id.clone()),
        }
    }
}

/// Byte ranges of the chunks of a `size`-byte file, in send order.
pub fn chunk_ranges(size: usize, chunk_size: usize) -> impl Iterator<Item = Range<usize>> {
    (0..size)
        .step_by(chunk_size.max(1))
        .map(move |start| start..(start + chunk_size).min(size))
}

/// `round(offset * 100 / size)`; an empty file is always 100%.
pub fn progress_percent(offset: u64, size: u64) -> u8 {
    if size == 0 {
        return 100;
    }
    let offset = offset.min(size) as u128;
    let size = size as u128;
    ((offset * 200 + size) / (size * 2)) as u8
}

/// Outcome of one recipient stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
}

/// Streams one [`OutgoingFile`] to one peer.
pub struct StreamTask {
    pub file: Arc<OutgoingFile>,
    pub peer_id: PeerId,
    pub channel: Arc<dyn DataChannel>,
    /// Bytes acknowledged by the receiver; `None` until the first ack.
    pub acks: watch::Receiver<Option<u64>>,
    /// Advertised in `FILE_META`; `None` disables window flow control.
    pub window: Option<u64>,
    pub stop: SignalOfStop,
    pub events: mpsc::UnboundedSender<TransferEvent>,
}

impl StreamTask {
    /// Run to completion and report the result as a [`TransferEvent`].
    pub async fn run(mut self) {
        let file_id = self.file.file_id.clone();
        let peer_id = self.peer_id.clone();
        let events = self.events.clone();

        match self.stream().await {
            Ok(StreamOutcome::Completed) => {
                info!(event = "upload_complete", file = %self.file.filename, peer = %peer_id, bytes = self.file.size(), "File sent");
            }
            Ok(StreamOutcome::Cancelled) => {
                info!(event = "upload_cancelled", file = %self.file.filename, peer = %peer_id, "Upload cancelled");
                let _ = events.send(TransferEvent::Cancelled { file_id, peer_id });
            }
            Err(e) => {
                warn!(event = "upload_failure", file = %self.file.filename, peer = %peer_id, error = %e, "Upload failed");
                let _ = events.send(TransferEvent::Failed {
                    file_id,
                    peer_id,
                    error: format!("{e:#}"),
                });
            }
        }
    }

    async fn stream(&mut self) -> Result<StreamOutcome> {
        // Cancelled while queued: the peer never saw this file.
        if self.stop.cancelled() {
            return Ok(StreamOutcome::Cancelled);
        }
        self.send_control(&self.file.meta(self.window)).await.context("sending FILE_META")?;

        let size = self.file.size();
        let mut last_progress = 0u8;

        for range in chunk_ranges(self.file.data.len(), CHUNK_SIZE) {
            if self.stop.cancelled() {
                return self.abort().await;
            }

            // 100 is reserved for the completion report.
            let progress = progress_percent(range.start as u64, size).min(99).max(last_progress);
            last_progress = progress;
            self.report(progress, false);

            let len = range.len();
            let sent_before = range.start as u64;
            if !self.wait_for_window(sent_before, len as u64).await? {
                return self.abort().await;
            }
            wait_for_buffer_space(self.channel.as_ref(), len).await?;

            let chunk = self.file.data.slice(range);
            self.channel
                .send_binary(chunk)
                .await
                .map_err(|e| anyhow!("sending chunk at offset {sent_before}: {e}"))?;

            tokio::task::yield_now().await;
        }

        if self.stop.cancelled() {
            return self.abort().await;
        }

        self.report(100, true);
        self.send_control(&self.file.end()).await.context("sending FILE_END")?;
        Ok(StreamOutcome::Completed)
    }

    /// Block while the receiver window is exhausted. Returns `false` when
    /// the upload was cancelled while waiting.
    async fn wait_for_window(&mut self, sent: u64, next: u64) -> Result<bool> {
        let Some(window) = self.window else {
            return Ok(true);
        };

        let deadline = tokio::time::Instant::now() + DC_BUFFER_DRAIN_TIMEOUT;
        loop {
            let in_flight = match *self.acks.borrow_and_update() {
                // Receivers that never ack are paced by the buffer watermark only.
                None => return Ok(true),
                Some(acked) => sent.saturating_sub(acked),
            };
            if in_flight + next <= window || in_flight == 0 {
                return Ok(true);
            }

            debug!(event = "upload_window_wait", peer = %self.peer_id, in_flight, window, "Waiting for receiver ack");
            tokio::select! {
                changed = self.acks.changed() => {
                    if changed.is_err() {
                        // Tracker dropped the record: cancelled.
                        return Ok(false);
                    }
                }
                _ = self.stop.wait() => return Ok(false),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(anyhow!("receiver stopped acknowledging ({in_flight} bytes in flight)"));
                }
            }
        }
    }

    async fn abort(&self) -> Result<StreamOutcome> {
        if let Err(e) = self.send_control(&self.file.cancel()).await {
            debug!(event = "upload_cancel_notify_failure", peer = %self.peer_id, error = %e, "Could not notify peer of cancellation");
        }
        Ok(StreamOutcome::Cancelled)
    }

    async fn send_control(&self, frame: &ControlFrame) -> Result<()> {
        let text = frame.encode()?;
        self.channel.send_text(text).await?;
        Ok(())
    }

    fn report(&self, progress: u8, complete: bool) {
        let _ = self.events.send(TransferEvent::Progress {
            file_id: self.file.file_id.clone(),
            peer_id: self.peer_id.clone(),
            progress,
            complete,
        });
    }
}

/// FIFO of uploads to one peer. A file's `FILE_META` goes out only after
/// the previous file's `FILE_END` (or `FILE_CANCEL`).
pub struct PeerOutbox {
    tx: mpsc::UnboundedSender<StreamTask>,
}

impl PeerOutbox {
    /// Start the worker. It drains whatever is queued and exits once the
    /// outbox is dropped.
    pub fn spawn(peer_id: PeerId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StreamTask>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                debug!(event = "upload_dequeued", peer = %peer_id, file = %task.file.filename, "Starting queued upload");
                task.run().await;
            }
            debug!(event = "upload_queue_closed", peer = %peer_id, "Upload queue closed");
        });
        Self { tx }
    }

    /// Queue a stream. Hands the task back if the worker is gone.
    pub fn push(&self, task: StreamTask) -> Result<(), StreamTask> {
        self.tx.send(task).map_err(|e| e.0)
    }
}

/// Wait until the channel's send buffer has room for `next_msg_size`
/// more bytes.
pub async fn wait_for_buffer_space(dc: &dyn DataChannel, next_msg_size: usize) -> Result<()> {
    let buffered = dc.buffered_amount().await;
    if buffered + next_msg_size <= DC_BUFFERED_AMOUNT_HIGH {
        return Ok(());
    }

    debug!(
        event = "upload_backpressure",
        buffered,
        next_msg = next_msg_size,
        high_watermark = DC_BUFFERED_AMOUNT_HIGH,
        "Applying backpressure - waiting for buffer to drain"
    );

    let deadline = tokio::time::Instant::now() + DC_BUFFER_DRAIN_TIMEOUT;
    loop {
        if !dc.is_open() {
            return Err(TransportError::ChannelClosed.into());
        }
        if dc.buffered_amount().await + next_msg_size <= DC_BUFFERED_AMOUNT_HIGH {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(DC_BUFFER_POLL_INTERVAL).await;
    }

    if dc.is_open() {
        let buffered = dc.buffered_amount().await;
        warn!(event = "upload_drain_timeout", buffered, "Buffer drain timeout - proceeding anyway");
        Ok(())
    } else {
        Err(TransportError::ChannelClosed.into())
    }
}
