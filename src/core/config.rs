//! Centralized configuration constants for blazeit.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format names (envelope kinds, data-channel frame
//! types) stay in their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Fixed chunk size in bytes (16 KiB).
///
/// Every binary data-channel message carries at most this many bytes. 16 KiB
/// is the largest message size every WebRTC stack accepts without
/// negotiating `a=max-message-size`, so browsers on the other end of the
/// channel can read the chunks too.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// High water mark for the data channel SCTP send buffer (bytes).
/// When `buffered_amount` exceeds this value the sender pauses chunk
/// transmission until the buffer drains.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

/// Poll interval while waiting for the SCTP send buffer to drain.
pub const DC_BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Give up on a recipient whose send buffer stays above the watermark
/// for this long.
pub const DC_BUFFER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Receive window advertised in `FILE_META`: the maximum number of bytes a
/// sender may have in flight beyond the receiver's last `FILE_WINDOW` ack.
pub const RECEIVER_WINDOW_BYTES: u64 = 4 * 1024 * 1024;

/// The receiver acknowledges progress every time this many additional bytes
/// have arrived for a flow-controlled transfer.
pub const RECEIVER_ACK_INTERVAL_BYTES: u64 = 1024 * 1024;

// ── Completion de-duplication ────────────────────────────────────────────────

/// Lifetime of a file completion marker. A second `FILE_END` for the same
/// (sender, transfer) inside this window is dropped.
pub const COMPLETION_DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Maximum completion markers remembered (least recently used are evicted).
pub const COMPLETION_DEDUP_CAPACITY: usize = 256;

// ── Message log ──────────────────────────────────────────────────────────────

/// Two chat messages with identical author and content closer than this
/// (milliseconds) are treated as the same message.
pub const CHAT_DEDUP_WINDOW_MS: i64 = 1000;

/// Author name used for system notifications.
pub const SYSTEM_AUTHOR: &str = "SYSTEM";

// ── Connection / Network ─────────────────────────────────────────────────────

/// Label of the single ordered, reliable data channel opened per peer.
pub const DATA_CHANNEL_LABEL: &str = "chat";

/// Default relay endpoint.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8080/ws";

/// Default ICE server used when none is configured.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// A peer session still negotiating after this long is abandoned.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

// ── Signaling reconnect ──────────────────────────────────────────────────────

/// Maximum reconnect attempts after the relay connection drops.
pub const RECONNECT_MAX_RETRIES: u32 = 5;

/// Delays (in seconds) between reconnect attempts after a drop.
pub const RECONNECT_RETRY_DELAYS: [u64; 5] = [1, 2, 5, 10, 30];

/// Upper bound of the random jitter added to each reconnect delay.
pub const RECONNECT_JITTER_MS: u64 = 250;

// ── Persistence ──────────────────────────────────────────────────────────────

/// Storage key for the remembered username.
pub const STORE_KEY_USERNAME: &str = "blazeit_username";

/// Storage key for the remembered room.
pub const STORE_KEY_ROOM: &str = "blazeit_roomId";
