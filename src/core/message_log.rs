//! Append-only message log: chat, system notices and file records.
//!
//! Dedup rules:
//! - text: same author and content within [`CHAT_DEDUP_WINDOW_MS`];
//! - files: same `(fileId, filename, author)`.

use crate::core::config::{CHAT_DEDUP_WINDOW_MS, SYSTEM_AUTHOR};
use bytes::Bytes;
use std::path::PathBuf;
use tracing::warn;
use uuid::Uuid;

/// Where the bytes of a file message live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileHandle {
    Path(PathBuf),
    Memory(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: String,
    pub filename: String,
    pub mime: String,
    pub size: u64,
    pub own: bool,
    pub handle: FileHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Chat { own: bool },
    System,
    File(FileRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub author: String,
    pub content: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub kind: MessageKind,
}

impl Message {
    fn new(author: impl Into<String>, content: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            author: author.into(),
            content: content.into(),
            timestamp: now_ms(),
            kind,
        }
    }

    pub fn chat(author: impl Into<String>, content: impl Into<String>, own: bool) -> Self {
        Self::new(author, content, MessageKind::Chat { own })
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(SYSTEM_AUTHOR, content, MessageKind::System)
    }

    pub fn file(author: impl Into<String>, content: impl Into<String>, record: FileRecord) -> Self {
        Self::new(author, content, MessageKind::File(record))
    }

    #[cfg(test)]
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_system(&self) -> bool {
        matches!(self.kind, MessageKind::System)
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless it duplicates an earlier message. Returns the stored
    /// message.
    pub fn append(&mut self, message: Message) -> Option<&Message> {
        if self.is_duplicate(&message) {
            return None;
        }
        if message.is_system() {
            warn!(event = "system_notice", notice = %message.content, "System message");
        }
        self.messages.push(message);
        self.messages.last()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn is_duplicate(&self, message: &Message) -> bool {
        match &message.kind {
            MessageKind::File(record) => self.messages.iter().any(|m| match &m.kind {
                MessageKind::File(r) => {
                    r.file_id == record.file_id
                        && r.filename == record.filename
                        && m.author == message.author
                }
                _ => false,
            }),
            _ => self.messages.iter().rev().any(|m| {
                !matches!(m.kind, MessageKind::File(_))
                    && m.content == message.content
                    && m.author == message.author
                    && (m.timestamp - message.timestamp).abs() < CHAT_DEDUP_WINDOW_MS
            }),
        }
    }
}
