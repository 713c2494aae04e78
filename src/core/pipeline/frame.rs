//! Data-channel text frames.
//!
//! Text frames are JSON. Frames with a `type` of `FILE_META`, `FILE_END`,
//! `FILE_CANCEL` or `FILE_WINDOW` drive file transfers; any other object
//! with a `content` string is chat. Binary frames are raw chunk bytes and
//! never pass through here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ControlFrame {
    FileMeta {
        filename: String,
        size: u64,
        #[serde(default)]
        mime: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        /// Receive window the sender will honour once acked. Absent for
        /// peers without flow control.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window: Option<u64>,
    },
    FileEnd {
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
    },
    FileCancel {
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
    },
    /// Receiver → sender: total bytes received so far.
    FileWindow { file_id: String, received: u64 },
}

/// Peer-to-peer chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    pub content: String,
    /// Sender wall clock, milliseconds since the epoch.
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    Chat(ChatFrame),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed {kind} frame: {reason}")]
    Malformed { kind: String, reason: String },
    #[error("frame has neither a known type nor chat content")]
    Unrecognized,
}

const CONTROL_KINDS: [&str; 4] = ["FILE_META", "FILE_END", "FILE_CANCEL", "FILE_WINDOW"];

impl Frame {
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        if let Some(kind) = value.get("type").and_then(|t| t.as_str()) {
            if CONTROL_KINDS.contains(&kind) {
                let kind = kind.to_string();
                return serde_json::from_value(value)
                    .map(Frame::Control)
                    .map_err(|e| FrameError::Malformed {
                        kind,
                        reason: e.to_string(),
                    });
            }
        }

        if value.get("content").is_some_and(|c| c.is_string()) {
            return serde_json::from_value(value)
                .map(Frame::Chat)
                .map_err(|e| FrameError::Malformed {
                    kind: "chat".into(),
                    reason: e.to_string(),
                });
        }

        Err(FrameError::Unrecognized)
    }
}

impl ControlFrame {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ChatFrame {
    pub fn new(content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            content: content.into(),
            timestamp,
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn meta_wire_shape() {
        let meta = ControlFrame::FileMeta {
            filename: "a.bin".into(),
            size: 40000,
            mime: "application/octet-stream".into(),
            file_id: Some("f1".into()),
            window: Some(4096),
        };
        let value: serde_json::Value = serde_json::from_str(&meta.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "FILE_META",
                "filename": "a.bin",
                "size": 40000,
                "mime": "application/octet-stream",
                "fileId": "f1",
                "window": 4096
            })
        );
    }

    #[test]
    fn decodes_browser_frames() {
        // Legacy clients send no window and may omit fileId.
        let meta = Frame::decode(r#"{"type":"FILE_META","filename":"x.txt","size":3,"mime":"text/plain"}"#).unwrap();
        assert!(matches!(
            meta,
            Frame::Control(ControlFrame::FileMeta { file_id: None, window: None, .. })
        ));

        let end = Frame::decode(r#"{"type":"FILE_END","filename":"x.txt","fileId":"f"}"#).unwrap();
        assert_eq!(
            end,
            Frame::Control(ControlFrame::FileEnd {
                filename: "x.txt".into(),
                file_id: Some("f".into())
            })
        );

        let chat = Frame::decode(r#"{"content":"hi","timestamp":1700000000000}"#).unwrap();
        assert_eq!(chat, Frame::Chat(ChatFrame::new("hi", 1_700_000_000_000)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(Frame::decode("nope"), Err(FrameError::Json(_))));
        assert!(matches!(Frame::decode(r#"{"foo":1}"#), Err(FrameError::Unrecognized)));
        assert!(matches!(
            Frame::decode(r#"{"type":"FILE_WINDOW","fileId":"f"}"#),
            Err(FrameError::Malformed { .. })
        ));
    }
}
