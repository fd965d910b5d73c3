//! Events surfaced to session consumers.

use std::path::PathBuf;

use bytes::Bytes;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// A photo that finished transferring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPhoto {
    /// Image bytes, exactly as received.
    pub bytes: Bytes,
    /// Source identifier reported by `PHOTO_TAKEN`.
    pub uri: Option<String>,
    /// Size from the `PHOTO_DATA` announcement.
    pub declared_size: Option<u64>,
    /// Where the photo store saved it, if a store is configured.
    pub path: Option<PathBuf>,
}

impl CompletedPhoto {
    /// Number of bytes received.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if no bytes were received.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the received length equals the announced size.
    ///
    /// Missing announcements count as a match.
    pub fn size_matches(&self) -> bool {
        self.declared_size
            .map_or(true, |declared| declared == self.bytes.len() as u64)
    }

    /// Whether the bytes start with a JPEG SOI marker and end with EOI.
    pub fn looks_like_jpeg(&self) -> bool {
        self.bytes.len() >= 4
            && self.bytes.starts_with(&[0xFF, 0xD8])
            && self.bytes.ends_with(&[0xFF, 0xD9])
    }
}

impl Serialize for CompletedPhoto {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CompletedPhoto", 5)?;
        state.serialize_field("uri", &self.uri)?;
        state.serialize_field("declared_size", &self.declared_size)?;
        state.serialize_field("received_size", &self.bytes.len())?;
        state.serialize_field("path", &self.path)?;
        state.serialize_field("looks_like_jpeg", &self.looks_like_jpeg())?;
        state.end()
    }
}

/// Notification from the receive loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Handshake completed.
    Connected,
    /// Session ended. Emitted exactly once per session.
    Disconnected {
        /// Why the session ended.
        reason: String,
    },
    /// A photo transfer completed.
    PhotoReceived(CompletedPhoto),
    /// Device-reported or transport failure.
    Error {
        /// Human-readable description.
        message: String,
    },
    /// Recoverable anomaly (size mismatch, undecodable bytes).
    Warning {
        /// Human-readable description.
        message: String,
    },
    /// Informational message.
    Log {
        /// Human-readable description.
        message: String,
    },
    /// Transfer progress in whole percent.
    Progress {
        /// 0 to 100.
        percent: u8,
    },
    /// `PONG` received.
    HeartbeatAck,
}

impl SessionEvent {
    pub(crate) fn error(message: impl Into<String>) -> Self {
        SessionEvent::Error {
            message: message.into(),
        }
    }

    pub(crate) fn warning(message: impl Into<String>) -> Self {
        SessionEvent::Warning {
            message: message.into(),
        }
    }

    pub(crate) fn log(message: impl Into<String>) -> Self {
        SessionEvent::Log {
            message: message.into(),
        }
    }

    pub(crate) fn disconnected(reason: impl Into<String>) -> Self {
        SessionEvent::Disconnected {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo(bytes: &'static [u8], declared: Option<u64>) -> CompletedPhoto {
        CompletedPhoto {
            bytes: Bytes::from_static(bytes),
            uri: Some("content://media/7".into()),
            declared_size: declared,
            path: None,
        }
    }

    #[test]
    fn test_looks_like_jpeg() {
        assert!(photo(&[0xFF, 0xD8, 0xFF, 0xD9], Some(4)).looks_like_jpeg());
        assert!(!photo(&[0x89, b'P', b'N', b'G'], Some(4)).looks_like_jpeg());
        assert!(!photo(&[0xFF, 0xD9], Some(2)).looks_like_jpeg());
    }

    #[test]
    fn test_size_matches() {
        assert!(photo(b"abcd", Some(4)).size_matches());
        assert!(!photo(b"abcd", Some(5)).size_matches());
        assert!(photo(b"abcd", None).size_matches());
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(SessionEvent::Progress { percent: 40 }).unwrap();
        assert_eq!(json, serde_json::json!({"event": "progress", "percent": 40}));

        let json = serde_json::to_value(SessionEvent::HeartbeatAck).unwrap();
        assert_eq!(json, serde_json::json!({"event": "heartbeat_ack"}));
    }

    #[test]
    fn test_photo_json_omits_bytes() {
        let event = SessionEvent::PhotoReceived(photo(&[0xFF, 0xD8, 0xFF, 0xD9], Some(4)));
        let json = serde_json::to_value(event).unwrap();

        assert_eq!(json["event"], "photo_received");
        assert_eq!(json["uri"], "content://media/7");
        assert_eq!(json["received_size"], 4);
        assert_eq!(json["looks_like_jpeg"], true);
        assert!(json.get("bytes").is_none());
    }
}
