//! Wire format constants and outbound commands.
//!
//! The stream carries newline-terminated ASCII control lines interleaved with
//! raw photo bytes. There is no outer envelope; a transfer looks like:
//! ```text
//! PHOTO_TAKEN:content://media/7\n
//! PHOTO_DATA:48213\n
//! ┌────────────────────────────┐
//! │ 48213 raw payload bytes    │
//! └────────────────────────────┘
//! PHOTO_END\n
//! ```
//!
//! Commands travel the other way as bare keywords with no terminator.

use bytes::Bytes;

/// Default TCP port the camera app listens on.
pub const DEFAULT_PORT: u16 = 8080;

/// Line terminator for control messages.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Default maximum length of a control line before it is dropped.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Maximum number of decimal digits accepted in a size announcement.
pub const MAX_SIZE_DIGITS: usize = 20;

/// Upper bound on buffer preallocation from an announced size (16 MB).
pub const MAX_PREALLOCATION: usize = 16 * 1024 * 1024;

/// Byte patterns scanned for inside binary data.
pub mod markers {
    /// Terminal sentinel of a photo payload.
    pub const PHOTO_END: &[u8] = b"PHOTO_END";
    /// Size announcement prefix, followed by decimal digits and a newline.
    pub const PHOTO_DATA: &[u8] = b"PHOTO_DATA:";

    /// Handshake accepted.
    pub const CONNECTED: &str = "CONNECTED";
    /// Capture command acknowledged.
    pub const COMMAND_RECEIVED: &str = "COMMAND_RECEIVED";
    /// Capture done; optional `:<uri>` suffix.
    pub const PHOTO_TAKEN: &str = "PHOTO_TAKEN";
    /// Heartbeat reply.
    pub const PONG: &str = "PONG";
    /// Peer-side failure prefix.
    pub const ERROR: &str = "ERROR:";

    /// Keywords the device may send without a trailing newline.
    pub const BARE_KEYWORDS: [&str; 4] = [CONNECTED, COMMAND_RECEIVED, PONG, "PHOTO_END"];

    /// Find the first occurrence of `needle` in `haystack`.
    #[inline]
    pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || haystack.len() < needle.len() {
            return None;
        }
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Length of the longest suffix of `data` that is a proper prefix of `marker`.
    ///
    /// These bytes may be the start of a marker split across reads and must be
    /// held back until the next read decides them.
    pub fn partial_suffix(data: &[u8], marker: &[u8]) -> usize {
        let max = data.len().min(marker.len() - 1);
        (1..=max)
            .rev()
            .find(|&n| data[data.len() - n..] == marker[..n])
            .unwrap_or(0)
    }
}

/// Commands sent from the controller to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Request a capture.
    TakePhoto,
    /// Heartbeat.
    Ping,
    /// Graceful close notice.
    Disconnect,
}

impl Command {
    /// All commands, in the order the device's scanner tries them.
    pub const ALL: [Command; 3] = [Command::TakePhoto, Command::Ping, Command::Disconnect];

    /// Keyword as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::TakePhoto => "TAKE_PHOTO",
            Command::Ping => "PING",
            Command::Disconnect => "DISCONNECT",
        }
    }

    /// Encode for writing. Commands are bare keywords with no terminator.
    #[inline]
    pub fn encode(&self) -> Bytes {
        Bytes::from_static(self.as_str().as_bytes())
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
