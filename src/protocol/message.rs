//! Control messages sent by the device.
//!
//! Each control message is one line of text. Parsing trims surrounding
//! whitespace (the device may send `\r\n`) and never fails for unknown text;
//! only a malformed size announcement is a protocol error.
//!
//! # Example
//!
//! ```
//! use shutterwire::protocol::ControlMessage;
//!
//! let msg = ControlMessage::parse("PHOTO_DATA:48213").unwrap();
//! assert_eq!(msg, ControlMessage::PhotoData { size: 48213 });
//! assert_eq!(msg.to_line(), "PHOTO_DATA:48213\n");
//! ```

use super::wire_format::markers;
use crate::error::{Result, ShutterError};

/// A parsed control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Handshake accepted.
    Connected,
    /// Capture command acknowledged.
    CommandReceived,
    /// Capture done. `uri` is absent for the legacy bare form.
    PhotoTaken {
        /// Source identifier on the device.
        uri: Option<String>,
    },
    /// Size announcement; payload bytes follow.
    PhotoData {
        /// Declared payload length.
        size: u64,
    },
    /// Terminal sentinel.
    PhotoEnd,
    /// Heartbeat reply.
    Pong,
    /// Peer-side failure.
    Error(String),
    /// Anything else. Kept for logging; never fatal.
    Unknown(String),
}

impl ControlMessage {
    /// Parse a single control line.
    ///
    /// # Errors
    ///
    /// Returns [`ShutterError::Protocol`] if a `PHOTO_DATA:` size is not a
    /// decimal integer.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();

        match line {
            markers::CONNECTED => return Ok(ControlMessage::Connected),
            markers::COMMAND_RECEIVED => return Ok(ControlMessage::CommandReceived),
            markers::PONG => return Ok(ControlMessage::Pong),
            markers::PHOTO_TAKEN => return Ok(ControlMessage::PhotoTaken { uri: None }),
            "PHOTO_END" => return Ok(ControlMessage::PhotoEnd),
            _ => {}
        }

        if let Some(uri) = line.strip_prefix("PHOTO_TAKEN:") {
            let uri = uri.trim();
            return Ok(ControlMessage::PhotoTaken {
                uri: (!uri.is_empty()).then(|| uri.to_string()),
            });
        }

        if let Some(size) = line.strip_prefix("PHOTO_DATA:") {
            let size = parse_size(size.trim())?;
            return Ok(ControlMessage::PhotoData { size });
        }

        if let Some(message) = line.strip_prefix(markers::ERROR) {
            return Ok(ControlMessage::Error(message.trim().to_string()));
        }

        Ok(ControlMessage::Unknown(line.to_string()))
    }

    /// Parse a line that may start with keywords sent without a newline.
    ///
    /// The device writes `CONNECTED`, `COMMAND_RECEIVED` and `PONG` bare, so
    /// they can arrive glued to the front of the next line, e.g.
    /// `COMMAND_RECEIVEDPHOTO_TAKEN:content://media/7`.
    pub fn parse_line(line: &str) -> Vec<Result<Self>> {
        let mut rest = line.trim();
        let mut out = Vec::new();

        'outer: while !rest.is_empty() {
            for keyword in markers::BARE_KEYWORDS {
                if rest.len() > keyword.len() && rest.starts_with(keyword) {
                    out.push(Self::parse(keyword));
                    rest = rest[keyword.len()..].trim_start();
                    continue 'outer;
                }
            }
            out.push(Self::parse(rest));
            break;
        }

        out
    }

    /// Encode as a newline-terminated line (device side).
    pub fn to_line(&self) -> String {
        let mut line = self.to_string();
        line.push('\n');
        line
    }
}

impl std::fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMessage::Connected => f.write_str(markers::CONNECTED),
            ControlMessage::CommandReceived => f.write_str(markers::COMMAND_RECEIVED),
            ControlMessage::PhotoTaken { uri: Some(uri) } => write!(f, "PHOTO_TAKEN:{uri}"),
            ControlMessage::PhotoTaken { uri: None } => f.write_str(markers::PHOTO_TAKEN),
            ControlMessage::PhotoData { size } => write!(f, "PHOTO_DATA:{size}"),
            ControlMessage::PhotoEnd => f.write_str("PHOTO_END"),
            ControlMessage::Pong => f.write_str(markers::PONG),
            ControlMessage::Error(message) => write!(f, "{}{message}", markers::ERROR),
            ControlMessage::Unknown(line) => f.write_str(line),
        }
    }
}

/// Parse the decimal size of a `PHOTO_DATA:` announcement.
pub(crate) fn parse_size(digits: &str) -> Result<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ShutterError::Protocol(format!(
            "Invalid photo size: {digits:?}"
        )));
    }
    digits
        .parse::<u64>()
        .map_err(|e| ShutterError::Protocol(format!("Invalid photo size {digits:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keywords() {
        assert_eq!(ControlMessage::parse("CONNECTED").unwrap(), ControlMessage::Connected);
        assert_eq!(
            ControlMessage::parse("COMMAND_RECEIVED\r").unwrap(),
            ControlMessage::CommandReceived
        );
        assert_eq!(ControlMessage::parse(" PONG ").unwrap(), ControlMessage::Pong);
        assert_eq!(ControlMessage::parse("PHOTO_END").unwrap(), ControlMessage::PhotoEnd);
    }

    #[test]
    fn test_parse_photo_taken() {
        assert_eq!(
            ControlMessage::parse("PHOTO_TAKEN:content://media/7").unwrap(),
            ControlMessage::PhotoTaken {
                uri: Some("content://media/7".into())
            }
        );
        assert_eq!(
            ControlMessage::parse("PHOTO_TAKEN").unwrap(),
            ControlMessage::PhotoTaken { uri: None }
        );
        assert_eq!(
            ControlMessage::parse("PHOTO_TAKEN:").unwrap(),
            ControlMessage::PhotoTaken { uri: None }
        );
    }

    #[test]
    fn test_parse_photo_data() {
        assert_eq!(
            ControlMessage::parse("PHOTO_DATA:4").unwrap(),
            ControlMessage::PhotoData { size: 4 }
        );
        assert_eq!(
            ControlMessage::parse("PHOTO_DATA: 1024 ").unwrap(),
            ControlMessage::PhotoData { size: 1024 }
        );
    }

    #[test]
    fn test_parse_malformed_size_is_protocol_error() {
        for bad in ["PHOTO_DATA:", "PHOTO_DATA:abc", "PHOTO_DATA:-5", "PHOTO_DATA:1.5"] {
            let err = ControlMessage::parse(bad).unwrap_err();
            assert!(matches!(err, ShutterError::Protocol(_)), "{bad}");
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn test_parse_size_overflow() {
        let err = ControlMessage::parse("PHOTO_DATA:99999999999999999999999").unwrap_err();
        assert!(err.to_string().contains("Invalid photo size"));
    }

    #[test]
    fn test_parse_error_message() {
        assert_eq!(
            ControlMessage::parse("ERROR:capture failed - no camera").unwrap(),
            ControlMessage::Error("capture failed - no camera".into())
        );
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(
            ControlMessage::parse("HELLO_V2").unwrap(),
            ControlMessage::Unknown("HELLO_V2".into())
        );
    }

    #[test]
    fn test_parse_line_glued_keywords() {
        let parsed: Vec<_> = ControlMessage::parse_line("COMMAND_RECEIVEDPHOTO_TAKEN:content://media/7")
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            parsed,
            vec![
                ControlMessage::CommandReceived,
                ControlMessage::PhotoTaken {
                    uri: Some("content://media/7".into())
                },
            ]
        );
    }

    #[test]
    fn test_parse_line_repeated_bare_keywords() {
        let parsed: Vec<_> = ControlMessage::parse_line("CONNECTEDPONGPONG")
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            parsed,
            vec![
                ControlMessage::Connected,
                ControlMessage::Pong,
                ControlMessage::Pong
            ]
        );
    }

    #[test]
    fn test_parse_line_empty() {
        assert!(ControlMessage::parse_line("   ").is_empty());
    }

    #[test]
    fn test_to_line() {
        assert_eq!(ControlMessage::Connected.to_line(), "CONNECTED\n");
        assert_eq!(
            ControlMessage::Error("boom".into()).to_line(),
            "ERROR:boom\n"
        );
        assert_eq!(ControlMessage::PhotoData { size: 7 }.to_line(), "PHOTO_DATA:7\n");
    }
}
