//! Stream classifier: splits raw reads into control messages and payload.
//!
//! Reads from the socket have arbitrary boundaries. A control line, a size
//! announcement's digits, or the `PHOTO_END` sentinel can all be split across
//! two reads, and text can share a read with binary payload. The classifier
//! keeps a carry-over `BytesMut` and a lexical mode:
//! - `Text`: decode line by line as UTF-8. A `PHOTO_DATA:<n>` line switches to
//!   `Payload`. Lines that are not UTF-8 are binary noise; the classifier
//!   resynchronises on the next size announcement. A buffer that starts with a
//!   bare keyword (`CONNECTED`, `COMMAND_RECEIVED`, `PONG`, `PHOTO_END`) is
//!   emitted without waiting for its newline, since the device often omits
//!   it. As a consequence an unknown line that begins with a keyword and is
//!   split right after it (`PONG` then `_V2\n`) comes out as the keyword
//!   followed by an unknown `_V2`.
//! - `Payload`: everything is photo bytes until `PHOTO_END` (switch back to
//!   `Text`) or a new `PHOTO_DATA:<n>\n` (a fresh transfer). A trailing suffix
//!   that could be the start of either marker is held back until the next read.
//!
//! # Example
//!
//! ```
//! use shutterwire::protocol::{ControlMessage, StreamClassifier, StreamEvent};
//!
//! let mut classifier = StreamClassifier::new();
//!
//! let events = classifier.push(b"PHOTO_DATA:4\n\xff\xd8\xff\xd9PH");
//! assert_eq!(events.len(), 2);
//!
//! let events = classifier.push(b"OTO_END\n");
//! assert_eq!(events, vec![StreamEvent::Message(ControlMessage::PhotoEnd)]);
//! ```

use bytes::{Bytes, BytesMut};

use super::message::{parse_size, ControlMessage};
use super::wire_format::{
    markers, DEFAULT_MAX_LINE_LENGTH, LINE_TERMINATOR, MAX_SIZE_DIGITS,
};

/// One classified unit of the stream, in source byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A recognised control line.
    Message(ControlMessage),
    /// Photo payload bytes for the current transfer.
    Payload(Bytes),
    /// A control line that could not be parsed.
    Malformed {
        /// The offending line, lossily decoded.
        line: String,
        /// Human-readable cause.
        reason: String,
    },
    /// Binary bytes outside any transfer, discarded.
    Undecodable {
        /// Number of bytes dropped.
        len: usize,
    },
}

/// Lexical mode of the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Expecting newline-terminated control lines.
    Text,
    /// Inside a photo payload.
    Payload,
}

/// Outcome of inspecting a `PHOTO_DATA:` match inside payload.
enum Announcement {
    /// Valid announcement occupying `len` bytes including the terminator.
    Complete { size: u64, len: usize },
    /// Digits so far are plausible but the terminator has not arrived.
    Pending,
    /// The match is coincidental payload.
    NotAnnouncement,
}

/// Buffer that turns arbitrary reads into [`StreamEvent`]s.
#[derive(Debug)]
pub struct StreamClassifier {
    /// Bytes not yet classified.
    buffer: BytesMut,
    /// Current lexical mode.
    mode: Mode,
    /// Longest newline-less text accepted before it is dropped.
    max_line_length: usize,
}

impl StreamClassifier {
    /// Create a classifier with default limits.
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Create a classifier with a custom line length limit.
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            mode: Mode::Text,
            max_line_length,
        }
    }

    /// Push one read and return every event it completes.
    ///
    /// Bytes that cannot be classified yet (a partial line, a partial marker)
    /// stay buffered for the next push.
    pub fn push(&mut self, data: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(data);

        let mut events = Vec::new();

        loop {
            let progressed = match self.mode {
                Mode::Text => self.extract_text(&mut events),
                Mode::Payload => self.extract_payload(&mut events),
            };
            if !progressed {
                break;
            }
        }

        if self.mode == Mode::Text {
            self.flush_bare_keywords(&mut events);
        }

        events
    }

    /// Classify a pending text fragment after the stream went quiet.
    ///
    /// `ERROR:<msg>` is the one line the device sends without a newline. Once a
    /// read times out, a buffered `ERROR:` fragment is taken as complete. Any
    /// other fragment is a line stalled mid-flight and stays buffered for the
    /// next read.
    pub fn flush_idle(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.mode != Mode::Text || self.buffer.is_empty() {
            return events;
        }

        let Ok(text) = std::str::from_utf8(&self.buffer) else {
            return events;
        };
        if !text.trim_start().starts_with(markers::ERROR) {
            return events;
        }

        let text = text.to_string();
        self.buffer.clear();
        self.emit_line(&text, &mut events);
        events
    }

    /// Whether the classifier is inside a photo payload.
    #[inline]
    pub fn in_payload(&self) -> bool {
        self.mode == Mode::Payload
    }

    /// Number of buffered, unclassified bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop buffered bytes and return to text mode.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.mode = Mode::Text;
    }

    /// Extract one line (or skip one run of binary) in text mode.
    fn extract_text(&mut self, events: &mut Vec<StreamEvent>) -> bool {
        if self.buffer.is_empty() {
            return false;
        }

        let newline = self.buffer.iter().position(|&b| b == LINE_TERMINATOR);
        let end = newline.unwrap_or(self.buffer.len());

        match std::str::from_utf8(&self.buffer[..end]) {
            Ok(_) => match newline {
                Some(pos) => {
                    let line = self.buffer.split_to(pos + 1);
                    let text = String::from_utf8_lossy(&line[..pos]);
                    self.emit_line(&text, events);
                    true
                }
                None if self.buffer.len() > self.max_line_length => {
                    let line = self.buffer.split();
                    events.push(StreamEvent::Malformed {
                        line: String::from_utf8_lossy(&line[..64.min(line.len())]).into_owned(),
                        reason: format!(
                            "line exceeds {} bytes without a terminator",
                            self.max_line_length
                        ),
                    });
                    true
                }
                None => false,
            },
            // Truncated multi-byte character at the end of a partial line.
            Err(e)
                if e.error_len().is_none()
                    && newline.is_none()
                    && self.buffer.len() <= self.max_line_length =>
            {
                false
            }
            Err(e) => self.skip_binary(e.valid_up_to(), newline, events),
        }
    }

    /// Discard binary bytes outside a transfer up to the next size
    /// announcement, or to the end of the offending line.
    fn skip_binary(
        &mut self,
        invalid_at: usize,
        newline: Option<usize>,
        events: &mut Vec<StreamEvent>,
    ) -> bool {
        let limit = newline.map_or(self.buffer.len(), |pos| pos + 1);
        let region = &self.buffer[invalid_at..limit];

        let drop = match markers::find(region, markers::PHOTO_DATA) {
            Some(offset) => invalid_at + offset,
            None if newline.is_some() => limit,
            None => limit - markers::partial_suffix(region, markers::PHOTO_DATA),
        };

        if drop == 0 {
            return false;
        }

        let _ = self.buffer.split_to(drop);
        events.push(StreamEvent::Undecodable { len: drop });
        true
    }

    /// Extract payload up to the next marker in payload mode.
    fn extract_payload(&mut self, events: &mut Vec<StreamEvent>) -> bool {
        if self.buffer.is_empty() {
            return false;
        }

        let mut from = 0;
        loop {
            let end = markers::find(&self.buffer[from..], markers::PHOTO_END).map(|i| i + from);
            // Only an announcement that precedes the sentinel matters.
            let announce = markers::find(&self.buffer[from..], markers::PHOTO_DATA)
                .map(|i| i + from)
                .filter(|&a| end.map_or(true, |e| a < e));

            match (end, announce) {
                (_, Some(at)) => match self.announcement_at(at) {
                    Announcement::Complete { size, len } => {
                        self.emit_payload(at, events);
                        let _ = self.buffer.split_to(len);
                        events.push(StreamEvent::Message(ControlMessage::PhotoData { size }));
                        return true;
                    }
                    Announcement::Pending => {
                        self.emit_payload(at, events);
                        return false;
                    }
                    Announcement::NotAnnouncement => {
                        from = at + 1;
                    }
                },
                (Some(end), None) => {
                    self.emit_payload(end, events);
                    let _ = self.buffer.split_to(markers::PHOTO_END.len());
                    if self.buffer.first() == Some(&LINE_TERMINATOR) {
                        let _ = self.buffer.split_to(1);
                    }
                    self.mode = Mode::Text;
                    events.push(StreamEvent::Message(ControlMessage::PhotoEnd));
                    return true;
                }
                (None, None) => {
                    let hold = markers::partial_suffix(&self.buffer, markers::PHOTO_END)
                        .max(markers::partial_suffix(&self.buffer, markers::PHOTO_DATA));
                    let len = self.buffer.len() - hold;
                    self.emit_payload(len, events);
                    return false;
                }
            }
        }
    }

    /// Inspect a `PHOTO_DATA:` match at `at` inside payload.
    fn announcement_at(&self, at: usize) -> Announcement {
        let digits_start = at + markers::PHOTO_DATA.len();
        let tail = &self.buffer[digits_start..];
        let digits = tail.iter().take_while(|b| b.is_ascii_digit()).count();

        if digits > MAX_SIZE_DIGITS {
            return Announcement::NotAnnouncement;
        }

        let terminator_len = match (tail.get(digits), tail.get(digits + 1)) {
            (None, _) => return Announcement::Pending,
            (Some(&LINE_TERMINATOR), _) => 1,
            (Some(b'\r'), None) => return Announcement::Pending,
            (Some(b'\r'), Some(&LINE_TERMINATOR)) => 2,
            _ => return Announcement::NotAnnouncement,
        };

        if digits == 0 {
            return Announcement::NotAnnouncement;
        }

        let Ok(text) = std::str::from_utf8(&tail[..digits]) else {
            return Announcement::NotAnnouncement;
        };
        match parse_size(text) {
            Ok(size) => Announcement::Complete {
                size,
                len: markers::PHOTO_DATA.len() + digits + terminator_len,
            },
            Err(_) => Announcement::NotAnnouncement,
        }
    }

    /// Emit the first `len` buffered bytes as payload.
    fn emit_payload(&mut self, len: usize, events: &mut Vec<StreamEvent>) {
        if len > 0 {
            events.push(StreamEvent::Payload(self.buffer.split_to(len).freeze()));
        }
    }

    /// Parse one complete text line into events.
    fn emit_line(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        for parsed in ControlMessage::parse_line(text) {
            match parsed {
                Ok(message) => {
                    if matches!(message, ControlMessage::PhotoData { .. }) {
                        self.mode = Mode::Payload;
                    }
                    events.push(StreamEvent::Message(message));
                }
                Err(e) => events.push(StreamEvent::Malformed {
                    line: text.trim().to_string(),
                    reason: e.to_string(),
                }),
            }
        }
    }

    /// Emit keywords the device sends without a newline.
    ///
    /// None of them is a prefix of any other message, so a carry buffer that
    /// starts with one can be classified immediately.
    fn flush_bare_keywords(&mut self, events: &mut Vec<StreamEvent>) {
        loop {
            let skip = self
                .buffer
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            let rest = &self.buffer[skip..];

            let Some(keyword) = markers::BARE_KEYWORDS
                .into_iter()
                .find(|k| rest.starts_with(k.as_bytes()))
            else {
                return;
            };

            let _ = self.buffer.split_to(skip + keyword.len());
            match ControlMessage::parse(keyword) {
                Ok(message) => events.push(StreamEvent::Message(message)),
                Err(e) => tracing::debug!("Unparseable bare keyword {keyword}: {e}"),
            }
        }
    }

    /// Get the current mode for debugging.
    #[cfg(test)]
    fn mode_name(&self) -> &'static str {
        match self.mode {
            Mode::Text => "Text",
            Mode::Payload => "Payload",
        }
    }
}

impl Default for StreamClassifier {
    fn default() -> Self {
        Self::new()
    }
}
