//! Protocol module - wire format, control messages, and stream classification.
//!
//! This module implements the camera wire protocol:
//! - Control line parsing and outbound command encoding
//! - Stream classifier separating text from binary payload across reads
//! - Photo assembly buffer for one in-flight transfer

mod classifier;
mod message;
mod photo_buffer;
mod wire_format;

pub use classifier::{StreamClassifier, StreamEvent};
pub use message::ControlMessage;
pub use photo_buffer::PhotoAssembly;
pub use wire_format::{
    markers, Command, DEFAULT_MAX_LINE_LENGTH, DEFAULT_PORT, LINE_TERMINATOR, MAX_PREALLOCATION,
    MAX_SIZE_DIGITS,
};
