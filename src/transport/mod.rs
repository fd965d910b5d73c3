//! Transport module - TCP connection to the device.
//!
//! Provides:
//! - Bounded-time connect with refused/timeout mapped to typed errors
//! - Chunk reader with a poll interval and optional idle bound

mod tcp;

pub use tcp::{
    connect, ChunkReader, ReadOutcome, DEFAULT_CONNECT_TIMEOUT, DEFAULT_POLL_INTERVAL,
    DEFAULT_READ_BUFFER_SIZE,
};
