//! Error types for shutterwire.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all shutterwire operations.
#[derive(Debug, Error)]
pub enum ShutterError {
    /// I/O error during socket or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device did not accept the connection in time.
    #[error("Connection to {addr} timed out after {timeout:?}; check the device address and network")]
    ConnectTimeout {
        /// Address we tried to reach.
        addr: String,
        /// Bound that expired.
        timeout: Duration,
    },

    /// The device actively refused the connection.
    #[error("Connection to {0} refused; is the camera app running?")]
    ConnectionRefused(String),

    /// Connection closed by the peer or torn down locally.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No bytes arrived within the configured idle bound.
    #[error("No data received for {0:?}")]
    IdleTimeout(Duration),

    /// Protocol error (malformed size field, overlong line, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation needs a live connection.
    #[error("Not connected to a device")]
    NotConnected,

    /// A session is already live; a second connect is rejected.
    #[error("A device session is already active; disconnect first")]
    SessionActive,

    /// The command queue is full; the writer cannot keep up with the peer.
    #[error("Command queue is full")]
    Backpressure,

    /// A capture is already outstanding.
    #[error("A photo capture is already in progress")]
    CaptureInProgress,

    /// Configuration file could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// JSON serialization error (event output).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShutterError {
    /// Whether this error ends the session it occurred in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShutterError::Io(_)
                | ShutterError::ConnectTimeout { .. }
                | ShutterError::ConnectionRefused(_)
                | ShutterError::ConnectionClosed
                | ShutterError::IdleTimeout(_)
        )
    }
}

/// Result type alias using ShutterError.
pub type Result<T> = std::result::Result<T, ShutterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_fatal() {
        assert!(ShutterError::ConnectionClosed.is_fatal());
        assert!(ShutterError::IdleTimeout(Duration::from_secs(1)).is_fatal());
        assert!(ShutterError::ConnectionRefused("127.0.0.1:8080".into()).is_fatal());
    }

    #[test]
    fn test_protocol_errors_are_not_fatal() {
        assert!(!ShutterError::Protocol("bad size".into()).is_fatal());
        assert!(!ShutterError::NotConnected.is_fatal());
        assert!(!ShutterError::CaptureInProgress.is_fatal());
    }

    #[test]
    fn test_messages_are_human_readable() {
        let err = ShutterError::ConnectTimeout {
            addr: "10.0.0.5:8080".into(),
            timeout: Duration::from_secs(10),
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.5:8080"));
        assert!(msg.contains("timed out"));
    }
}
