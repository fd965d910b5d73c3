//! Configuration for sessions, photo storage and the device emulator.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Durations are written as (fractional) seconds:
//!
//! ```toml
//! [session]
//! address = "192.168.1.20:8080"
//! connect_timeout = 10
//! heartbeat_interval = 15
//! disconnect_grace = 0.1
//!
//! [store]
//! directory = "photos"
//!
//! [emulator]
//! bind = "0.0.0.0:8080"
//! omit_newlines = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{DEFAULT_MAX_LINE_LENGTH, DEFAULT_PORT};
use crate::session::DEFAULT_PROGRESS_STEP;
use crate::transport::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_READ_BUFFER_SIZE};
use crate::writer::DEFAULT_CHANNEL_CAPACITY;

/// Default wait between sending `DISCONNECT` and closing the socket.
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_millis(100);

/// Default file name prefix for stored photos.
pub const DEFAULT_PHOTO_PREFIX: &str = "photo";

/// Default URI prefix the emulator reports in `PHOTO_TAKEN`.
pub const DEFAULT_URI_PREFIX: &str = "content://media/external/images/media/";

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Controller session settings.
    pub session: SessionConfig,
    /// Where received photos are written.
    pub store: StoreConfig,
    /// Device emulator settings.
    pub emulator: EmulatorConfig,
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        tracing::debug!("Loaded config from {}", path.display());
        Self::from_toml_str(&text)
    }
}

/// Settings for one controller session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Device address, `host:port`. A bare host gets the default port.
    pub address: Option<String>,
    /// Bound on connection establishment.
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// Wait per read before the loop checks for commands and shutdown.
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// End the session after this long without data.
    #[serde(with = "opt_secs")]
    pub idle_timeout: Option<Duration>,
    /// Send `PING` this often while connected.
    #[serde(with = "opt_secs")]
    pub heartbeat_interval: Option<Duration>,
    /// Wait after `DISCONNECT` before closing.
    #[serde(with = "secs")]
    pub disconnect_grace: Duration,
    /// Read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Longest control line accepted without a newline.
    pub max_line_length: usize,
    /// Progress granularity in percent.
    pub progress_step: u8,
    /// Outbound command queue capacity.
    pub command_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_timeout: None,
            heartbeat_interval: None,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            progress_step: DEFAULT_PROGRESS_STEP,
            command_queue: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Photo storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory for received photos. Photos are not saved when unset.
    pub directory: Option<PathBuf>,
    /// File name prefix.
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: None,
            prefix: DEFAULT_PHOTO_PREFIX.to_string(),
        }
    }
}

/// Device emulator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmulatorConfig {
    /// Listen address.
    pub bind: String,
    /// Image served on capture. A small built-in JPEG when unset.
    pub photo: Option<PathBuf>,
    /// Prefix of the URI reported in `PHOTO_TAKEN`.
    pub uri_prefix: String,
    /// Send `CONNECTED`, `COMMAND_RECEIVED` and `PONG` without a newline.
    pub omit_newlines: bool,
    /// Write the payload in pieces of this many bytes.
    pub chunk_size: Option<usize>,
    /// Pause between payload pieces.
    #[serde(with = "secs")]
    pub chunk_delay: Duration,
    /// Pause between acknowledging and reporting the capture.
    #[serde(with = "secs")]
    pub capture_delay: Duration,
    /// Answer every capture with `ERROR:<message>` instead of a photo.
    pub fail_capture: Option<String>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            bind: format!("127.0.0.1:{DEFAULT_PORT}"),
            photo: None,
            uri_prefix: DEFAULT_URI_PREFIX.to_string(),
            omit_newlines: false,
            chunk_size: None,
            chunk_delay: Duration::ZERO,
            capture_delay: Duration::ZERO,
            fail_capture: None,
        }
    }
}

/// Append the default port to a bare host.
pub fn with_default_port(address: &str) -> String {
    let has_port = match address.rsplit_once(':') {
        // `[::1]:8080` or `host:8080`, but not a bare IPv6 literal.
        Some((host, port)) => {
            port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        address.to_string()
    } else if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{DEFAULT_PORT}")
    } else {
        format!("{address}:{DEFAULT_PORT}")
    }
}

/// Durations as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| de::Error::custom(format!("invalid duration {secs}: {e}")))
    }
}

/// Optional durations as fractional seconds.
mod opt_secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&value.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| {
                Duration::try_from_secs_f64(secs)
                    .map_err(|e| de::Error::custom(format!("invalid duration {secs}: {e}")))
            })
            .transpose()
    }
}
