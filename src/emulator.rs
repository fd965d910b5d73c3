//! Device emulator: a TCP server that plays the camera.
//!
//! Useful for exercising controllers without hardware. The emulator speaks the
//! device side of the protocol:
//! - `CONNECTED` on accept
//! - `TAKE_PHOTO` → `COMMAND_RECEIVED`, `PHOTO_TAKEN:<uri>`, `PHOTO_DATA:<n>`,
//!   payload, `PHOTO_END`
//! - `PING` → `PONG`
//! - `DISCONNECT` → close
//!
//! Like the real device it serves one controller at a time; a newer
//! connection replaces the current one.
//!
//! # Example
//!
//! ```ignore
//! use shutterwire::{config::EmulatorConfig, emulator::DeviceEmulator};
//!
//! let emulator = DeviceEmulator::bind(EmulatorConfig::default()).await?;
//! println!("listening on {}", emulator.local_addr()?);
//! emulator.run().await?;
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::config::EmulatorConfig;
use crate::error::Result;
use crate::protocol::{markers, Command, ControlMessage};

/// Size of the built-in sample photo.
pub const SAMPLE_PHOTO_SIZE: usize = 32 * 1024;

/// TCP server emulating the camera device.
pub struct DeviceEmulator {
    listener: TcpListener,
    config: Arc<EmulatorConfig>,
    photo: Bytes,
    captures: Arc<AtomicU64>,
}

impl DeviceEmulator {
    /// Bind the listen address and load the photo to serve.
    pub async fn bind(config: EmulatorConfig) -> Result<Self> {
        let photo = match &config.photo {
            Some(path) => Bytes::from(tokio::fs::read(path).await?),
            None => sample_photo(SAMPLE_PHOTO_SIZE),
        };
        let listener = TcpListener::bind(&config.bind).await?;

        Ok(Self {
            listener,
            config: Arc::new(config),
            photo,
            captures: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Serve `photo` on every capture instead of the configured one.
    pub fn with_photo(mut self, photo: impl Into<Bytes>) -> Self {
        self.photo = photo.into();
        self
    }

    /// Address the emulator is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Photo served on capture.
    pub fn photo(&self) -> &Bytes {
        &self.photo
    }

    /// Accept controllers until the task is dropped or accept fails.
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            "Emulator listening on {} ({} byte photo)",
            self.listener.local_addr()?,
            self.photo.len()
        );

        let mut current: Option<JoinHandle<()>> = None;

        loop {
            let (stream, peer) = self.listener.accept().await?;
            tracing::info!("Controller connected from {peer}");

            if let Some(previous) = current.take() {
                if !previous.is_finished() {
                    tracing::info!("Replacing previous controller connection");
                    previous.abort();
                }
            }

            let connection = Connection {
                config: self.config.clone(),
                photo: self.photo.clone(),
                captures: self.captures.clone(),
            };
            current = Some(tokio::spawn(async move {
                match connection.serve(stream).await {
                    Ok(()) => tracing::info!("Controller {peer} disconnected"),
                    Err(e) => tracing::warn!("Controller {peer} connection failed: {e}"),
                }
            }));
        }
    }
}

/// One accepted controller connection.
struct Connection {
    config: Arc<EmulatorConfig>,
    photo: Bytes,
    captures: Arc<AtomicU64>,
}

impl Connection {
    async fn serve(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        self.keyword(&mut writer, &ControlMessage::Connected).await?;

        let mut scanner = CommandScanner::new();
        let mut buf = vec![0u8; 1024];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }

            for command in scanner.push(&buf[..n]) {
                tracing::debug!("Emulator received {command}");
                match command {
                    Command::TakePhoto => self.capture(&mut writer).await?,
                    Command::Ping => self.keyword(&mut writer, &ControlMessage::Pong).await?,
                    Command::Disconnect => return Ok(()),
                }
            }
        }
    }

    /// Acknowledge, then deliver a photo or an error.
    async fn capture(&self, writer: &mut OwnedWriteHalf) -> Result<()> {
        self.keyword(writer, &ControlMessage::CommandReceived).await?;

        if !self.config.capture_delay.is_zero() {
            tokio::time::sleep(self.config.capture_delay).await;
        }

        if let Some(message) = &self.config.fail_capture {
            return self
                .keyword(writer, &ControlMessage::Error(message.clone()))
                .await;
        }

        let id = self.captures.fetch_add(1, Ordering::Relaxed) + 1;
        let taken = ControlMessage::PhotoTaken {
            uri: Some(format!("{}{id}", self.config.uri_prefix)),
        };
        let announce = ControlMessage::PhotoData {
            size: self.photo.len() as u64,
        };
        writer.write_all(taken.to_line().as_bytes()).await?;
        writer.write_all(announce.to_line().as_bytes()).await?;

        match self.config.chunk_size {
            Some(size) if size > 0 => {
                for piece in self.photo.chunks(size) {
                    writer.write_all(piece).await?;
                    writer.flush().await?;
                    if !self.config.chunk_delay.is_zero() {
                        tokio::time::sleep(self.config.chunk_delay).await;
                    }
                }
            }
            _ => writer.write_all(&self.photo).await?,
        }

        writer
            .write_all(ControlMessage::PhotoEnd.to_line().as_bytes())
            .await?;
        writer.flush().await?;

        tracing::debug!("Emulator sent photo {id} ({} bytes)", self.photo.len());
        Ok(())
    }

    /// Write a short message, with or without its newline.
    async fn keyword(&self, writer: &mut OwnedWriteHalf, message: &ControlMessage) -> Result<()> {
        let line = if self.config.omit_newlines {
            message.to_string()
        } else {
            message.to_line()
        };
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Finds command keywords in a stream that may glue or split them.
#[derive(Debug, Default)]
struct CommandScanner {
    buffer: BytesMut,
}

impl CommandScanner {
    fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, data: &[u8]) -> Vec<Command> {
        self.buffer.extend_from_slice(data);
        let mut commands = Vec::new();

        loop {
            let next = Command::ALL
                .iter()
                .filter_map(|c| {
                    markers::find(&self.buffer, c.as_str().as_bytes()).map(|at| (at, *c))
                })
                .min_by_key(|(at, _)| *at);
            let Some((at, command)) = next else {
                break;
            };

            if at > 0 {
                tracing::debug!("Emulator ignoring {at} stray bytes");
            }
            let _ = self.buffer.split_to(at + command.as_str().len());
            commands.push(command);
        }

        let keep = Command::ALL
            .iter()
            .map(|c| markers::partial_suffix(&self.buffer, c.as_str().as_bytes()))
            .max()
            .unwrap_or(0);
        let stray = self.buffer.len() - keep;
        if stray > 0 {
            tracing::debug!("Emulator ignoring {stray} stray bytes");
            let _ = self.buffer.split_to(stray);
        }

        commands
    }
}

/// Deterministic JPEG-framed sample image of `len` bytes (at least 4).
pub fn sample_photo(len: usize) -> Bytes {
    let len = len.max(4);
    let mut photo = BytesMut::with_capacity(len);
    photo.extend_from_slice(&[0xFF, 0xD8]);

    // xorshift filler keeps the payload binary and free of marker text.
    let mut state: u32 = 0x9E37_79B9;
    while photo.len() < len - 2 {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        photo.extend_from_slice(&[(state as u8) | 0x80]);
    }

    photo.extend_from_slice(&[0xFF, 0xD9]);
    photo.freeze()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_scanner_single_and_glued() {
        let mut scanner = CommandScanner::new();
        assert_eq!(scanner.push(b"PING"), vec![Command::Ping]);
        assert_eq!(
            scanner.push(b"TAKE_PHOTOPINGDISCONNECT"),
            vec![Command::TakePhoto, Command::Ping, Command::Disconnect]
        );
    }

    #[test]
    fn test_scanner_split_keyword() {
        let mut scanner = CommandScanner::new();
        assert!(scanner.push(b"TAKE_").is_empty());
        assert!(scanner.push(b"PHO").is_empty());
        assert_eq!(scanner.push(b"TO"), vec![Command::TakePhoto]);
    }

    #[test]
    fn test_scanner_skips_noise() {
        let mut scanner = CommandScanner::new();
        assert_eq!(scanner.push(b"\nhello PING\r\n"), vec![Command::Ping]);
        assert!(scanner.buffer.is_empty());
    }

    #[test]
    fn test_sample_photo() {
        let photo = sample_photo(1024);
        assert_eq!(photo.len(), 1024);
        assert!(photo.starts_with(&[0xFF, 0xD8]));
        assert!(photo.ends_with(&[0xFF, 0xD9]));
        assert!(markers::find(&photo, markers::PHOTO_END).is_none());
        assert_eq!(sample_photo(0).len(), 4);
    }

    async fn start(config: EmulatorConfig) -> (SocketAddr, Bytes) {
        let emulator = DeviceEmulator::bind(EmulatorConfig {
            bind: "127.0.0.1:0".into(),
            ..config
        })
        .await
        .unwrap()
        .with_photo(sample_photo(64));
        let addr = emulator.local_addr().unwrap();
        let photo = emulator.photo().clone();
        tokio::spawn(emulator.run());
        (addr, photo)
    }

    async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
        let mut received = Vec::new();
        let mut buf = [0u8; 512];
        while markers::find(&received, needle).is_none() {
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "emulator closed early");
            received.extend_from_slice(&buf[..n]);
        }
        received
    }

    #[tokio::test]
    async fn test_handshake_and_ping() {
        let (addr, _) = start(EmulatorConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        assert_eq!(read_until(&mut stream, b"CONNECTED\n").await, b"CONNECTED\n");

        stream.write_all(b"PING").await.unwrap();
        assert_eq!(read_until(&mut stream, b"PONG\n").await, b"PONG\n");
    }

    #[tokio::test]
    async fn test_capture_wire_format() {
        let (addr, photo) = start(EmulatorConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        read_until(&mut stream, b"CONNECTED\n").await;

        stream.write_all(b"TAKE_PHOTO").await.unwrap();
        let received = read_until(&mut stream, b"PHOTO_END\n").await;

        let mut expected = b"COMMAND_RECEIVED\nPHOTO_TAKEN:content://media/external/images/media/1\nPHOTO_DATA:64\n".to_vec();
        expected.extend_from_slice(&photo);
        expected.extend_from_slice(b"PHOTO_END\n");
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_omit_newlines_and_failure() {
        let (addr, _) = start(EmulatorConfig {
            omit_newlines: true,
            fail_capture: Some("camera busy".into()),
            ..EmulatorConfig::default()
        })
        .await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(b"TAKE_PHOTO").await.unwrap();
        let received = read_until(&mut stream, b"busy").await;
        assert_eq!(received, b"CONNECTEDCOMMAND_RECEIVEDERROR:camera busy");
    }

    #[tokio::test]
    async fn test_disconnect_closes() {
        let (addr, _) = start(EmulatorConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        read_until(&mut stream, b"CONNECTED\n").await;

        stream.write_all(b"DISCONNECT").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
