//! TCP transport: bounded connect and a polling chunk reader.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use shutterwire::transport::{connect, ChunkReader, ReadOutcome};
//!
//! let stream = connect("192.168.1.20:8080", Duration::from_secs(10)).await?;
//! let (read_half, _write_half) = stream.into_split();
//! let mut reader = ChunkReader::new(read_half, Duration::from_secs(1), 64 * 1024, None);
//!
//! loop {
//!     match reader.next_chunk().await? {
//!         ReadOutcome::Data(chunk) => println!("{} bytes", chunk.len()),
//!         ReadOutcome::Idle => continue,
//!         ReadOutcome::Eof => break,
//!     }
//! }
//! ```

use std::io::ErrorKind;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;

use crate::error::{Result, ShutterError};

/// Default bound on connection establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait per read before reporting an idle poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default read buffer size (64KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Open a TCP connection to the device within `timeout`.
///
/// Nagle is disabled; commands are a few bytes each.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Err(_) => {
            return Err(ShutterError::ConnectTimeout {
                addr: addr.to_string(),
                timeout,
            })
        }
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
            return Err(ShutterError::ConnectionRefused(addr.to_string()))
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(stream)) => stream,
    };

    stream.set_nodelay(true)?;
    tracing::debug!("Connected to {addr}");
    Ok(stream)
}

/// Result of one read poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes arrived.
    Data(Bytes),
    /// Nothing arrived within the poll interval; the connection is still open.
    Idle,
    /// The peer closed the connection.
    Eof,
}

/// Reads arbitrary-sized chunks with a bounded wait per poll.
pub struct ChunkReader<R> {
    reader: R,
    buffer: BytesMut,
    buffer_size: usize,
    poll_interval: Duration,
    idle_timeout: Option<Duration>,
    /// Time since the last byte arrived, in whole polls.
    idle_for: Duration,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    /// Wrap a read half.
    ///
    /// With `idle_timeout` set, [`next_chunk`](Self::next_chunk) fails with
    /// [`ShutterError::IdleTimeout`] once that long passes without data.
    pub fn new(
        reader: R,
        poll_interval: Duration,
        buffer_size: usize,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            poll_interval,
            idle_timeout,
            idle_for: Duration::ZERO,
        }
    }

    /// Wait up to one poll interval for the next chunk.
    ///
    /// Cancel safe: no bytes are lost if the future is dropped.
    pub async fn next_chunk(&mut self) -> Result<ReadOutcome> {
        self.buffer.reserve(self.buffer_size);

        match tokio::time::timeout(self.poll_interval, self.reader.read_buf(&mut self.buffer)).await
        {
            Err(_) => {
                self.idle_for += self.poll_interval;
                match self.idle_timeout {
                    Some(limit) if self.idle_for >= limit => Err(ShutterError::IdleTimeout(limit)),
                    _ => Ok(ReadOutcome::Idle),
                }
            }
            Ok(Ok(0)) => Ok(ReadOutcome::Eof),
            Ok(Ok(_)) => {
                self.idle_for = Duration::ZERO;
                Ok(ReadOutcome::Data(self.buffer.split().freeze()))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_reads_data_then_eof() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = ChunkReader::new(server, Duration::from_secs(1), 1024, None);

        client.write_all(b"CONNECTED\n").await.unwrap();
        assert_eq!(
            reader.next_chunk().await.unwrap(),
            ReadOutcome::Data(Bytes::from_static(b"CONNECTED\n"))
        );

        drop(client);
        assert_eq!(reader.next_chunk().await.unwrap(), ReadOutcome::Eof);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_poll_keeps_connection() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = ChunkReader::new(server, Duration::from_secs(1), 1024, None);

        assert_eq!(reader.next_chunk().await.unwrap(), ReadOutcome::Idle);
        assert_eq!(reader.next_chunk().await.unwrap(), ReadOutcome::Idle);

        client.write_all(b"PONG").await.unwrap();
        assert_eq!(
            reader.next_chunk().await.unwrap(),
            ReadOutcome::Data(Bytes::from_static(b"PONG"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (_client, server) = tokio::io::duplex(1024);
        let mut reader = ChunkReader::new(
            server,
            Duration::from_secs(1),
            1024,
            Some(Duration::from_secs(3)),
        );

        assert_eq!(reader.next_chunk().await.unwrap(), ReadOutcome::Idle);
        assert_eq!(reader.next_chunk().await.unwrap(), ReadOutcome::Idle);
        let err = reader.next_chunk().await.unwrap_err();
        assert!(matches!(err, ShutterError::IdleTimeout(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_resets_idle_timer() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = ChunkReader::new(
            server,
            Duration::from_secs(1),
            1024,
            Some(Duration::from_secs(2)),
        );

        assert_eq!(reader.next_chunk().await.unwrap(), ReadOutcome::Idle);
        client.write_all(b"x").await.unwrap();
        assert!(matches!(reader.next_chunk().await.unwrap(), ReadOutcome::Data(_)));
        assert_eq!(reader.next_chunk().await.unwrap(), ReadOutcome::Idle);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect(&addr, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ShutterError::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn test_connect_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let stream = connect(&addr, Duration::from_secs(5)).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }
}
