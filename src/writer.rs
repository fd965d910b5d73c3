//! Dedicated writer task for outbound commands.
//!
//! Callers never touch the socket's write half. They hand commands to a writer
//! task over an mpsc channel and return immediately, so `take_photo` and `ping`
//! never wait on the receive loop or on a slow peer.
//!
//! # Architecture
//!
//! ```text
//! take_photo ─┐                                   ┌─► TcpStream write half
//! ping       ─┼─► mpsc::Sender<Command> ─► Writer ┤
//! heartbeat  ─┘                                   └─► sent notifications ─► receive loop
//! ```
//!
//! Each command is announced on the notification channel before its bytes are
//! written, so the receive loop applies the command's state transition before
//! any reply to it can be read.

use std::io::IoSlice;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, ShutterError};
use crate::protocol::Command;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Maximum commands to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 16;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the command queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending commands to the writer task.
///
/// Cheaply cloneable; the receive loop holds a clone for heartbeats.
#[derive(Clone)]
pub struct WriterHandle {
    /// Channel sender for commands.
    tx: mpsc::Sender<Command>,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Queue a command without waiting.
    ///
    /// Returns `Err(Backpressure)` if the queue is full and
    /// `Err(ConnectionClosed)` if the writer task has exited.
    pub fn send(&self, command: Command) -> Result<()> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ShutterError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => ShutterError::ConnectionClosed,
        })
    }

    /// Whether the writer task has exited.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending commands.
///
/// When `sent` is given, every command is forwarded there before it is written.
///
/// # Returns
///
/// A tuple of `(WriterHandle, JoinHandle)`. The task ends with `Ok(())` once
/// every handle is dropped, or with the first write error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
    sent: Option<mpsc::UnboundedSender<Command>>,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));

    let handle = WriterHandle::new(tx);
    let task = tokio::spawn(writer_loop(rx, writer, sent));

    (handle, task)
}

/// Main writer loop - receives commands and writes them to the socket.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Command>,
    mut writer: W,
    sent: Option<mpsc::UnboundedSender<Command>>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(command) => command,
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(command) => batch.push(command),
                Err(_) => break,
            }
        }

        if let Some(sent) = &sent {
            for command in &batch {
                // The receive loop may already be gone during teardown.
                let _ = sent.send(*command);
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!("Command write failed: {e}");
            return Err(e);
        }
        tracing::debug!("Wrote {} command(s)", batch.len());
    }
}

/// Write a batch of commands using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[Command]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|c| c.as_str().len()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(ShutterError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after a partial write.
fn build_remaining_slices(batch: &[Command], skip_bytes: usize) -> Vec<IoSlice<'static>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for command in batch {
        let bytes = command.as_str().as_bytes();
        let end = offset + bytes.len();

        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&bytes[start..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default(), None);

        handle.send(Command::TakePhoto).unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"TAKE_PHOTO");
    }

    #[tokio::test]
    async fn test_notifies_before_write() {
        let (client, mut server) = duplex(4096);
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default(), Some(sent_tx));

        handle.send(Command::Ping).unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PING");
        // The notification was queued before the bytes hit the wire.
        assert_eq!(sent_rx.try_recv().unwrap(), Command::Ping);
    }

    #[tokio::test]
    async fn test_send_full_queue() {
        let (tx, _rx) = mpsc::channel::<Command>(1);
        let handle = WriterHandle::new(tx);

        handle.send(Command::Ping).unwrap();
        let err = handle.send(Command::Ping).unwrap_err();
        assert!(matches!(err, ShutterError::Backpressure));
    }

    #[tokio::test]
    async fn test_send_after_writer_exit() {
        let (tx, rx) = mpsc::channel::<Command>(4);
        drop(rx);
        let handle = WriterHandle::new(tx);

        assert!(handle.is_closed());
        let err = handle.send(Command::Disconnect).unwrap_err();
        assert!(matches!(err, ShutterError::ConnectionClosed));
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = [Command::TakePhoto, Command::Ping];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);

        let slices = build_remaining_slices(&batch, 4);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"_PHOTO");

        let slices = build_remaining_slices(&batch, 10);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"PING");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        write_batch(&mut buf, &[Command::Ping, Command::Disconnect])
            .await
            .unwrap();
        assert_eq!(buf.into_inner(), b"PINGDISCONNECT");
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default(), None);

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
