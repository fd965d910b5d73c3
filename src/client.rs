//! Client builder, camera client, and the receive loop.
//!
//! The [`ClientBuilder`] configures a session and returns a [`CameraClient`]
//! together with its [`Events`] stream. The client manages the lifecycle:
//! 1. Connect to the device within a bounded timeout
//! 2. Spawn the command writer task
//! 3. Spawn the receive loop: read chunks, classify, drive the state machine
//! 4. Surface every outcome as a [`SessionEvent`]
//!
//! Commands are fire-and-forget; nothing the caller does waits on the receive
//! loop except [`CameraClient::disconnect`], which waits for teardown.
//!
//! # Example
//!
//! ```ignore
//! use shutterwire::{ClientBuilder, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> shutterwire::Result<()> {
//!     let (client, mut events) = ClientBuilder::new().build();
//!     client.connect("192.168.1.20:8080").await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::Connected => client.take_photo()?,
//!             SessionEvent::PhotoReceived(photo) => {
//!                 println!("got {} bytes", photo.len());
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::{with_default_port, SessionConfig};
use crate::error::{Result, ShutterError};
use crate::protocol::{Command, StreamClassifier, StreamEvent};
use crate::session::{CompletedPhoto, SessionEvent, SessionState, StateMachine};
use crate::store::PhotoStore;
use crate::transport::{connect, ChunkReader, ReadOutcome};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Builder for configuring and creating a camera client.
pub struct ClientBuilder {
    config: SessionConfig,
    store: Option<Arc<dyn PhotoStore>>,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::from_config(SessionConfig::default())
    }

    /// Start from a loaded session configuration.
    pub fn from_config(config: SessionConfig) -> Self {
        Self {
            config,
            store: None,
        }
    }

    /// Set the connection timeout.
    ///
    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set how long each read waits before the loop re-polls.
    ///
    /// Also bounds how long a newline-less `ERROR:` waits to be surfaced.
    /// Default: 1 second
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// End the session after this long without data.
    ///
    /// Default: none
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Send `PING` periodically while connected.
    ///
    /// Default: none
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = Some(interval);
        self
    }

    /// Set the wait between `DISCONNECT` and closing the socket.
    ///
    /// Default: 100 ms
    pub fn disconnect_grace(mut self, grace: Duration) -> Self {
        self.config.disconnect_grace = grace;
        self
    }

    /// Set the read buffer size.
    ///
    /// Default: 64KB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the longest control line accepted without a newline.
    ///
    /// Default: 4096
    pub fn max_line_length(mut self, length: usize) -> Self {
        self.config.max_line_length = length;
        self
    }

    /// Set the progress event granularity in percent.
    ///
    /// Default: 10
    pub fn progress_step(mut self, step: u8) -> Self {
        self.config.progress_step = step;
        self
    }

    /// Set the outbound command queue capacity.
    ///
    /// Default: 64
    pub fn command_queue(mut self, capacity: usize) -> Self {
        self.config.command_queue = capacity;
        self
    }

    /// Save every completed photo before reporting it.
    pub fn store(mut self, store: impl PhotoStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Build the client and its event stream.
    pub fn build(self) -> (CameraClient, Events) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Disconnected);

        let client = CameraClient {
            config: self.config,
            store: self.store,
            events: events_tx,
            state: Arc::new(state),
            session: Mutex::new(None),
            attempt: AtomicU64::new(0),
        };

        (client, Events { rx: events_rx })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of session events, in the order they occurred.
pub struct Events {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Events {
    /// Wait for the next event.
    ///
    /// Returns `None` once the client and every session are gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is ready.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

/// Handles of one live session.
struct Session {
    writer: WriterHandle,
    /// Set by `take_photo` until the capture it requested is over.
    capture_pending: Arc<AtomicBool>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Controller side of a camera session.
///
/// At most one session is live at a time. All methods take `&self`, so the
/// client can be shared behind an `Arc`.
pub struct CameraClient {
    config: SessionConfig,
    store: Option<Arc<dyn PhotoStore>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<watch::Sender<SessionState>>,
    session: Mutex<Option<Session>>,
    /// Number of the latest connect attempt; a disconnect bumps it to cancel one in flight.
    attempt: AtomicU64,
}

impl CameraClient {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Open a session to the device at `addr` (`host` or `host:port`).
    ///
    /// Returns once the TCP connection is up; the handshake completes
    /// asynchronously with a [`SessionEvent::Connected`].
    ///
    /// # Errors
    ///
    /// - [`ShutterError::SessionActive`] if a session is already live
    /// - [`ShutterError::ConnectTimeout`] / [`ShutterError::ConnectionRefused`]
    ///   if the device cannot be reached
    /// - [`ShutterError::ConnectionClosed`] if [`disconnect`](Self::disconnect)
    ///   was called before the connection came up
    pub async fn connect(&self, addr: &str) -> Result<()> {
        let addr = with_default_port(addr);
        let attempt = self.begin_attempt()?;

        tracing::info!("Connecting to {addr}");
        let stream = match connect(&addr, self.config.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Connection failed: {e}");
                let _slot = lock(&self.session);
                if self.is_current(attempt) {
                    self.state.send_replace(SessionState::Disconnected);
                    let _ = self.events.send(SessionEvent::error(e.to_string()));
                    let _ = self.events.send(SessionEvent::disconnected(e.to_string()));
                }
                return Err(e);
            }
        };

        self.start_session(attempt, stream)
    }

    /// Claim the session slot for a new connect attempt.
    fn begin_attempt(&self) -> Result<u64> {
        let mut slot = lock(&self.session);
        if *self.state.borrow() != SessionState::Disconnected {
            return Err(ShutterError::SessionActive);
        }
        self.state.send_replace(SessionState::Connecting);
        // A finished session is replaced.
        *slot = None;
        Ok(self.attempt.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Whether `attempt` is still the connect in flight. Call with the session lock held.
    fn is_current(&self, attempt: u64) -> bool {
        self.attempt.load(Ordering::Acquire) == attempt
            && *self.state.borrow() == SessionState::Connecting
    }

    /// Spawn the writer and receive loop over a connected stream.
    fn start_session(&self, attempt: u64, stream: TcpStream) -> Result<()> {
        let mut slot = lock(&self.session);
        if !self.is_current(attempt) {
            tracing::info!("Connect cancelled by disconnect; closing new connection");
            return Err(ShutterError::ConnectionClosed);
        }

        let (read_half, write_half) = stream.into_split();

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let writer_config = WriterConfig {
            channel_capacity: self.config.command_queue,
        };
        let (writer, writer_task) = spawn_writer_task(write_half, writer_config, Some(sent_tx));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let capture_pending = Arc::new(AtomicBool::new(false));

        let mut machine = StateMachine::new(self.config.progress_step);
        machine.connecting();

        let receive = ReceiveLoop {
            reader: ChunkReader::new(
                read_half,
                self.config.poll_interval,
                self.config.read_buffer_size,
                self.config.idle_timeout,
            ),
            classifier: StreamClassifier::with_max_line_length(self.config.max_line_length),
            machine,
            writer: writer.clone(),
            writer_task,
            sent_rx,
            shutdown_rx,
            heartbeat: self.config.heartbeat_interval,
            events: self.events.clone(),
            state: self.state.clone(),
            capture_pending: capture_pending.clone(),
            store: self.store.clone(),
        };
        let task = tokio::spawn(receive.run());

        *slot = Some(Session {
            writer,
            capture_pending,
            shutdown: shutdown_tx,
            task,
        });

        Ok(())
    }

    /// Request a capture.
    ///
    /// # Errors
    ///
    /// - [`ShutterError::NotConnected`] without a live session (an `Error`
    ///   event is emitted too)
    /// - [`ShutterError::CaptureInProgress`] while a capture is outstanding
    pub fn take_photo(&self) -> Result<()> {
        let slot = lock(&self.session);
        let state = self.state();
        let session = match slot.as_ref() {
            Some(session) if state.is_connected() && !session.writer.is_closed() => session,
            _ => {
                let _ = self
                    .events
                    .send(SessionEvent::error("Cannot take photo: not connected"));
                return Err(ShutterError::NotConnected);
            }
        };

        // The state only advances once the writer reports the command, so the
        // flag guards the gap.
        if state.is_capturing() || session.capture_pending.swap(true, Ordering::AcqRel) {
            return Err(ShutterError::CaptureInProgress);
        }
        if let Err(e) = session.writer.send(Command::TakePhoto) {
            session.capture_pending.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Send a heartbeat.
    ///
    /// Returns `false`, doing nothing, unless the handshake has completed.
    pub fn ping(&self) -> bool {
        if !self.state().is_connected() {
            return false;
        }
        self.send(Command::Ping).is_ok()
    }

    /// End the session: send `DISCONNECT`, wait the grace period, close.
    ///
    /// Idempotent. Returns after the receive loop has torn down and emitted
    /// its single `Disconnected` event. Called while [`connect`](Self::connect)
    /// is still in flight, it cancels that attempt.
    pub async fn disconnect(&self) {
        let session = {
            let mut slot = lock(&self.session);
            match slot.take() {
                Some(session) => session,
                None => {
                    if *self.state.borrow() == SessionState::Connecting {
                        self.attempt.fetch_add(1, Ordering::AcqRel);
                        self.state.send_replace(SessionState::Disconnected);
                        let _ = self
                            .events
                            .send(SessionEvent::disconnected("Disconnected by user"));
                    }
                    return;
                }
            }
        };

        if !session.task.is_finished() && session.writer.send(Command::Disconnect).is_ok() {
            tokio::time::sleep(self.config.disconnect_grace).await;
        }

        let _ = session.shutdown.send(());
        if let Err(e) = session.task.await {
            tracing::error!("Receive loop failed: {e}");
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether the handshake has completed and the session is live.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn send(&self, command: Command) -> Result<()> {
        match lock(&self.session).as_ref() {
            Some(session) if !session.writer.is_closed() => session.writer.send(command),
            _ => Err(ShutterError::NotConnected),
        }
    }
}

/// Lock the session slot, ignoring poisoning.
fn lock(slot: &Mutex<Option<Session>>) -> MutexGuard<'_, Option<Session>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Task state of one session's receive loop.
struct ReceiveLoop {
    reader: ChunkReader<OwnedReadHalf>,
    classifier: StreamClassifier,
    machine: StateMachine,
    writer: WriterHandle,
    writer_task: JoinHandle<Result<()>>,
    /// Commands the writer is about to put on the wire.
    sent_rx: mpsc::UnboundedReceiver<Command>,
    shutdown_rx: oneshot::Receiver<()>,
    heartbeat: Option<Duration>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<watch::Sender<SessionState>>,
    capture_pending: Arc<AtomicBool>,
    store: Option<Arc<dyn PhotoStore>>,
}

impl ReceiveLoop {
    async fn run(mut self) {
        self.publish();

        let reason = self.drive().await;
        tracing::info!("Session ended: {reason}");

        // Dropping the writer's half closes the socket.
        self.writer_task.abort();
        self.classifier.clear();

        if let Some(event) = self.machine.disconnect(&reason) {
            self.publish();
            self.emit(event);
        }
    }

    /// Process the connection until it ends; returns why.
    async fn drive(&mut self) -> String {
        let mut heartbeat = self.heartbeat.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                biased;

                Some(command) = self.sent_rx.recv() => {
                    self.machine.command_issued(command);
                    if command == Command::TakePhoto && !self.machine.state().is_capturing() {
                        // Not accepted as a capture; nothing will clear the flag later.
                        self.capture_pending.store(false, Ordering::Release);
                    }
                    self.publish();
                }

                _ = &mut self.shutdown_rx => {
                    return "Disconnected by user".to_string();
                }

                result = &mut self.writer_task => {
                    return match result {
                        Ok(Ok(())) => "Command writer closed".to_string(),
                        Ok(Err(e)) => {
                            let reason = format!("Failed to send command: {e}");
                            self.emit(SessionEvent::error(reason.clone()));
                            reason
                        }
                        Err(e) => format!("Command writer failed: {e}"),
                    };
                }

                _ = tick(&mut heartbeat) => {
                    if self.machine.state().is_connected() {
                        if let Err(e) = self.writer.send(Command::Ping) {
                            tracing::debug!("Heartbeat not sent: {e}");
                        }
                    }
                }

                outcome = self.reader.next_chunk() => match outcome {
                    Ok(ReadOutcome::Data(chunk)) => {
                        let events = self.classifier.push(&chunk);
                        self.apply(events).await;
                    }
                    Ok(ReadOutcome::Idle) => {
                        let events = self.classifier.flush_idle();
                        self.apply(events).await;
                    }
                    Ok(ReadOutcome::Eof) => {
                        return "Connection closed by device".to_string();
                    }
                    Err(e) => {
                        self.emit(SessionEvent::error(e.to_string()));
                        return e.to_string();
                    }
                },
            }
        }
    }

    /// Feed classified events through the state machine, in order.
    async fn apply(&mut self, stream_events: Vec<StreamEvent>) {
        for stream_event in stream_events {
            let events = self.machine.handle(stream_event);
            // Consumers reacting to an event must see the state it produced.
            self.publish();

            for event in events {
                let event = match event {
                    SessionEvent::PhotoReceived(photo) => {
                        SessionEvent::PhotoReceived(self.store_photo(photo).await)
                    }
                    event => event,
                };
                self.emit(event);
            }
        }
    }

    /// Hand a completed photo to the store, recording where it went.
    async fn store_photo(&self, mut photo: CompletedPhoto) -> CompletedPhoto {
        let Some(store) = self.store.clone() else {
            return photo;
        };

        let to_save = photo.clone();
        match tokio::task::spawn_blocking(move || store.save(&to_save)).await {
            Ok(Ok(path)) => photo.path = Some(path),
            Ok(Err(e)) => self.emit(SessionEvent::error(format!("Failed to save photo: {e}"))),
            Err(e) => self.emit(SessionEvent::error(format!("Photo store task failed: {e}"))),
        }
        photo
    }

    fn publish(&self) {
        self.state.send_if_modified(|current| {
            let next = self.machine.state();
            if current.is_capturing() && !next.is_capturing() {
                self.capture_pending.store(false, Ordering::Release);
            }
            let changed = *current != next;
            *current = next;
            changed
        });
    }

    fn emit(&self, event: SessionEvent) {
        match &event {
            SessionEvent::Error { message } => tracing::error!("{message}"),
            SessionEvent::Warning { message } => tracing::warn!("{message}"),
            SessionEvent::Log { message } => tracing::debug!("{message}"),
            SessionEvent::PhotoReceived(photo) => {
                tracing::info!("Photo received: {} bytes", photo.len())
            }
            _ => {}
        }
        // The consumer may have dropped its event stream.
        let _ = self.events.send(event);
    }
}

/// Wait for the next heartbeat tick, or forever without a heartbeat.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_default() {
        let builder = ClientBuilder::new();
        assert_eq!(builder.config, SessionConfig::default());
        assert!(builder.store.is_none());
    }

    #[test]
    fn test_builder_settings() {
        let builder = ClientBuilder::new()
            .connect_timeout(Duration::from_secs(3))
            .poll_interval(Duration::from_millis(50))
            .idle_timeout(Duration::from_secs(30))
            .heartbeat_interval(Duration::from_secs(5))
            .disconnect_grace(Duration::from_millis(10))
            .read_buffer_size(1024)
            .max_line_length(256)
            .progress_step(25)
            .command_queue(8);

        assert_eq!(builder.config.connect_timeout, Duration::from_secs(3));
        assert_eq!(builder.config.poll_interval, Duration::from_millis(50));
        assert_eq!(builder.config.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(builder.config.heartbeat_interval, Some(Duration::from_secs(5)));
        assert_eq!(builder.config.disconnect_grace, Duration::from_millis(10));
        assert_eq!(builder.config.read_buffer_size, 1024);
        assert_eq!(builder.config.max_line_length, 256);
        assert_eq!(builder.config.progress_step, 25);
        assert_eq!(builder.config.command_queue, 8);
    }

    #[tokio::test]
    async fn test_take_photo_without_connection() {
        let (client, mut events) = ClientBuilder::new().build();

        let err = client.take_photo().unwrap_err();
        assert!(matches!(err, ShutterError::NotConnected));
        assert!(matches!(events.try_recv(), Some(SessionEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_ping_without_connection_is_noop() {
        let (client, mut events) = ClientBuilder::new().build();

        assert!(!client.ping());
        assert!(events.try_recv().is_none());
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_without_session() {
        let (client, mut events) = ClientBuilder::new().build();

        client.disconnect().await;
        client.disconnect().await;
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_connect_in_flight() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, mut events) = ClientBuilder::new().build();

        let attempt = client.begin_attempt().unwrap();
        assert_eq!(client.state(), SessionState::Connecting);

        client.disconnect().await;
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(matches!(events.try_recv(), Some(SessionEvent::Disconnected { .. })));

        // The connection that was in flight comes up after the disconnect.
        let stream = TcpStream::connect(addr).await.unwrap();
        let err = client.start_session(attempt, stream).unwrap_err();
        assert!(matches!(err, ShutterError::ConnectionClosed));
        assert!(lock(&client.session).is_none());
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_newer_attempt_supersedes_cancelled_one() {
        let (client, _events) = ClientBuilder::new().build();

        let first = client.begin_attempt().unwrap();
        client.disconnect().await;
        let second = client.begin_attempt().unwrap();

        let _slot = lock(&client.session);
        assert!(!client.is_current(first));
        assert!(client.is_current(second));
    }

    #[tokio::test]
    async fn test_connect_refused_emits_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (client, mut events) = ClientBuilder::new().build();
        let err = client.connect(&addr).await.unwrap_err();

        assert!(matches!(err, ShutterError::ConnectionRefused(_)));
        assert!(matches!(events.try_recv(), Some(SessionEvent::Error { .. })));
        assert!(matches!(events.try_recv(), Some(SessionEvent::Disconnected { .. })));
        assert_eq!(client.state(), SessionState::Disconnected);
    }
}
