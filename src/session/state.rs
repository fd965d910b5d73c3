//! Protocol state machine for one device session.
//!
//! The machine consumes classified stream events and produces session events.
//! It owns the in-flight photo record, so nothing outside the receive loop can
//! observe a half-built photo.
//!
//! Recognisable messages that arrive out of order are applied leniently and
//! logged at debug level; a device that skips `COMMAND_RECEIVED` still gets its
//! photo delivered.

use serde::Serialize;

use crate::protocol::{Command, ControlMessage, PhotoAssembly, StreamEvent};

use super::event::{CompletedPhoto, SessionEvent};

/// Default progress granularity in percent.
pub const DEFAULT_PROGRESS_STEP: u8 = 10;

/// Lifecycle of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No transport.
    Disconnected,
    /// Transport open, waiting for `CONNECTED`.
    Connecting,
    /// Idle and ready for commands.
    Connected,
    /// `TAKE_PHOTO` sent, waiting for `COMMAND_RECEIVED`.
    AwaitingCommandAck,
    /// Acknowledged, waiting for the capture and size announcement.
    AwaitingCapture,
    /// Payload bytes are arriving.
    ReceivingPhoto,
}

impl SessionState {
    /// Whether the handshake has completed and the session is live.
    pub fn is_connected(&self) -> bool {
        !matches!(self, SessionState::Disconnected | SessionState::Connecting)
    }

    /// Whether a capture is outstanding.
    pub fn is_capturing(&self) -> bool {
        matches!(
            self,
            SessionState::AwaitingCommandAck
                | SessionState::AwaitingCapture
                | SessionState::ReceivingPhoto
        )
    }

    /// Name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::AwaitingCommandAck => "awaiting_command_ack",
            SessionState::AwaitingCapture => "awaiting_capture",
            SessionState::ReceivingPhoto => "receiving_photo",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session state plus the transfer record.
#[derive(Debug)]
pub struct StateMachine {
    state: SessionState,
    /// URI from the last `PHOTO_TAKEN`.
    uri: Option<String>,
    /// In-flight transfer.
    photo: Option<PhotoAssembly>,
    /// Highest progress boundary emitted for the current transfer.
    last_progress: Option<u8>,
    /// Whether the "all announced bytes received" log was emitted.
    reached_declared: bool,
    /// Undecodable bytes are reported once per session.
    undecodable_warned: bool,
    progress_step: u8,
}

impl StateMachine {
    /// Create a machine in `Disconnected`.
    pub fn new(progress_step: u8) -> Self {
        Self {
            state: SessionState::Disconnected,
            uri: None,
            photo: None,
            last_progress: None,
            reached_declared: false,
            undecodable_warned: false,
            progress_step: progress_step.clamp(1, 100),
        }
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bytes received for the in-flight transfer, if any.
    pub fn received(&self) -> Option<u64> {
        self.photo.as_ref().map(PhotoAssembly::received)
    }

    /// Transport opened; wait for the handshake.
    pub fn connecting(&mut self) {
        self.reset();
        self.state = SessionState::Connecting;
    }

    /// Record that a command was handed to the writer.
    pub fn command_issued(&mut self, command: Command) {
        match (command, self.state) {
            (Command::TakePhoto, SessionState::Connected) => {
                self.transition(SessionState::AwaitingCommandAck);
            }
            (Command::TakePhoto, state) => {
                tracing::debug!("TAKE_PHOTO issued while {state}; state unchanged");
            }
            (Command::Ping | Command::Disconnect, _) => {}
        }
    }

    /// Apply one classified stream event.
    pub fn handle(&mut self, event: StreamEvent) -> Vec<SessionEvent> {
        let mut out = Vec::new();

        match event {
            StreamEvent::Message(message) => self.on_message(message, &mut out),
            StreamEvent::Payload(bytes) => match self.photo.as_mut() {
                Some(photo) => {
                    photo.append(&bytes);
                    self.progress(&mut out);
                }
                None => {
                    tracing::debug!("Dropping {} payload bytes outside a transfer", bytes.len());
                }
            },
            StreamEvent::Malformed { line, reason } => {
                tracing::warn!("Malformed control line {line:?}: {reason}");
                out.push(SessionEvent::warning(reason));
            }
            StreamEvent::Undecodable { len } => {
                if self.undecodable_warned {
                    tracing::debug!("Discarded {len} more undecodable bytes");
                } else {
                    self.undecodable_warned = true;
                    out.push(SessionEvent::warning(format!(
                        "Discarded {len} undecodable bytes outside a photo transfer"
                    )));
                }
            }
        }

        out
    }

    /// End the session. Returns the `Disconnected` event the first time only.
    pub fn disconnect(&mut self, reason: &str) -> Option<SessionEvent> {
        if self.state == SessionState::Disconnected {
            return None;
        }

        if let Some(photo) = &self.photo {
            tracing::debug!(
                "Discarding partial photo: {} of {} bytes",
                photo.received(),
                photo.declared_size()
            );
        }
        self.reset();
        self.state = SessionState::Disconnected;
        Some(SessionEvent::disconnected(reason))
    }

    fn on_message(&mut self, message: ControlMessage, out: &mut Vec<SessionEvent>) {
        match message {
            ControlMessage::Connected => match self.state {
                SessionState::Connecting => {
                    self.transition(SessionState::Connected);
                    out.push(SessionEvent::Connected);
                }
                state => tracing::debug!("Ignoring CONNECTED while {state}"),
            },

            ControlMessage::CommandReceived => match self.state {
                SessionState::AwaitingCommandAck => {
                    self.transition(SessionState::AwaitingCapture);
                }
                SessionState::Connected => {
                    tracing::debug!("COMMAND_RECEIVED without a pending TAKE_PHOTO");
                    self.transition(SessionState::AwaitingCapture);
                }
                state => tracing::debug!("Ignoring COMMAND_RECEIVED while {state}"),
            },

            ControlMessage::PhotoTaken { uri } => {
                match self.state {
                    SessionState::AwaitingCapture => {}
                    SessionState::Connected | SessionState::AwaitingCommandAck => {
                        tracing::debug!("PHOTO_TAKEN while {}", self.state);
                        self.transition(SessionState::AwaitingCapture);
                    }
                    state => tracing::debug!("PHOTO_TAKEN while {state}"),
                }
                out.push(SessionEvent::log(match &uri {
                    Some(uri) => format!("Photo taken: {uri}"),
                    None => "Photo taken".to_string(),
                }));
                self.uri = uri;
            }

            ControlMessage::PhotoData { size } => {
                if let Some(previous) = self.photo.take() {
                    out.push(SessionEvent::warning(format!(
                        "New transfer announced; discarding partial photo ({} of {} bytes)",
                        previous.received(),
                        previous.declared_size()
                    )));
                }
                if self.state != SessionState::AwaitingCapture {
                    tracing::debug!("PHOTO_DATA while {}", self.state);
                }
                self.photo = Some(PhotoAssembly::new(size));
                self.last_progress = None;
                self.reached_declared = false;
                self.transition(SessionState::ReceivingPhoto);
                out.push(SessionEvent::log(format!("Receiving photo: {size} bytes")));
            }

            ControlMessage::PhotoEnd => match self.photo.take() {
                Some(mut photo) => {
                    let declared = photo.declared_size();
                    let completed = CompletedPhoto {
                        bytes: photo.finalize(),
                        uri: self.uri.take(),
                        declared_size: Some(declared),
                        path: None,
                    };
                    if !completed.size_matches() {
                        out.push(SessionEvent::warning(format!(
                            "Photo size mismatch: announced {declared} bytes, received {}",
                            completed.len()
                        )));
                    }
                    self.transition(SessionState::Connected);
                    out.push(SessionEvent::PhotoReceived(completed));
                }
                None => {
                    out.push(SessionEvent::warning("PHOTO_END received outside a transfer"));
                }
            },

            ControlMessage::Pong => out.push(SessionEvent::HeartbeatAck),

            ControlMessage::Error(message) => {
                if matches!(
                    self.state,
                    SessionState::AwaitingCommandAck | SessionState::AwaitingCapture
                ) {
                    self.uri = None;
                    self.transition(SessionState::Connected);
                }
                out.push(SessionEvent::error(format!("Device error: {message}")));
            }

            ControlMessage::Unknown(line) => {
                out.push(SessionEvent::log(format!("Unrecognised message: {line}")));
            }
        }
    }

    /// Emit progress on step boundaries and the one-off completion log.
    fn progress(&mut self, out: &mut Vec<SessionEvent>) {
        let Some(photo) = &self.photo else {
            return;
        };

        if let Some(percent) = photo.progress_percent() {
            let boundary = if percent == 100 {
                100
            } else {
                percent - percent % self.progress_step
            };
            if boundary > 0 && self.last_progress.map_or(true, |last| boundary > last) {
                self.last_progress = Some(boundary);
                out.push(SessionEvent::Progress { percent: boundary });
            }
        }

        let declared = photo.declared_size();
        if !self.reached_declared && declared > 0 && photo.received() >= declared {
            self.reached_declared = true;
            out.push(SessionEvent::log(format!(
                "Received all {declared} announced bytes; waiting for PHOTO_END"
            )));
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!("Session state {} -> {}", self.state, next);
        self.state = next;
    }

    fn reset(&mut self) {
        self.uri = None;
        self.photo = None;
        self.last_progress = None;
        self.reached_declared = false;
        self.undecodable_warned = false;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_STEP)
    }
}
