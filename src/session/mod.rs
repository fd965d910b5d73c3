//! Session module - protocol state machine and consumer-facing events.

mod event;
mod state;

pub use event::{CompletedPhoto, SessionEvent};
pub use state::{SessionState, StateMachine, DEFAULT_PROGRESS_STEP};
