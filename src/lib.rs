//! # shutterwire
//!
//! Remote control and photo transfer for network cameras.
//!
//! A controller connects to the camera over TCP, issues capture commands and
//! receives the resulting images on the same stream. Control messages are
//! newline-terminated ASCII lines; photos travel as raw bytes between a
//! `PHOTO_DATA:<size>` announcement and a `PHOTO_END` sentinel.
//!
//! ## Architecture
//!
//! - **Transport**: bounded connect, chunk reader with idle polling
//! - **Classifier**: splits arbitrary reads into control messages and payload
//! - **State machine**: session lifecycle and photo assembly
//! - **Client**: receive loop, command writer task, event stream
//!
//! A device emulator is included for testing controllers without hardware.
//!
//! ## Example
//!
//! ```ignore
//! use shutterwire::{ClientBuilder, DirectoryStore, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> shutterwire::Result<()> {
//!     let (client, mut events) = ClientBuilder::new()
//!         .store(DirectoryStore::new("photos", "photo"))
//!         .build();
//!
//!     client.connect("192.168.1.20").await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::Connected => client.take_photo()?,
//!             SessionEvent::PhotoReceived(photo) => {
//!                 println!("saved to {:?}", photo.path);
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

pub mod config;
pub mod emulator;
pub mod error;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;

mod client;
mod writer;

pub use client::{CameraClient, ClientBuilder, Events};
pub use config::Config;
pub use error::{Result, ShutterError};
pub use session::{CompletedPhoto, SessionEvent, SessionState};
pub use store::{DirectoryStore, PhotoStore};
