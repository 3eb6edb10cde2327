//! # syncalong
//!
//! Synchronized playback across independently clocked machines.
//!
//! ## Features
//!
//! - Length-prefixed control protocol carrying playback signals and a
//!   who-has / file-push exchange
//! - NTP-style clock service and client for a shared authoritative time
//! - Fan-out server that broadcasts signals and replicates media files
//! - Client runtime that executes each signal at its agreed instant
//!
//! ## Example
//!
//! ```rust,no_run
//! use syncalong::{ServerConfig, SyncServer};
//!
//! # async fn example() -> Result<(), syncalong::SyncError> {
//! let mut server = SyncServer::new(ServerConfig::default());
//! server.start().await?;
//!
//! // Make sure every client has the file, then play it everywhere
//! let (sync, play) = server.serve_and_play("songs/song.mp3").await?;
//! println!("pushed to {}, signalled {}", sync.pushed.len(), play.delivered.len());
//!
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Wire**: [`protocol`] frames and envelopes
//! - **Time**: [`clock`] service, queries and `wait_until`
//! - **Roles**: [`server::SyncServer`] coordinates, [`client::SyncClient`]
//!   follows

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Error types
pub mod error;

/// Configuration types
pub mod types;

/// Test doubles
pub mod testing;

pub mod client;
pub mod clock;
pub mod protocol;
pub mod server;

pub use client::{
    AudioError, AudioSink, DirectoryRepository, FileRepository, FileWriter, NullAudioSink,
    SyncClient,
};
pub use clock::{AuthoritativeClock, ClockClient, ClockSample, ClockService, wait_until};
pub use error::{Result, SyncError};
pub use protocol::{
    Envelope, FileSyncMessage, FramedTransport, ProtocolError, SignalAction, SignalMessage,
};
pub use server::{BroadcastReport, FileSyncReport, ServerEvent, SyncServer};
pub use types::{ClientConfig, ClockClientConfig, ClockServiceConfig, EvictionPolicy, ServerConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        AudioSink, ClientConfig, ClockService, ClockServiceConfig, ServerConfig, SignalAction,
        SyncClient, SyncError, SyncServer,
    };
}
