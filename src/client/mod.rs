//! Playback client

mod audio;
mod repository;
mod runtime;


pub use audio::{AudioError, AudioSink, NullAudioSink, PlaybackState};
pub use repository::{DirectoryRepository, FileRepository, FileWriter, validate_file_name};
pub use runtime::{ClientState, SyncClient};
