//! Audio playback capability
//!
//! Decoding and playback live outside this crate. The client runtime drives
//! whatever engine is plugged in through [`AudioSink`].

use std::path::{Path, PathBuf};

/// Errors from the audio capability
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// File could not be loaded or decoded
    #[error("cannot load {path}: {reason}")]
    Load {
        /// File that failed
        path: PathBuf,
        /// Reason reported by the engine
        reason: String,
    },

    /// Play requested with nothing loaded
    #[error("nothing loaded")]
    NothingLoaded,

    /// Engine failure
    #[error("playback error: {0}")]
    Playback(String),
}

/// Playback state tracked by sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    /// Stopped or never started
    #[default]
    Stopped,
    /// Playing
    Playing,
    /// Paused
    Paused,
}

/// Audio playback capability
pub trait AudioSink: Send {
    /// Load a file, replacing whatever was loaded
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded.
    fn load(&mut self, path: &Path) -> Result<(), AudioError>;

    /// Start the loaded file from the beginning
    ///
    /// # Errors
    ///
    /// Returns an error if playback cannot start.
    fn play(&mut self) -> Result<(), AudioError>;

    /// Stop playback
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    fn stop(&mut self) -> Result<(), AudioError>;

    /// Pause playback
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    fn pause(&mut self) -> Result<(), AudioError>;

    /// Resume paused playback
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    fn resume(&mut self) -> Result<(), AudioError>;
}

/// Sink that tracks state without producing sound
#[derive(Debug, Default)]
pub struct NullAudioSink {
    loaded: Option<PathBuf>,
    state: PlaybackState,
}

impl NullAudioSink {
    /// Create an idle sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently loaded file
    #[must_use]
    pub fn loaded(&self) -> Option<&Path> {
        self.loaded.as_deref()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.state
    }
}

impl AudioSink for NullAudioSink {
    fn load(&mut self, path: &Path) -> Result<(), AudioError> {
        self.loaded = Some(path.to_path_buf());
        self.state = PlaybackState::Stopped;
        Ok(())
    }

    fn play(&mut self) -> Result<(), AudioError> {
        if self.loaded.is_none() {
            return Err(AudioError::NothingLoaded);
        }
        self.state = PlaybackState::Playing;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.state = PlaybackState::Stopped;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        if self.state == PlaybackState::Playing {
            self.state = PlaybackState::Paused;
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<(), AudioError> {
        if self.state == PlaybackState::Paused {
            self.state = PlaybackState::Playing;
        }
        Ok(())
    }
}
