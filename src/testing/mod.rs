//! Test doubles for the client's external collaborators
//!
//! Used by the crate's own tests and available to downstream integration
//! tests.


use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::client::{AudioError, AudioSink, FileRepository, FileWriter, validate_file_name};
use crate::clock::AuthoritativeClock;
use crate::error::Result;

/// One call made on a [`RecordingAudioSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCall {
    /// `load(path)`
    Load(PathBuf),
    /// `play()`
    Play,
    /// `stop()`
    Stop,
    /// `pause()`
    Pause,
    /// `resume()`
    Resume,
}

/// Audio sink that records every call
///
/// Clones share one call log, so a test can keep a clone while the client
/// owns the original.
#[derive(Debug, Clone, Default)]
pub struct RecordingAudioSink {
    calls: Arc<Mutex<Vec<(AudioCall, SystemTime)>>>,
    fail_load: bool,
}

impl RecordingAudioSink {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorder whose `load` always fails
    #[must_use]
    pub fn failing_load() -> Self {
        Self {
            fail_load: true,
            ..Self::default()
        }
    }

    /// Calls made so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<AudioCall> {
        lock(&self.calls).iter().map(|(call, _)| call.clone()).collect()
    }

    /// Calls made so far with the local time of each
    #[must_use]
    pub fn timed_calls(&self) -> Vec<(AudioCall, SystemTime)> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: AudioCall) {
        lock(&self.calls).push((call, SystemTime::now()));
    }
}

impl AudioSink for RecordingAudioSink {
    fn load(&mut self, path: &Path) -> std::result::Result<(), AudioError> {
        if self.fail_load {
            return Err(AudioError::Load {
                path: path.to_path_buf(),
                reason: "load disabled".to_string(),
            });
        }
        self.record(AudioCall::Load(path.to_path_buf()));
        Ok(())
    }

    fn play(&mut self) -> std::result::Result<(), AudioError> {
        self.record(AudioCall::Play);
        Ok(())
    }

    fn stop(&mut self) -> std::result::Result<(), AudioError> {
        self.record(AudioCall::Stop);
        Ok(())
    }

    fn pause(&mut self) -> std::result::Result<(), AudioError> {
        self.record(AudioCall::Pause);
        Ok(())
    }

    fn resume(&mut self) -> std::result::Result<(), AudioError> {
        self.record(AudioCall::Resume);
        Ok(())
    }
}

/// In-memory repository
///
/// Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    largest_chunk: Arc<Mutex<usize>>,
}

impl MemoryRepository {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file directly
    pub fn insert(&self, name: impl Into<String>, content: impl Into<Vec<u8>>) {
        lock(&self.files).insert(name.into(), content.into());
    }

    /// Content of a stored file
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(name).cloned()
    }

    /// Number of stored files
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.files).len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest single chunk appended by any writer so far
    #[must_use]
    pub fn largest_chunk(&self) -> usize {
        *lock(&self.largest_chunk)
    }
}

#[async_trait]
impl FileRepository for MemoryRepository {
    async fn exists(&self, name: &str, expected_size: u64) -> bool {
        lock(&self.files)
            .get(name)
            .is_some_and(|content| content.len() as u64 == expected_size)
    }

    async fn create(&self, name: &str) -> Result<Box<dyn FileWriter>> {
        let path = self.path_of(name)?;
        Ok(Box::new(MemoryWriter {
            repository: self.clone(),
            name: name.to_string(),
            path,
            content: Vec::new(),
        }))
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        Ok(Path::new("memory").join(validate_file_name(name)?))
    }
}

/// Buffers content and publishes it to the repository on commit
struct MemoryWriter {
    repository: MemoryRepository,
    name: String,
    path: PathBuf,
    content: Vec<u8>,
}

#[async_trait]
impl FileWriter for MemoryWriter {
    async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        {
            let mut largest = lock(&self.repository.largest_chunk);
            *largest = (*largest).max(chunk.len());
        }
        self.content.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<PathBuf> {
        let Self {
            repository,
            name,
            path,
            content,
        } = *self;
        lock(&repository.files).insert(name, content);
        Ok(path)
    }

    async fn abort(self: Box<Self>) {}
}

/// Clock that reads the local clock shifted by a fixed amount
#[derive(Debug, Clone, Copy)]
pub struct FixedOffsetClock {
    offset: Duration,
    ahead: bool,
}

impl FixedOffsetClock {
    /// Clock running `offset` ahead of the local clock
    #[must_use]
    pub fn ahead(offset: Duration) -> Self {
        Self {
            offset,
            ahead: true,
        }
    }

    /// Clock running `offset` behind the local clock
    #[must_use]
    pub fn behind(offset: Duration) -> Self {
        Self {
            offset,
            ahead: false,
        }
    }
}

#[async_trait]
impl AuthoritativeClock for FixedOffsetClock {
    async fn now(&self) -> Result<SystemTime> {
        let local = SystemTime::now();
        let shifted = if self.ahead {
            local.checked_add(self.offset)
        } else {
            local.checked_sub(self.offset)
        };
        Ok(shifted.unwrap_or(local))
    }
}

// A panicking test thread must not poison the doubles for the next assertion
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
