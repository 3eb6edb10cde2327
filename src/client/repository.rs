//! Local media repository

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, SyncError};

/// Storage for replicated media files
#[async_trait]
pub trait FileRepository: Send + Sync {
    /// Whether a file called `name` exists with exactly `expected_size` bytes
    async fn exists(&self, name: &str, expected_size: u64) -> bool;

    /// Start storing a file called `name`
    ///
    /// Nothing replaces an existing file of that name until the writer is
    /// committed.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidFileName` for unsafe names, or
    /// `SyncError::Repository` if the file cannot be created.
    async fn create(&self, name: &str) -> Result<Box<dyn FileWriter>>;

    /// Store `content` as `name`, replacing any existing file
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidFileName` for unsafe names, or
    /// `SyncError::Repository` if the write fails.
    async fn write(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let mut writer = self.create(name).await?;
        if let Err(e) = writer.append(content).await {
            writer.abort().await;
            return Err(e);
        }
        writer.commit().await
    }

    /// Path the audio capability should load for `name`
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidFileName` for unsafe names.
    fn path_of(&self, name: &str) -> Result<PathBuf>;
}

/// A file being received, written chunk by chunk
#[async_trait]
pub trait FileWriter: Send {
    /// Append the next chunk
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Repository` if the write fails.
    async fn append(&mut self, chunk: &[u8]) -> Result<()>;

    /// Finish the file, replacing any existing file of the same name
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Repository` if the file cannot be finalized.
    async fn commit(self: Box<Self>) -> Result<PathBuf>;

    /// Throw away everything written so far
    async fn abort(self: Box<Self>);
}

/// Check that `name` is a single plain path component
///
/// Separators, `.`/`..`, absolute paths, drive prefixes and NUL bytes are
/// all rejected, so a name from the wire can never leave the repository.
///
/// # Errors
///
/// Returns `SyncError::InvalidFileName` if the name is unsafe.
pub fn validate_file_name(name: &str) -> Result<&str> {
    let invalid = || SyncError::InvalidFileName {
        name: name.to_string(),
    };

    if name.is_empty() || name.contains('\0') || name.contains(['/', '\\']) {
        return Err(invalid());
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(invalid()),
    }
}

/// Repository backed by one local directory
#[derive(Debug, Clone)]
pub struct DirectoryRepository {
    root: PathBuf,
}

impl DirectoryRepository {
    /// Use `root` as the repository directory; it is created on first write
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Repository directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileRepository for DirectoryRepository {
    async fn exists(&self, name: &str, expected_size: u64) -> bool {
        let Ok(path) = self.path_of(name) else {
            return false;
        };

        match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.is_file() && meta.len() == expected_size,
            Err(_) => false,
        }
    }

    async fn create(&self, name: &str) -> Result<Box<dyn FileWriter>> {
        let path = self.path_of(name)?;
        let partial = self.root.join(format!(".{name}.partial"));
        let repo_err = |source| SyncError::Repository {
            name: name.to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.root).await.map_err(repo_err)?;
        let file = tokio::fs::File::create(&partial).await.map_err(repo_err)?;

        Ok(Box::new(DirectoryWriter {
            name: name.to_string(),
            path,
            partial,
            file,
            written: 0,
        }))
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_file_name(name)?))
    }
}

/// Writes into a hidden partial file and renames it into place on commit
struct DirectoryWriter {
    name: String,
    path: PathBuf,
    partial: PathBuf,
    file: tokio::fs::File,
    written: u64,
}

#[async_trait]
impl FileWriter for DirectoryWriter {
    async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        if let Err(source) = self.file.write_all(chunk).await {
            return Err(SyncError::Repository {
                name: self.name.clone(),
                source,
            });
        }
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<PathBuf> {
        let flushed = self.file.flush().await;
        let Self {
            name,
            path,
            partial,
            file,
            written,
        } = *self;
        drop(file);

        let finished = match flushed {
            Ok(()) => tokio::fs::rename(&partial, &path).await,
            Err(e) => Err(e),
        };
        if let Err(source) = finished {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(SyncError::Repository { name, source });
        }

        tracing::debug!(path = %path.display(), bytes = written, "Stored file");
        Ok(path)
    }

    async fn abort(self: Box<Self>) {
        let Self { partial, file, .. } = *self;
        drop(file);
        if let Err(e) = tokio::fs::remove_file(&partial).await {
            tracing::debug!(path = %partial.display(), "Error removing partial file: {}", e);
        }
    }
}
