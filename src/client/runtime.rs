//! Client connection state machine
//!
//! One receive loop per connection. Envelopes are handled strictly one at a
//! time: while a signal waits for its target instant, nothing else is read
//! from the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpStream, ToSocketAddrs};

use super::audio::AudioSink;
use super::repository::{DirectoryRepository, FileRepository, FileWriter};
use crate::clock::{AuthoritativeClock, ClockClient, wait_until};
use crate::error::{Result, SyncError};
use crate::protocol::{
    ControlStream, Envelope, FileSyncMessage, FramedTransport, ProtocolError, SignalAction,
    SignalMessage,
};
use crate::types::ClientConfig;

/// Largest piece of a pushed file held in memory at once
const FILE_CHUNK_LEN: usize = 64 * 1024;

/// Client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No control connection
    Disconnected,
    /// Greeting sent, ready to serve
    Connected,
    /// Inside the receive loop
    Serving,
}

/// A playback client
///
/// Answers who-has queries from its repository, stores pushed files and
/// executes signals at their target instant on the shared clock.
pub struct SyncClient<S = TcpStream> {
    config: ClientConfig,
    audio: Box<dyn AudioSink>,
    repository: Arc<dyn FileRepository>,
    clock: Arc<dyn AuthoritativeClock>,
    transport: Option<FramedTransport<S>>,
    state: ClientState,
}

impl<S> SyncClient<S>
where
    S: ControlStream,
{
    /// Create a client for any stream type, using a directory repository
    /// and the configured clock service
    ///
    /// Connections are handed over with [`SyncClient::attach`].
    pub fn for_stream(config: ClientConfig, audio: impl AudioSink + 'static) -> Self {
        let repository = Arc::new(DirectoryRepository::new(config.repository_dir.clone()));
        let clock = Arc::new(ClockClient::new(config.clock.clone()));

        Self {
            config,
            audio: Box::new(audio),
            repository,
            clock,
            transport: None,
            state: ClientState::Disconnected,
        }
    }

    /// Use a different repository
    #[must_use]
    pub fn with_repository(mut self, repository: impl FileRepository + 'static) -> Self {
        self.repository = Arc::new(repository);
        self
    }

    /// Use a different authoritative clock
    #[must_use]
    pub fn with_clock(mut self, clock: impl AuthoritativeClock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Whether a control connection is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Take over an established stream and send the greeting
    ///
    /// # Errors
    ///
    /// Returns `SyncError::AlreadyRunning` if a connection is open, or the
    /// error from sending the greeting.
    pub async fn attach(&mut self, stream: S) -> Result<()> {
        if self.transport.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let mut transport = FramedTransport::with_max_frame_len(stream, self.config.max_frame_len);
        transport.send(&self.config.greeting).await?;

        self.transport = Some(transport);
        self.state = ClientState::Connected;
        Ok(())
    }

    /// Close the control connection
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotConnected` if there is no connection.
    pub async fn disconnect(&mut self) -> Result<()> {
        let mut transport = self.transport.take().ok_or(SyncError::NotConnected)?;
        self.state = ClientState::Disconnected;

        if let Err(e) = transport.shutdown().await {
            tracing::debug!("Error shutting down control connection: {}", e);
        }
        tracing::info!("Disconnected");
        Ok(())
    }

    /// Serve the connection until the server closes it
    ///
    /// Returns `Ok(())` when the server closes the connection between
    /// messages. A close inside a frame or a file push, and any other
    /// failure, is logged and ends the session with an error; the connection
    /// is dropped either way.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotConnected` without a connection, or the error
    /// that ended the session.
    pub async fn run(&mut self) -> Result<()> {
        if self.transport.is_none() {
            return Err(SyncError::NotConnected);
        }
        self.state = ClientState::Serving;

        let result = self.serve().await;

        self.transport = None;
        self.state = ClientState::Disconnected;

        if let Err(e) = &result {
            tracing::error!("Session ended: {}", e);
        }
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let received = self.transport()?.try_receive_envelope().await;

            match received {
                Ok(None) => {
                    tracing::info!("Server closed the control connection");
                    return Ok(());
                }
                Ok(Some(Envelope::FileSync(message))) => self.handle_file_sync(message).await?,
                Ok(Some(Envelope::Signal(signal))) => self.handle_signal(signal).await?,
                Err(e) if e.is_skippable() => {
                    tracing::warn!("Skipping message: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn transport(&mut self) -> Result<&mut FramedTransport<S>> {
        self.transport.as_mut().ok_or(SyncError::NotConnected)
    }

    async fn handle_file_sync(&mut self, message: FileSyncMessage) -> Result<()> {
        match message {
            FileSyncMessage::WhoHas {
                file_name,
                file_size,
            } => {
                let have = self
                    .repository
                    .exists(&file_name, u64::from(file_size))
                    .await;
                tracing::debug!(file = %file_name, size = file_size, have, "Who-has query");

                let reply = if have {
                    FileSyncMessage::Have
                } else {
                    FileSyncMessage::Missing
                };
                self.transport()?.send_envelope(&reply.into()).await?;
            }
            FileSyncMessage::FileSend {
                file_name,
                file_size,
            } => self.receive_file(&file_name, u64::from(file_size)).await?,
            reply @ (FileSyncMessage::Have | FileSyncMessage::Missing) => {
                tracing::warn!(kind = ?reply.kind(), "Ignoring unsolicited file-sync reply");
            }
        }
        Ok(())
    }

    /// Read the `size` content bytes following a `FileSend` header and store
    /// them
    ///
    /// Content is consumed even when the name is rejected, so the next
    /// envelope starts on a frame boundary.
    async fn receive_file(&mut self, file_name: &str, size: u64) -> Result<()> {
        let mut writer = match self.repository.create(file_name).await {
            Ok(writer) => Some(writer),
            Err(SyncError::InvalidFileName { name }) => {
                tracing::warn!(file = %name, "Discarding pushed file with unsafe name");
                None
            }
            Err(e) => return Err(e),
        };

        let copied = self.copy_content(&mut writer, size).await;

        match (copied, writer) {
            (Ok(()), Some(writer)) => {
                let path = writer.commit().await?;
                tracing::info!(file = %file_name, path = %path.display(), "Received file");
                Ok(())
            }
            (Ok(()), None) => Ok(()),
            (Err(e), Some(writer)) => {
                writer.abort().await;
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }

    async fn copy_content(
        &mut self,
        writer: &mut Option<Box<dyn FileWriter>>,
        size: u64,
    ) -> Result<()> {
        let chunk_len = FILE_CHUNK_LEN.min(self.config.max_frame_len).max(1);
        let mut remaining = size;

        while remaining > 0 {
            let len = usize::try_from(remaining).map_or(chunk_len, |r| r.min(chunk_len));
            let chunk = self.transport()?.receive_raw(len).await?;
            if let Some(writer) = writer.as_mut() {
                writer.append(&chunk).await?;
            }
            remaining -= len as u64;
        }
        Ok(())
    }

    async fn handle_signal(&mut self, signal: SignalMessage) -> Result<()> {
        let target = signal.checked_target_instant().ok_or_else(|| {
            ProtocolError::malformed(format!(
                "signal target {} + {}s is out of range",
                signal.sent_at, signal.delay_seconds
            ))
        })?;
        tracing::debug!(
            action = %signal.action,
            delay = signal.delay_seconds,
            "Signal received, waiting for target instant"
        );

        wait_until(self.clock.as_ref(), target).await?;
        self.execute(&signal);
        Ok(())
    }

    fn execute(&mut self, signal: &SignalMessage) {
        let result = match signal.action {
            SignalAction::Play => {
                let Some(name) = signal.file_name.as_deref() else {
                    tracing::warn!("Play signal without a file name");
                    return;
                };
                let path = match self.repository.path_of(name) {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::warn!("Cannot play {}: {}", name, e);
                        return;
                    }
                };
                self.audio.load(&path).and_then(|()| self.audio.play())
            }
            SignalAction::Stop => self.audio.stop(),
            SignalAction::Pause => self.audio.pause(),
            SignalAction::Resume => self.audio.resume(),
        };

        match result {
            Ok(()) => tracing::info!(action = %signal.action, "Executed signal"),
            Err(e) => tracing::warn!(action = %signal.action, "Audio error: {}", e),
        }
    }
}

impl SyncClient<TcpStream> {
    /// Create a TCP client using a directory repository and the configured
    /// clock service
    pub fn new(config: ClientConfig, audio: impl AudioSink + 'static) -> Self {
        Self::for_stream(config, audio)
    }

    /// Connect to a server over TCP and send the greeting
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or greeting fails.
    pub async fn connect(&mut self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        self.attach(stream).await?;
        tracing::info!(peer = %peer, "Connected to server");
        Ok(peer)
    }
}
