//! Fan-out server: accepts clients, broadcasts signals, synchronizes files

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{BroadcastReport, FileSyncReport, ServerEvent};
use super::handle::ClientHandle;
use super::registry::ClientRegistry;
use crate::clock::{AuthoritativeClock, SystemClock};
use crate::error::{Result, SyncError};
use crate::protocol::{
    BoxedStream, Envelope, FileSyncMessage, FramedTransport, SignalAction, SignalMessage,
};
use crate::types::ServerConfig;

/// Server state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not accepting connections
    Stopped,
    /// Accept loop running
    Listening,
}

/// Who-has answer from one client
enum QueryOutcome {
    Have,
    Missing,
    /// Send or receive failed; the connection may still be usable
    Failed(SyncError),
    /// No answer in time; replies on this connection can no longer be
    /// matched to queries
    TimedOut,
}

/// Fan-out server
///
/// Owns the client registry. Every per-client failure during a fan-out pass
/// is logged with the client's address and isolated from the other clients.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    clock: Arc<dyn AuthoritativeClock>,
    event_tx: broadcast::Sender<ServerEvent>,
    cancel: Option<CancellationToken>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl SyncServer {
    /// Create a stopped server stamping signals with the local clock
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            config,
            registry: Arc::new(ClientRegistry::new()),
            clock: Arc::new(SystemClock),
            event_tx,
            cancel: None,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Stamp signals with a different authoritative clock
    #[must_use]
    pub fn with_clock(mut self, clock: impl AuthoritativeClock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Subscribe to events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// Client registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Server configuration
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ServerState {
        if self.cancel.is_some() {
            ServerState::Listening
        } else {
            ServerState::Stopped
        }
    }

    /// Bound address while listening
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and spawn the accept loop
    ///
    /// # Errors
    ///
    /// Returns `SyncError::AlreadyRunning` if started twice, or the bind error.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.cancel.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(accept_loop(
            listener,
            self.registry.clone(),
            self.config.clone(),
            self.event_tx.clone(),
            cancel.clone(),
        ));

        tracing::info!(addr = %local_addr, "Server listening");
        let _ = self.event_tx.send(ServerEvent::Listening { addr: local_addr });

        self.cancel = Some(cancel);
        self.accept_task = Some(task);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop accepting, close every client connection and empty the registry
    ///
    /// Fan-out passes borrow the server, so none is in flight here and every
    /// handle's transport lock is free; a pass whose future was dropped has
    /// already released its locks.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotRunning` if the server was not started.
    pub async fn stop(&mut self) -> Result<()> {
        let cancel = self.cancel.take().ok_or(SyncError::NotRunning)?;
        cancel.cancel();

        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Accept loop ended abnormally: {}", e);
            }
        }

        for handle in self.registry.drain().await {
            handle.close().await;
            let _ = self.event_tx.send(ServerEvent::ClientRemoved {
                id: handle.id(),
                addr: handle.addr(),
                reason: "server stopped".to_string(),
            });
        }

        self.local_addr = None;
        tracing::info!("Server stopped");
        let _ = self.event_tx.send(ServerEvent::Stopped);
        Ok(())
    }

    /// Build a signal stamped with the current authoritative time and send it
    /// to every registered client
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidParameter` for `Play` without a file name,
    /// or the error from reading the clock. Per-client send failures never
    /// fail the call; they are reported in the returned report.
    pub async fn broadcast_signal(
        &self,
        action: SignalAction,
        file_name: Option<&str>,
        delay_seconds: u32,
    ) -> Result<BroadcastReport> {
        let sent_at = self.clock.now().await?;

        let message = match (action, file_name) {
            (SignalAction::Play, Some(name)) => SignalMessage::play(name, sent_at, delay_seconds),
            (SignalAction::Play, None) => {
                return Err(SyncError::InvalidParameter {
                    name: "file_name".to_string(),
                    message: "play requires a file name".to_string(),
                });
            }
            (action, _) => SignalMessage::control(action, sent_at, delay_seconds),
        };

        self.broadcast(&message).await
    }

    /// Send a prepared signal to every registered client
    ///
    /// # Errors
    ///
    /// Returns an error only if the message cannot be encoded.
    pub async fn broadcast(&self, message: &SignalMessage) -> Result<BroadcastReport> {
        let payload = Envelope::from(message.clone()).encode()?;
        let payload = &payload;
        let handles = self.registry.snapshot().await;

        let results = join_all(handles.iter().map(|handle| async move {
            let result = handle.send_frame(payload).await;
            (handle, result)
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (handle, result) in results {
            match result {
                Ok(()) => {
                    handle.record_success();
                    report.delivered.push(handle.addr());
                }
                Err(e) => {
                    report.failed.push(handle.addr());
                    let error = SyncError::from(e);
                    self.handle_failure(handle, &format!("{} signal", message.action), &error)
                        .await;
                }
            }
        }

        tracing::info!(
            action = %message.action,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Broadcast signal"
        );
        Ok(report)
    }

    /// Broadcast `Play` for `file_name`
    ///
    /// # Errors
    ///
    /// See [`broadcast_signal`](Self::broadcast_signal).
    pub async fn signal_play(&self, file_name: &str, delay_seconds: u32) -> Result<BroadcastReport> {
        self.broadcast_signal(SignalAction::Play, Some(file_name), delay_seconds)
            .await
    }

    /// Broadcast `Stop` with the default delay
    ///
    /// # Errors
    ///
    /// See [`broadcast_signal`](Self::broadcast_signal).
    pub async fn signal_stop(&self) -> Result<BroadcastReport> {
        self.broadcast_signal(SignalAction::Stop, None, self.config.default_delay_seconds)
            .await
    }

    /// Broadcast `Pause` with the default delay
    ///
    /// # Errors
    ///
    /// See [`broadcast_signal`](Self::broadcast_signal).
    pub async fn signal_pause(&self) -> Result<BroadcastReport> {
        self.broadcast_signal(SignalAction::Pause, None, self.config.default_delay_seconds)
            .await
    }

    /// Broadcast `Resume` with the default delay
    ///
    /// # Errors
    ///
    /// See [`broadcast_signal`](Self::broadcast_signal).
    pub async fn signal_resume(&self) -> Result<BroadcastReport> {
        self.broadcast_signal(SignalAction::Resume, None, self.config.default_delay_seconds)
            .await
    }

    /// Make sure every client holds `path`
    ///
    /// All clients are asked who-has first; only once every answer is in (or
    /// has timed out) is the content pushed to the clients that lack it.
    ///
    /// # Errors
    ///
    /// Returns an error if the local file cannot be read or named. Per-client
    /// failures are reported in the returned report.
    pub async fn sync_file(&self, path: impl AsRef<Path>) -> Result<FileSyncReport> {
        let path = path.as_ref();
        let (file_name, content) = read_local_file(path).await?;
        let file_size = u32::try_from(content.len()).map_err(|_| SyncError::FileTooLarge {
            name: file_name.clone(),
            size: content.len() as u64,
        })?;

        let handles = self.registry.snapshot().await;
        let mut report = FileSyncReport::default();

        // Query phase
        let file_name_ref = file_name.as_str();
        let reply_timeout = self.config.reply_timeout;
        let answers = join_all(handles.iter().map(|handle| async move {
            let outcome =
                match tokio::time::timeout(reply_timeout, handle.query_file(file_name_ref, file_size))
                    .await
                {
                    Err(_) => QueryOutcome::TimedOut,
                    Ok(Ok(Envelope::FileSync(FileSyncMessage::Have))) => QueryOutcome::Have,
                    Ok(Ok(Envelope::FileSync(FileSyncMessage::Missing))) => QueryOutcome::Missing,
                    Ok(Ok(other)) => QueryOutcome::Failed(SyncError::UnexpectedMessage {
                        expected: "Have or Missing".to_string(),
                        actual: describe(&other),
                    }),
                    Ok(Err(e)) => QueryOutcome::Failed(e.into()),
                };
            (handle, outcome)
        }))
        .await;

        let mut needs_file = Vec::new();
        for (handle, outcome) in answers {
            match outcome {
                QueryOutcome::Have => {
                    handle.record_success();
                    report.up_to_date.push(handle.addr());
                }
                QueryOutcome::Missing => {
                    handle.record_success();
                    needs_file.push(handle);
                }
                QueryOutcome::Failed(e) => {
                    report.failed.push(handle.addr());
                    self.handle_failure(handle, "who-has query", &e).await;
                }
                QueryOutcome::TimedOut => {
                    report.failed.push(handle.addr());
                    tracing::warn!(
                        peer = %handle.addr(),
                        timeout = ?reply_timeout,
                        "No who-has reply, removing client"
                    );
                    self.evict(handle, "who-has reply timed out").await;
                }
            }
        }

        // Push phase
        let content = content.as_slice();
        let pushes = join_all(needs_file.iter().map(|handle| async move {
            let result = handle.push_file(file_name_ref, content).await;
            (*handle, result)
        }))
        .await;

        for (handle, result) in pushes {
            match result {
                Ok(()) => {
                    handle.record_success();
                    report.pushed.push(handle.addr());
                }
                Err(e) => {
                    report.failed.push(handle.addr());
                    self.handle_failure(handle, "file push", &SyncError::from(e))
                        .await;
                }
            }
        }

        tracing::info!(
            file = %file_name,
            size = file_size,
            up_to_date = report.up_to_date.len(),
            pushed = report.pushed.len(),
            failed = report.failed.len(),
            "File synchronized"
        );
        Ok(report)
    }

    /// Synchronize `path` and then signal everyone to play it after the
    /// default delay
    ///
    /// # Errors
    ///
    /// See [`sync_file`](Self::sync_file) and
    /// [`broadcast_signal`](Self::broadcast_signal).
    pub async fn serve_and_play(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(FileSyncReport, BroadcastReport)> {
        let path = path.as_ref();
        let sync = self.sync_file(path).await?;
        let file_name = file_name_of(path)?;
        let play = self
            .signal_play(&file_name, self.config.default_delay_seconds)
            .await?;
        Ok((sync, play))
    }

    async fn handle_failure(&self, handle: &Arc<ClientHandle>, operation: &str, error: &SyncError) {
        let failures = handle.record_failure();
        tracing::warn!(
            peer = %handle.addr(),
            failures,
            "{} failed: {}",
            operation,
            error
        );

        if self.config.eviction.should_evict(failures) {
            self.evict(handle, &format!("{failures} consecutive failures"))
                .await;
        }
    }

    async fn evict(&self, handle: &Arc<ClientHandle>, reason: &str) {
        if self.registry.remove(handle.id()).await.is_none() {
            return;
        }

        handle.close().await;
        tracing::info!(peer = %handle.addr(), reason, "Client removed");
        let _ = self.event_tx.send(ServerEvent::ClientRemoved {
            id: handle.id(),
            addr: handle.addr(),
            reason: reason.to_string(),
        });
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    config: ServerConfig,
    event_tx: broadcast::Sender<ServerEvent>,
    cancel: CancellationToken,
) {
    let config = Arc::new(config);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::debug!(peer = %addr, "Accepted connection");
                        tokio::spawn(admit(
                            stream,
                            addr,
                            registry.clone(),
                            config.clone(),
                            event_tx.clone(),
                            cancel.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
        }
    }

    tracing::debug!("Accept loop exiting");
}

/// Run the greeting handshake and register the connection
async fn admit(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    config: Arc<ServerConfig>,
    event_tx: broadcast::Sender<ServerEvent>,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %addr, "Cannot set TCP_NODELAY: {}", e);
    }
    let stream: BoxedStream = Box::new(stream);
    let mut transport = FramedTransport::with_max_frame_len(stream, config.max_frame_len);

    let greeting = tokio::select! {
        () = cancel.cancelled() => return,
        result = tokio::time::timeout(config.handshake_timeout, transport.receive()) => result,
    };

    let failure = match greeting {
        Ok(Ok(frame)) if frame[..] == config.greeting[..] => None,
        Ok(Ok(_)) => Some("unexpected greeting".to_string()),
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some("no greeting before timeout".to_string()),
    };
    if let Some(reason) = failure {
        let err = SyncError::HandshakeFailed { peer: addr, reason };
        tracing::warn!(peer = %addr, "Rejecting connection: {}", err);
        return;
    }

    let handle = registry.register(addr, transport).await;

    // stop() cancels before draining; a registration that lands after the
    // drain must undo itself
    if cancel.is_cancelled() {
        if let Some(handle) = registry.remove(handle.id()).await {
            handle.close().await;
        }
        return;
    }

    tracing::info!(peer = %addr, id = %handle.id(), "Client registered");
    let _ = event_tx.send(ServerEvent::ClientRegistered {
        id: handle.id(),
        addr,
    });
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .ok_or_else(|| SyncError::InvalidFileName {
            name: path.display().to_string(),
        })
}

async fn read_local_file(path: &Path) -> Result<(String, Vec<u8>)> {
    let file_name = file_name_of(path)?;
    let content = tokio::fs::read(path)
        .await
        .map_err(|source| SyncError::Repository {
            name: file_name.clone(),
            source,
        })?;
    Ok((file_name, content))
}

fn describe(envelope: &Envelope) -> String {
    match envelope {
        Envelope::Signal(signal) => format!("{} signal", signal.action),
        Envelope::FileSync(message) => format!("{:?}", message.kind()),
    }
}
