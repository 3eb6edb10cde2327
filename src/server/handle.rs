//! Server-side handle for one client connection

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Mutex;

use crate::protocol::{BoxedStream, Envelope, FileSyncMessage, FramedTransport, ProtocolError};

/// Registry-assigned client identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// One accepted, greeted connection
///
/// The transport sits behind a lock so a who-has query and its reply are
/// never interleaved with other traffic on the same connection.
pub struct ClientHandle {
    id: ClientId,
    addr: SocketAddr,
    transport: Mutex<FramedTransport<BoxedStream>>,
    consecutive_failures: AtomicU32,
}

impl ClientHandle {
    pub(crate) fn new(id: ClientId, addr: SocketAddr, transport: FramedTransport<BoxedStream>) -> Self {
        Self {
            id,
            addr,
            transport: Mutex::new(transport),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Identifier
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Remote address
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Failed sends since the last success
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Send an already encoded envelope as one frame
    pub(crate) async fn send_frame(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.transport.lock().await.send(payload).await
    }

    /// Send `WhoHas` and wait for the reply
    pub(crate) async fn query_file(
        &self,
        file_name: &str,
        file_size: u32,
    ) -> Result<Envelope, ProtocolError> {
        let query = Envelope::from(FileSyncMessage::WhoHas {
            file_name: file_name.to_string(),
            file_size,
        });

        let mut transport = self.transport.lock().await;
        transport.send_envelope(&query).await?;
        transport.receive_envelope().await
    }

    /// Send a `FileSend` header followed by the raw content
    pub(crate) async fn push_file(
        &self,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), ProtocolError> {
        let file_size = u32::try_from(content.len())
            .map_err(|_| ProtocolError::malformed("file does not fit the 4-byte size field"))?;
        let header = Envelope::from(FileSyncMessage::FileSend {
            file_name: file_name.to_string(),
            file_size,
        });

        let mut transport = self.transport.lock().await;
        transport.send_envelope(&header).await?;
        transport.send_raw(content).await
    }

    /// Shut down the connection
    pub(crate) async fn close(&self) {
        if let Err(e) = self.transport.lock().await.shutdown().await {
            tracing::debug!(peer = %self.addr, "Error closing connection: {}", e);
        }
    }

    pub(crate) fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Count a failure, returning the new consecutive count
    pub(crate) fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("consecutive_failures", &self.consecutive_failures())
            .finish_non_exhaustive()
    }
}
