//! Concurrent registry of connected clients

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

use super::handle::{ClientHandle, ClientId};
use crate::protocol::{BoxedStream, FramedTransport};

/// Registry of client handles
///
/// Fan-out passes iterate a [`snapshot`](Self::snapshot), so connections
/// accepted or removed mid-pass never disturb the pass.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    next_id: AtomicU64,
    clients: RwLock<HashMap<ClientId, Arc<ClientHandle>>>,
}

impl ClientRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a greeted connection
    pub async fn register(
        &self,
        addr: SocketAddr,
        transport: FramedTransport<BoxedStream>,
    ) -> Arc<ClientHandle> {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(ClientHandle::new(id, addr, transport));
        self.clients.write().await.insert(id, handle.clone());
        handle
    }

    /// Remove a handle, returning it if it was registered
    pub async fn remove(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        self.clients.write().await.remove(&id)
    }

    /// Look up a handle
    pub async fn get(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        self.clients.read().await.get(&id).cloned()
    }

    /// All current handles, ordered by registration
    pub async fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        let mut handles: Vec<_> = self.clients.read().await.values().cloned().collect();
        handles.sort_by_key(|handle| handle.id());
        handles
    }

    /// Remove and return every handle
    pub async fn drain(&self) -> Vec<Arc<ClientHandle>> {
        let mut handles: Vec<_> = self
            .clients
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        handles.sort_by_key(|handle| handle.id());
        handles
    }

    /// Number of registered handles
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether no handles are registered
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}
