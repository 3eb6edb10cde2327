//! Server events for application integration

use std::net::SocketAddr;

use super::handle::ClientId;

/// Events emitted by the fan-out server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Listener bound and accepting
    Listening {
        /// Bound address
        addr: SocketAddr,
    },

    /// Client greeted and was registered
    ClientRegistered {
        /// Registry identifier
        id: ClientId,
        /// Client address
        addr: SocketAddr,
    },

    /// Client removed from the registry
    ClientRemoved {
        /// Registry identifier
        id: ClientId,
        /// Client address
        addr: SocketAddr,
        /// Why it was removed
        reason: String,
    },

    /// Server stopped
    Stopped,
}

/// Outcome of one signal broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients the signal was written to
    pub delivered: Vec<SocketAddr>,
    /// Clients whose send failed
    pub failed: Vec<SocketAddr>,
}

impl BroadcastReport {
    /// Whether every client received the signal
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of one file synchronization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSyncReport {
    /// Clients that already had the file
    pub up_to_date: Vec<SocketAddr>,
    /// Clients the file was pushed to
    pub pushed: Vec<SocketAddr>,
    /// Clients that failed to answer or to receive the file
    pub failed: Vec<SocketAddr>,
}

impl FileSyncReport {
    /// Whether every client now has the file
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
