//! Fan-out server and client registry

mod events;
mod handle;
mod registry;
#[allow(clippy::module_inception)]
mod server;

#[cfg(test)]
mod tests;

pub use events::{BroadcastReport, FileSyncReport, ServerEvent};
pub use handle::{ClientHandle, ClientId};
pub use registry::ClientRegistry;
pub use server::{ServerState, SyncServer};
