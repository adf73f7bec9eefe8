//! Privileged helper process and its IPC channel.
//!
//! Workers run unprivileged; mounts, unmounts, and ownership changes are
//! delegated to a Watcher process over two unidirectional Unix sockets per
//! worker index (requests on `{insock-prefix}-{idx}.sock`, responses on
//! `{outsock-prefix}-{idx}.sock`). See [`protocol`] for the frame layout.
//!
//! ```text
//! worker                              watcher
//! WatcherClient ──insock──▶ WatcherServer ─▶ TaskRunner (mount/umount/chown)
//!        ▲                        │
//!        └────────outsock─────────┘
//! ```

mod client;
pub mod fstab;
pub mod protocol;
mod server;
mod tasks;

use std::path::PathBuf;
use std::sync::Arc;

pub use client::WatcherClient;
pub use protocol::{ChownTask, MountTask, Response, UmountTask, WIRE_VERSION, WatcherTask, WireError};
pub use server::WatcherServer;
pub use tasks::{DEFAULT_UMOUNT_TIMEOUT, TaskRunner};

use crate::config::ProxySettings;

/// A client shared by every volume of one worker.
pub type SharedWatcher = Arc<tokio::sync::Mutex<WatcherClient>>;

/// Socket pair of one worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatcherPaths {
    pub insock: PathBuf,
    pub outsock: PathBuf,
}

impl WatcherPaths {
    pub fn new(insock: impl Into<PathBuf>, outsock: impl Into<PathBuf>) -> Self {
        Self {
            insock: insock.into(),
            outsock: outsock.into(),
        }
    }

    pub fn for_worker(settings: &ProxySettings, worker_index: usize) -> Self {
        let (insock, outsock) = settings.watcher_socket_paths(worker_index);
        Self { insock, outsock }
    }
}

/// Connect and wrap the client for sharing.
pub async fn connect_shared(paths: &WatcherPaths) -> crate::error::StorageResult<SharedWatcher> {
    let client = WatcherClient::connect(paths).await?;
    Ok(Arc::new(tokio::sync::Mutex::new(client)))
}
