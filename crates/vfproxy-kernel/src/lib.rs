//! # vfproxy-kernel
//!
//! Storage volume layer of the vfproxy storage proxy.
//!
//! A worker owns a [`VolumePool`]: one initialised [`Volume`] per configured
//! backend instance. Volumes expose vfolders grouped into quota scopes and hide
//! how each backend lays them out and enforces limits. Privileged work
//! (mounts, fstab edits, ownership changes) is delegated to a separate
//! [`watcher`] process over Unix sockets. Long-running vfolder deletes and
//! clones run as [`bgtask`] handlers that report through an
//! [`EventProducer`].

pub mod bgtask;
pub mod blocking;
pub mod config;
pub mod error;
pub mod events;
pub mod fslock;
pub mod pool;
pub mod retry;
pub mod subproc;
pub mod volume;
pub mod watcher;

pub use bgtask::{
    BackgroundTaskHandler, BackgroundTaskRunner, CloneVFolderHandler, DeleteVFolderHandler,
    TaskManifest, TaskStatus, VFolderCloneManifest, VFolderDeleteManifest,
};
pub use config::{ConfigError, ProxyConfig, ProxySettings, VolumeConfig, VolumeSettings};
pub use error::{ErrorKind, StorageError, StorageResult};
pub use events::{EventBus, EventMessage, EventProducer, HasSubject, Subscription, VFolderEvent, matches_pattern};
pub use fslock::{DEFAULT_LOCK_TIMEOUT, FileLock};
pub use pool::{BackendDiscovery, BackendRegistry, BuiltinBackends, VolumeInfo, VolumePool};
pub use volume::{FsOpModel, QuotaModel, Volume, VolumeDeps};
pub use watcher::{SharedWatcher, TaskRunner, WatcherClient, WatcherPaths, WatcherServer, WatcherTask};
