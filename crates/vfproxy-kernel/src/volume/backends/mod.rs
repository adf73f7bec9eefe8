//! Volume backend implementations.
//!
//! Each backend exposes a `from_context` constructor with the
//! [`VolumeConstructor`] signature; the pool's backend registry maps names to
//! those constructors.

pub mod share;
pub mod vfs;
pub mod xfs;

use std::sync::Arc;

use crate::config::{VolumeConfig, VolumeSettings};
use crate::error::StorageResult;
use crate::watcher::SharedWatcher;

use super::ops::Volume;

/// Process-wide collaborators a backend may need.
#[derive(Clone, Default)]
pub struct VolumeDeps {
    /// Client of the privileged Watcher, when `use-watcher` is enabled.
    pub watcher: Option<SharedWatcher>,
    /// Owner (uid, gid) applied to privileged mounts.
    pub owner: Option<(u32, u32)>,
}

impl std::fmt::Debug for VolumeDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDeps")
            .field("watcher", &self.watcher.is_some())
            .field("owner", &self.owner)
            .finish()
    }
}

/// Everything a backend constructor receives.
#[derive(Debug, Clone)]
pub struct VolumeContext {
    pub name: String,
    pub config: VolumeConfig,
    pub settings: VolumeSettings,
    pub deps: VolumeDeps,
}

/// Builds a volume from its configuration. Must not touch the filesystem;
/// fallible setup belongs in [`Volume::init`].
pub type VolumeConstructor = fn(VolumeContext) -> StorageResult<Arc<dyn Volume>>;
