//! Background vfolder tasks.
//!
//! A handler resolves its volume from the [`VolumePool`](crate::pool::VolumePool),
//! performs one long-running vfolder operation, and publishes exactly one
//! outcome event (unless the volume itself is unknown). The
//! [`BackgroundTaskRunner`] is the orchestrating side: it spawns executions,
//! tracks their status by task id and refuses a second task for a vfolder that
//! already has one in flight.

mod handlers;
pub mod manifest;
mod runner;

use async_trait::async_trait;

pub use handlers::{CloneVFolderHandler, DeleteVFolderHandler};
pub use manifest::{MANIFEST_VERSION, VFolderCloneManifest, VFolderDeleteManifest};
pub use runner::{BackgroundTaskRunner, TaskStatus};

use crate::error::StorageResult;

/// A task request that names the resource it works on.
pub trait TaskManifest: Send + 'static {
    /// Tasks sharing a key never run concurrently.
    fn task_key(&self) -> String;
}

impl TaskManifest for VFolderDeleteManifest {
    fn task_key(&self) -> String {
        format!("{}/{}", self.volume, self.vfid)
    }
}

impl TaskManifest for VFolderCloneManifest {
    /// Keyed on the destination; the source is only read.
    fn task_key(&self) -> String {
        format!("{}/{}", self.volume, self.dst_vfid)
    }
}

/// One kind of background task.
#[async_trait]
pub trait BackgroundTaskHandler: Send + Sync {
    type Manifest: TaskManifest;

    fn name(&self) -> &'static str;

    async fn execute(&self, manifest: Self::Manifest) -> StorageResult<()>;
}
