//! Vfolder deletion and clone handlers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::BackgroundTaskHandler;
use super::manifest::{VFolderCloneManifest, VFolderDeleteManifest};
use crate::error::StorageResult;
use crate::events::{EventProducer, VFolderEvent};
use crate::pool::VolumePool;

/// Deletes a vfolder and reports the outcome.
pub struct DeleteVFolderHandler {
    pool: Arc<VolumePool>,
    events: Arc<dyn EventProducer>,
}

impl DeleteVFolderHandler {
    pub fn new(pool: Arc<VolumePool>, events: Arc<dyn EventProducer>) -> Self {
        Self { pool, events }
    }
}

#[async_trait]
impl BackgroundTaskHandler for DeleteVFolderHandler {
    type Manifest = VFolderDeleteManifest;

    fn name(&self) -> &'static str {
        "vfolder-delete"
    }

    #[instrument(skip_all, fields(volume = %manifest.volume, vfid = %manifest.vfid))]
    async fn execute(&self, manifest: VFolderDeleteManifest) -> StorageResult<()> {
        let volume = self.pool.get_volume_by_name(&manifest.volume).await?;
        let vfid = manifest.vfid;

        match volume.delete_vfolder(&vfid).await {
            Ok(()) => {
                info!("vfolder deleted");
                self.events
                    .produce_event(VFolderEvent::DeletionSuccess { vfid })
                    .await
            }
            Err(e) => {
                warn!(error = %e, "vfolder deletion failed");
                let event = VFolderEvent::DeletionFailure {
                    vfid,
                    message: e.event_message(),
                };
                if let Err(publish) = self.events.produce_event(event).await {
                    warn!(error = %publish, "failed to publish deletion failure");
                }
                Err(e)
            }
        }
    }
}

/// Clones a vfolder and reports the outcome.
pub struct CloneVFolderHandler {
    pool: Arc<VolumePool>,
    events: Arc<dyn EventProducer>,
}

impl CloneVFolderHandler {
    pub fn new(pool: Arc<VolumePool>, events: Arc<dyn EventProducer>) -> Self {
        Self { pool, events }
    }
}

#[async_trait]
impl BackgroundTaskHandler for CloneVFolderHandler {
    type Manifest = VFolderCloneManifest;

    fn name(&self) -> &'static str {
        "vfolder-clone"
    }

    #[instrument(
        skip_all,
        fields(volume = %manifest.volume, src = %manifest.src_vfid, dst = %manifest.dst_vfid)
    )]
    async fn execute(&self, manifest: VFolderCloneManifest) -> StorageResult<()> {
        let volume = self.pool.get_volume_by_name(&manifest.volume).await?;
        let (src_vfid, dst_vfid) = (manifest.src_vfid, manifest.dst_vfid);

        match volume.clone_vfolder(&src_vfid, &dst_vfid).await {
            Ok(()) => {
                info!("vfolder cloned");
                self.events
                    .produce_event(VFolderEvent::CloneSuccess { src_vfid, dst_vfid })
                    .await
            }
            Err(e) => {
                warn!(error = %e, "vfolder clone failed");
                let event = VFolderEvent::CloneFailure {
                    src_vfid,
                    dst_vfid,
                    message: e.event_message(),
                };
                if let Err(publish) = self.events.produce_event(event).await {
                    warn!(error = %publish, "failed to publish clone failure");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, ProxySettings, VolumeConfig};
    use crate::error::StorageError;
    use crate::events::HasSubject;
    use crate::pool::BuiltinBackends;
    use crate::volume::VolumeDeps;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use uuid::Uuid;
    use vfproxy_types::{QuotaScopeId, VFolderId};

    /// Records every event it is handed.
    #[derive(Default)]
    struct RecordingProducer {
        events: Mutex<Vec<VFolderEvent>>,
    }

    #[async_trait]
    impl EventProducer for RecordingProducer {
        async fn produce_event(&self, event: VFolderEvent) -> StorageResult<()> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    /// Rejects every event, like a bus that is down.
    struct DownProducer;

    #[async_trait]
    impl EventProducer for DownProducer {
        async fn produce_event(&self, _event: VFolderEvent) -> StorageResult<()> {
            Err(StorageError::external("bus down"))
        }
    }

    async fn setup() -> (Arc<VolumePool>, Arc<RecordingProducer>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let config = ProxyConfig {
            storage_proxy: ProxySettings::default(),
            volume: [("local".to_string(), VolumeConfig::new("vfs", tmp.path()))]
                .into_iter()
                .collect(),
        };
        let pool = VolumePool::create(&config, VolumeDeps::default(), &BuiltinBackends)
            .await
            .unwrap();
        (Arc::new(pool), Arc::new(RecordingProducer::default()), tmp)
    }

    async fn scoped_folder(pool: &VolumePool) -> VFolderId {
        let volume = pool.get_volume_by_name("local").await.unwrap();
        let scope = QuotaScopeId::user(Uuid::new_v4());
        volume.create_quota_scope(&scope, None).await.unwrap();
        let vfid = VFolderId::random(scope);
        volume.create_vfolder(&vfid, false).await.unwrap();
        vfid
    }

    #[tokio::test]
    async fn test_delete_publishes_success() {
        let (pool, events, _tmp) = setup().await;
        let vfid = scoped_folder(&pool).await;
        let handler = DeleteVFolderHandler::new(pool.clone(), events.clone());

        handler
            .execute(VFolderDeleteManifest::new("local", vfid))
            .await
            .unwrap();

        let published = events.events.lock().clone();
        assert_eq!(published, vec![VFolderEvent::DeletionSuccess { vfid }]);
    }

    #[tokio::test]
    async fn test_delete_missing_publishes_failure() {
        let (pool, events, _tmp) = setup().await;
        let vfid = VFolderId::legacy(Uuid::new_v4());
        let handler = DeleteVFolderHandler::new(pool, events.clone());

        let err = handler
            .execute(VFolderDeleteManifest::new("local", vfid))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::VFolderNotFound(_)));

        let published = events.events.lock().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject(), "vfolder.deletion.failure");
        match &published[0] {
            VFolderEvent::DeletionFailure { vfid: got, message } => {
                assert_eq!(*got, vfid);
                assert_eq!(*message, err.event_message());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_volume_emits_nothing() {
        let (pool, events, _tmp) = setup().await;
        let handler = DeleteVFolderHandler::new(pool, events.clone());
        let err = handler
            .execute(VFolderDeleteManifest::new(
                "elsewhere",
                VFolderId::legacy(Uuid::new_v4()),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidVolume(_)));
        assert!(events.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_clone_publishes_success() {
        let (pool, events, _tmp) = setup().await;
        let src = scoped_folder(&pool).await;
        let volume = pool.get_volume_by_name("local").await.unwrap();
        volume
            .mkdir(&src, std::path::Path::new("data"), false, false)
            .await
            .unwrap();
        let dst = VFolderId::random(src.quota_scope_id.unwrap());

        let handler = CloneVFolderHandler::new(pool.clone(), events.clone());
        handler
            .execute(VFolderCloneManifest::new("local", src, dst))
            .await
            .unwrap();

        assert!(volume.mangle_vfpath(&dst).join("data").is_dir());
        assert_eq!(
            events.events.lock().clone(),
            vec![VFolderEvent::CloneSuccess {
                src_vfid: src,
                dst_vfid: dst
            }]
        );
    }

    #[tokio::test]
    async fn test_clone_missing_source_publishes_failure() {
        let (pool, events, _tmp) = setup().await;
        let src = VFolderId::legacy(Uuid::new_v4());
        let dst = VFolderId::legacy(Uuid::new_v4());
        let handler = CloneVFolderHandler::new(pool, events.clone());

        assert!(
            handler
                .execute(VFolderCloneManifest::new("local", src, dst))
                .await
                .is_err()
        );
        let published = events.events.lock().clone();
        assert_eq!(published.len(), 1);
        assert!(published[0].is_failure());
        assert_eq!(published[0].subject(), "vfolder.clone.failure");
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_operation_error() {
        let (pool, _events, _tmp) = setup().await;
        let delete = DeleteVFolderHandler::new(pool.clone(), Arc::new(DownProducer));
        let err = delete
            .execute(VFolderDeleteManifest::new(
                "local",
                VFolderId::legacy(Uuid::new_v4()),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::VFolderNotFound(_)));

        let clone = CloneVFolderHandler::new(pool, Arc::new(DownProducer));
        let err = clone
            .execute(VFolderCloneManifest::new(
                "local",
                VFolderId::legacy(Uuid::new_v4()),
                VFolderId::legacy(Uuid::new_v4()),
            ))
            .await
            .unwrap_err();
        assert!(!matches!(err, StorageError::External(_)));
    }
}
