//! Per-scope share backend.
//!
//! Every quota scope is its own provisioned share, mounted at the scope root
//! through the Watcher. The provisioner's share record is the scope's
//! tracking metadata: a scope exists exactly when its record does.
//!
//! Creation provisions the share, polls until the export is visible, asks the
//! Watcher to mount it (recording it in fstab when configured), and chowns the
//! mount point to the configured owner. Deletion unmounts and releases it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use vfproxy_types::{Capability, CapabilitySet, QuotaConfig, QuotaScopeId, QuotaUsage};

use super::vfs::{BaseFsOpModel, BaseQuotaModel, check_mount_path};
use super::{VolumeContext, VolumeDeps};
use crate::blocking::run_blocking;
use crate::config::VolumeSettings;
use crate::error::{StorageError, StorageResult};
use crate::fslock::FileLock;
use crate::retry::retry_fixed;
use crate::volume::ops::{FsOpModel, QuotaModel, Volume};
use crate::watcher::{ChownTask, MountTask, SharedWatcher, UmountTask, WatcherTask};

/// Registered backend name.
pub const BACKEND_NAME: &str = "share";

const RECORDS_DIRNAME: &str = ".records";
const LOCK_FILENAME: &str = ".provision.lock";

mod defaults {
    use std::path::PathBuf;

    pub fn fs_type() -> String {
        "none".to_string()
    }

    pub fn mount_options() -> Option<String> {
        Some("bind".to_string())
    }

    pub fn edit_fstab() -> bool {
        true
    }

    pub fn fstab_path() -> PathBuf {
        PathBuf::from("/etc/fstab")
    }

    pub fn max_poll_count() -> usize {
        20
    }

    pub fn poll_interval_ms() -> u64 {
        1000
    }

    pub fn umount_timeout() -> u64 {
        30
    }
}

/// `[volume.<name>.options]` of a `share` volume.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ShareOptions {
    /// Directory holding the provisioned shares.
    pub export_root: PathBuf,
    /// When set, shares are mounted from `{prefix}:/share_{id}` (e.g. an NFS
    /// server) instead of their local export path.
    #[serde(default)]
    pub fs_location_prefix: Option<String>,
    #[serde(default = "defaults::fs_type")]
    pub fs_type: String,
    #[serde(default = "defaults::mount_options")]
    pub mount_options: Option<String>,
    #[serde(default = "defaults::edit_fstab")]
    pub edit_fstab: bool,
    #[serde(default = "defaults::fstab_path")]
    pub fstab_path: PathBuf,
    #[serde(default = "defaults::max_poll_count")]
    pub max_poll_count: usize,
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seconds.
    #[serde(default = "defaults::umount_timeout")]
    pub umount_timeout: u64,
}

impl ShareOptions {
    pub fn new(export_root: impl Into<PathBuf>) -> Self {
        Self {
            export_root: export_root.into(),
            fs_location_prefix: None,
            fs_type: defaults::fs_type(),
            mount_options: defaults::mount_options(),
            edit_fstab: defaults::edit_fstab(),
            fstab_path: defaults::fstab_path(),
            max_poll_count: defaults::max_poll_count(),
            poll_interval_ms: defaults::poll_interval_ms(),
            umount_timeout: defaults::umount_timeout(),
        }
    }
}

/// A provisioned share.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub share_id: String,
    pub scope: QuotaScopeId,
    pub export_path: PathBuf,
    /// Requested size; `None` means unlimited.
    pub size_bytes: Option<u64>,
}

/// Creates and releases shares.
#[async_trait]
pub trait ShareProvisioner: Send + Sync {
    async fn find(&self, scope: &QuotaScopeId) -> StorageResult<Option<ShareRecord>>;

    /// Provision a share for `scope`; `QuotaScopeAlreadyExists` when one is
    /// already recorded.
    async fn provision(&self, scope: &QuotaScopeId, size_bytes: Option<u64>) -> StorageResult<ShareRecord>;

    /// Whether the export is ready to be mounted.
    async fn is_available(&self, share: &ShareRecord) -> StorageResult<bool>;

    async fn resize(&self, share: &ShareRecord, size_bytes: Option<u64>) -> StorageResult<ShareRecord>;

    async fn release(&self, share: &ShareRecord) -> StorageResult<()>;
}

/// Shares as `share_<id>` directories under a local export root, with one
/// JSON record per scope in `<root>/.records`.
#[derive(Debug, Clone)]
pub struct LocalExportProvisioner {
    root: PathBuf,
    lock: FileLock,
}

impl LocalExportProvisioner {
    pub fn new(root: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let root = root.into();
        Self {
            lock: FileLock::new(root.join(LOCK_FILENAME), lock_timeout),
            root,
        }
    }

    fn record_path(&self, scope: &QuotaScopeId) -> PathBuf {
        self.root
            .join(RECORDS_DIRNAME)
            .join(format!("{}.json", scope.pathname()))
    }
}

fn read_record(path: &Path) -> StorageResult<Option<ShareRecord>> {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StorageError::External(format!("corrupt share record {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_record(path: &Path, record: &ShareRecord) -> StorageResult<()> {
    let raw = serde_json::to_vec_pretty(record)
        .map_err(|e| StorageError::External(format!("encode share record: {e}")))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, raw)?;
    Ok(())
}

#[async_trait]
impl ShareProvisioner for LocalExportProvisioner {
    async fn find(&self, scope: &QuotaScopeId) -> StorageResult<Option<ShareRecord>> {
        let path = self.record_path(scope);
        run_blocking(move || read_record(&path)).await
    }

    async fn provision(&self, scope: &QuotaScopeId, size_bytes: Option<u64>) -> StorageResult<ShareRecord> {
        let _guard = self.lock.acquire().await?;
        let record_path = self.record_path(scope);
        let share_id = Uuid::new_v4().as_simple().to_string();
        let record = ShareRecord {
            export_path: self.root.join(format!("share_{share_id}")),
            share_id,
            scope: *scope,
            size_bytes,
        };
        let scope = *scope;
        run_blocking(move || {
            if read_record(&record_path)?.is_some() {
                return Err(StorageError::quota_scope_already_exists(&scope));
            }
            std::fs::create_dir_all(&record.export_path)?;
            write_record(&record_path, &record)?;
            Ok(record)
        })
        .await
    }

    async fn is_available(&self, share: &ShareRecord) -> StorageResult<bool> {
        let path = share.export_path.clone();
        run_blocking(move || Ok(path.is_dir())).await
    }

    async fn resize(&self, share: &ShareRecord, size_bytes: Option<u64>) -> StorageResult<ShareRecord> {
        let _guard = self.lock.acquire().await?;
        let record_path = self.record_path(&share.scope);
        let updated = ShareRecord {
            size_bytes,
            ..share.clone()
        };
        let record = updated.clone();
        run_blocking(move || write_record(&record_path, &record)).await?;
        Ok(updated)
    }

    async fn release(&self, share: &ShareRecord) -> StorageResult<()> {
        let _guard = self.lock.acquire().await?;
        let record_path = self.record_path(&share.scope);
        let export_path = share.export_path.clone();
        run_blocking(move || {
            match std::fs::remove_dir_all(&export_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            match std::fs::remove_file(&record_path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }
}

// ============================================================================
// Quota model
// ============================================================================

/// One mounted share per scope.
pub struct ShareQuotaModel {
    base: BaseQuotaModel,
    options: ShareOptions,
    provisioner: Arc<dyn ShareProvisioner>,
    watcher: Option<SharedWatcher>,
    owner: Option<(u32, u32)>,
    /// Shares mounted through this process.
    mounted: parking_lot::Mutex<HashMap<QuotaScopeId, ShareRecord>>,
}

impl ShareQuotaModel {
    pub fn new(
        mount_path: &Path,
        options: ShareOptions,
        provisioner: Arc<dyn ShareProvisioner>,
        deps: VolumeDeps,
    ) -> Self {
        Self {
            base: BaseQuotaModel::new(mount_path),
            options,
            provisioner,
            watcher: deps.watcher,
            owner: deps.owner,
            mounted: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn mounted_count(&self) -> usize {
        self.mounted.lock().len()
    }

    fn watcher(&self) -> StorageResult<&SharedWatcher> {
        self.watcher
            .as_ref()
            .ok_or_else(|| StorageError::watcher("the share backend requires use-watcher"))
    }

    async fn run_task(&self, task: WatcherTask) -> StorageResult<String> {
        let watcher = self.watcher()?;
        let mut client = watcher.lock().await;
        client.run(&task).await
    }

    fn mount_source(&self, share: &ShareRecord) -> String {
        match &self.options.fs_location_prefix {
            Some(prefix) => format!("{prefix}:/share_{}", share.share_id),
            None => share.export_path.display().to_string(),
        }
    }

    async fn find_share(&self, scope: &QuotaScopeId) -> StorageResult<Option<ShareRecord>> {
        if let Some(share) = self.mounted.lock().get(scope).cloned() {
            return Ok(Some(share));
        }
        self.provisioner.find(scope).await
    }

    async fn tracked(&self, scope: &QuotaScopeId) -> StorageResult<ShareRecord> {
        self.find_share(scope)
            .await?
            .ok_or_else(|| StorageError::quota_scope_not_found(scope))
    }

    async fn wait_until_available(&self, share: &ShareRecord) -> StorageResult<()> {
        let interval = Duration::from_millis(self.options.poll_interval_ms);
        let provisioner = &self.provisioner;
        let ready = retry_fixed(interval, self.options.max_poll_count, || async move {
            debug!(share = %share.share_id, "polling share availability");
            Ok(provisioner.is_available(share).await?.then_some(()))
        })
        .await?;
        ready.ok_or_else(|| {
            StorageError::External(format!(
                "share {} not available after {} polls",
                share.share_id, self.options.max_poll_count
            ))
        })
    }

    async fn mount_share(&self, scope: &QuotaScopeId, share: &ShareRecord) -> StorageResult<()> {
        let target = self.mangle_qspath(Some(scope));
        self.run_task(WatcherTask::Mount(MountTask {
            source: self.mount_source(share),
            fs_type: self.options.fs_type.clone(),
            options: self.options.mount_options.clone(),
            target: target.clone(),
            edit_fstab: self.options.edit_fstab,
            fstab_path: self.options.fstab_path.clone(),
        }))
        .await?;
        if let Some((uid, gid)) = self.owner {
            let chowned = self
                .run_task(WatcherTask::Chown(ChownTask {
                    path: target.clone(),
                    uid,
                    gid,
                }))
                .await;
            if let Err(e) = chowned {
                warn!(scope = %scope, error = %e, "chown of mounted share failed, unmounting");
                if let Err(umount) = self.run_task(self.umount_task(target)).await {
                    warn!(scope = %scope, error = %umount, "failed to unmount share");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn umount_task(&self, target: PathBuf) -> WatcherTask {
        WatcherTask::Umount(UmountTask {
            target,
            edit_fstab: self.options.edit_fstab,
            fstab_path: self.options.fstab_path.clone(),
            timeout: Some(Duration::from_secs(self.options.umount_timeout)),
        })
    }
}

#[async_trait]
impl QuotaModel for ShareQuotaModel {
    fn mangle_qspath(&self, scope: Option<&QuotaScopeId>) -> PathBuf {
        self.base.mangle_qspath(scope)
    }

    async fn create_quota_scope(
        &self,
        scope: &QuotaScopeId,
        options: Option<QuotaConfig>,
    ) -> StorageResult<()> {
        if let Some(config) = &options {
            config.validate()?;
        }
        self.watcher()?;
        let share = self
            .provisioner
            .provision(scope, options.map(|c| c.limit_bytes))
            .await?;

        let mounted = match self.wait_until_available(&share).await {
            Ok(()) => self.mount_share(scope, &share).await,
            Err(e) => Err(e),
        };
        if let Err(e) = mounted {
            warn!(scope = %scope, share = %share.share_id, error = %e, "share setup failed, releasing");
            if let Err(release) = self.provisioner.release(&share).await {
                warn!(share = %share.share_id, error = %release, "failed to release share");
            }
            return Err(e);
        }

        info!(scope = %scope, share = %share.share_id, "share mounted");
        self.mounted.lock().insert(*scope, share);
        Ok(())
    }

    async fn describe_quota_scope(&self, scope: &QuotaScopeId) -> StorageResult<Option<QuotaUsage>> {
        Ok(self
            .find_share(scope)
            .await?
            .map(|share| QuotaUsage::new(None, share.size_bytes)))
    }

    async fn update_quota_scope(&self, scope: &QuotaScopeId, config: QuotaConfig) -> StorageResult<()> {
        let share = self.tracked(scope).await?;
        config.validate()?;
        let updated = self.provisioner.resize(&share, Some(config.limit_bytes)).await?;
        self.mounted.lock().insert(*scope, updated);
        Ok(())
    }

    async fn unset_quota(&self, scope: &QuotaScopeId) -> StorageResult<()> {
        let share = self.tracked(scope).await?;
        let updated = self.provisioner.resize(&share, None).await?;
        self.mounted.lock().insert(*scope, updated);
        Ok(())
    }

    async fn delete_quota_scope(&self, scope: &QuotaScopeId) -> StorageResult<()> {
        let share = self.tracked(scope).await?;
        let target = self.mangle_qspath(Some(scope));
        let probe = target.clone();
        if run_blocking(move || Ok(probe.is_dir())).await? {
            self.base.ensure_no_subdirs(scope, &target).await?;
        }
        self.run_task(self.umount_task(target)).await?;
        self.provisioner.release(&share).await?;
        self.mounted.lock().remove(scope);
        info!(scope = %scope, share = %share.share_id, "share released");
        Ok(())
    }
}

// ============================================================================
// Volume
// ============================================================================

/// A volume whose quota scopes are individually mounted shares.
pub struct ShareVolume {
    name: String,
    mount_path: PathBuf,
    settings: VolumeSettings,
    export_root: PathBuf,
    quota_model: ShareQuotaModel,
    fsop_model: BaseFsOpModel,
}

impl ShareVolume {
    pub fn new(
        name: impl Into<String>,
        mount_path: impl Into<PathBuf>,
        settings: VolumeSettings,
        options: ShareOptions,
        deps: VolumeDeps,
        provisioner: Option<Arc<dyn ShareProvisioner>>,
    ) -> Self {
        let mount_path = mount_path.into();
        let provisioner: Arc<dyn ShareProvisioner> = match provisioner {
            Some(provisioner) => provisioner,
            None => Arc::new(LocalExportProvisioner::new(
                &options.export_root,
                settings.file_lock_timeout,
            )),
        };
        Self {
            name: name.into(),
            export_root: options.export_root.clone(),
            quota_model: ShareQuotaModel::new(&mount_path, options, provisioner, deps),
            fsop_model: BaseFsOpModel::new(settings),
            mount_path,
            settings,
        }
    }

    /// Registry constructor.
    pub fn from_context(ctx: VolumeContext) -> StorageResult<Arc<dyn Volume>> {
        let options: ShareOptions = ctx.config.parse_options().map_err(|e| {
            StorageError::VolumeInit(format!("volume '{}': {e}", ctx.name))
        })?;
        Ok(Arc::new(Self::new(
            ctx.name,
            ctx.config.path,
            ctx.settings,
            options,
            ctx.deps,
            None,
        )))
    }
}

#[async_trait]
impl Volume for ShareVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> &str {
        BACKEND_NAME
    }

    fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    fn settings(&self) -> &VolumeSettings {
        &self.settings
    }

    fn quota_model(&self) -> &dyn QuotaModel {
        &self.quota_model
    }

    fn fsop_model(&self) -> &dyn FsOpModel {
        &self.fsop_model
    }

    fn get_capabilities(&self) -> CapabilitySet {
        CapabilitySet::from([Capability::Vfolder, Capability::Quota])
    }

    async fn init(&self) -> StorageResult<()> {
        check_mount_path(&self.name, &self.mount_path).await?;
        if self.quota_model.watcher.is_none() {
            return Err(StorageError::VolumeInit(format!(
                "volume '{}': the share backend requires use-watcher",
                self.name
            )));
        }
        let root = self.export_root.clone();
        if !run_blocking(move || Ok(root.is_dir())).await? {
            return Err(StorageError::VolumeInit(format!(
                "volume '{}': export root {} is not a directory",
                self.name,
                self.export_root.display()
            )));
        }
        Ok(())
    }

    async fn shutdown(&self) -> StorageResult<()> {
        // Mounts stay in place (and in fstab) across restarts.
        debug!(volume = %self.name, mounted = self.quota_model.mounted_count(), "share volume shutdown");
        Ok(())
    }
}
