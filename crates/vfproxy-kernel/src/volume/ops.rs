//! Volume, quota model, and filesystem-operation traits.
//!
//! A backend supplies a [`QuotaModel`] (how scope roots are laid out and how
//! limits are enforced) and an [`FsOpModel`] (how trees are copied, removed,
//! scanned, and measured). [`Volume`] then provides the vfolder operations as
//! default methods on top of those two, so every backend gets the same
//! mangling, sanitizing, and error semantics. Backends override a default
//! only when they have a genuinely different primitive.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tracing::{debug, warn};

use vfproxy_types::{
    Capability, CapabilitySet, CapacityUsage, DirEntry, FsPerfMetric, HardwareMetadata,
    HealthStatus, QuotaConfig, QuotaScopeId, QuotaUsage, TreeUsage, VFolderId,
};

use super::path::{mangle_path, sanitize_path};
use super::stream::{ByteStream, read_to_stream, write_from_stream};
use crate::blocking::run_blocking;
use crate::config::VolumeSettings;
use crate::error::{StorageError, StorageResult};

/// A lazy, finite, non-restartable stream of scan results.
pub type DirEntryStream = BoxStream<'static, StorageResult<DirEntry>>;

/// File name of the per-vfolder metadata document.
pub const METADATA_FILENAME: &str = "metadata.json";

/// Largest metadata document `get_metadata` returns.
pub const MAX_METADATA_SIZE: u64 = 10 * 1024 * 1024;

/// Directory (inside the vfolder) that holds upload sessions.
pub const UPLOAD_DIRNAME: &str = ".upload";

// ============================================================================
// Quota model
// ============================================================================

/// Lifecycle of quota scopes on one volume.
///
/// ```text
/// absent ──create──▶ created ──update──▶ limited ──unset──▶ created
///    ▲                  │                   │
///    └──────delete──────┴───────delete──────┘   (only when no vfolders remain)
/// ```
#[async_trait]
pub trait QuotaModel: Send + Sync {
    /// Root directory of `scope`; the volume mount path for legacy folders.
    fn mangle_qspath(&self, scope: Option<&QuotaScopeId>) -> PathBuf;

    /// Create the scope, optionally with a limit.
    ///
    /// Idempotent with respect to the directory. Fails with
    /// `QuotaScopeAlreadyExists` when tracking metadata is already present.
    async fn create_quota_scope(
        &self,
        scope: &QuotaScopeId,
        options: Option<QuotaConfig>,
    ) -> StorageResult<()>;

    /// Current usage and limit, or `None` when the scope does not exist.
    async fn describe_quota_scope(&self, scope: &QuotaScopeId) -> StorageResult<Option<QuotaUsage>>;

    /// Replace the scope's limit. `QuotaScopeNotFound` if never created.
    async fn update_quota_scope(&self, scope: &QuotaScopeId, config: QuotaConfig) -> StorageResult<()>;

    /// Remove the scope's limit, keeping its directory.
    async fn unset_quota(&self, scope: &QuotaScopeId) -> StorageResult<()>;

    /// Remove the scope. `NotEmpty` while any vfolder directory remains.
    async fn delete_quota_scope(&self, scope: &QuotaScopeId) -> StorageResult<()>;
}

// ============================================================================
// Filesystem operation model
// ============================================================================

/// Bulk filesystem primitives used by the vfolder operations.
#[async_trait]
pub trait FsOpModel: Send + Sync {
    /// Copy the contents of `src` into the existing directory `dst`.
    async fn copy_tree(&self, src: &Path, dst: &Path) -> StorageResult<()>;

    /// Move the directory `src` to `dst`.
    async fn move_tree(&self, src: &Path, dst: &Path) -> StorageResult<()>;

    /// Remove `path` and everything below it.
    async fn delete_tree(&self, path: &Path) -> StorageResult<()>;

    /// Stream the entries below `path`, breadth first.
    async fn scan_tree(&self, path: &Path, recursive: bool) -> StorageResult<DirEntryStream>;

    /// File count and bytes below `path`, or [`TreeUsage::too_many`] when the
    /// walk exceeds its time budget.
    async fn scan_tree_usage(&self, path: &Path) -> StorageResult<TreeUsage>;

    /// Bytes used below `path`.
    async fn scan_tree_size(&self, path: &Path) -> StorageResult<u64>;
}

// ============================================================================
// Volume
// ============================================================================

/// One configured storage backend instance.
#[async_trait]
pub trait Volume: Send + Sync {
    // ------------------------------------------------------------------------
    // Identity and wiring
    // ------------------------------------------------------------------------

    /// Configured volume name.
    fn name(&self) -> &str;

    /// Registered backend name (`vfs`, `xfs`, ...).
    fn backend(&self) -> &str;

    fn mount_path(&self) -> &Path;

    fn settings(&self) -> &VolumeSettings;

    fn quota_model(&self) -> &dyn QuotaModel;

    fn fsop_model(&self) -> &dyn FsOpModel;

    /// Capabilities advertised by this backend. Pure.
    fn get_capabilities(&self) -> CapabilitySet;

    /// Fail with `Unsupported` unless `cap` is advertised.
    fn require_capability(&self, cap: Capability, operation: &str) -> StorageResult<()> {
        if self.get_capabilities().contains(cap) {
            Ok(())
        } else {
            Err(StorageError::unsupported(format!(
                "{operation} requires the '{cap}' capability, which volume '{}' ({}) lacks",
                self.name(),
                self.backend()
            )))
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Acquire backend resources. Runs once before the volume is registered.
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Release backend resources. Safe after a partial `init`.
    async fn shutdown(&self) -> StorageResult<()> {
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    async fn get_hwinfo(&self) -> StorageResult<HardwareMetadata> {
        let mount_path = self.mount_path().to_path_buf();
        let present = run_blocking(move || Ok(mount_path.is_dir())).await?;
        let mut info = HardwareMetadata::default();
        info.metadata
            .insert("backend".to_string(), self.backend().to_string());
        info.metadata.insert(
            "mount_path".to_string(),
            self.mount_path().display().to_string(),
        );
        if !present {
            info.status = HealthStatus::Unavailable;
            info.status_info = Some("mount path is not a directory".to_string());
        }
        Ok(info)
    }

    async fn get_performance_metric(&self) -> StorageResult<FsPerfMetric> {
        self.require_capability(Capability::Metric, "get_performance_metric")?;
        Err(StorageError::unsupported(format!(
            "volume '{}' advertises metrics but does not report them",
            self.name()
        )))
    }

    /// Capacity and usage of the whole volume filesystem.
    async fn get_fs_usage(&self) -> StorageResult<CapacityUsage> {
        let mount_path = self.mount_path().to_path_buf();
        run_blocking(move || {
            let stat = rustix::fs::statvfs(&mount_path).map_err(io::Error::from)?;
            Ok(CapacityUsage {
                capacity_bytes: stat.f_blocks * stat.f_frsize,
                used_bytes: (stat.f_blocks - stat.f_bfree) * stat.f_frsize,
            })
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Quota scopes (delegated to the quota model)
    // ------------------------------------------------------------------------

    async fn create_quota_scope(
        &self,
        scope: &QuotaScopeId,
        options: Option<QuotaConfig>,
    ) -> StorageResult<()> {
        if options.is_some() {
            self.require_capability(Capability::Quota, "create_quota_scope with a limit")?;
        }
        self.quota_model().create_quota_scope(scope, options).await
    }

    async fn describe_quota_scope(&self, scope: &QuotaScopeId) -> StorageResult<Option<QuotaUsage>> {
        self.quota_model().describe_quota_scope(scope).await
    }

    async fn update_quota_scope(&self, scope: &QuotaScopeId, config: QuotaConfig) -> StorageResult<()> {
        self.require_capability(Capability::Quota, "update_quota_scope")?;
        self.quota_model().update_quota_scope(scope, config).await
    }

    async fn unset_quota(&self, scope: &QuotaScopeId) -> StorageResult<()> {
        self.quota_model().unset_quota(scope).await
    }

    async fn delete_quota_scope(&self, scope: &QuotaScopeId) -> StorageResult<()> {
        self.quota_model().delete_quota_scope(scope).await
    }

    // ------------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------------

    /// Physical directory of `vfid`.
    fn mangle_vfpath(&self, vfid: &VFolderId) -> PathBuf {
        let scope_root = self
            .quota_model()
            .mangle_qspath(vfid.quota_scope_id.as_ref());
        mangle_path(&scope_root, &vfid.folder_id)
    }

    /// Resolve `relpath` inside `vfid`, rejecting escapes.
    async fn sanitize_vfpath(&self, vfid: &VFolderId, relpath: &Path) -> StorageResult<PathBuf> {
        sanitize_path(self.mangle_vfpath(vfid), relpath.to_path_buf(), *vfid).await
    }

    /// Resolved directory a client should mount for `vfid` / `subpath`.
    async fn get_vfolder_mount(&self, vfid: &VFolderId, subpath: &Path) -> StorageResult<PathBuf> {
        self.sanitize_vfpath(vfid, subpath).await
    }

    // ------------------------------------------------------------------------
    // Vfolder lifecycle
    // ------------------------------------------------------------------------

    /// Create the vfolder directory (mode 0755).
    ///
    /// The scope root must already exist. With `exist_ok = false` an existing
    /// folder fails with `VFolderCreation`.
    async fn create_vfolder(&self, vfid: &VFolderId, exist_ok: bool) -> StorageResult<()> {
        let qspath = self
            .quota_model()
            .mangle_qspath(vfid.quota_scope_id.as_ref());
        let vfpath = self.mangle_vfpath(vfid);
        let vfid = *vfid;
        run_blocking(move || {
            use std::os::unix::fs::DirBuilderExt;

            if !qspath.is_dir() {
                return Err(match &vfid.quota_scope_id {
                    Some(qsid) => StorageError::quota_scope_not_found(qsid),
                    None => StorageError::VFolderCreation(format!(
                        "volume root {} is missing",
                        qspath.display()
                    )),
                });
            }
            if let Some(parent) = vfpath.parent() {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(parent)
                    .map_err(|e| StorageError::VFolderCreation(format!("{vfid}: {e}")))?;
            }
            match std::fs::DirBuilder::new().mode(0o755).create(&vfpath) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && exist_ok => Ok(()),
                Err(e) => Err(StorageError::VFolderCreation(format!("{vfid}: {e}"))),
            }
        })
        .await?;
        debug!(vfid = %vfid, "vfolder created");
        Ok(())
    }

    /// Remove the vfolder and its now-empty shard directories.
    async fn delete_vfolder(&self, vfid: &VFolderId) -> StorageResult<()> {
        let vfpath = self.mangle_vfpath(vfid);
        let exists = {
            let p = vfpath.clone();
            run_blocking(move || Ok(p.is_dir())).await?
        };
        if !exists {
            return Err(StorageError::vfolder_not_found(vfid));
        }

        self.fsop_model().delete_tree(&vfpath).await?;

        let qspath = self
            .quota_model()
            .mangle_qspath(vfid.quota_scope_id.as_ref());
        run_blocking(move || {
            // The folder directory may survive delete_tree on some backends;
            // then walk up the two shard levels.
            let mut dir = Some(vfpath.as_path());
            for _ in 0..3 {
                let Some(d) = dir else { break };
                if d == qspath || !d.starts_with(&qspath) {
                    break;
                }
                match std::fs::remove_dir(d) {
                    Ok(()) => {}
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::NotFound | io::ErrorKind::DirectoryNotEmpty
                        ) => {}
                    Err(e) => return Err(e.into()),
                }
                dir = d.parent();
            }
            Ok(())
        })
        .await?;
        debug!(vfid = %vfid, "vfolder deleted");
        Ok(())
    }

    /// Copy `src` into a new vfolder `dst`.
    ///
    /// Capacity is checked before anything is touched. A failed copy removes
    /// `dst` again.
    async fn clone_vfolder(&self, src: &VFolderId, dst: &VFolderId) -> StorageResult<()> {
        let usage = self.get_usage(src, Path::new(".")).await?;
        let capacity = self.get_fs_usage().await?;
        let available = i64::try_from(capacity.available_bytes()).unwrap_or(i64::MAX);
        if usage.used_bytes > available {
            return Err(StorageError::execution("Not enough space available for clone."));
        }

        self.create_vfolder(dst, false).await?;
        let src_path = self.mangle_vfpath(src);
        let dst_path = self.mangle_vfpath(dst);
        if let Err(e) = self.fsop_model().copy_tree(&src_path, &dst_path).await {
            warn!(src = %src, dst = %dst, error = %e, "vfolder clone copy failed");
            if let Err(cleanup) = self.delete_vfolder(dst).await {
                warn!(dst = %dst, error = %cleanup, "failed to remove partial clone");
            }
            return Err(StorageError::execution(
                "Copying files from source directories failed.",
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Metadata and uploads
    // ------------------------------------------------------------------------

    async fn put_metadata(&self, vfid: &VFolderId, payload: Bytes) -> StorageResult<()> {
        let path = self
            .sanitize_vfpath(vfid, Path::new(METADATA_FILENAME))
            .await?;
        run_blocking(move || Ok(std::fs::write(path, &payload)?)).await
    }

    /// The metadata document, or empty when none was stored.
    async fn get_metadata(&self, vfid: &VFolderId) -> StorageResult<Bytes> {
        let path = self
            .sanitize_vfpath(vfid, Path::new(METADATA_FILENAME))
            .await?;
        run_blocking(move || {
            let len = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Bytes::new()),
                Err(e) => return Err(e.into()),
            };
            if len > MAX_METADATA_SIZE {
                return Err(StorageError::execution("Too large metadata (more than 10 MiB)"));
            }
            Ok(Bytes::from(std::fs::read(&path)?))
        })
        .await
    }

    /// Start an upload session, returning its token.
    async fn prepare_upload(&self, vfid: &VFolderId) -> StorageResult<String> {
        let base = self.sanitize_vfpath(vfid, Path::new(UPLOAD_DIRNAME)).await?;
        let token = uuid::Uuid::new_v4().as_simple().to_string();
        let session = base.join(&token);
        run_blocking(move || {
            std::fs::create_dir_all(&base)?;
            std::fs::File::create(&session)?;
            Ok(())
        })
        .await?;
        Ok(token)
    }

    // ------------------------------------------------------------------------
    // Usage
    // ------------------------------------------------------------------------

    async fn get_usage(&self, vfid: &VFolderId, relpath: &Path) -> StorageResult<TreeUsage> {
        let target = self.sanitize_vfpath(vfid, relpath).await?;
        self.fsop_model().scan_tree_usage(&target).await
    }

    async fn get_used_bytes(&self, vfid: &VFolderId) -> StorageResult<u64> {
        let target = self.sanitize_vfpath(vfid, Path::new(".")).await?;
        self.fsop_model().scan_tree_size(&target).await
    }

    // ------------------------------------------------------------------------
    // Files and directories inside a vfolder
    // ------------------------------------------------------------------------

    async fn scandir(
        &self,
        vfid: &VFolderId,
        relpath: &Path,
        recursive: bool,
    ) -> StorageResult<DirEntryStream> {
        let target = self.sanitize_vfpath(vfid, relpath).await?;
        self.fsop_model().scan_tree(&target, recursive).await
    }

    async fn mkdir(
        &self,
        vfid: &VFolderId,
        relpath: &Path,
        parents: bool,
        exist_ok: bool,
    ) -> StorageResult<()> {
        let target = self.sanitize_vfpath(vfid, relpath).await?;
        run_blocking(move || {
            let result = if parents {
                std::fs::create_dir_all(&target)
            } else {
                std::fs::create_dir(&target)
            };
            match result {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && exist_ok => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn rmdir(&self, vfid: &VFolderId, relpath: &Path, recursive: bool) -> StorageResult<()> {
        let root = self.sanitize_vfpath(vfid, Path::new(".")).await?;
        let target = self.sanitize_vfpath(vfid, relpath).await?;
        if target == root {
            return Err(StorageError::invalid_params(
                "cannot remove the vfolder root; delete the vfolder instead",
            ));
        }
        if recursive {
            self.fsop_model().delete_tree(&target).await
        } else {
            run_blocking(move || Ok(std::fs::remove_dir(&target)?)).await
        }
    }

    async fn move_file(&self, vfid: &VFolderId, src: &Path, dst: &Path) -> StorageResult<()> {
        let src_path = self.sanitize_vfpath(vfid, src).await?;
        let dst_path = self.sanitize_vfpath(vfid, dst).await?;
        run_blocking(move || {
            if !src_path.is_file() {
                return Err(StorageError::invalid_params(format!(
                    "source path {} is not a file",
                    src_path.display()
                )));
            }
            if let Some(parent) = dst_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&src_path, &dst_path)?;
            Ok(())
        })
        .await
    }

    async fn move_tree(&self, vfid: &VFolderId, src: &Path, dst: &Path) -> StorageResult<()> {
        let src_path = self.sanitize_vfpath(vfid, src).await?;
        let dst_path = self.sanitize_vfpath(vfid, dst).await?;
        let is_dir = {
            let p = src_path.clone();
            run_blocking(move || Ok(p.is_dir())).await?
        };
        if !is_dir {
            return Err(StorageError::invalid_params(format!(
                "source path {} is not a directory",
                src.display()
            )));
        }
        self.fsop_model().move_tree(&src_path, &dst_path).await
    }

    async fn copy_file(&self, vfid: &VFolderId, src: &Path, dst: &Path) -> StorageResult<()> {
        let src_path = self.sanitize_vfpath(vfid, src).await?;
        let dst_path = self.sanitize_vfpath(vfid, dst).await?;
        run_blocking(move || {
            if !src_path.is_file() {
                return Err(StorageError::invalid_params(format!(
                    "source path {} is not a file",
                    src_path.display()
                )));
            }
            if let Some(parent) = dst_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src_path, &dst_path)?;
            Ok(())
        })
        .await
    }

    /// Delete files and directories. Paths that are already gone are skipped.
    async fn delete_files(
        &self,
        vfid: &VFolderId,
        relpaths: &[PathBuf],
        recursive: bool,
    ) -> StorageResult<()> {
        for relpath in relpaths {
            let target = self.sanitize_vfpath(vfid, relpath).await?;
            let probe = target.clone();
            let meta = run_blocking(move || match std::fs::symlink_metadata(&probe) {
                Ok(meta) => Ok(Some(meta)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            })
            .await?;
            let Some(meta) = meta else { continue };

            if meta.is_dir() {
                if recursive {
                    self.fsop_model().delete_tree(&target).await?;
                } else {
                    run_blocking(move || Ok(std::fs::remove_dir(&target)?)).await?;
                }
            } else {
                run_blocking(move || Ok(std::fs::remove_file(&target)?)).await?;
            }
        }
        Ok(())
    }

    /// Write a streamed payload to `relpath`, creating parent directories.
    async fn add_file(
        &self,
        vfid: &VFolderId,
        relpath: &Path,
        payload: ByteStream,
    ) -> StorageResult<u64> {
        let target = self.sanitize_vfpath(vfid, relpath).await?;
        if let Some(parent) = target.parent() {
            let parent = parent.to_path_buf();
            run_blocking(move || Ok(std::fs::create_dir_all(parent)?)).await?;
        }
        write_from_stream(target, payload, self.settings().stream_queue_size).await
    }

    /// Stream `relpath` in `chunk_size` pieces (0 = the file's preferred
    /// I/O block size).
    async fn read_file(
        &self,
        vfid: &VFolderId,
        relpath: &Path,
        chunk_size: usize,
    ) -> StorageResult<ByteStream> {
        let target = self.sanitize_vfpath(vfid, relpath).await?;
        let probe = target.clone();
        let block_size = run_blocking(move || {
            use std::os::unix::fs::MetadataExt;
            let meta = std::fs::metadata(&probe)?;
            if !meta.is_file() {
                return Err(StorageError::invalid_params(format!(
                    "{} is not a file",
                    probe.display()
                )));
            }
            Ok(meta.blksize() as usize)
        })
        .await?;
        let chunk_size = if chunk_size == 0 { block_size } else { chunk_size };
        Ok(read_to_stream(
            target,
            chunk_size,
            self.settings().stream_queue_size,
        ))
    }
}

/// Update a scope's limit, creating the scope first when it is missing.
///
/// Not atomic across processes: two callers can both observe "absent" and
/// race on create, in which case the loser sees `QuotaScopeAlreadyExists`.
pub async fn ensure_quota_scope(
    volume: &dyn Volume,
    scope: &QuotaScopeId,
    config: QuotaConfig,
) -> StorageResult<()> {
    config.validate()?;
    match volume.describe_quota_scope(scope).await? {
        Some(_) => volume.update_quota_scope(scope, config).await,
        None => volume.create_quota_scope(scope, Some(config)).await,
    }
}
