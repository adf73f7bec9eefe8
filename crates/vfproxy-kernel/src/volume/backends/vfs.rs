//! Plain directory backend.
//!
//! Scopes and vfolders are ordinary directories under the mount path; no
//! limits are enforced. [`BaseQuotaModel`] and [`BaseFsOpModel`] are also the
//! building blocks the other backends reuse for everything they do not
//! override.

use std::collections::VecDeque;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use vfproxy_types::{
    Capability, CapabilitySet, DirEntry, DirEntryType, QuotaConfig, QuotaScopeId, QuotaUsage, Stat,
    TreeUsage,
};

use super::VolumeContext;
use crate::blocking::run_blocking;
use crate::config::VolumeSettings;
use crate::error::{StorageError, StorageResult};
use crate::subproc;
use crate::volume::ops::{DirEntryStream, FsOpModel, QuotaModel, Volume};
use crate::volume::stream::receiver_stream;

/// Registered backend name.
pub const BACKEND_NAME: &str = "vfs";

/// Entries between two deadline checks of a usage walk.
const USAGE_CHECK_INTERVAL: u64 = 1000;

// ============================================================================
// Quota model
// ============================================================================

/// Scope roots are plain directories; limits are not supported.
#[derive(Debug, Clone)]
pub struct BaseQuotaModel {
    mount_path: PathBuf,
}

impl BaseQuotaModel {
    pub fn new(mount_path: impl Into<PathBuf>) -> Self {
        Self {
            mount_path: mount_path.into(),
        }
    }

    /// Existing scope root, or `QuotaScopeNotFound`.
    pub async fn existing_qspath(&self, scope: &QuotaScopeId) -> StorageResult<PathBuf> {
        let qspath = self.mangle_qspath(Some(scope));
        let probe = qspath.clone();
        if run_blocking(move || Ok(probe.is_dir())).await? {
            Ok(qspath)
        } else {
            Err(StorageError::quota_scope_not_found(scope))
        }
    }

    /// Create the scope root directory; succeeds when it already exists.
    pub async fn create_scope_dir(&self, scope: &QuotaScopeId) -> StorageResult<PathBuf> {
        let qspath = self.mangle_qspath(Some(scope));
        let target = qspath.clone();
        run_blocking(move || {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(&target)?;
            Ok(())
        })
        .await?;
        Ok(qspath)
    }

    /// Fail with `NotEmpty` when `qspath` holds any sub-directory.
    pub async fn ensure_no_subdirs(&self, scope: &QuotaScopeId, qspath: &Path) -> StorageResult<()> {
        let probe = qspath.to_path_buf();
        let has_subdirs = run_blocking(move || {
            for entry in std::fs::read_dir(&probe)? {
                if entry?.file_type()?.is_dir() {
                    return Ok(true);
                }
            }
            Ok(false)
        })
        .await?;
        if has_subdirs {
            return Err(StorageError::not_empty(format!(
                "quota scope {scope} still contains vfolders"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaModel for BaseQuotaModel {
    fn mangle_qspath(&self, scope: Option<&QuotaScopeId>) -> PathBuf {
        match scope {
            Some(qsid) => self.mount_path.join(qsid.pathname()),
            None => self.mount_path.clone(),
        }
    }

    async fn create_quota_scope(
        &self,
        scope: &QuotaScopeId,
        options: Option<QuotaConfig>,
    ) -> StorageResult<()> {
        if options.is_some() {
            return Err(StorageError::unsupported(
                "plain directory scopes cannot enforce limits",
            ));
        }
        self.create_scope_dir(scope).await?;
        Ok(())
    }

    async fn describe_quota_scope(&self, scope: &QuotaScopeId) -> StorageResult<Option<QuotaUsage>> {
        match self.existing_qspath(scope).await {
            Ok(_) => Ok(Some(QuotaUsage::untracked())),
            Err(StorageError::QuotaScopeNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_quota_scope(&self, scope: &QuotaScopeId, config: QuotaConfig) -> StorageResult<()> {
        self.existing_qspath(scope).await?;
        config.validate()?;
        Ok(())
    }

    async fn unset_quota(&self, scope: &QuotaScopeId) -> StorageResult<()> {
        self.existing_qspath(scope).await?;
        Ok(())
    }

    async fn delete_quota_scope(&self, scope: &QuotaScopeId) -> StorageResult<()> {
        let qspath = self.existing_qspath(scope).await?;
        self.ensure_no_subdirs(scope, &qspath).await?;
        run_blocking(move || Ok(std::fs::remove_dir_all(&qspath)?)).await
    }
}

// ============================================================================
// Filesystem operations
// ============================================================================

/// In-process tree walks run on the blocking pool.
#[derive(Debug, Clone)]
pub struct BaseFsOpModel {
    settings: VolumeSettings,
}

impl BaseFsOpModel {
    pub fn new(settings: VolumeSettings) -> Self {
        Self { settings }
    }

    /// Usage walk without the `du` fast path.
    pub async fn walk_usage(&self, path: &Path) -> StorageResult<TreeUsage> {
        let root = path.to_path_buf();
        let budget = self.settings.usage_scan_timeout;
        run_blocking(move || {
            let deadline = Instant::now() + budget;
            let mut file_count: i64 = 0;
            let mut used_bytes: i64 = 0;
            let mut visited: u64 = 0;
            let mut queue = VecDeque::from([root]);
            while let Some(dir) = queue.pop_front() {
                let entries = match std::fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(e) if vanished(&e) => continue,
                    Err(e) => return Err(e.into()),
                };
                for entry in entries {
                    visited += 1;
                    if visited % USAGE_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
                        return Ok(TreeUsage::too_many());
                    }
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) if vanished(&e) => continue,
                        Err(e) => return Err(e.into()),
                    };
                    let meta = match entry.metadata() {
                        Ok(meta) => meta,
                        Err(e) if vanished(&e) => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if meta.is_dir() {
                        queue.push_back(entry.path());
                    } else {
                        file_count += 1;
                        used_bytes += meta.len() as i64;
                    }
                }
            }
            Ok(TreeUsage::new(file_count, used_bytes))
        })
        .await
    }
}

fn vanished(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    )
}

/// Copy the contents of `src` into `dst`, preserving symlinks and modes.
pub(crate) fn copy_dir_contents(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            match std::fs::create_dir(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
            std::fs::set_permissions(&target, entry.metadata()?.permissions())?;
            copy_dir_contents(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Link target relative to the scan root when it points inside it.
fn symlink_target(root: &Path, link: &Path, raw: &Path) -> String {
    let absolute = match link.parent() {
        Some(parent) if raw.is_relative() => normalize_lexically(&parent.join(raw)),
        _ => normalize_lexically(raw),
    };
    match absolute.strip_prefix(root) {
        Ok(rel) => rel.display().to_string(),
        Err(_) => raw.display().to_string(),
    }
}

fn entry_stat(meta: &std::fs::Metadata) -> Stat {
    use std::os::unix::fs::MetadataExt;
    Stat {
        size: meta.len(),
        owner: meta.uid(),
        mode: meta.mode(),
        modified: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
        created: meta.created().ok(),
    }
}

/// Breadth-first scan feeding `tx`; stops at `limit` entries (0 = no limit)
/// or when the receiver goes away.
fn scan_worker(
    root: PathBuf,
    recursive: bool,
    limit: usize,
    tx: mpsc::Sender<StorageResult<DirEntry>>,
) {
    let mut queue = VecDeque::from([root.clone()]);
    let mut sent = 0usize;
    while let Some(dir) = queue.pop_front() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if dir != root && vanished(&e) => continue,
            Err(e) => {
                let _ = tx.blocking_send(Err(e.into()));
                return;
            }
        };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let file_type = meta.file_type();
            let (entry_type, target) = if file_type.is_symlink() {
                let target = std::fs::read_link(&path)
                    .ok()
                    .map(|raw| symlink_target(&root, &path, &raw));
                (DirEntryType::Symlink, target)
            } else if file_type.is_dir() {
                if recursive {
                    queue.push_back(path.clone());
                }
                (DirEntryType::Directory, None)
            } else {
                (DirEntryType::File, None)
            };
            let rel = path.strip_prefix(&root).unwrap_or(&path).to_path_buf();
            let item = DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: rel,
                entry_type,
                stat: entry_stat(&meta),
                symlink_target: target,
            };
            if tx.blocking_send(Ok(item)).is_err() {
                return;
            }
            sent += 1;
            if limit > 0 && sent >= limit {
                return;
            }
        }
    }
}

#[async_trait]
impl FsOpModel for BaseFsOpModel {
    async fn copy_tree(&self, src: &Path, dst: &Path) -> StorageResult<()> {
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        run_blocking(move || {
            std::fs::create_dir_all(&dst)?;
            copy_dir_contents(&src, &dst)?;
            Ok(())
        })
        .await
    }

    async fn move_tree(&self, src: &Path, dst: &Path) -> StorageResult<()> {
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        run_blocking(move || {
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match std::fs::rename(&src, &dst) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                    std::fs::create_dir_all(&dst)?;
                    copy_dir_contents(&src, &dst)?;
                    std::fs::remove_dir_all(&src)?;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn delete_tree(&self, path: &Path) -> StorageResult<()> {
        let path = path.to_path_buf();
        run_blocking(move || Ok(std::fs::remove_dir_all(&path)?)).await
    }

    async fn scan_tree(&self, path: &Path, recursive: bool) -> StorageResult<DirEntryStream> {
        let (tx, rx) = mpsc::channel(self.settings.stream_queue_size.max(1));
        let root = path.to_path_buf();
        let limit = self.settings.scandir_limit;
        tokio::task::spawn_blocking(move || scan_worker(root, recursive, limit, tx));
        Ok(receiver_stream(rx))
    }

    async fn scan_tree_usage(&self, path: &Path) -> StorageResult<TreeUsage> {
        self.walk_usage(path).await
    }

    async fn scan_tree_size(&self, path: &Path) -> StorageResult<u64> {
        let mut cmd = Command::new("du");
        cmd.arg("-s").arg("-B1").arg(path);
        match subproc::run(cmd).await {
            Ok(out) => out
                .split_whitespace()
                .next()
                .and_then(|n| n.parse::<u64>().ok())
                .ok_or_else(|| StorageError::execution(format!("unexpected du output: {out:?}"))),
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!("du not available, walking the tree instead");
                let usage = self.walk_usage(path).await?;
                Ok(usage.used_bytes.max(0) as u64)
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Volume
// ============================================================================

/// A volume of plain directories.
pub struct BaseVolume {
    name: String,
    mount_path: PathBuf,
    settings: VolumeSettings,
    quota_model: BaseQuotaModel,
    fsop_model: BaseFsOpModel,
}

impl BaseVolume {
    pub fn new(name: impl Into<String>, mount_path: impl Into<PathBuf>, settings: VolumeSettings) -> Self {
        let mount_path = mount_path.into();
        Self {
            name: name.into(),
            quota_model: BaseQuotaModel::new(&mount_path),
            fsop_model: BaseFsOpModel::new(settings),
            mount_path,
            settings,
        }
    }

    /// Registry constructor.
    pub fn from_context(ctx: VolumeContext) -> StorageResult<Arc<dyn Volume>> {
        Ok(Arc::new(Self::new(ctx.name, ctx.config.path, ctx.settings)))
    }
}

impl std::fmt::Debug for BaseVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseVolume")
            .field("name", &self.name)
            .field("mount_path", &self.mount_path)
            .finish_non_exhaustive()
    }
}

/// Fail with `VolumeInit` unless `mount_path` is a directory.
pub(crate) async fn check_mount_path(name: &str, mount_path: &Path) -> StorageResult<()> {
    let probe = mount_path.to_path_buf();
    if run_blocking(move || Ok(probe.is_dir())).await? {
        Ok(())
    } else {
        warn!(volume = %name, path = %mount_path.display(), "mount path missing");
        Err(StorageError::VolumeInit(format!(
            "volume '{name}': mount path {} is not a directory",
            mount_path.display()
        )))
    }
}

#[async_trait]
impl Volume for BaseVolume {
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
        CapabilitySet::from([Capability::Vfolder])
    }

    async fn init(&self) -> StorageResult<()> {
        check_mount_path(&self.name, &self.mount_path).await
    }
}
