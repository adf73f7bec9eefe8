//! XFS project-quota backend.
//!
//! Each quota scope is an XFS project: the scope root directory is tagged
//! with a project id and the project carries a hard block limit. The project
//! registry (`projects` = `id:path`, `projid` = `name:id`) lives in a
//! configurable directory (default `/etc`) and is the scope's tracking
//! metadata. Every read-modify-write of it holds one named file lock, since
//! several worker processes share the files.
//!
//! Limits and reports go through an [`XfsQuotaTool`]; [`XfsQuotaCli`] drives
//! `xfs_quota -x`. Tree copies and deletions prefer `cp --reflink=auto` and
//! `rm -rf` when the tools are available, and fall back to in-process walks
//! otherwise.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use vfproxy_types::{Capability, CapabilitySet, QuotaConfig, QuotaScopeId, QuotaUsage, TreeUsage};

use super::VolumeContext;
use super::vfs::{BaseFsOpModel, BaseQuotaModel, check_mount_path};
use crate::blocking::run_blocking;
use crate::config::VolumeSettings;
use crate::error::{StorageError, StorageResult};
use crate::fslock::FileLock;
use crate::subproc;
use crate::volume::ops::{DirEntryStream, FsOpModel, QuotaModel, Volume};

/// Registered backend name.
pub const BACKEND_NAME: &str = "xfs";

const PROJECTS_FILE: &str = "projects";
const PROJID_FILE: &str = "projid";
const LOCK_FILE: &str = ".vfproxy-xfs-projects.lock";

mod defaults {
    use std::path::PathBuf;

    pub fn registry_dir() -> PathBuf {
        PathBuf::from("/etc")
    }

    pub fn first_project_id() -> u32 {
        1000
    }

    pub fn xfs_quota_cmd() -> String {
        "xfs_quota".to_string()
    }
}

/// `[volume.<name>.options]` of an `xfs` volume.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct XfsOptions {
    #[serde(default = "defaults::registry_dir")]
    pub registry_dir: PathBuf,
    /// Lowest project id handed out to quota scopes.
    #[serde(default = "defaults::first_project_id")]
    pub first_project_id: u32,
    #[serde(default = "defaults::xfs_quota_cmd")]
    pub xfs_quota_cmd: String,
}

impl Default for XfsOptions {
    fn default() -> Self {
        Self {
            registry_dir: defaults::registry_dir(),
            first_project_id: defaults::first_project_id(),
            xfs_quota_cmd: defaults::xfs_quota_cmd(),
        }
    }
}

// ============================================================================
// Project registry
// ============================================================================

fn parse_projid(text: &str) -> Vec<(String, u32)> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let (name, id) = l.split_once(':')?;
            Some((name.to_string(), id.trim().parse().ok()?))
        })
        .collect()
}

fn parse_projects(text: &str) -> Vec<(u32, String)> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let (id, path) = l.split_once(':')?;
            Some((id.trim().parse().ok()?, path.to_string()))
        })
        .collect()
}

/// Drop the lines for which `matches` holds, keeping comments and foreign
/// entries untouched.
fn retain_lines(text: &str, matches: impl Fn(&str) -> bool) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if !matches(line.trim()) {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn allocate_id(used: &BTreeSet<u32>, first: u32) -> Option<u32> {
    (first..=u32::MAX).find(|id| !used.contains(id))
}

fn read_or_empty(path: &Path) -> io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Write via a temporary sibling and rename, so readers never see a torn file.
fn replace_file(path: &Path, contents: &str) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

/// The `projects` / `projid` pair.
#[derive(Debug, Clone)]
pub struct ProjectRegistry {
    projects: PathBuf,
    projid: PathBuf,
    lock: FileLock,
    first_id: u32,
}

impl ProjectRegistry {
    pub fn new(registry_dir: &Path, first_id: u32, settings: &VolumeSettings) -> Self {
        Self {
            projects: registry_dir.join(PROJECTS_FILE),
            projid: registry_dir.join(PROJID_FILE),
            lock: FileLock::new(registry_dir.join(LOCK_FILE), settings.file_lock_timeout),
            first_id,
        }
    }

    pub fn projects_path(&self) -> &Path {
        &self.projects
    }

    pub fn projid_path(&self) -> &Path {
        &self.projid
    }

    /// Project id registered under `name`.
    pub async fn lookup(&self, name: &str) -> StorageResult<Option<u32>> {
        let _guard = self.lock.acquire().await?;
        let projid = self.projid.clone();
        let name = name.to_string();
        run_blocking(move || {
            let text = read_or_empty(&projid)?;
            Ok(parse_projid(&text)
                .into_iter()
                .find(|(n, _)| *n == name)
                .map(|(_, id)| id))
        })
        .await
    }

    /// Register `name` for `path`; `None` when `name` is already registered.
    pub async fn register(&self, name: &str, path: &Path) -> StorageResult<Option<u32>> {
        let _guard = self.lock.acquire().await?;
        let (projects, projid) = (self.projects.clone(), self.projid.clone());
        let (name, path) = (name.to_string(), path.display().to_string());
        let first_id = self.first_id;
        run_blocking(move || {
            let projid_text = read_or_empty(&projid)?;
            let projects_text = read_or_empty(&projects)?;
            let names = parse_projid(&projid_text);
            if names.iter().any(|(n, _)| *n == name) {
                return Ok(None);
            }
            let used: BTreeSet<u32> = names
                .iter()
                .map(|(_, id)| *id)
                .chain(parse_projects(&projects_text).into_iter().map(|(id, _)| id))
                .collect();
            let id = allocate_id(&used, first_id)
                .ok_or_else(|| StorageError::execution("XFS project ids exhausted"))?;

            let mut projects_text = projects_text;
            projects_text.push_str(&format!("{id}:{path}\n"));
            let mut projid_text = projid_text;
            projid_text.push_str(&format!("{name}:{id}\n"));
            replace_file(&projects, &projects_text)?;
            replace_file(&projid, &projid_text)?;
            Ok(Some(id))
        })
        .await
    }

    /// Remove `name`, returning the id it held.
    pub async fn unregister(&self, name: &str) -> StorageResult<Option<u32>> {
        let _guard = self.lock.acquire().await?;
        let (projects, projid) = (self.projects.clone(), self.projid.clone());
        let name = name.to_string();
        run_blocking(move || {
            let projid_text = read_or_empty(&projid)?;
            let Some(id) = parse_projid(&projid_text)
                .into_iter()
                .find(|(n, _)| *n == name)
                .map(|(_, id)| id)
            else {
                return Ok(None);
            };
            let projects_text = read_or_empty(&projects)?;
            let id_prefix = format!("{id}:");
            let name_prefix = format!("{name}:");
            replace_file(
                &projects,
                &retain_lines(&projects_text, |l| l.starts_with(&id_prefix)),
            )?;
            replace_file(
                &projid,
                &retain_lines(&projid_text, |l| l.starts_with(&name_prefix)),
            )?;
            Ok(Some(id))
        })
        .await
    }
}

// ============================================================================
// xfs_quota
// ============================================================================

/// Applies and reports XFS project quotas.
#[async_trait]
pub trait XfsQuotaTool: Send + Sync {
    /// Verify the tool works against the volume (run once at init).
    async fn probe(&self) -> StorageResult<()>;

    /// Tag `path` (recursively) with `project_id`.
    async fn setup_project(&self, project_id: u32, path: &Path) -> StorageResult<()>;

    /// Remove the project tag from `path`.
    async fn clear_project(&self, project_id: u32, path: &Path) -> StorageResult<()>;

    /// Set (or with `None`, remove) the hard block limit.
    async fn set_limit(&self, project_id: u32, limit_bytes: Option<u64>) -> StorageResult<()>;

    async fn report(&self, project_id: u32) -> StorageResult<QuotaUsage>;
}

/// [`XfsQuotaTool`] backed by the `xfs_quota` command in expert mode.
#[derive(Debug, Clone)]
pub struct XfsQuotaCli {
    cmd: String,
    mount_path: PathBuf,
    projects: PathBuf,
    projid: PathBuf,
}

impl XfsQuotaCli {
    pub fn new(cmd: impl Into<String>, mount_path: &Path, registry: &ProjectRegistry) -> Self {
        Self {
            cmd: cmd.into(),
            mount_path: mount_path.to_path_buf(),
            projects: registry.projects_path().to_path_buf(),
            projid: registry.projid_path().to_path_buf(),
        }
    }

    async fn exec(&self, command: String) -> StorageResult<String> {
        let mut cmd = Command::new(&self.cmd);
        cmd.arg("-x")
            .arg("-D")
            .arg(&self.projects)
            .arg("-P")
            .arg(&self.projid)
            .arg("-c")
            .arg(&command)
            .arg(&self.mount_path);
        debug!(%command, mount = %self.mount_path.display(), "xfs_quota");
        subproc::run(cmd).await
    }
}

/// Parse one `report -p -b -N -n` line for `project_id` (KiB blocks).
fn parse_report(output: &str, project_id: u32) -> Option<QuotaUsage> {
    let tag = format!("#{project_id}");
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next()? != tag {
            return None;
        }
        let used: u64 = fields.next()?.parse().ok()?;
        let _soft: u64 = fields.next()?.parse().ok()?;
        let hard: u64 = fields.next()?.parse().ok()?;
        Some(QuotaUsage::new(
            Some(used * 1024),
            (hard > 0).then_some(hard * 1024),
        ))
    })
}

#[async_trait]
impl XfsQuotaTool for XfsQuotaCli {
    async fn probe(&self) -> StorageResult<()> {
        self.exec("state -p".to_string()).await.map(|_| ())
    }

    async fn setup_project(&self, project_id: u32, path: &Path) -> StorageResult<()> {
        self.exec(format!("project -s -p {} {project_id}", path.display()))
            .await
            .map(|_| ())
    }

    async fn clear_project(&self, project_id: u32, path: &Path) -> StorageResult<()> {
        self.exec(format!("project -C -p {} {project_id}", path.display()))
            .await
            .map(|_| ())
    }

    async fn set_limit(&self, project_id: u32, limit_bytes: Option<u64>) -> StorageResult<()> {
        // xfs_quota rounds to 1 KiB blocks; 0 removes the limit.
        let limit = limit_bytes.unwrap_or(0);
        self.exec(format!("limit -p bhard={limit} {project_id}"))
            .await
            .map(|_| ())
    }

    async fn report(&self, project_id: u32) -> StorageResult<QuotaUsage> {
        let out = self
            .exec(format!("report -p -b -N -n -L {project_id} -U {project_id}"))
            .await?;
        // A project without any accounted blocks is omitted from the report.
        Ok(parse_report(&out, project_id).unwrap_or(QuotaUsage::new(Some(0), None)))
    }
}

// ============================================================================
// Quota model
// ============================================================================

/// One XFS project per quota scope.
pub struct XfsProjectQuotaModel {
    base: BaseQuotaModel,
    registry: ProjectRegistry,
    tool: Arc<dyn XfsQuotaTool>,
}

impl XfsProjectQuotaModel {
    pub fn new(mount_path: &Path, registry: ProjectRegistry, tool: Arc<dyn XfsQuotaTool>) -> Self {
        Self {
            base: BaseQuotaModel::new(mount_path),
            registry,
            tool,
        }
    }

    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    /// Scope root and project id of a created scope.
    async fn tracked(&self, scope: &QuotaScopeId) -> StorageResult<(PathBuf, u32)> {
        let qspath = self.base.existing_qspath(scope).await?;
        match self.registry.lookup(&scope.pathname()).await? {
            Some(id) => Ok((qspath, id)),
            None => Err(StorageError::quota_scope_not_found(scope)),
        }
    }
}

#[async_trait]
impl QuotaModel for XfsProjectQuotaModel {
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
        let qspath = self.base.create_scope_dir(scope).await?;
        let name = scope.pathname();
        let Some(id) = self.registry.register(&name, &qspath).await? else {
            return Err(StorageError::quota_scope_already_exists(scope));
        };

        if let Err(e) = self.tool.setup_project(id, &qspath).await {
            warn!(scope = %scope, project_id = id, error = %e, "project setup failed, rolling back");
            self.registry.unregister(&name).await?;
            return Err(e);
        }
        if let Some(config) = options {
            self.tool.set_limit(id, Some(config.limit_bytes)).await?;
        }
        info!(scope = %scope, project_id = id, "quota scope created");
        Ok(())
    }

    async fn describe_quota_scope(&self, scope: &QuotaScopeId) -> StorageResult<Option<QuotaUsage>> {
        if self.base.describe_quota_scope(scope).await?.is_none() {
            return Ok(None);
        }
        match self.registry.lookup(&scope.pathname()).await? {
            Some(id) => Ok(Some(self.tool.report(id).await?)),
            None => Ok(Some(QuotaUsage::untracked())),
        }
    }

    async fn update_quota_scope(&self, scope: &QuotaScopeId, config: QuotaConfig) -> StorageResult<()> {
        let (_, id) = self.tracked(scope).await?;
        config.validate()?;
        self.tool.set_limit(id, Some(config.limit_bytes)).await
    }

    async fn unset_quota(&self, scope: &QuotaScopeId) -> StorageResult<()> {
        let (_, id) = self.tracked(scope).await?;
        self.tool.set_limit(id, None).await
    }

    async fn delete_quota_scope(&self, scope: &QuotaScopeId) -> StorageResult<()> {
        let qspath = self.base.existing_qspath(scope).await?;
        self.base.ensure_no_subdirs(scope, &qspath).await?;
        if let Some(id) = self.registry.lookup(&scope.pathname()).await? {
            self.tool.set_limit(id, None).await?;
            self.tool.clear_project(id, &qspath).await?;
            self.registry.unregister(&scope.pathname()).await?;
        }
        run_blocking(move || Ok(std::fs::remove_dir_all(&qspath)?)).await?;
        info!(scope = %scope, "quota scope deleted");
        Ok(())
    }
}

// ============================================================================
// Filesystem operations
// ============================================================================

/// Reflink-aware copies with a fallback to the base walks.
pub struct XfsFsOpModel {
    base: BaseFsOpModel,
    bulk: AtomicBool,
}

impl XfsFsOpModel {
    pub fn new(settings: VolumeSettings) -> Self {
        Self {
            base: BaseFsOpModel::new(settings),
            bulk: AtomicBool::new(false),
        }
    }

    /// Enable the bulk primitives when GNU `cp` is present.
    pub async fn detect_bulk_tools(&self) {
        let mut cmd = Command::new("cp");
        cmd.arg("--reflink=auto").arg("--version");
        let available = subproc::run(cmd).await.is_ok();
        if !available {
            warn!("GNU cp not available; falling back to in-process copies, which may be slower");
        }
        self.bulk.store(available, Ordering::Relaxed);
    }

    pub fn uses_bulk_tools(&self) -> bool {
        self.bulk.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FsOpModel for XfsFsOpModel {
    async fn copy_tree(&self, src: &Path, dst: &Path) -> StorageResult<()> {
        if !self.uses_bulk_tools() {
            return self.base.copy_tree(src, dst).await;
        }
        let mut cmd = Command::new("cp");
        cmd.arg("-a")
            .arg("--reflink=auto")
            .arg("--")
            .arg(src.join("."))
            .arg(dst);
        subproc::drain(subproc::spawn_and_watch(cmd)?).await
    }

    async fn move_tree(&self, src: &Path, dst: &Path) -> StorageResult<()> {
        self.base.move_tree(src, dst).await
    }

    async fn delete_tree(&self, path: &Path) -> StorageResult<()> {
        if !self.uses_bulk_tools() {
            return self.base.delete_tree(path).await;
        }
        let mut cmd = Command::new("rm");
        cmd.arg("-rf").arg("--one-file-system").arg("--").arg(path);
        subproc::drain(subproc::spawn_and_watch(cmd)?).await
    }

    async fn scan_tree(&self, path: &Path, recursive: bool) -> StorageResult<DirEntryStream> {
        self.base.scan_tree(path, recursive).await
    }

    async fn scan_tree_usage(&self, path: &Path) -> StorageResult<TreeUsage> {
        self.base.scan_tree_usage(path).await
    }

    async fn scan_tree_size(&self, path: &Path) -> StorageResult<u64> {
        self.base.scan_tree_size(path).await
    }
}

// ============================================================================
// Volume
// ============================================================================

/// A volume on an XFS filesystem mounted with project quotas (`prjquota`).
pub struct XfsVolume {
    name: String,
    mount_path: PathBuf,
    settings: VolumeSettings,
    quota_model: XfsProjectQuotaModel,
    fsop_model: XfsFsOpModel,
}

impl XfsVolume {
    pub fn new(
        name: impl Into<String>,
        mount_path: impl Into<PathBuf>,
        settings: VolumeSettings,
        options: &XfsOptions,
        tool: Option<Arc<dyn XfsQuotaTool>>,
    ) -> Self {
        let mount_path = mount_path.into();
        let registry = ProjectRegistry::new(&options.registry_dir, options.first_project_id, &settings);
        let tool: Arc<dyn XfsQuotaTool> = match tool {
            Some(tool) => tool,
            None => Arc::new(XfsQuotaCli::new(&options.xfs_quota_cmd, &mount_path, &registry)),
        };
        Self {
            name: name.into(),
            quota_model: XfsProjectQuotaModel::new(&mount_path, registry, tool),
            fsop_model: XfsFsOpModel::new(settings),
            mount_path,
            settings,
        }
    }

    /// Registry constructor.
    pub fn from_context(ctx: VolumeContext) -> StorageResult<Arc<dyn Volume>> {
        let options: XfsOptions = ctx.config.parse_options().map_err(|e| {
            StorageError::VolumeInit(format!("volume '{}': {e}", ctx.name))
        })?;
        Ok(Arc::new(Self::new(
            ctx.name,
            ctx.config.path,
            ctx.settings,
            &options,
            None,
        )))
    }
}

#[async_trait]
impl Volume for XfsVolume {
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
        self.quota_model
            .registry()
            .lookup("")
            .await
            .map_err(|e| StorageError::VolumeInit(format!("volume '{}': registry: {e}", self.name)))?;
        self.quota_model
            .tool
            .probe()
            .await
            .map_err(|e| StorageError::VolumeInit(format!("volume '{}': xfs_quota: {e}", self.name)))?;
        self.fsop_model.detect_bulk_tools().await;
        Ok(())
    }
}
