//! Vfolder path mangling and traversal-safe resolution.
//!
//! A vfolder's physical location is a pure function of its quota scope root
//! and folder UUID: the 32-hex digest split as `ab/cd/<remaining 28>`, which
//! keeps any single directory from holding millions of children.
//!
//! Every user-supplied relative path is resolved with [`sanitize_path`] before
//! use. Resolution follows symlinks for the components that exist (including
//! dangling links, whose targets are followed lexically) and normalises the
//! missing tail, so a link pointing outside the vfolder is rejected even when
//! its target does not exist yet.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;
use vfproxy_types::VFolderId;

use crate::blocking::run_blocking;
use crate::error::{StorageError, StorageResult};

/// Upper bound on symlink hops during resolution (matches Linux `MAXSYMLINKS`).
const MAX_SYMLINK_HOPS: usize = 40;

/// Physical path of folder `folder_id` under `scope_root`.
pub fn mangle_path(scope_root: &Path, folder_id: &Uuid) -> PathBuf {
    let hex = folder_id.as_simple().to_string();
    scope_root.join(&hex[0..2]).join(&hex[2..4]).join(&hex[4..])
}

/// Resolve `relpath` inside the vfolder rooted at `vfroot`.
///
/// Fails with `VFolderNotFound` when the root is missing or not a directory,
/// and with `InvalidSubpath` when the resolved path leaves the root.
pub async fn sanitize_path(
    vfroot: PathBuf,
    relpath: PathBuf,
    vfid: VFolderId,
) -> StorageResult<PathBuf> {
    run_blocking(move || sanitize_blocking(&vfroot, &relpath, &vfid)).await
}

pub(crate) fn sanitize_blocking(
    vfroot: &Path,
    relpath: &Path,
    vfid: &VFolderId,
) -> StorageResult<PathBuf> {
    let root = match dunce::canonicalize(vfroot) {
        Ok(root) if root.is_dir() => root,
        Ok(_) => return Err(StorageError::vfolder_not_found(vfid)),
        Err(e) if is_missing(&e) => return Err(StorageError::vfolder_not_found(vfid)),
        Err(e) => return Err(e.into()),
    };
    let resolved = resolve_lenient(&root, relpath)?;
    if !resolved.starts_with(&root) {
        return Err(StorageError::invalid_subpath(format!(
            "{} (in {vfid})",
            relpath.display()
        )));
    }
    Ok(resolved)
}

fn is_missing(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

enum Step {
    Up,
    Name(OsString),
}

fn steps(path: &Path) -> impl Iterator<Item = Step> + '_ {
    path.components().filter_map(|c| match c {
        Component::ParentDir => Some(Step::Up),
        Component::Normal(name) => Some(Step::Name(name.to_os_string())),
        Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
    })
}

/// Non-strict realpath of `base/relpath`.
fn resolve_lenient(base: &Path, relpath: &Path) -> StorageResult<PathBuf> {
    let mut current = if relpath.has_root() {
        PathBuf::from("/")
    } else {
        base.to_path_buf()
    };
    let mut pending: VecDeque<Step> = steps(relpath).collect();
    let mut hops = 0;

    while let Some(step) = pending.pop_front() {
        let name = match step {
            Step::Up => {
                current.pop();
                continue;
            }
            Step::Name(name) => name,
        };
        let next = current.join(&name);
        match std::fs::symlink_metadata(&next) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(StorageError::invalid_subpath(format!(
                        "{}: too many levels of symbolic links",
                        relpath.display()
                    )));
                }
                let target = std::fs::read_link(&next)?;
                if target.has_root() {
                    current = PathBuf::from("/");
                }
                let expanded: Vec<Step> = steps(&target).collect();
                for s in expanded.into_iter().rev() {
                    pending.push_front(s);
                }
            }
            Ok(_) => current = next,
            Err(e) if is_missing(&e) => current = next,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(current)
}
