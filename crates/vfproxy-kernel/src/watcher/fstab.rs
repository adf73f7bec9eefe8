//! fstab maintenance for Watcher mounts.
//!
//! Entries are matched by mount point (second field). Edits are
//! read-modify-write under an advisory lock on `<fstab>.lock`, so concurrent
//! Watchers serving different workers never interleave.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::blocking::run_blocking;
use crate::error::StorageResult;
use crate::fslock::FileLock;

/// One fstab line (`defaults` when no options are given).
pub fn entry_line(source: &str, target: &Path, fs_type: &str, options: Option<&str>) -> String {
    format!(
        "{source} {} {fs_type} {} 0 0",
        target.display(),
        options.unwrap_or("defaults")
    )
}

fn mount_point(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    line.split_whitespace().nth(1)
}

/// `text` with `line` appended; `None` when the mount point already has an
/// entry.
pub fn add_entry(text: &str, line: &str) -> Option<String> {
    let target = mount_point(line)?;
    if text.lines().any(|l| mount_point(l) == Some(target)) {
        return None;
    }
    let mut out = text.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(line);
    out.push('\n');
    Some(out)
}

/// `text` without the entries for `target`; `None` when there were none.
pub fn remove_entry(text: &str, target: &Path) -> Option<String> {
    let target = target.to_string_lossy();
    let mut removed = false;
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if mount_point(line) == Some(target.as_ref()) {
            removed = true;
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    removed.then_some(out)
}

fn lock_for(fstab: &Path, timeout: Duration) -> FileLock {
    let mut lock = fstab.as_os_str().to_owned();
    lock.push(".lock");
    FileLock::new(PathBuf::from(lock), timeout)
}

async fn edit<F>(fstab: &Path, timeout: Duration, f: F) -> StorageResult<bool>
where
    F: FnOnce(&str) -> Option<String> + Send + 'static,
{
    let _guard = lock_for(fstab, timeout).acquire().await?;
    let path = fstab.to_path_buf();
    run_blocking(move || {
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        match f(&text) {
            Some(updated) => {
                std::fs::write(&path, updated)?;
                Ok(true)
            }
            None => Ok(false),
        }
    })
    .await
}

/// Append `line` unless its mount point is already listed.
pub async fn add_mount(fstab: &Path, line: String, timeout: Duration) -> StorageResult<bool> {
    let changed = edit(fstab, timeout, move |text| add_entry(text, &line)).await?;
    debug!(fstab = %fstab.display(), changed, "fstab add");
    Ok(changed)
}

/// Drop every entry for `target`.
pub async fn remove_mount(fstab: &Path, target: &Path, timeout: Duration) -> StorageResult<bool> {
    let target_owned = target.to_path_buf();
    let changed = edit(fstab, timeout, move |text| remove_entry(text, &target_owned)).await?;
    debug!(fstab = %fstab.display(), target = %target.display(), changed, "fstab remove");
    Ok(changed)
}
