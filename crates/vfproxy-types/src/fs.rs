//! Directory-scan records.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Type of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirEntryType {
    File,
    Directory,
    Symlink,
}

impl DirEntryType {
    pub fn is_file(&self) -> bool {
        matches!(self, DirEntryType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, DirEntryType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, DirEntryType::Symlink)
    }
}

/// Metadata captured for a scanned entry (not following symlinks).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub size: u64,
    /// Owner uid.
    pub owner: u32,
    /// Permission bits including the file-type bits.
    pub mode: u32,
    pub modified: SystemTime,
    /// Birth time, when the filesystem records one.
    pub created: Option<SystemTime>,
}

/// One entry yielded by a directory scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    /// Path relative to the scan root.
    pub path: PathBuf,
    pub entry_type: DirEntryType,
    pub stat: Stat,
    /// For symlinks, the target relative to the scan root when it points
    /// inside it, otherwise the raw link text.
    pub symlink_target: Option<String>,
}
