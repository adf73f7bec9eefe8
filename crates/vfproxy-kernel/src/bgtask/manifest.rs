//! Background task manifests.
//!
//! A manifest is the serialisable request for one background task. On the
//! wire it is a JSON object carrying `version` next to the manifest fields, so
//! an orchestrator on another release fails loudly instead of misreading.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use vfproxy_types::VFolderId;

use crate::error::{StorageError, StorageResult};

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Serialize)]
struct VersionedRef<'a, T> {
    version: u32,
    #[serde(flatten)]
    manifest: &'a T,
}

#[derive(Deserialize)]
struct Versioned<T> {
    version: u32,
    #[serde(flatten)]
    manifest: T,
}

fn encode<T: Serialize>(manifest: &T) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(&VersionedRef {
        version: MANIFEST_VERSION,
        manifest,
    })
    .map_err(|e| StorageError::invalid_params(format!("manifest encode: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    let versioned: Versioned<T> = serde_json::from_slice(bytes)
        .map_err(|e| StorageError::invalid_params(format!("manifest decode: {e}")))?;
    if versioned.version != MANIFEST_VERSION {
        return Err(StorageError::invalid_params(format!(
            "manifest version {} (expected {MANIFEST_VERSION})",
            versioned.version
        )));
    }
    Ok(versioned.manifest)
}

/// Delete one vfolder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VFolderDeleteManifest {
    /// Volume name.
    pub volume: String,
    pub vfid: VFolderId,
}

impl VFolderDeleteManifest {
    pub fn new(volume: impl Into<String>, vfid: VFolderId) -> Self {
        Self {
            volume: volume.into(),
            vfid,
        }
    }

    pub fn to_wire(&self) -> StorageResult<Vec<u8>> {
        encode(self)
    }

    pub fn from_wire(bytes: &[u8]) -> StorageResult<Self> {
        decode(bytes)
    }
}

/// Clone one vfolder into a new one on the same volume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VFolderCloneManifest {
    pub volume: String,
    pub src_vfid: VFolderId,
    pub dst_vfid: VFolderId,
}

impl VFolderCloneManifest {
    pub fn new(volume: impl Into<String>, src_vfid: VFolderId, dst_vfid: VFolderId) -> Self {
        Self {
            volume: volume.into(),
            src_vfid,
            dst_vfid,
        }
    }

    pub fn to_wire(&self) -> StorageResult<Vec<u8>> {
        encode(self)
    }

    pub fn from_wire(bytes: &[u8]) -> StorageResult<Self> {
        decode(bytes)
    }
}
