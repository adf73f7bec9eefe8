//! Watcher wire format.
//!
//! A request is two length-delimited frames: the task name, then the
//! `postcard` body of a versioned per-task struct. A response is two frames:
//! one byte (`1` = succeeded) and a UTF-8 message.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version stamped into every request body.
pub const WIRE_VERSION: u16 = 1;

/// Watcher protocol errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown watcher task: {0}")]
    UnknownTask(String),

    #[error("wire version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u16, got: u16 },

    #[error("task header is not utf-8")]
    InvalidHeader,

    #[error("malformed response: {0}")]
    InvalidResponse(String),

    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
}

/// Mount `source` at `target`, optionally recording it in fstab.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTask {
    pub source: String,
    pub fs_type: String,
    pub options: Option<String>,
    pub target: PathBuf,
    pub edit_fstab: bool,
    pub fstab_path: PathBuf,
}

/// Unmount `target`, optionally dropping its fstab line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UmountTask {
    pub target: PathBuf,
    pub edit_fstab: bool,
    pub fstab_path: PathBuf,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChownTask {
    pub path: PathBuf,
    pub uid: u32,
    pub gid: u32,
}

/// A privileged operation executed by the Watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatcherTask {
    Mount(MountTask),
    Umount(UmountTask),
    Chown(ChownTask),
}

#[derive(Serialize)]
struct VersionedRef<'a, T> {
    version: u16,
    task: &'a T,
}

#[derive(Deserialize)]
struct Versioned<T> {
    version: u16,
    task: T,
}

fn encode_body<T: Serialize>(task: &T) -> Result<Bytes, WireError> {
    let body = postcard::to_stdvec(&VersionedRef {
        version: WIRE_VERSION,
        task,
    })?;
    Ok(Bytes::from(body))
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, WireError> {
    let versioned: Versioned<T> = postcard::from_bytes(body)?;
    if versioned.version != WIRE_VERSION {
        return Err(WireError::VersionMismatch {
            expected: WIRE_VERSION,
            got: versioned.version,
        });
    }
    Ok(versioned.task)
}

fn decode_mount(body: &[u8]) -> Result<WatcherTask, WireError> {
    decode_body(body).map(WatcherTask::Mount)
}

fn decode_umount(body: &[u8]) -> Result<WatcherTask, WireError> {
    decode_body(body).map(WatcherTask::Umount)
}

fn decode_chown(body: &[u8]) -> Result<WatcherTask, WireError> {
    decode_body(body).map(WatcherTask::Chown)
}

type Decoder = fn(&[u8]) -> Result<WatcherTask, WireError>;

/// Task name → body decoder.
static DECODERS: &[(&str, Decoder)] = &[
    ("mount", decode_mount),
    ("umount", decode_umount),
    ("chown", decode_chown),
];

impl WatcherTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mount(_) => "mount",
            Self::Umount(_) => "umount",
            Self::Chown(_) => "chown",
        }
    }

    /// Header and body frames.
    pub fn encode(&self) -> Result<(Bytes, Bytes), WireError> {
        let body = match self {
            Self::Mount(task) => encode_body(task)?,
            Self::Umount(task) => encode_body(task)?,
            Self::Chown(task) => encode_body(task)?,
        };
        Ok((Bytes::from_static(self.name().as_bytes()), body))
    }

    pub fn decode(header: &[u8], body: &[u8]) -> Result<Self, WireError> {
        let name = std::str::from_utf8(header).map_err(|_| WireError::InvalidHeader)?;
        let (_, decoder) = DECODERS
            .iter()
            .find(|(known, _)| *known == name)
            .ok_or_else(|| WireError::UnknownTask(name.to_string()))?;
        decoder(body)
    }
}

/// Outcome of one task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub succeeded: bool,
    pub message: String,
}

impl Response {
    /// Acknowledgement of a task without output.
    pub fn ok() -> Self {
        Self::success("ok")
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            message: message.into(),
        }
    }

    /// Status and message frames.
    pub fn encode(&self) -> (Bytes, Bytes) {
        (
            Bytes::from_static(if self.succeeded { &[1] } else { &[0] }),
            Bytes::from(self.message.clone().into_bytes()),
        )
    }

    pub fn decode(status: &[u8], message: &[u8]) -> Result<Self, WireError> {
        let succeeded = match status {
            [1] => true,
            [0] => false,
            other => {
                return Err(WireError::InvalidResponse(format!(
                    "status frame {other:?}"
                )));
            }
        };
        let message = String::from_utf8(message.to_vec())
            .map_err(|_| WireError::InvalidResponse("message is not utf-8".to_string()))?;
        Ok(Self { succeeded, message })
    }
}
