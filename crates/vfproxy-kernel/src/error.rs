//! Storage error taxonomy.

use std::io;
use thiserror::Error;

use vfproxy_types::{QuotaConfigError, QuotaScopeId, VFolderId};

/// Coarse classification of a [`StorageError`].
///
/// Outer surfaces map kinds to their own status codes (HTTP, task results)
/// without matching on every variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    Unsupported,
    External,
    Fatal,
}

/// Storage proxy error type.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The vfolder directory does not exist.
    #[error("vfolder not found: {0}")]
    VFolderNotFound(String),

    /// The quota scope was never created (or already deleted).
    #[error("quota scope not found: {0}")]
    QuotaScopeNotFound(String),

    /// The quota scope already carries tracking metadata.
    #[error("quota scope already exists: {0}")]
    QuotaScopeAlreadyExists(String),

    /// A directory that must be empty is not.
    #[error("not empty: {0}")]
    NotEmpty(String),

    /// A background task for the same key is already in flight.
    #[error("task already running: {0}")]
    TaskAlreadyRunning(String),

    /// A relative path resolves outside its vfolder.
    #[error("invalid subpath: {0}")]
    InvalidSubpath(String),

    #[error("invalid quota config: {0}")]
    InvalidQuotaConfig(String),

    #[error("invalid quota scope: {0}")]
    InvalidQuotaScope(String),

    /// No volume with that name or id is registered.
    #[error("invalid volume: {0}")]
    InvalidVolume(String),

    #[error("invalid parameters: {0}")]
    InvalidApiParameters(String),

    /// The backend does not advertise the capability an operation needs.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An operation ran but failed (subprocess, copy, capacity check).
    #[error("execution failed: {0}")]
    Execution(String),

    /// Creating the vfolder directory failed.
    #[error("vfolder creation failed: {0}")]
    VFolderCreation(String),

    /// An external collaborator (vendor tool, provisioner) failed.
    #[error("external error: {0}")]
    External(String),

    /// The Watcher channel failed or the Watcher reported a task failure.
    #[error("watcher client error: {0}")]
    WatcherClient(String),

    /// A volume failed to initialise; the pool cannot start.
    #[error("volume init failed: {0}")]
    VolumeInit(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn vfolder_not_found(vfid: &VFolderId) -> Self {
        Self::VFolderNotFound(vfid.to_string())
    }

    pub fn quota_scope_not_found(qsid: &QuotaScopeId) -> Self {
        Self::QuotaScopeNotFound(qsid.to_string())
    }

    pub fn quota_scope_already_exists(qsid: &QuotaScopeId) -> Self {
        Self::QuotaScopeAlreadyExists(qsid.to_string())
    }

    pub fn not_empty(what: impl Into<String>) -> Self {
        Self::NotEmpty(what.into())
    }

    pub fn invalid_subpath(path: impl Into<String>) -> Self {
        Self::InvalidSubpath(path.into())
    }

    pub fn invalid_volume(name: impl Into<String>) -> Self {
        Self::InvalidVolume(name.into())
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidApiParameters(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Self::External(msg.into())
    }

    pub fn watcher(msg: impl Into<String>) -> Self {
        Self::WatcherClient(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VFolderNotFound(_) | Self::QuotaScopeNotFound(_) => ErrorKind::NotFound,
            Self::QuotaScopeAlreadyExists(_) | Self::NotEmpty(_) | Self::TaskAlreadyRunning(_) => {
                ErrorKind::Conflict
            }
            Self::InvalidSubpath(_)
            | Self::InvalidQuotaConfig(_)
            | Self::InvalidQuotaScope(_)
            | Self::InvalidVolume(_)
            | Self::InvalidApiParameters(_) => ErrorKind::InvalidInput,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Execution(_)
            | Self::VFolderCreation(_)
            | Self::External(_)
            | Self::WatcherClient(_)
            | Self::Io(_) => ErrorKind::External,
            Self::VolumeInit(_) => ErrorKind::Fatal,
        }
    }

    /// Message suitable for a failure event.
    ///
    /// OS errors render as `[Errno N] text` so consumers can tell them apart
    /// from domain failures.
    pub fn event_message(&self) -> String {
        match self {
            Self::Io(e) => match e.raw_os_error() {
                Some(errno) => {
                    let text = e.to_string();
                    let suffix = format!(" (os error {errno})");
                    let text = text.strip_suffix(&suffix).unwrap_or(&text);
                    format!("[Errno {errno}] {text}")
                }
                None => e.to_string(),
            },
            other => other.to_string(),
        }
    }
}

impl From<QuotaConfigError> for StorageError {
    fn from(e: QuotaConfigError) -> Self {
        Self::InvalidQuotaConfig(e.to_string())
    }
}

/// Storage result type.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(StorageError::VFolderNotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(StorageError::not_empty("x").kind(), ErrorKind::Conflict);
        assert_eq!(StorageError::invalid_subpath("../x").kind(), ErrorKind::InvalidInput);
        assert_eq!(StorageError::unsupported("metric").kind(), ErrorKind::Unsupported);
        assert_eq!(StorageError::VolumeInit("boom".into()).kind(), ErrorKind::Fatal);
        assert_eq!(
            StorageError::Io(io::Error::other("x")).kind(),
            ErrorKind::External
        );
    }

    #[test]
    fn test_event_message_formats_errno() {
        let err = StorageError::Io(io::Error::from_raw_os_error(2));
        let message = err.event_message();
        assert!(message.starts_with("[Errno 2] "));
        assert!(!message.contains("os error"));
        assert_eq!(message.matches('2').count(), 1);

        let err = StorageError::execution("Copying files from source directories failed.");
        assert_eq!(
            err.event_message(),
            "execution failed: Copying files from source directories failed."
        );
    }

    #[test]
    fn test_quota_config_conversion() {
        let err: StorageError = QuotaConfigError::ZeroLimit.into();
        assert!(matches!(err, StorageError::InvalidQuotaConfig(_)));
    }
}
