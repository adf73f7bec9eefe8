//! Storage proxy configuration.
//!
//! Loaded from TOML with kebab-case keys:
//!
//! ```toml
//! [storage-proxy]
//! node-id = "node01"
//! ipc-base-path = "/tmp/vfproxy/ipc"
//! scandir-limit = 1000
//! use-watcher = true
//!
//! [volume.local]
//! backend = "vfs"
//! path = "/var/lib/vfproxy/local"
//!
//! [volume.fast.options]      # backend specific
//! registry-dir = "/etc"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

mod defaults {
    use std::path::PathBuf;

    pub fn node_id() -> String {
        "node01".to_string()
    }

    pub fn num_proc() -> usize {
        1
    }

    pub fn ipc_base_path() -> PathBuf {
        PathBuf::from("/tmp/vfproxy/ipc")
    }

    pub fn scandir_limit() -> usize {
        1000
    }

    pub fn stream_queue_size() -> usize {
        32
    }

    pub fn usage_scan_timeout() -> u64 {
        30
    }

    pub fn file_lock_timeout() -> u64 {
        3
    }

    pub fn event_bus_capacity() -> usize {
        1024
    }

    pub fn watcher_insock_path_prefix() -> PathBuf {
        PathBuf::from("/tmp/vfproxy/watcher-in")
    }

    pub fn watcher_outsock_path_prefix() -> PathBuf {
        PathBuf::from("/tmp/vfproxy/watcher-out")
    }
}

/// Top-level configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyConfig {
    pub storage_proxy: ProxySettings,
    /// Volumes by name.
    #[serde(default)]
    pub volume: BTreeMap<String, VolumeConfig>,
}

/// The `[storage-proxy]` section.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxySettings {
    #[serde(default = "defaults::node_id")]
    pub node_id: String,
    /// Number of worker processes; the Watcher serves one channel pair each.
    #[serde(default = "defaults::num_proc")]
    pub num_proc: usize,
    #[serde(default = "defaults::ipc_base_path")]
    pub ipc_base_path: PathBuf,
    /// Maximum entries yielded by one directory scan (0 = unlimited).
    #[serde(default = "defaults::scandir_limit")]
    pub scandir_limit: usize,
    /// Capacity of the bounded channels behind scans and file streams.
    #[serde(default = "defaults::stream_queue_size")]
    pub stream_queue_size: usize,
    /// Wall-clock budget of a usage walk, in seconds.
    #[serde(default = "defaults::usage_scan_timeout")]
    pub usage_scan_timeout: u64,
    /// Advisory file lock timeout, in seconds.
    #[serde(default = "defaults::file_lock_timeout")]
    pub file_lock_timeout: u64,
    #[serde(default = "defaults::event_bus_capacity")]
    pub event_bus_capacity: usize,
    #[serde(default)]
    pub use_watcher: bool,
    #[serde(default = "defaults::watcher_insock_path_prefix")]
    pub watcher_insock_path_prefix: PathBuf,
    #[serde(default = "defaults::watcher_outsock_path_prefix")]
    pub watcher_outsock_path_prefix: PathBuf,
    /// Owner uid applied to privileged mounts.
    #[serde(default)]
    pub user: Option<u32>,
    /// Owner gid applied to privileged mounts.
    #[serde(default)]
    pub group: Option<u32>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            node_id: defaults::node_id(),
            num_proc: defaults::num_proc(),
            ipc_base_path: defaults::ipc_base_path(),
            scandir_limit: defaults::scandir_limit(),
            stream_queue_size: defaults::stream_queue_size(),
            usage_scan_timeout: defaults::usage_scan_timeout(),
            file_lock_timeout: defaults::file_lock_timeout(),
            event_bus_capacity: defaults::event_bus_capacity(),
            use_watcher: false,
            watcher_insock_path_prefix: defaults::watcher_insock_path_prefix(),
            watcher_outsock_path_prefix: defaults::watcher_outsock_path_prefix(),
            user: None,
            group: None,
        }
    }
}

impl ProxySettings {
    /// The runtime knobs handed to every volume.
    pub fn volume_settings(&self) -> VolumeSettings {
        VolumeSettings {
            scandir_limit: self.scandir_limit,
            stream_queue_size: self.stream_queue_size,
            usage_scan_timeout: Duration::from_secs(self.usage_scan_timeout),
            file_lock_timeout: Duration::from_secs(self.file_lock_timeout),
        }
    }

    /// (uid, gid) for privileged mounts; both must be set.
    pub fn owner(&self) -> Option<(u32, u32)> {
        self.user.zip(self.group)
    }

    /// Socket paths of the Watcher channel pair for one worker.
    pub fn watcher_socket_paths(&self, worker_index: usize) -> (PathBuf, PathBuf) {
        (
            with_suffix(&self.watcher_insock_path_prefix, worker_index),
            with_suffix(&self.watcher_outsock_path_prefix, worker_index),
        )
    }
}

fn with_suffix(prefix: &Path, worker_index: usize) -> PathBuf {
    let mut s = prefix.as_os_str().to_owned();
    s.push(format!("-{worker_index}.sock"));
    PathBuf::from(s)
}

/// One `[volume.<name>]` section.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VolumeConfig {
    /// Registered backend name (`vfs`, `xfs`, `share`).
    pub backend: String,
    /// Mount path of the volume.
    pub path: PathBuf,
    /// Backend-specific options.
    #[serde(default)]
    pub options: toml::Table,
}

impl VolumeConfig {
    pub fn new(backend: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            backend: backend.into(),
            path: path.into(),
            options: toml::Table::new(),
        }
    }

    /// Deserialize the backend-specific options table.
    pub fn parse_options<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        Ok(toml::Value::Table(self.options.clone()).try_into()?)
    }
}

/// Runtime knobs shared by every volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeSettings {
    pub scandir_limit: usize,
    pub stream_queue_size: usize,
    pub usage_scan_timeout: Duration,
    pub file_lock_timeout: Duration,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        ProxySettings::default().volume_settings()
    }
}

impl ProxyConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ProxyConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let settings = &self.storage_proxy;
        if settings.stream_queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "storage-proxy.stream-queue-size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if settings.event_bus_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "storage-proxy.event-bus-capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if settings.num_proc == 0 {
            return Err(ConfigError::InvalidValue {
                key: "storage-proxy.num-proc".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        for (name, volume) in &self.volume {
            if !volume.path.is_absolute() {
                return Err(ConfigError::InvalidValue {
                    key: format!("volume.{name}.path"),
                    reason: "must be an absolute path".to_string(),
                });
            }
        }
        Ok(())
    }
}
