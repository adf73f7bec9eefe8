//! Volume pool and backend registry.
//!
//! The pool owns every configured volume of one worker. Backends are looked up
//! by name in a [`BackendRegistry`] that a [`BackendDiscovery`] fills; the
//! default discovery registers the built-in backends, tests swap in their
//! own.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use vfproxy_types::{CapabilitySet, VolumeId};

use crate::config::ProxyConfig;
use crate::error::{StorageError, StorageResult};
use crate::volume::backends::{share, vfs, xfs};
use crate::volume::{Volume, VolumeConstructor, VolumeContext, VolumeDeps};

// ============================================================================
// Backend registry
// ============================================================================

/// Backend name → constructor.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    constructors: BTreeMap<String, VolumeConstructor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry filled by `discovery`.
    pub fn discover(discovery: &dyn BackendDiscovery) -> Self {
        let mut registry = Self::new();
        discovery.register(&mut registry);
        registry
    }

    /// Register `constructor` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, constructor: VolumeConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    pub fn get(&self, name: &str) -> Option<VolumeConstructor> {
        self.constructors.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Populates a [`BackendRegistry`].
pub trait BackendDiscovery: Send + Sync {
    fn register(&self, registry: &mut BackendRegistry);
}

/// `vfs`, `xfs`, and `share`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinBackends;

impl BackendDiscovery for BuiltinBackends {
    fn register(&self, registry: &mut BackendRegistry) {
        registry.register(vfs::BACKEND_NAME, vfs::BaseVolume::from_context);
        registry.register(xfs::BACKEND_NAME, xfs::XfsVolume::from_context);
        registry.register(share::BACKEND_NAME, share::ShareVolume::from_context);
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Summary of one registered volume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    pub name: String,
    pub id: VolumeId,
    pub backend: String,
    pub path: PathBuf,
    pub capabilities: CapabilitySet,
}

struct Entry {
    id: VolumeId,
    volume: Arc<dyn Volume>,
}

/// Every initialised volume of a worker, by name.
pub struct VolumePool {
    volumes: RwLock<BTreeMap<String, Entry>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for VolumePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumePool")
            .field("volumes", &"<locked>")
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

async fn shutdown_entries(entries: BTreeMap<String, Entry>) {
    for (name, entry) in entries {
        if let Err(e) = entry.volume.shutdown().await {
            warn!(volume = %name, error = %e, "volume shutdown failed");
        }
    }
}

impl VolumePool {
    /// Construct and initialise every configured volume, in name order.
    ///
    /// The first failure aborts: volumes initialised so far are shut down
    /// best-effort and the error is returned as `VolumeInit` (unknown
    /// backends as `InvalidVolume`).
    #[instrument(skip_all, fields(node_id = %config.storage_proxy.node_id))]
    pub async fn create(
        config: &ProxyConfig,
        deps: VolumeDeps,
        discovery: &dyn BackendDiscovery,
    ) -> StorageResult<Self> {
        let registry = BackendRegistry::discover(discovery);
        let settings = config.storage_proxy.volume_settings();
        let node_id = &config.storage_proxy.node_id;
        let mut ready = BTreeMap::new();

        for (name, volume_config) in &config.volume {
            let Some(constructor) = registry.get(&volume_config.backend) else {
                error!(volume = %name, backend = %volume_config.backend, known = ?registry, "unknown backend");
                shutdown_entries(ready).await;
                return Err(StorageError::invalid_volume(format!(
                    "volume '{name}': unknown backend '{}'",
                    volume_config.backend
                )));
            };

            let ctx = VolumeContext {
                name: name.clone(),
                config: volume_config.clone(),
                settings,
                deps: deps.clone(),
            };
            let initialised = match constructor(ctx) {
                Ok(volume) => {
                    let result = volume.init().await;
                    result.map(|()| volume)
                }
                Err(e) => Err(e),
            };
            let volume = match initialised {
                Ok(volume) => volume,
                Err(e) => {
                    error!(volume = %name, error = %e, "volume init failed");
                    shutdown_entries(ready).await;
                    return Err(match e {
                        StorageError::VolumeInit(_) => e,
                        other => StorageError::VolumeInit(format!("volume '{name}': {other}")),
                    });
                }
            };

            let id = VolumeId::derive(node_id, name);
            info!(volume = %name, id = %id.short(), backend = %volume_config.backend, "volume ready");
            ready.insert(name.clone(), Entry { id, volume });
        }

        Ok(Self {
            volumes: RwLock::new(ready),
            shut_down: AtomicBool::new(false),
        })
    }

    pub async fn get_volume(&self, id: &VolumeId) -> StorageResult<Arc<dyn Volume>> {
        let volumes = self.volumes.read().await;
        volumes
            .values()
            .find(|entry| entry.id == *id)
            .map(|entry| Arc::clone(&entry.volume))
            .ok_or_else(|| StorageError::invalid_volume(id.to_string()))
    }

    pub async fn get_volume_by_name(&self, name: &str) -> StorageResult<Arc<dyn Volume>> {
        let volumes = self.volumes.read().await;
        volumes
            .get(name)
            .map(|entry| Arc::clone(&entry.volume))
            .ok_or_else(|| StorageError::invalid_volume(name))
    }

    pub async fn list_volumes(&self) -> Vec<VolumeInfo> {
        let volumes = self.volumes.read().await;
        volumes
            .iter()
            .map(|(name, entry)| VolumeInfo {
                name: name.clone(),
                id: entry.id,
                backend: entry.volume.backend().to_string(),
                path: entry.volume.mount_path().to_path_buf(),
                capabilities: entry.volume.get_capabilities(),
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.volumes.read().await.len()
    }

    /// Shut down and release every volume. Failures are logged, not
    /// returned; calling twice is a no-op.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            info!("volume pool already shut down");
            return;
        }
        let entries = std::mem::take(&mut *self.volumes.write().await);
        info!(count = entries.len(), "shutting down volumes");
        shutdown_entries(entries).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxySettings, VolumeConfig};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use vfproxy_types::Capability;

    fn config_with(volumes: &[(&str, &str, PathBuf)]) -> ProxyConfig {
        ProxyConfig {
            storage_proxy: ProxySettings::default(),
            volume: volumes
                .iter()
                .map(|(name, backend, path)| (name.to_string(), VolumeConfig::new(*backend, path.clone())))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(&[("local", "vfs", tmp.path().to_path_buf())]);
        let pool = VolumePool::create(&config, VolumeDeps::default(), &BuiltinBackends)
            .await
            .unwrap();

        let by_name = pool.get_volume_by_name("local").await.unwrap();
        assert_eq!(by_name.backend(), "vfs");

        let id = VolumeId::derive(&config.storage_proxy.node_id, "local");
        let by_id = pool.get_volume(&id).await.unwrap();
        assert_eq!(by_id.name(), "local");

        let infos = pool.list_volumes().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, id);
        assert!(infos[0].capabilities.contains(Capability::Vfolder));
    }

    #[tokio::test]
    async fn test_unknown_volume_lookups() {
        let config = config_with(&[]);
        let pool = VolumePool::create(&config, VolumeDeps::default(), &BuiltinBackends)
            .await
            .unwrap();
        assert!(matches!(
            pool.get_volume_by_name("nope").await,
            Err(StorageError::InvalidVolume(_))
        ));
        assert!(matches!(
            pool.get_volume(&VolumeId::derive("n", "nope")).await,
            Err(StorageError::InvalidVolume(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(&[("odd", "tape", tmp.path().to_path_buf())]);
        let err = VolumePool::create(&config, VolumeDeps::default(), &BuiltinBackends)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidVolume(_)));
    }

    #[tokio::test]
    async fn test_init_failure_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(&[
            ("a-good", "vfs", tmp.path().to_path_buf()),
            ("b-missing", "vfs", tmp.path().join("missing")),
        ]);
        let err = VolumePool::create(&config, VolumeDeps::default(), &BuiltinBackends)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::VolumeInit(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }

    static SHUTDOWNS: AtomicUsize = AtomicUsize::new(0);

    /// A `vfs` volume that counts shutdowns.
    struct Counting(vfs::BaseVolume);

    #[async_trait::async_trait]
    impl Volume for Counting {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn backend(&self) -> &str {
            "counting"
        }
        fn mount_path(&self) -> &std::path::Path {
            self.0.mount_path()
        }
        fn settings(&self) -> &crate::config::VolumeSettings {
            self.0.settings()
        }
        fn quota_model(&self) -> &dyn crate::volume::QuotaModel {
            self.0.quota_model()
        }
        fn fsop_model(&self) -> &dyn crate::volume::FsOpModel {
            self.0.fsop_model()
        }
        fn get_capabilities(&self) -> CapabilitySet {
            self.0.get_capabilities()
        }
        async fn init(&self) -> StorageResult<()> {
            self.0.init().await
        }
        async fn shutdown(&self) -> StorageResult<()> {
            SHUTDOWNS.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::execution("shutdown hiccup"))
        }
    }

    struct CountingBackends;

    impl BackendDiscovery for CountingBackends {
        fn register(&self, registry: &mut BackendRegistry) {
            registry.register("counting", |ctx| {
                Ok(Arc::new(Counting(vfs::BaseVolume::new(
                    ctx.name,
                    ctx.config.path,
                    ctx.settings,
                ))))
            });
        }
    }

    #[tokio::test]
    async fn test_discovery_swap_and_shutdown() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(&[
            ("one", "counting", tmp.path().to_path_buf()),
            ("two", "counting", tmp.path().to_path_buf()),
        ]);

        // Built-in discovery does not know the test backend.
        assert!(
            VolumePool::create(&config, VolumeDeps::default(), &BuiltinBackends)
                .await
                .is_err()
        );

        let pool = VolumePool::create(&config, VolumeDeps::default(), &CountingBackends)
            .await
            .unwrap();
        assert_eq!(pool.len().await, 2);

        let before = SHUTDOWNS.load(Ordering::SeqCst);
        pool.shutdown().await;
        assert_eq!(SHUTDOWNS.load(Ordering::SeqCst), before + 2);
        assert_eq!(pool.len().await, 0);

        pool.shutdown().await;
        assert_eq!(SHUTDOWNS.load(Ordering::SeqCst), before + 2);
    }

    #[tokio::test]
    async fn test_failed_init_shuts_down_earlier_volumes() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(&[
            ("a", "counting", tmp.path().to_path_buf()),
            ("b", "counting", tmp.path().join("missing")),
        ]);
        let before = SHUTDOWNS.load(Ordering::SeqCst);
        let err = VolumePool::create(&config, VolumeDeps::default(), &CountingBackends)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::VolumeInit(_)));
        assert!(SHUTDOWNS.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn test_builtin_registry() {
        let registry = BackendRegistry::discover(&BuiltinBackends);
        assert_eq!(registry.names().collect::<Vec<_>>(), ["share", "vfs", "xfs"]);
    }
}
