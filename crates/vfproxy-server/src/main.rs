//! vfproxy binary.
//!
//! ## Usage
//!
//! ```bash
//! # Privileged helper: serve every worker's channel pair (run as root)
//! vfproxy watcher --config /etc/vfproxy/vfproxy.toml
//!
//! # Initialise the configured volumes and print them as JSON
//! vfproxy volumes --config /etc/vfproxy/vfproxy.toml
//!
//! # Run one background vfolder task and print its outcome event
//! vfproxy vfolder delete --config vfproxy.toml --volume local --vfid <scope>/<folder>
//! vfproxy vfolder clone --config vfproxy.toml --volume local --src <vfid> --dst <vfid>
//! ```
//!
//! Logging goes to stderr; set `RUST_LOG` to adjust the filter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use vfproxy_kernel::watcher::{SharedWatcher, connect_shared};
use vfproxy_kernel::{
    BackgroundTaskRunner, BuiltinBackends, CloneVFolderHandler, DeleteVFolderHandler, EventBus,
    ProxyConfig, TaskRunner, TaskStatus, VFolderCloneManifest, VFolderDeleteManifest, VolumeDeps,
    VolumePool, WatcherPaths, WatcherServer,
};
use vfproxy_types::VFolderId;

#[derive(Parser, Debug)]
#[command(name = "vfproxy")]
#[command(about = "Storage proxy volume layer and privileged Watcher")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve privileged mount/umount/chown requests from workers.
    Watcher {
        #[arg(short, long)]
        config: PathBuf,
        /// Serve only this worker index (default: all of 0..num-proc)
        #[arg(long)]
        worker_index: Option<usize>,
    },
    /// Initialise every configured volume, print them, and shut down.
    Volumes {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 0)]
        worker_index: usize,
    },
    /// Run one vfolder background task.
    Vfolder {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 0)]
        worker_index: usize,
        #[arg(long)]
        volume: String,
        #[command(subcommand)]
        task: VfolderTask,
    },
}

#[derive(Subcommand, Debug)]
enum VfolderTask {
    Delete {
        #[arg(long)]
        vfid: VFolderId,
    },
    Clone {
        #[arg(long)]
        src: VFolderId,
        #[arg(long)]
        dst: VFolderId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match args.command {
        Command::Watcher {
            config,
            worker_index,
        } => run_watcher(&config, worker_index).await,
        Command::Volumes {
            config,
            worker_index,
        } => run_volumes(&config, worker_index).await,
        Command::Vfolder {
            config,
            worker_index,
            volume,
            task,
        } => run_vfolder_task(&config, worker_index, volume, task).await,
    }
}

fn load_config(path: &Path) -> Result<ProxyConfig> {
    ProxyConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

async fn run_watcher(config_path: &Path, worker_index: Option<usize>) -> Result<()> {
    let config = load_config(config_path)?;
    let settings = &config.storage_proxy;
    let indices: Vec<usize> = match worker_index {
        Some(idx) if idx >= settings.num_proc => {
            bail!("worker index {idx} out of range (num-proc = {})", settings.num_proc)
        }
        Some(idx) => vec![idx],
        None => (0..settings.num_proc).collect(),
    };

    std::fs::create_dir_all(&settings.ipc_base_path)
        .with_context(|| format!("creating {}", settings.ipc_base_path.display()))?;

    let cancel = CancellationToken::new();
    let lock_timeout = settings.volume_settings().file_lock_timeout;
    let servers = indices.into_iter().map(|idx| {
        let server = WatcherServer::new(
            WatcherPaths::for_worker(settings, idx),
            TaskRunner::new(lock_timeout),
        );
        tokio::spawn(server.serve(cancel.clone()))
    });
    let servers: Vec<_> = servers.collect();
    tracing::info!(count = servers.len(), "watcher started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("interrupted, stopping watcher");
    cancel.cancel();

    for result in futures::future::join_all(servers).await {
        result.context("watcher task panicked")??;
    }
    Ok(())
}

/// Connect to the Watcher when the config asks for it.
async fn volume_deps(config: &ProxyConfig, worker_index: usize) -> Result<VolumeDeps> {
    let settings = &config.storage_proxy;
    let watcher = if settings.use_watcher {
        let paths = WatcherPaths::for_worker(settings, worker_index);
        let client = connect_shared(&paths)
            .await
            .with_context(|| format!("connecting to watcher at {}", paths.insock.display()))?;
        Some(client)
    } else {
        None
    };
    Ok(VolumeDeps {
        watcher,
        owner: settings.owner(),
    })
}

async fn close_watcher(watcher: Option<SharedWatcher>) {
    let Some(shared) = watcher else {
        return;
    };
    match Arc::try_unwrap(shared) {
        Ok(client) => client.into_inner().close().await,
        Err(_) => tracing::warn!("watcher client still shared at exit"),
    }
}

async fn build_pool(config: &ProxyConfig, worker_index: usize) -> Result<(Arc<VolumePool>, Option<SharedWatcher>)> {
    let deps = volume_deps(config, worker_index).await?;
    let watcher = deps.watcher.clone();
    let pool = VolumePool::create(config, deps, &BuiltinBackends)
        .await
        .context("initialising volumes")?;
    Ok((Arc::new(pool), watcher))
}

async fn run_volumes(config_path: &Path, worker_index: usize) -> Result<()> {
    let config = load_config(config_path)?;
    let (pool, watcher) = build_pool(&config, worker_index).await?;

    let volumes = pool.list_volumes().await;
    println!("{}", serde_json::to_string_pretty(&volumes)?);

    pool.shutdown().await;
    drop(pool);
    close_watcher(watcher).await;
    Ok(())
}

async fn run_vfolder_task(
    config_path: &Path,
    worker_index: usize,
    volume: String,
    task: VfolderTask,
) -> Result<()> {
    let config = load_config(config_path)?;
    let (pool, watcher) = build_pool(&config, worker_index).await?;
    let bus = Arc::new(EventBus::new(config.storage_proxy.event_bus_capacity));
    let mut events = bus.subscribe("vfolder.>");
    let runner = BackgroundTaskRunner::new();

    let task_id = match task {
        VfolderTask::Delete { vfid } => runner.spawn(
            Arc::new(DeleteVFolderHandler::new(pool.clone(), bus.clone())),
            VFolderDeleteManifest::new(volume, vfid),
        )?,
        VfolderTask::Clone { src, dst } => runner.spawn(
            Arc::new(CloneVFolderHandler::new(pool.clone(), bus.clone())),
            VFolderCloneManifest::new(volume, src, dst),
        )?,
    };
    let status = runner.wait(&task_id).await;

    while let Some(msg) = events.try_recv() {
        println!("{}", serde_json::to_string(&msg.event)?);
    }

    pool.shutdown().await;
    drop(pool);
    close_watcher(watcher).await;

    match status {
        Some(TaskStatus::Succeeded) => Ok(()),
        Some(TaskStatus::Failed { message }) => bail!("task {task_id} failed: {message}"),
        other => bail!("task {task_id} ended as {other:?}"),
    }
}
