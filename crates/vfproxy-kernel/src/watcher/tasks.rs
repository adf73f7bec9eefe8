//! Privileged task execution inside the Watcher process.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use super::fstab;
use super::protocol::{ChownTask, MountTask, Response, UmountTask, WatcherTask};
use crate::blocking::run_blocking;
use crate::error::{StorageError, StorageResult};
use crate::fslock::DEFAULT_LOCK_TIMEOUT;
use crate::subproc;

/// Umount timeout when the request does not carry one.
pub const DEFAULT_UMOUNT_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes decoded [`WatcherTask`]s.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    lock_timeout: Duration,
    mount_cmd: String,
    umount_cmd: String,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

/// Tasks with command output answer it; silent tasks answer `ok`.
fn ack(output: String) -> Response {
    let output = output.trim();
    if output.is_empty() {
        Response::ok()
    } else {
        Response::success(output)
    }
}

impl TaskRunner {
    /// `lock_timeout` bounds waits on the fstab lock.
    pub fn new(lock_timeout: Duration) -> Self {
        Self::with_commands(lock_timeout, "mount", "umount")
    }

    /// Use other programs in place of `mount` and `umount`.
    pub fn with_commands(
        lock_timeout: Duration,
        mount_cmd: impl Into<String>,
        umount_cmd: impl Into<String>,
    ) -> Self {
        Self {
            lock_timeout,
            mount_cmd: mount_cmd.into(),
            umount_cmd: umount_cmd.into(),
        }
    }

    pub async fn execute(&self, task: &WatcherTask) -> StorageResult<Response> {
        match task {
            WatcherTask::Mount(task) => self.mount(task).await,
            WatcherTask::Umount(task) => self.umount(task).await,
            WatcherTask::Chown(task) => chown(task).await,
        }
    }

    async fn mount(&self, task: &MountTask) -> StorageResult<Response> {
        let target = task.target.clone();
        run_blocking(move || Ok(std::fs::create_dir_all(&target)?)).await?;

        let mut cmd = Command::new(&self.mount_cmd);
        cmd.arg("-t").arg(&task.fs_type);
        if let Some(options) = &task.options {
            cmd.arg("-o").arg(options);
        }
        cmd.arg(&task.source).arg(&task.target);
        let output = subproc::run(cmd).await?;
        info!(source = %task.source, target = %task.target.display(), fs_type = %task.fs_type, "mounted");

        if task.edit_fstab {
            let line = fstab::entry_line(
                &task.source,
                &task.target,
                &task.fs_type,
                task.options.as_deref(),
            );
            fstab::add_mount(&task.fstab_path, line, self.lock_timeout).await?;
        }
        Ok(ack(output))
    }

    async fn umount(&self, task: &UmountTask) -> StorageResult<Response> {
        let limit = task.timeout.unwrap_or(DEFAULT_UMOUNT_TIMEOUT);
        let mut cmd = Command::new(&self.umount_cmd);
        cmd.arg(&task.target);
        let output = tokio::time::timeout(limit, subproc::run(cmd))
            .await
            .map_err(|_| {
                StorageError::execution(format!(
                    "umount {} timed out after {limit:?}",
                    task.target.display()
                ))
            })??;
        info!(target = %task.target.display(), "unmounted");

        if task.edit_fstab {
            fstab::remove_mount(&task.fstab_path, &task.target, self.lock_timeout).await?;
        }
        remove_mountpoint(task.target.clone()).await?;
        Ok(ack(output))
    }
}

async fn remove_mountpoint(target: PathBuf) -> StorageResult<()> {
    run_blocking(move || match std::fs::remove_dir(&target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {
            warn!(target = %target.display(), "mount point not empty after umount, keeping it");
            Ok(())
        }
        Err(e) => Err(e.into()),
    })
    .await
}

async fn chown(task: &ChownTask) -> StorageResult<Response> {
    let ChownTask { path, uid, gid } = task.clone();
    run_blocking(move || change_owner(&path, uid, gid)).await?;
    Ok(Response::ok())
}

fn change_owner(path: &Path, uid: u32, gid: u32) -> StorageResult<()> {
    std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_chown_to_current_owner() {
        let tmp = TempDir::new().unwrap();
        let meta = std::fs::metadata(tmp.path()).unwrap();
        let task = WatcherTask::Chown(ChownTask {
            path: tmp.path().to_path_buf(),
            uid: meta.uid(),
            gid: meta.gid(),
        });
        let response = TaskRunner::default().execute(&task).await.unwrap();
        assert_eq!(response, Response::ok());
    }

    #[tokio::test]
    async fn test_chown_missing_path_fails() {
        let tmp = TempDir::new().unwrap();
        let task = WatcherTask::Chown(ChownTask {
            path: tmp.path().join("missing"),
            uid: 0,
            gid: 0,
        });
        assert!(matches!(
            TaskRunner::default().execute(&task).await,
            Err(StorageError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_mount_bogus_fs_fails_without_fstab_edit() {
        let tmp = TempDir::new().unwrap();
        let fstab_path = tmp.path().join("fstab");
        let task = WatcherTask::Mount(MountTask {
            source: "none".to_string(),
            fs_type: "vfproxy-bogus-fs".to_string(),
            options: None,
            target: tmp.path().join("mnt"),
            edit_fstab: true,
            fstab_path: fstab_path.clone(),
        });
        assert!(TaskRunner::default().execute(&task).await.is_err());
        assert!(tmp.path().join("mnt").is_dir());
        assert!(!fstab_path.exists());
    }

    #[tokio::test]
    async fn test_mount_and_umount_edit_fstab() {
        let tmp = TempDir::new().unwrap();
        let fstab_path = tmp.path().join("fstab");
        let target = tmp.path().join("mnt");
        let runner = TaskRunner::with_commands(DEFAULT_LOCK_TIMEOUT, "true", "true");

        let mount = WatcherTask::Mount(MountTask {
            source: "nas:/share_1".to_string(),
            fs_type: "nfs".to_string(),
            options: None,
            target: target.clone(),
            edit_fstab: true,
            fstab_path: fstab_path.clone(),
        });
        assert_eq!(runner.execute(&mount).await.unwrap(), Response::ok());
        assert!(target.is_dir());
        let fstab = std::fs::read_to_string(&fstab_path).unwrap();
        assert!(fstab.contains("nas:/share_1"));

        let umount = WatcherTask::Umount(UmountTask {
            target: target.clone(),
            edit_fstab: true,
            fstab_path: fstab_path.clone(),
            timeout: Some(Duration::from_secs(5)),
        });
        assert_eq!(runner.execute(&umount).await.unwrap(), Response::ok());
        assert!(!target.exists());
        assert_eq!(std::fs::read_to_string(&fstab_path).unwrap(), "");
    }

    #[tokio::test]
    async fn test_umount_timeout() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("slow-umount");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = TaskRunner::with_commands(
            DEFAULT_LOCK_TIMEOUT,
            "true",
            script.display().to_string(),
        );
        let umount = WatcherTask::Umount(UmountTask {
            target: tmp.path().join("mnt"),
            edit_fstab: false,
            fstab_path: tmp.path().join("fstab"),
            timeout: Some(Duration::from_millis(100)),
        });
        match runner.execute(&umount).await {
            Err(StorageError::Execution(msg)) => assert!(msg.contains("timed out")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_ack() {
        assert_eq!(ack("\n".to_string()), Response::ok());
        assert_eq!(ack("done\n".to_string()), Response::success("done"));
    }
}
