//! Watcher round trips over real Unix sockets.
//!
//! Each test runs a `WatcherServer` in a task with sockets inside a tempdir and
//! talks to it through `WatcherClient`. Mount and umount use `true` in place of
//! the real programs so nothing here needs root.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use vfproxy_kernel::watcher::{ChownTask, MountTask, Response, UmountTask};
use vfproxy_kernel::{
    DEFAULT_LOCK_TIMEOUT, StorageError, StorageResult, TaskRunner, WatcherClient, WatcherPaths,
    WatcherServer, WatcherTask,
};

struct Harness {
    paths: WatcherPaths,
    cancel: CancellationToken,
    server: JoinHandle<StorageResult<()>>,
    tmp: TempDir,
}

impl Harness {
    async fn start(runner: TaskRunner) -> Self {
        let tmp = TempDir::new().unwrap();
        let paths = WatcherPaths::new(
            tmp.path().join("ipc/watcher-in-0.sock"),
            tmp.path().join("ipc/watcher-out-0.sock"),
        );
        let cancel = CancellationToken::new();
        let server = tokio::spawn(WatcherServer::new(paths.clone(), runner).serve(cancel.clone()));

        for _ in 0..200 {
            if paths.insock.exists() && paths.outsock.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(paths.outsock.exists(), "watcher never bound its sockets");

        Self {
            paths,
            cancel,
            server,
            tmp,
        }
    }

    fn scratch(&self) -> &std::path::Path {
        self.tmp.path()
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.server.await.unwrap().unwrap();
        assert!(!self.paths.insock.exists());
        assert!(!self.paths.outsock.exists());
    }
}

fn chown_self(path: &std::path::Path) -> WatcherTask {
    let meta = std::fs::metadata(path).unwrap();
    WatcherTask::Chown(ChownTask {
        path: path.to_path_buf(),
        uid: meta.uid(),
        gid: meta.gid(),
    })
}

#[tokio::test]
async fn test_failure_keeps_connection_alive() {
    let harness = Harness::start(TaskRunner::default()).await;
    let mut client = WatcherClient::connect(&harness.paths).await.unwrap();

    let response = client.request(&chown_self(harness.scratch())).await.unwrap();
    assert_eq!(response, Response::ok());

    let bogus = WatcherTask::Mount(MountTask {
        source: "none".to_string(),
        fs_type: "vfproxy-bogus-fs".to_string(),
        options: None,
        target: harness.scratch().join("mnt"),
        edit_fstab: false,
        fstab_path: harness.scratch().join("fstab"),
    });
    let response = client.request(&bogus).await.unwrap();
    assert!(!response.succeeded);
    assert!(!response.message.is_empty());

    // `run` turns the same failure into an error.
    assert!(matches!(
        client.run(&bogus).await,
        Err(StorageError::WatcherClient(_))
    ));

    let response = client.request(&chown_self(harness.scratch())).await.unwrap();
    assert!(response.succeeded);

    client.close().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_mount_umount_round_trip() {
    let harness =
        Harness::start(TaskRunner::with_commands(DEFAULT_LOCK_TIMEOUT, "true", "true")).await;
    let mut client = WatcherClient::connect(&harness.paths).await.unwrap();
    let fstab = harness.scratch().join("fstab");
    let target = harness.scratch().join("mnt/share_1");

    client
        .run(&WatcherTask::Mount(MountTask {
            source: "nas:/exports/share_1".to_string(),
            fs_type: "nfs".to_string(),
            options: Some("vers=4".to_string()),
            target: target.clone(),
            edit_fstab: true,
            fstab_path: fstab.clone(),
        }))
        .await
        .unwrap();
    assert!(target.is_dir());
    assert_eq!(
        std::fs::read_to_string(&fstab).unwrap().trim_end(),
        format!("nas:/exports/share_1 {} nfs vers=4 0 0", target.display())
    );

    client
        .run(&WatcherTask::Umount(UmountTask {
            target: target.clone(),
            edit_fstab: true,
            fstab_path: fstab.clone(),
            timeout: None,
        }))
        .await
        .unwrap();
    assert!(!target.exists());
    assert!(std::fs::read_to_string(&fstab).unwrap().is_empty());

    client.close().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_server_accepts_next_worker() {
    let harness = Harness::start(TaskRunner::default()).await;

    let mut first = WatcherClient::connect(&harness.paths).await.unwrap();
    assert!(first.request(&chown_self(harness.scratch())).await.unwrap().succeeded);
    first.close().await;

    let mut second = WatcherClient::connect(&harness.paths).await.unwrap();
    assert!(second.request(&chown_self(harness.scratch())).await.unwrap().succeeded);
    second.close().await;

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_task_is_answered() {
    let harness = Harness::start(TaskRunner::default()).await;

    let inbound = UnixStream::connect(&harness.paths.insock).await.unwrap();
    let outbound = UnixStream::connect(&harness.paths.outsock).await.unwrap();
    let mut requests = FramedWrite::new(inbound, LengthDelimitedCodec::new());
    let mut responses = FramedRead::new(outbound, LengthDelimitedCodec::new());

    requests.feed(bytes::Bytes::from("format-disk")).await.unwrap();
    requests.send(bytes::Bytes::from("")).await.unwrap();

    let status = responses.next().await.unwrap().unwrap();
    let message = responses.next().await.unwrap().unwrap();
    let response = Response::decode(&status, &message).unwrap();
    assert!(!response.succeeded);
    assert!(response.message.contains("UnknownTask"));

    drop(requests);
    drop(responses);
    harness.stop().await;
}

#[tokio::test]
async fn test_connect_without_server_fails() {
    let tmp = TempDir::new().unwrap();
    let paths = WatcherPaths::new(tmp.path().join("in.sock"), tmp.path().join("out.sock"));
    assert!(matches!(
        WatcherClient::connect(&paths).await,
        Err(StorageError::WatcherClient(_))
    ));
}

#[tokio::test]
async fn test_abandoned_request_does_not_leak_into_next() {
    let tmp = TempDir::new().unwrap();
    let script = tmp.path().join("slow-umount");
    std::fs::write(&script, "#!/bin/sh\nsleep 0.3\necho stale-umount-output\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let harness = Harness::start(TaskRunner::with_commands(
        DEFAULT_LOCK_TIMEOUT,
        "true",
        script.display().to_string(),
    ))
    .await;
    let mut client = WatcherClient::connect(&harness.paths).await.unwrap();

    let umount = WatcherTask::Umount(UmountTask {
        target: harness.scratch().join("mnt"),
        edit_fstab: false,
        fstab_path: harness.scratch().join("fstab"),
        timeout: Some(Duration::from_secs(5)),
    });
    let abandoned = tokio::time::timeout(Duration::from_millis(50), client.request(&umount)).await;
    assert!(abandoned.is_err());

    // The late umount answer is skipped; chown gets its own.
    let response = client.request(&chown_self(harness.scratch())).await.unwrap();
    assert_eq!(response, Response::ok());

    let response = client.request(&umount).await.unwrap();
    assert_eq!(response, Response::success("stale-umount-output"));

    client.close().await;
    harness.stop().await;
}
