//! Vendor CLI invocation.
//!
//! Bulk primitives (`cp --reflink`, `du`, `xfs_quota`, `mount`) run as child
//! processes. [`run`] collects the whole stdout; [`spawn_and_watch`] streams
//! it line by line for long-running copies. Children are killed when the
//! caller's future or stream is dropped.

use std::process::Stdio;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::error::{StorageError, StorageResult};

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

/// Run `cmd` to completion and return its stdout.
///
/// Spawn failures surface as [`StorageError::Io`] (so a missing tool keeps
/// its `NotFound` kind); a non-zero exit is [`StorageError::Execution`].
pub async fn run(mut cmd: Command) -> StorageResult<String> {
    let program = program_name(&cmd);
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StorageError::execution(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

struct Watched {
    program: String,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr: JoinHandle<String>,
}

/// Spawn `cmd` and stream its stdout lines.
///
/// The stream ends after the last line when the child exits successfully, or
/// yields one final `Err` when it exits non-zero.
pub fn spawn_and_watch(mut cmd: Command) -> StorageResult<BoxStream<'static, StorageResult<String>>> {
    let program = program_name(&cmd);
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| StorageError::execution(format!("{program}: stdout not captured")))?;
    let mut stderr_pipe = child.stderr.take();
    let stderr = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    let watched = Watched {
        program,
        child,
        lines: BufReader::new(stdout).lines(),
        stderr,
    };

    Ok(stream::unfold(Some(watched), |state| async move {
        let mut w = state?;
        match w.lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), Some(w))),
            Ok(None) => {
                let status = match w.child.wait().await {
                    Ok(status) => status,
                    Err(e) => return Some((Err(StorageError::Io(e)), None)),
                };
                if status.success() {
                    return None;
                }
                let stderr = w.stderr.await.unwrap_or_default();
                Some((
                    Err(StorageError::execution(format!(
                        "{} exited with {status}: {}",
                        w.program,
                        stderr.trim()
                    ))),
                    None,
                ))
            }
            Err(e) => Some((Err(StorageError::Io(e)), None)),
        }
    })
    .boxed())
}

/// Consume a watched child to completion, logging each line.
pub async fn drain(mut lines: BoxStream<'static, StorageResult<String>>) -> StorageResult<()> {
    while let Some(line) = lines.next().await {
        let line = line?;
        tracing::debug!(%line, "subprocess output");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_run_collects_stdout() {
        let out = run(sh("echo hello")).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_nonzero_is_execution_error() {
        let err = run(sh("echo bad >&2; exit 3")).await.unwrap_err();
        match err {
            StorageError::Execution(msg) => assert!(msg.contains("bad"), "{msg}"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_missing_program_is_io() {
        let err = run(Command::new("vfproxy-no-such-tool")).await.unwrap_err();
        match err {
            StorageError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_watch_streams_lines() {
        let lines: Vec<String> = spawn_and_watch(sh("echo one; echo two"))
            .unwrap()
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, ["one", "two"]);
    }

    #[tokio::test]
    async fn test_watch_reports_failure_last() {
        let items: Vec<StorageResult<String>> = spawn_and_watch(sh("echo partial; exit 1"))
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert!(matches!(items[1], Err(StorageError::Execution(_))));
        assert!(drain(spawn_and_watch(sh("exit 2")).unwrap()).await.is_err());
    }
}
