//! Watcher request loop.

use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::WatcherPaths;
use super::protocol::{Response, WatcherTask};
use super::tasks::TaskRunner;
use crate::error::StorageResult;

/// Serves one worker's channel pair until cancelled.
pub struct WatcherServer {
    paths: WatcherPaths,
    runner: TaskRunner,
}

fn bind(path: &Path) -> StorageResult<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(UnixListener::bind(path)?)
}

impl WatcherServer {
    pub fn new(paths: WatcherPaths, runner: TaskRunner) -> Self {
        Self { paths, runner }
    }

    /// Bind both sockets and serve connections one pair at a time.
    ///
    /// Task failures are answered, never fatal; a closed channel ends the
    /// connection and the server waits for the next one. Only `cancel` stops
    /// the server.
    pub async fn serve(self, cancel: CancellationToken) -> StorageResult<()> {
        let inbound = bind(&self.paths.insock)?;
        let outbound = bind(&self.paths.outsock)?;
        info!(
            insock = %self.paths.insock.display(),
            outsock = %self.paths.outsock.display(),
            "watcher listening"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = async { tokio::try_join!(inbound.accept(), outbound.accept()) } => {
                    let ((reader, _), (writer, _)) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "watcher accept failed");
                            continue;
                        }
                    };
                    debug!("worker connected");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = self.handle_connection(reader, writer) => match result {
                            Ok(()) => debug!("worker disconnected"),
                            Err(e) => warn!(error = %e, "watcher connection failed"),
                        }
                    }
                }
            }
        }

        info!("watcher stopping");
        for path in [&self.paths.insock, &self.paths.outsock] {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    async fn handle_connection(&self, reader: UnixStream, writer: UnixStream) -> StorageResult<()> {
        let mut requests = FramedRead::new(reader, LengthDelimitedCodec::new());
        let mut responses = FramedWrite::new(writer, LengthDelimitedCodec::new());

        loop {
            let Some(header) = requests.next().await.transpose()? else {
                return Ok(());
            };
            let Some(body) = requests.next().await.transpose()? else {
                return Ok(());
            };

            let response = match WatcherTask::decode(&header, &body) {
                Ok(task) => {
                    debug!(task = task.name(), "executing");
                    match self.runner.execute(&task).await {
                        Ok(response) => response,
                        Err(e) => {
                            warn!(task = task.name(), error = %e, "watcher task failed");
                            Response::failure(format!("{e:?}"))
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "undecodable watcher request");
                    Response::failure(format!("{e:?}"))
                }
            };

            let (status, message) = response.encode();
            responses.feed(status).await?;
            responses.send(message).await?;
        }
    }
}
