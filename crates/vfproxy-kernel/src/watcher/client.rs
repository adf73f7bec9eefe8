//! Worker-side Watcher channel.

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use super::WatcherPaths;
use super::protocol::{Response, WatcherTask};
use crate::error::{StorageError, StorageResult};

/// Capacity of the response queue fed by the listener.
const RESPONSE_QUEUE: usize = 128;

/// Sends tasks to the Watcher and awaits their responses.
///
/// Responses carry no correlation id, so only one request may be in flight;
/// `request` takes `&mut self` to enforce that. A request dropped after it was
/// sent still gets answered; that answer is discarded by the next request.
pub struct WatcherClient {
    requests: FramedWrite<UnixStream, LengthDelimitedCodec>,
    responses: mpsc::Receiver<StorageResult<Response>>,
    listener: JoinHandle<()>,
    /// Requests fully sent whose responses were never taken.
    unanswered: usize,
    /// A request was dropped while its frames were being written.
    torn: bool,
}

async fn listen(
    mut frames: FramedRead<UnixStream, LengthDelimitedCodec>,
    tx: mpsc::Sender<StorageResult<Response>>,
) {
    loop {
        let pair = match (frames.next().await, frames.next().await) {
            (Some(Ok(status)), Some(Ok(message))) => Response::decode(&status, &message)
                .map_err(|e| StorageError::watcher(e.to_string())),
            (Some(Err(e)), _) | (_, Some(Err(e))) => Err(e.into()),
            _ => {
                debug!("watcher closed the response channel");
                return;
            }
        };
        let failed = pair.is_err();
        if tx.send(pair).await.is_err() || failed {
            return;
        }
    }
}

impl WatcherClient {
    pub async fn connect(paths: &WatcherPaths) -> StorageResult<Self> {
        let inbound = UnixStream::connect(&paths.insock).await.map_err(|e| {
            StorageError::watcher(format!("connect {}: {e}", paths.insock.display()))
        })?;
        let outbound = UnixStream::connect(&paths.outsock).await.map_err(|e| {
            StorageError::watcher(format!("connect {}: {e}", paths.outsock.display()))
        })?;

        let (tx, rx) = mpsc::channel(RESPONSE_QUEUE);
        let listener = tokio::spawn(listen(
            FramedRead::new(outbound, LengthDelimitedCodec::new()),
            tx,
        ));
        Ok(Self {
            requests: FramedWrite::new(inbound, LengthDelimitedCodec::new()),
            responses: rx,
            listener,
            unanswered: 0,
            torn: false,
        })
    }

    /// Send `task` and wait for its response.
    pub async fn request(&mut self, task: &WatcherTask) -> StorageResult<Response> {
        if self.torn {
            return Err(StorageError::watcher(
                "request channel desynchronised by an interrupted send",
            ));
        }
        while self.unanswered > 0 {
            let stale = self.next_response().await?;
            self.unanswered -= 1;
            debug!(succeeded = stale.succeeded, "discarded response to an abandoned request");
        }

        let (header, body) = task
            .encode()
            .map_err(|e| StorageError::watcher(e.to_string()))?;
        self.torn = true;
        self.requests.feed(header).await?;
        self.requests.send(body).await?;
        self.torn = false;
        self.unanswered += 1;

        let response = self.next_response().await;
        self.unanswered -= 1;
        response
    }

    async fn next_response(&mut self) -> StorageResult<Response> {
        match self.responses.recv().await {
            Some(result) => result,
            None => Err(StorageError::watcher("watcher channel closed")),
        }
    }

    /// Like [`request`](Self::request), mapping a failed task to
    /// `WatcherClient` and returning its message on success.
    pub async fn run(&mut self, task: &WatcherTask) -> StorageResult<String> {
        let response = self.request(task).await?;
        if response.succeeded {
            Ok(response.message)
        } else {
            warn!(task = task.name(), message = %response.message, "watcher task failed");
            Err(StorageError::watcher(format!(
                "{}: {}",
                task.name(),
                response.message
            )))
        }
    }

    /// Stop the listener, then drop both sockets.
    pub async fn close(self) {
        self.listener.abort();
        let _ = self.listener.await;
    }
}
