//! Async ↔ blocking bridges for file payloads.
//!
//! File bodies cross between the async request side and a blocking worker
//! through a bounded `mpsc` channel, so a slow disk applies backpressure to
//! the uploader and a slow downloader stalls the reader instead of buffering
//! the whole file. Channel close is end-of-stream in both directions.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use crate::blocking::join_blocking;
use crate::error::StorageResult;

/// A stream of file chunks.
pub type ByteStream = BoxStream<'static, StorageResult<Bytes>>;

/// Turn the receiving half of a channel into a boxed stream.
pub(crate) fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Write `payload` to `path` (created or truncated), returning bytes written.
///
/// An error item in `payload` stops the upload and is returned after the
/// worker has closed the file.
pub async fn write_from_stream(
    path: PathBuf,
    mut payload: ByteStream,
    queue_size: usize,
) -> StorageResult<u64> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(queue_size.max(1));
    let writer = tokio::task::spawn_blocking(move || -> StorageResult<u64> {
        let mut file = File::create(&path)?;
        let mut written = 0u64;
        while let Some(chunk) = rx.blocking_recv() {
            file.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        file.flush()?;
        Ok(written)
    });

    let mut upstream_error = None;
    while let Some(item) = payload.next().await {
        match item {
            Ok(chunk) => {
                // The worker only hangs up on a write error, reported below.
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                upstream_error = Some(e);
                break;
            }
        }
    }
    drop(tx);

    let written = join_blocking(writer).await?;
    match upstream_error {
        Some(e) => Err(e),
        None => Ok(written),
    }
}

/// Stream the contents of `path` in `chunk_size` pieces.
///
/// Open and read errors arrive as the stream's final item. Dropping the
/// stream stops the worker at its next send.
pub fn read_to_stream(path: PathBuf, chunk_size: usize, queue_size: usize) -> ByteStream {
    let (tx, rx) = mpsc::channel::<StorageResult<Bytes>>(queue_size.max(1));
    let chunk_size = chunk_size.max(1);
    tokio::task::spawn_blocking(move || {
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                let _ = tx.blocking_send(Err(e.into()));
                return;
            }
        };
        loop {
            let mut buf = vec![0u8; chunk_size];
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    if tx.blocking_send(Ok(Bytes::from(buf))).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e.into()));
                    break;
                }
            }
        }
    });
    receiver_stream(rx)
}
