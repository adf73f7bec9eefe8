//! Offload of blocking filesystem work.
//!
//! Every syscall that can stall (directory walks, canonicalisation, statvfs,
//! chown) goes through [`run_blocking`] so the async runtime keeps serving
//! other requests. Panics in the closure resume on the caller.

use tokio::task::JoinHandle;

use crate::error::{StorageError, StorageResult};

/// Run `f` on the blocking thread pool and await its result.
pub async fn run_blocking<F, T>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    join_blocking(tokio::task::spawn_blocking(f)).await
}

/// Await a worker started with `spawn_blocking`.
///
/// Used directly when the caller has to feed the worker (through a channel)
/// before collecting its result.
pub async fn join_blocking<T>(handle: JoinHandle<StorageResult<T>>) -> StorageResult<T> {
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(StorageError::execution(format!("spawn_blocking: {e}"))),
    }
}
