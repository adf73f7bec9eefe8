//! Fixed-backoff polling.

use std::future::Future;
use std::time::Duration;

use crate::error::StorageResult;

/// Poll `op` until it yields `Some`, sleeping `interval` between attempts.
///
/// Returns `Ok(None)` once `max_attempts` polls came back empty. Errors from
/// `op` end the loop immediately.
pub async fn retry_fixed<T, F, Fut>(
    interval: Duration,
    max_attempts: usize,
    mut op: F,
) -> StorageResult<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<Option<T>>>,
{
    for attempt in 0..max_attempts {
        if let Some(value) = op().await? {
            return Ok(Some(value));
        }
        if attempt + 1 < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_returns_first_hit() {
        let calls = AtomicUsize::new(0);
        let found = retry_fixed(Duration::from_millis(1), 10, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok((n == 3).then_some(n)) }
        })
        .await
        .unwrap();
        assert_eq!(found, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let found: Option<()> = retry_fixed(Duration::from_millis(1), 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await
        .unwrap();
        assert!(found.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
