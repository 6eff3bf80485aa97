use std::sync::Arc;

use datafusion::common::{DataFusionError, Result};
use futures::future::{self, BoxFuture, FutureExt};
use log::debug;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Counting admission gate for open spill files, shared by every operator
/// that may touch disk.
#[derive(Debug)]
pub struct FileHandleSemaphore {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A quota of file handles. Returned to the semaphore when dropped.
#[derive(Debug)]
pub struct FileHandlePermit {
    permit: Option<OwnedSemaphorePermit>,
    count: usize,
}

impl FileHandlePermit {
    fn empty() -> Self {
        Self {
            permit: None,
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for FileHandlePermit {
    fn drop(&mut self) {
        if self.permit.take().is_some() {
            debug!("released {} file handles", self.count);
        }
    }
}

impl FileHandleSemaphore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of handles currently held by all permit owners.
    pub fn held(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Waits until `count` handles are available and takes them.
    ///
    /// Requests that can never be satisfied fail immediately instead of
    /// waiting forever.
    pub fn acquire(&self, count: usize) -> BoxFuture<'static, Result<FileHandlePermit>> {
        if count == 0 {
            return future::ready(Ok(FileHandlePermit::empty())).boxed();
        }
        let permits = match self.checked_permits(count) {
            Ok(permits) => permits,
            Err(e) => return future::ready(Err(e)).boxed(),
        };
        let semaphore = Arc::clone(&self.semaphore);
        async move {
            let permit = semaphore
                .acquire_many_owned(permits)
                .await
                .map_err(|_| {
                    DataFusionError::ResourcesExhausted(
                        "file handle semaphore has been closed".to_string(),
                    )
                })?;
            debug!("acquired {count} file handles");
            Ok(FileHandlePermit {
                permit: Some(permit),
                count,
            })
        }
        .boxed()
    }

    /// Takes `count` handles if they are available right now.
    pub fn try_acquire(&self, count: usize) -> Result<Option<FileHandlePermit>> {
        if count == 0 {
            return Ok(Some(FileHandlePermit::empty()));
        }
        let permits = self.checked_permits(count)?;
        match Arc::clone(&self.semaphore).try_acquire_many_owned(permits) {
            Ok(permit) => Ok(Some(FileHandlePermit {
                permit: Some(permit),
                count,
            })),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(DataFusionError::ResourcesExhausted(
                "file handle semaphore has been closed".to_string(),
            )),
        }
    }

    fn checked_permits(&self, count: usize) -> Result<u32> {
        if count > self.capacity {
            return Err(DataFusionError::ResourcesExhausted(format!(
                "requested {count} file handles but the limit is {}",
                self.capacity
            )));
        }
        u32::try_from(count).map_err(|_| {
            DataFusionError::ResourcesExhausted(format!("too many file handles requested: {count}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    #[tokio::test]
    async fn permits_return_on_drop() {
        let sem = FileHandleSemaphore::new(4);
        let first = sem.acquire(3).await.unwrap();
        assert_eq!(first.count(), 3);
        assert_eq!(sem.held(), 3);

        // only one handle left, the second request has to wait
        let mut waiting = sem.acquire(2);
        assert!((&mut waiting).now_or_never().is_none());

        drop(first);
        let second = waiting.await.unwrap();
        assert_eq!(sem.held(), 2);
        drop(second);
        assert_eq!(sem.held(), 0);
    }

    #[tokio::test]
    async fn zero_handles_never_block() {
        let sem = FileHandleSemaphore::new(0);
        let permit = sem.acquire(0).await.unwrap();
        assert_eq!(permit.count(), 0);
        assert_eq!(sem.held(), 0);
    }

    #[tokio::test]
    async fn unattainable_quota_is_rejected() {
        let sem = FileHandleSemaphore::new(2);
        let err = sem.acquire(3).await.unwrap_err();
        assert!(matches!(err, DataFusionError::ResourcesExhausted(_)));
        assert!(sem.try_acquire(3).is_err());
    }

    #[test]
    fn try_acquire_reports_contention() {
        let sem = FileHandleSemaphore::new(3);
        let held = sem.try_acquire(3).unwrap().unwrap();
        assert!(sem.try_acquire(1).unwrap().is_none());
        drop(held);
        assert!(sem.try_acquire(1).unwrap().is_some());
        assert_eq!(sem.held(), 0);
    }
}
