//! Semaphore-based worker pool.
//!
//! The [`WorkerPool`] limits the number of jobs executing at once. It issues
//! permits via a Tokio semaphore and carries the cancellation token that
//! in-flight jobs observe. The pool is an explicitly owned value: closing it
//! (via [`WorkerPool::shutdown`] or by dropping it) cancels every waiter and
//! refuses new permits, so no state outlives its owner.

use std::sync::Arc;

use digiflow_core::config::DEFAULT_POOL_SIZE;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A permit granting the right to run one job.
///
/// When dropped, the permit is automatically returned to the pool.
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
}

/// Cheap handle used by dispatcher tasks to draw permits from a pool.
#[derive(Debug, Clone)]
pub(crate) struct PoolLease {
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl PoolLease {
    /// Wait for a permit. Returns `None` once the pool is cancelled or
    /// closed; cancellation wins over a permit that is ready at the same
    /// moment.
    pub(crate) async fn acquire(&self) -> Option<WorkerPermit> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.ok().map(|p| WorkerPermit { _permit: p })
            }
        }
    }

    pub(crate) const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Bounded pool of worker slots.
#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Open a pool with the given number of slots (0 = default).
    pub fn open(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_POOL_SIZE } else { size };

        info!(pool_size = size, "WorkerPool opened");

        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn lease(&self) -> PoolLease {
        PoolLease {
            semaphore: Arc::clone(&self.semaphore),
            cancel: self.cancel.clone(),
        }
    }

    /// Ask waiting and running jobs to stop. Waiters give up immediately;
    /// running jobs see the request through their work context.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!("WorkerPool cancellation requested");
            self.cancel.cancel();
        }
    }

    /// Cancel and close the pool. Idempotent.
    pub fn shutdown(&self) {
        if self.semaphore.is_closed() {
            return;
        }
        self.cancel();
        self.semaphore.close();
        info!(pool_size = self.size, "WorkerPool shut down");
    }

    /// Maximum number of concurrently running jobs.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Number of free slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn try_acquire(pool: &WorkerPool) -> Option<WorkerPermit> {
        if pool.is_cancelled() {
            return None;
        }
        let permit = Arc::clone(&pool.semaphore).try_acquire_owned().ok()?;
        Some(WorkerPermit { _permit: permit })
    }

    #[tokio::test]
    async fn pool_default_size() {
        let pool = WorkerPool::open(DEFAULT_POOL_SIZE);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.available_permits(), 1);
    }

    #[tokio::test]
    async fn pool_zero_uses_default() {
        let pool = WorkerPool::open(0);
        assert_eq!(pool.size(), DEFAULT_POOL_SIZE);
    }

    #[tokio::test]
    #[allow(clippy::significant_drop_tightening)]
    async fn try_acquire_respects_size() {
        let pool = WorkerPool::open(2);
        let first = try_acquire(&pool);
        let second = try_acquire(&pool);
        assert!(first.is_some() && second.is_some());
        assert_eq!(pool.available_permits(), 0);
        assert!(try_acquire(&pool).is_none());
        drop((first, second));
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_permit() {
        let pool = WorkerPool::open(1);
        let permit = try_acquire(&pool).unwrap();
        let lease = pool.lease();

        let handle = tokio::spawn(async move { lease.acquire().await.is_some() });
        drop(permit);

        let acquired = tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("acquire should complete after permit released")
            .unwrap();
        assert!(acquired);
    }

    #[tokio::test]
    async fn cancel_releases_waiters() {
        let pool = WorkerPool::open(1);
        let _busy = try_acquire(&pool).unwrap();
        let lease = pool.lease();

        let handle = tokio::spawn(async move { lease.acquire().await.is_none() });
        pool.cancel();

        let gave_up = tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("waiter should give up on cancel")
            .unwrap();
        assert!(gave_up);
        assert!(try_acquire(&pool).is_none());
    }

    #[tokio::test]
    async fn drop_shuts_down() {
        let pool = WorkerPool::open(1);
        let lease = pool.lease();
        drop(pool);
        assert!(lease.cancel_token().is_cancelled());
        assert!(lease.acquire().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let pool = WorkerPool::open(3);
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_closed());
        assert!(pool.is_cancelled());
    }
}
