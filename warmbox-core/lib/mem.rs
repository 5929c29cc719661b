//! Memory admission control.
//!
//! The [`MemPool`] tracks how many MiB of the worker's memory budget are still uncommitted.
//! Sandboxes take their memory limit out of the pool before anything else is allocated for
//! them and put it back once their cgroup is released. Requests that do not fit wait, in
//! arrival order, until enough memory is returned.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use tokio::sync::Semaphore;

use crate::{WarmboxError, WarmboxResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A fixed budget of memory, in MiB, shared by every sandbox of a pool.
///
/// One semaphore permit stands for one MiB, so admission is linearized by the semaphore's FIFO
/// queue. Committed memory is counted separately because a queued request already holds some
/// of the semaphore's permits while it waits.
#[derive(Debug)]
pub struct MemPool {
    total_mb: u64,
    permits: Semaphore,
    committed_mb: AtomicU64,
    release_lock: Mutex<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemPool {
    /// Creates a pool with `total_mb` MiB available.
    pub fn new(total_mb: u64) -> WarmboxResult<Self> {
        let max = u64::from(u32::MAX).min(Semaphore::MAX_PERMITS as u64);
        if total_mb == 0 || total_mb > max {
            return Err(WarmboxError::Config(format!(
                "memory pool size must be between 1 and {} MiB, got {}",
                max, total_mb
            )));
        }

        Ok(Self {
            total_mb,
            permits: Semaphore::new(total_mb as usize),
            committed_mb: AtomicU64::new(0),
            release_lock: Mutex::new(()),
        })
    }

    /// The capacity of the pool.
    pub fn get_total_mb(&self) -> u64 {
        self.total_mb
    }

    /// Memory not currently committed to any sandbox.
    pub fn get_available_mb(&self) -> u64 {
        self.total_mb
            .saturating_sub(self.committed_mb.load(Ordering::Acquire))
    }

    /// Changes available memory by `delta_mb`.
    ///
    /// A negative delta takes memory and waits until that much is free. A positive delta
    /// returns memory and never waits. A delta larger than the whole pool fails immediately,
    /// since no amount of waiting could satisfy it.
    pub async fn adjust_available(&self, delta_mb: i64) -> WarmboxResult<()> {
        let magnitude = delta_mb.unsigned_abs();
        if magnitude > self.total_mb {
            return Err(WarmboxError::MemoryRequestExceedsCapacity {
                requested_mb: magnitude,
                total_mb: self.total_mb,
            });
        }

        if delta_mb < 0 {
            self.acquire(magnitude).await
        } else if delta_mb > 0 {
            self.release(magnitude)
        } else {
            Ok(())
        }
    }

    /// Takes `mb` MiB, waiting until they are free.
    pub async fn acquire(&self, mb: u64) -> WarmboxResult<()> {
        if mb > self.total_mb {
            return Err(WarmboxError::MemoryRequestExceedsCapacity {
                requested_mb: mb,
                total_mb: self.total_mb,
            });
        }

        if mb == 0 {
            return Ok(());
        }

        let permit = self
            .permits
            .acquire_many(mb as u32)
            .await
            .map_err(|_| WarmboxError::MemoryPoolClosed)?;

        // The memory stays taken until `release` hands it back.
        permit.forget();
        self.committed_mb.fetch_add(mb, Ordering::AcqRel);

        tracing::trace!("took {} MiB, {} MiB available", mb, self.get_available_mb());
        Ok(())
    }

    /// Returns `mb` MiB to the pool.
    pub fn release(&self, mb: u64) -> WarmboxResult<()> {
        if mb == 0 {
            return Ok(());
        }

        let _guard = self
            .release_lock
            .lock()
            .map_err(|e| WarmboxError::Fatal(format!("memory pool lock poisoned: {}", e)))?;

        let available_mb = self.get_available_mb();
        if mb > self.committed_mb.load(Ordering::Acquire) {
            return Err(WarmboxError::MemoryOverRelease {
                released_mb: mb,
                available_mb,
                total_mb: self.total_mb,
            });
        }

        self.committed_mb.fetch_sub(mb, Ordering::AcqRel);
        self.permits.add_permits(mb as usize);

        tracing::trace!("returned {} MiB, {} MiB available", mb, available_mb + mb);
        Ok(())
    }

    /// Takes the whole pool without waiting and closes it.
    ///
    /// Every sandbox must have been destroyed first. If any memory is still committed the
    /// pool has leaked and a fatal error is returned.
    pub fn drain(&self) -> WarmboxResult<()> {
        let committed_mb = self.committed_mb.load(Ordering::Acquire);
        if committed_mb > 0 {
            return Err(WarmboxError::Fatal(format!(
                "memory leak: {} of {} MiB never returned to the pool",
                committed_mb, self.total_mb
            )));
        }

        match self.permits.try_acquire_many(self.total_mb as u32) {
            Ok(permit) => {
                permit.forget();
                self.committed_mb.store(self.total_mb, Ordering::Release);
                self.permits.close();
                tracing::info!("memory pool drained ({} MiB)", self.total_mb);
                Ok(())
            }
            Err(_) => Err(WarmboxError::Fatal(
                "memory pool drained while requests are still waiting".to_string(),
            )),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_adjust_available_rejects_oversized_request() -> WarmboxResult<()> {
        let pool = MemPool::new(1000)?;

        let result = pool.adjust_available(-1001).await;
        assert!(matches!(
            result,
            Err(WarmboxError::MemoryRequestExceedsCapacity {
                requested_mb: 1001,
                total_mb: 1000
            })
        ));
        assert_eq!(pool.get_available_mb(), 1000);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_request_blocks_until_release() -> WarmboxResult<()> {
        let pool = Arc::new(MemPool::new(1000)?);

        pool.adjust_available(-600).await?;
        assert_eq!(pool.get_available_mb(), 400);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.adjust_available(-600).await })
        };

        // The second request cannot be satisfied yet
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // Permits parked with the waiter still count as available.
        assert_eq!(pool.get_available_mb(), 400);

        pool.adjust_available(600).await?;
        timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should be admitted after the release")
            .expect("waiter task panicked")?;

        assert_eq!(pool.get_available_mb(), 400);
        Ok(())
    }

    #[tokio::test]
    async fn test_release_never_exceeds_total() -> WarmboxResult<()> {
        let pool = MemPool::new(100)?;
        pool.adjust_available(-30).await?;

        assert!(matches!(
            pool.adjust_available(31).await,
            Err(WarmboxError::MemoryOverRelease { .. })
        ));
        pool.adjust_available(30).await?;
        assert_eq!(pool.get_available_mb(), 100);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adjustments_stay_in_bounds() -> WarmboxResult<()> {
        let pool = Arc::new(MemPool::new(256)?);
        let mut handles = Vec::new();

        for i in 0..32u64 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let mb = 16 + (i * 37) % 200;
                for _ in 0..20 {
                    pool.adjust_available(-(mb as i64)).await?;
                    let available = pool.get_available_mb();
                    assert!(available <= pool.get_total_mb());
                    tokio::task::yield_now().await;
                    pool.adjust_available(mb as i64).await?;
                }
                Ok::<_, WarmboxError>(())
            }));
        }

        for handle in handles {
            handle.await.expect("worker panicked")?;
        }

        assert_eq!(pool.get_available_mb(), 256);
        Ok(())
    }

    #[tokio::test]
    async fn test_drain_detects_leaks_and_closes() -> WarmboxResult<()> {
        let pool = MemPool::new(100)?;
        pool.adjust_available(-10).await?;

        let err = pool.drain().unwrap_err();
        assert!(err.is_fatal());

        pool.adjust_available(10).await?;
        pool.drain()?;
        assert_eq!(pool.get_available_mb(), 0);

        assert!(matches!(
            pool.adjust_available(-1).await,
            Err(WarmboxError::MemoryPoolClosed)
        ));
        Ok(())
    }

    #[test]
    fn test_new_rejects_empty_pool() {
        assert!(matches!(MemPool::new(0), Err(WarmboxError::Config(_))));
    }
}
