//! The buffered pre-warm cache.
//!
//! A fixed set of producer tasks keeps a bounded channel full. Each producer repeatedly takes
//! the next slot index from a shared counter, creates `<cache_dir>/<index>`, has the delegate
//! fork a sandbox from the cache's root sandbox into it, starts it, pauses it and publishes
//! it. A failed slot is published as an error and the producer moves on to the next index.
//!
//! Consumers take slots in the order they were published and get them back unpaused.
//! Cancellation is cooperative: a producer notices it between slots, so a creation already
//! in flight runs to completion and is then thrown away.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::{Duration, Instant},
};

use tokio::{
    fs,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use warmbox_utils::CACHE_ROOT_DIR;

use crate::{
    cache::{CacheFactory, CacheSandbox},
    config::{CacheConfig, CACHE_FILL_POLL_MS},
    WarmboxError, WarmboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Keeps a buffer of paused sandboxes built by a [`CacheFactory`].
pub struct BufferedCache<F: CacheFactory> {
    delegate: Arc<F>,
    root: Arc<F::Sandbox>,
    root_dir: PathBuf,
    root_cgroup: PathBuf,
    cache_dir: PathBuf,
    ready: Mutex<mpsc::Receiver<SlotResult<F::Sandbox>>>,
    capacity: usize,
    cancel: CancellationToken,
    next_idx: Arc<AtomicU64>,
    producers: StdMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

type SlotResult<S> = WarmboxResult<BufferSlot<S>>;

/// A started, paused sandbox and the directory it lives in.
struct BufferSlot<S> {
    sandbox: S,
    dir: PathBuf,
}

/// One background task refilling the buffer.
struct Producer<F: CacheFactory> {
    worker: usize,
    delegate: Arc<F>,
    root: Arc<F::Sandbox>,
    cache_dir: PathBuf,
    init_cmd: Vec<String>,
    next_idx: Arc<AtomicU64>,
    tx: mpsc::Sender<SlotResult<F::Sandbox>>,
    cancel: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<F: CacheFactory> BufferedCache<F> {
    /// Starts the root sandbox and the producers, then waits until the buffer is full.
    pub async fn new(delegate: F, config: &CacheConfig) -> WarmboxResult<Self> {
        let capacity = config.get_buffer_size();
        let producers = config.get_producers();
        if capacity == 0 || producers == 0 {
            return Err(WarmboxError::Config(format!(
                "pre-warm cache needs a buffer and producers, got {} slots and {} producers",
                capacity, producers
            )));
        }

        let cache_dir = config.get_cache_dir().clone();
        let root_dir = cache_dir.join(CACHE_ROOT_DIR);
        fs::create_dir_all(&root_dir).await?;

        let delegate = Arc::new(delegate);
        let (root, root_cgroup) = delegate
            .create(None, &root_dir, &config.root_cmd_with_index())
            .await
            .map_err(|e| {
                WarmboxError::Prewarm(format!("failed to create cache entry sandbox: {}", e))
            })?;

        if let Err(e) = root.start().await {
            if let Err(remove_err) = root.remove().await {
                tracing::warn!("failed to remove cache entry sandbox: {}", remove_err);
            }
            return Err(WarmboxError::Prewarm(format!(
                "failed to start cache entry sandbox: {}",
                e
            )));
        }

        let root = Arc::new(root);
        tracing::info!(
            "cache entry sandbox {} started (cgroup {})",
            root.id(),
            root_cgroup.display()
        );

        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let next_idx = Arc::new(AtomicU64::new(0));

        let handles = (0..producers)
            .map(|worker| {
                let producer = Producer {
                    worker,
                    delegate: Arc::clone(&delegate),
                    root: Arc::clone(&root),
                    cache_dir: cache_dir.clone(),
                    init_cmd: config.get_init_cmd().clone(),
                    next_idx: Arc::clone(&next_idx),
                    tx: tx.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(producer.run())
            })
            .collect();
        drop(tx);

        tracing::info!(
            "filling pre-warm buffer: {} slots, {} producers",
            capacity,
            producers
        );
        let started = Instant::now();
        while rx.len() < capacity {
            tokio::time::sleep(Duration::from_millis(CACHE_FILL_POLL_MS)).await;
        }
        tracing::info!("pre-warm buffer full after {:?}", started.elapsed());

        Ok(Self {
            delegate,
            root,
            root_dir,
            root_cgroup,
            cache_dir,
            ready: Mutex::new(rx),
            capacity,
            cancel,
            next_idx,
            producers: StdMutex::new(handles),
            closed: AtomicBool::new(false),
        })
    }

    /// Takes the oldest slot, unpauses it and returns the sandbox with its directory.
    ///
    /// Waits for a producer if the buffer is empty. A slot that failed to build is returned
    /// as its error.
    pub async fn create(&self) -> WarmboxResult<(F::Sandbox, PathBuf)> {
        let received = {
            let mut ready = self.ready.lock().await;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                slot = ready.recv() => slot,
            }
        };

        let slot = received.ok_or(WarmboxError::CacheClosed)??;
        if let Err(e) = slot.sandbox.unpause().await {
            discard(&slot.sandbox).await;
            return Err(e);
        }

        tracing::debug!(
            "handing out pre-warmed sandbox {} from {}",
            slot.sandbox.id(),
            slot.dir.display()
        );
        Ok((slot.sandbox, slot.dir))
    }

    /// Stops the producers, throws away every buffered sandbox and the root sandbox, then
    /// cleans up the delegate.
    ///
    /// Buffered slots are drained without waiting. Each producer finishes at most the one
    /// creation it is in the middle of, throws that sandbox away and exits; the delegate is
    /// cleaned up once they all have. Sandboxes already handed out must have been removed.
    pub async fn cleanup(&self) -> WarmboxResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::info!("stopping pre-warm producers");
        self.cancel.cancel();

        let drained = self.drain().await;
        tracing::info!("discarded {} buffered sandboxes", drained);

        if let Err(e) = self.root.stop().await {
            tracing::warn!("failed to stop cache entry sandbox: {}", e);
        }
        if let Err(e) = self.root.remove().await {
            tracing::warn!("failed to remove cache entry sandbox: {}", e);
        }

        self.join_producers().await;

        // Slots published between the drain and the producers exiting.
        let late = self.drain().await;
        if late > 0 {
            tracing::debug!("discarded {} late slots", late);
        }

        self.delegate.cleanup().await
    }

    /// Waits for every producer task to exit.
    pub async fn join_producers(&self) {
        let handles = std::mem::take(
            &mut *self
                .producers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("pre-warm producer panicked: {}", e);
            }
        }
    }

    /// The number of slots waiting in the buffer. Reads zero while a consumer is waiting.
    pub fn ready_len(&self) -> usize {
        self.ready.try_lock().map(|ready| ready.len()).unwrap_or(0)
    }

    /// The buffer's capacity.
    pub fn get_capacity(&self) -> usize {
        self.capacity
    }

    /// The sandbox every slot is forked from.
    pub fn get_root(&self) -> &F::Sandbox {
        &self.root
    }

    /// The root sandbox's directory.
    pub fn get_root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// The root sandbox's memory cgroup directory.
    pub fn get_root_cgroup(&self) -> &Path {
        &self.root_cgroup
    }

    /// The directory holding the slot directories.
    pub fn get_cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    async fn drain(&self) -> usize {
        let mut ready = self.ready.lock().await;
        ready.close();

        let mut drained = 0;
        while let Ok(slot) = ready.try_recv() {
            match slot {
                Ok(slot) => {
                    discard(&slot.sandbox).await;
                    drained += 1;
                }
                Err(e) => tracing::debug!("dropping failed slot: {}", e),
            }
        }
        drained
    }
}

impl<F: CacheFactory> Producer<F> {
    async fn run(self) {
        tracing::debug!("pre-warm producer {} started", self.worker);

        while !self.cancel.is_cancelled() {
            let idx = self.next_idx.fetch_add(1, Ordering::AcqRel);
            let slot = self.build(idx).await;
            if let Err(e) = &slot {
                tracing::warn!("pre-warm slot {} failed: {}", idx, e);
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = self.tx.reserve() => permit.ok(),
            };

            match permit {
                Some(permit) => permit.send(slot),
                None => {
                    if let Ok(slot) = slot {
                        discard(&slot.sandbox).await;
                    }
                    break;
                }
            }
        }

        tracing::debug!("pre-warm producer {} exiting", self.worker);
    }

    async fn build(&self, idx: u64) -> SlotResult<F::Sandbox> {
        let dir = self.cache_dir.join(idx.to_string());
        fs::create_dir_all(&dir).await.map_err(|e| {
            WarmboxError::Prewarm(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let (sandbox, _cgroup) = self
            .delegate
            .create(Some(self.root.as_ref()), &dir, &self.init_cmd)
            .await?;

        if let Err(e) = prime(&sandbox).await {
            discard(&sandbox).await;
            return Err(e);
        }

        Ok(BufferSlot { sandbox, dir })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<F: CacheFactory> fmt::Debug for BufferedCache<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedCache")
            .field("root", &self.root)
            .field("cache_dir", &self.cache_dir)
            .field("capacity", &self.capacity)
            .field("ready", &self.ready_len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn prime<S: CacheSandbox>(sandbox: &S) -> WarmboxResult<()> {
    sandbox.start().await?;
    sandbox.pause().await
}

/// Unpauses, stops and removes a sandbox nobody will use. Failures are logged.
async fn discard<S: CacheSandbox>(sandbox: &S) {
    if let Err(e) = sandbox.unpause().await {
        tracing::debug!("unpause of discarded sandbox {} failed: {}", sandbox.id(), e);
    }
    if let Err(e) = sandbox.stop().await {
        tracing::warn!("failed to stop discarded sandbox {}: {}", sandbox.id(), e);
    }
    if let Err(e) = sandbox.remove().await {
        tracing::warn!("failed to remove discarded sandbox {}: {}", sandbox.id(), e);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::atomic::AtomicUsize};

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::{sync::Semaphore, time::timeout};

    use super::*;
    use crate::{sandbox::SandboxId, WarmboxError};

    #[derive(Debug, Default)]
    struct OpLog(StdMutex<Vec<(u64, &'static str)>>);

    impl OpLog {
        fn push(&self, id: u64, op: &'static str) {
            self.0.lock().unwrap().push((id, op));
        }

        fn ops_of(&self, id: u64) -> Vec<&'static str> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|(sandbox, _)| *sandbox == id)
                .map(|(_, op)| *op)
                .collect()
        }

        fn ids_with(&self, op: &str) -> Vec<u64> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, logged)| *logged == op)
                .map(|(id, _)| *id)
                .collect()
        }
    }

    #[derive(Debug)]
    struct FakeSandbox {
        id: u64,
        log: Arc<OpLog>,
        fail_start: bool,
    }

    #[async_trait]
    impl CacheSandbox for FakeSandbox {
        fn id(&self) -> SandboxId {
            SandboxId::new(self.id)
        }

        async fn start(&self) -> WarmboxResult<()> {
            self.log.push(self.id, "start");
            if self.fail_start {
                return Err(WarmboxError::Isolation("injected start failure".into()));
            }
            Ok(())
        }

        async fn pause(&self) -> WarmboxResult<()> {
            self.log.push(self.id, "pause");
            Ok(())
        }

        async fn unpause(&self) -> WarmboxResult<()> {
            self.log.push(self.id, "unpause");
            Ok(())
        }

        async fn stop(&self) -> WarmboxResult<()> {
            self.log.push(self.id, "stop");
            Ok(())
        }

        async fn remove(&self) -> WarmboxResult<()> {
            self.log.push(self.id, "remove");
            Ok(())
        }
    }

    /// Builds fake sandboxes. Child creations past the first `ungated` wait on `gate`.
    struct FakeFactory {
        next_id: AtomicU64,
        log: Arc<OpLog>,
        ungated: u64,
        child_creates: AtomicU64,
        gate: Arc<Semaphore>,
        waiting: Arc<AtomicUsize>,
        fail_start: HashSet<u64>,
        cleaned: Arc<AtomicBool>,
    }

    impl FakeFactory {
        fn new(ungated: u64) -> Self {
            Self {
                next_id: AtomicU64::new(0),
                log: Arc::default(),
                ungated,
                child_creates: AtomicU64::new(0),
                gate: Arc::new(Semaphore::new(0)),
                waiting: Arc::default(),
                fail_start: HashSet::new(),
                cleaned: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl CacheFactory for FakeFactory {
        type Sandbox = FakeSandbox;

        async fn create(
            &self,
            parent: Option<&FakeSandbox>,
            sandbox_dir: &Path,
            _cmd: &[String],
        ) -> WarmboxResult<(FakeSandbox, PathBuf)> {
            if parent.is_some() && self.child_creates.fetch_add(1, Ordering::SeqCst) >= self.ungated
            {
                self.waiting.fetch_add(1, Ordering::SeqCst);
                self.gate.acquire().await.expect("gate closed").forget();
                self.waiting.fetch_sub(1, Ordering::SeqCst);
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.log.push(id, "create");

            Ok((
                FakeSandbox {
                    id,
                    log: Arc::clone(&self.log),
                    fail_start: self.fail_start.contains(&id),
                },
                sandbox_dir.join("cgroup"),
            ))
        }

        async fn cleanup(&self) -> WarmboxResult<()> {
            self.cleaned.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(temp: &TempDir, buffer_size: usize, producers: usize) -> CacheConfig {
        CacheConfig::builder()
            .buffer_size(buffer_size)
            .producers(producers)
            .cache_dir(temp.path().join("cache"))
            .build()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test_log::test(tokio::test)]
    async fn test_slots_are_handed_out_unpaused_in_order() -> WarmboxResult<()> {
        let temp = TempDir::new()?;
        let factory = FakeFactory::new(u64::MAX);
        let log = Arc::clone(&factory.log);
        let cleaned = Arc::clone(&factory.cleaned);

        let cache = BufferedCache::new(factory, &config(&temp, 2, 1)).await?;
        assert_eq!(cache.ready_len(), 2);
        assert_eq!(cache.get_root().id(), SandboxId::new(0));
        assert_eq!(cache.get_root_dir(), temp.path().join("cache/root"));

        let (first, dir) = cache.create().await?;
        assert_eq!(dir, temp.path().join("cache/0"));
        assert!(dir.is_dir());
        assert_eq!(
            log.ops_of(first.id),
            vec!["create", "start", "pause", "unpause"]
        );

        let (second, dir) = cache.create().await?;
        assert_eq!(dir, temp.path().join("cache/1"));
        assert!(second.id > first.id);

        first.remove().await?;
        second.remove().await?;
        cache.cleanup().await?;

        assert_eq!(log.ops_of(0), vec!["create", "start", "stop", "remove"]);
        assert!(cleaned.load(Ordering::SeqCst));
        assert!(matches!(
            cache.create().await,
            Err(WarmboxError::CacheClosed)
        ));

        // Every sandbox that was built got removed.
        let created: HashSet<_> = log.ids_with("create").into_iter().collect();
        let removed: HashSet<_> = log.ids_with("remove").into_iter().collect();
        assert_eq!(created, removed);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_slot_is_reported_to_its_consumer() -> WarmboxResult<()> {
        let temp = TempDir::new()?;
        let mut factory = FakeFactory::new(u64::MAX);
        factory.fail_start.insert(1);
        let log = Arc::clone(&factory.log);

        let cache = BufferedCache::new(factory, &config(&temp, 2, 1)).await?;

        let err = cache.create().await.unwrap_err();
        assert!(matches!(err, WarmboxError::Isolation(_)));
        assert_eq!(
            log.ops_of(1),
            vec!["create", "start", "unpause", "stop", "remove"]
        );

        // The producer kept going.
        let (sandbox, dir) = cache.create().await?;
        assert_eq!(sandbox.id, 2);
        assert_eq!(dir, temp.path().join("cache/1"));

        sandbox.remove().await?;
        cache.cleanup().await?;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_root_start_failure_aborts_construction() -> WarmboxResult<()> {
        let temp = TempDir::new()?;
        let mut factory = FakeFactory::new(u64::MAX);
        factory.fail_start.insert(0);
        let log = Arc::clone(&factory.log);

        let err = BufferedCache::new(factory, &config(&temp, 2, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, WarmboxError::Prewarm(_)));
        assert_eq!(log.ops_of(0), vec!["create", "start", "remove"]);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_cleanup_drains_only_buffered_slots() -> WarmboxResult<()> {
        let temp = TempDir::new()?;
        let factory = FakeFactory::new(2);
        let log = Arc::clone(&factory.log);
        let gate = Arc::clone(&factory.gate);
        let waiting = Arc::clone(&factory.waiting);
        let cleaned = Arc::clone(&factory.cleaned);

        let cache = Arc::new(BufferedCache::new(factory, &config(&temp, 2, 3)).await?);

        // Two slots buffered, three producers stuck in the middle of a creation.
        wait_until(|| waiting.load(Ordering::SeqCst) == 3).await;
        assert_eq!(cache.ready_len(), 2);
        let mut buffered = log.ids_with("pause");
        buffered.sort();
        assert_eq!(buffered, vec![1, 2]);

        let cleanup = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.cleanup().await })
        };

        wait_until(|| log.ids_with("remove").len() == 3).await;
        for id in &buffered {
            assert_eq!(
                log.ops_of(*id),
                vec!["create", "start", "pause", "unpause", "stop", "remove"]
            );
        }
        assert_eq!(log.ops_of(0), vec!["create", "start", "stop", "remove"]);
        assert!(!cleanup.is_finished());
        assert!(!cleaned.load(Ordering::SeqCst));

        // Let the in-flight creations finish; each producer throws its sandbox away and exits.
        gate.add_permits(3);
        timeout(Duration::from_secs(5), cleanup)
            .await
            .expect("cleanup should finish once producers exit")
            .expect("cleanup task panicked")?;

        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(cache.next_idx.load(Ordering::SeqCst), 5);
        assert_eq!(log.ids_with("create").len(), 1 + 5);
        assert_eq!(log.ids_with("remove").len(), 1 + 5);
        assert_eq!(cache.ready_len(), 0);
        Ok(())
    }
}
