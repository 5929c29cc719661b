use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use async_trait::async_trait;
use tokio::fs;
use warmbox_utils::DirMaker;

use crate::{
    cache::{CacheFactory, CacheSandbox},
    cgroup::CgroupPool,
    config::{CacheConfig, PoolConfig},
    mem::MemPool,
    sandbox::{IsolationBackend, ProcessContext, ProcessHandle, SandboxId, SandboxKind},
    WarmboxError, WarmboxResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Suffix of the cgroup directory used by the cache, next to its pool's own.
pub const CACHE_CGROUP_SUFFIX: &str = "-cache";

const SANDBOX_ROOT_DIR: &str = "root";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`CacheFactory`] that runs cache sandboxes through an [`IsolationBackend`].
///
/// Each sandbox takes its memory limit from the shared memory pool and gets a cgroup of its
/// own, so pre-warming competes with regular sandbox creation for the same budget.
#[derive(Debug)]
pub struct ProcessCacheFactory {
    backend: Arc<dyn IsolationBackend>,
    cgroups: Arc<CgroupPool>,
    cache_dirs: DirMaker,
    mem: Arc<MemPool>,
    mem_limit_mb: u64,
    next_id: AtomicU64,
}

/// A sandbox built by [`ProcessCacheFactory`].
#[derive(Debug)]
pub struct ProcessCacheSandbox {
    ctx: ProcessContext,
    parent: Option<ProcessHandle>,
    backend: Arc<dyn IsolationBackend>,
    cgroups: Arc<CgroupPool>,
    mem: Arc<MemPool>,
    process: Mutex<Option<ProcessHandle>>,
    removed: AtomicBool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProcessCacheFactory {
    /// Creates a factory whose cgroups live in `<cgroup_root>/<pool name>-cache`.
    ///
    /// The cache directory is created here, replacing any tree left by an earlier run. Fails
    /// if `mem` cannot hold the root sandbox and a full buffer at the same time.
    pub async fn new(
        pool: &PoolConfig,
        cache: &CacheConfig,
        mem: Arc<MemPool>,
        backend: Arc<dyn IsolationBackend>,
    ) -> WarmboxResult<Self> {
        cache.validate(pool)?;
        if cache.min_mem_pool_mb() > mem.get_total_mb() {
            return Err(WarmboxError::Config(format!(
                "cache needs {} MiB but the memory pool only holds {} MiB",
                cache.min_mem_pool_mb(),
                mem.get_total_mb()
            )));
        }

        let cache_dir = cache.get_cache_dir();
        let cache_dirs = match (cache_dir.parent(), cache_dir.file_name()) {
            (Some(base), Some(name)) => DirMaker::new(base, name.to_string_lossy(), true).await?,
            _ => {
                return Err(WarmboxError::Config(format!(
                    "invalid cache dir {}",
                    cache_dir.display()
                )))
            }
        };

        let cgroups = CgroupPool::new(
            pool.get_cgroup_root(),
            format!("{}{}", pool.get_name(), CACHE_CGROUP_SUFFIX),
        )
        .await?;

        Ok(Self {
            backend,
            cgroups: Arc::new(cgroups),
            cache_dirs,
            mem,
            mem_limit_mb: cache.get_mem_limit_mb(),
            next_id: AtomicU64::new(1),
        })
    }

    /// The factory's cgroups.
    pub fn get_cgroups(&self) -> &CgroupPool {
        &self.cgroups
    }
}

impl ProcessCacheSandbox {
    /// The sandbox's main process, once started.
    pub fn process(&self) -> Option<ProcessHandle> {
        *self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The directory the sandbox was created in.
    pub fn get_dir(&self) -> &Path {
        &self.ctx.scratch_dir
    }

    fn require_process(&self) -> WarmboxResult<ProcessHandle> {
        self.process().ok_or_else(|| {
            WarmboxError::Isolation(format!("cache sandbox {} is not running", self.ctx.id))
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CacheFactory for ProcessCacheFactory {
    type Sandbox = ProcessCacheSandbox;

    async fn create(
        &self,
        parent: Option<&ProcessCacheSandbox>,
        sandbox_dir: &Path,
        cmd: &[String],
    ) -> WarmboxResult<(ProcessCacheSandbox, PathBuf)> {
        let id = SandboxId::new(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.mem.acquire(self.mem_limit_mb).await?;

        let cgroup = match self
            .cgroups
            .get_cgroup(self.mem_limit_mb, parent.is_none())
            .await
        {
            Ok(cgroup) => cgroup,
            Err(e) => {
                self.mem.release(self.mem_limit_mb)?;
                return Err(e);
            }
        };
        let cgroup_path = cgroup.get_path().clone();

        let sandbox = ProcessCacheSandbox {
            ctx: ProcessContext {
                id,
                kind: SandboxKind::Zygote,
                root_dir: sandbox_dir.join(SANDBOX_ROOT_DIR),
                scratch_dir: sandbox_dir.to_path_buf(),
                code_dir: None,
                command: cmd.to_vec(),
                cgroup,
            },
            parent: parent.and_then(ProcessCacheSandbox::process),
            backend: Arc::clone(&self.backend),
            cgroups: Arc::clone(&self.cgroups),
            mem: Arc::clone(&self.mem),
            process: Mutex::new(None),
            removed: AtomicBool::new(false),
        };

        let populated = match fs::create_dir_all(&sandbox.ctx.root_dir).await {
            Ok(()) => self.backend.populate_root(&sandbox.ctx).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = populated {
            if let Err(remove_err) = sandbox.remove().await {
                tracing::warn!("failed to remove cache sandbox {}: {}", id, remove_err);
            }
            return Err(e);
        }

        tracing::debug!("cache sandbox {} built in {}", id, sandbox_dir.display());
        Ok((sandbox, cgroup_path))
    }

    async fn cleanup(&self) -> WarmboxResult<()> {
        let destroyed = self.cgroups.destroy().await;
        let removed = self.cache_dirs.cleanup().await.map_err(|e| {
            WarmboxError::Fatal(format!(
                "failed to remove {}: {}",
                self.cache_dirs.root().display(),
                e
            ))
        });

        destroyed.and(removed)
    }
}

#[async_trait]
impl CacheSandbox for ProcessCacheSandbox {
    fn id(&self) -> SandboxId {
        self.ctx.id
    }

    async fn start(&self) -> WarmboxResult<()> {
        let process = match self.parent {
            Some(parent) => self.backend.fork(parent, &self.ctx).await?,
            None => self.backend.start(&self.ctx).await?,
        };

        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = Some(process);
        Ok(())
    }

    async fn pause(&self) -> WarmboxResult<()> {
        self.backend.pause(self.require_process()?).await
    }

    async fn unpause(&self) -> WarmboxResult<()> {
        self.backend.unpause(self.require_process()?).await
    }

    async fn stop(&self) -> WarmboxResult<()> {
        let process = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match process {
            Some(process) => self.backend.kill(process).await,
            None => Ok(()),
        }
    }

    async fn remove(&self) -> WarmboxResult<()> {
        if self.removed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let stopped = self.stop().await;
        let removed = match self.backend.remove_root(&self.ctx).await {
            Ok(()) => remove_dir(&self.ctx.scratch_dir).await,
            Err(e) => Err(e),
        };

        // Released even if teardown failed.
        let released = self.cgroups.release(self.ctx.cgroup.clone());
        let returned = self.mem.release(self.ctx.cgroup.get_mem_limit_mb());

        stopped.and(removed).and(released).and(returned)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Removes a slot directory with the output files in it. A missing directory is fine.
async fn remove_dir(path: &Path) -> WarmboxResult<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WarmboxError::RootFs(path.to_path_buf(), e.to_string())),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{cache::BufferedCache, sandbox::ProcessBackend};

    struct Fixture {
        temp: TempDir,
        pool: PoolConfig,
        cache: CacheConfig,
        mem: Arc<MemPool>,
        backend: Arc<ProcessBackend>,
    }

    impl Fixture {
        fn new() -> WarmboxResult<Self> {
            let temp = TempDir::new()?;
            let pool = PoolConfig::builder()
                .name("test")
                .mem_pool_mb(1000)
                .cgroup_root(temp.path().join("cgroups"))
                .build();
            let cache = CacheConfig::builder()
                .buffer_size(2)
                .producers(2)
                .mem_limit_mb(100)
                .cache_dir(temp.path().join("cache"))
                .root_cmd(vec!["sleep".to_string(), "30".to_string()])
                .init_cmd(vec!["sleep".to_string(), "30".to_string()])
                .build();
            let backend = Arc::new(ProcessBackend::new(temp.path().join("packages")));

            Ok(Self {
                temp,
                pool,
                cache,
                mem: Arc::new(MemPool::new(1000)?),
                backend,
            })
        }

        async fn factory(&self) -> WarmboxResult<ProcessCacheFactory> {
            ProcessCacheFactory::new(
                &self.pool,
                &self.cache,
                Arc::clone(&self.mem),
                self.backend.clone(),
            )
            .await
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_fork_from_root_and_remove() -> WarmboxResult<()> {
        let f = Fixture::new()?;
        let factory = f.factory().await?;
        let cmd = vec!["sleep".to_string(), "30".to_string()];

        let root_dir = f.temp.path().join("root");
        fs::create_dir_all(&root_dir).await?;
        let (root, root_cgroup) = factory.create(None, &root_dir, &cmd).await?;
        assert!(root_cgroup.starts_with(f.temp.path().join("cgroups/test-cache")));
        root.start().await?;

        let child_dir = f.temp.path().join("child");
        fs::create_dir_all(&child_dir).await?;
        let (child, _) = factory.create(Some(&root), &child_dir, &cmd).await?;
        assert!(child.process().is_none());
        child.start().await?;
        child.pause().await?;
        child.unpause().await?;
        assert_eq!(f.mem.get_available_mb(), 800);

        child.remove().await?;
        child.remove().await?;
        root.remove().await?;

        assert_eq!(f.mem.get_available_mb(), 1000);
        assert_eq!(f.backend.live_processes().await, 0);
        assert!(!child_dir.exists());

        factory.cleanup().await?;
        assert!(!f.temp.path().join("cgroups/test-cache").exists());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_buffered_cache_over_processes() -> WarmboxResult<()> {
        let f = Fixture::new()?;
        let factory = f.factory().await?;

        let cache = BufferedCache::new(factory, &f.cache).await?;
        let (sandbox, dir) = cache.create().await?;
        assert!(sandbox.process().is_some());
        assert!(dir.starts_with(f.temp.path().join("cache")));

        sandbox.remove().await?;
        assert!(!dir.exists());
        cache.cleanup().await?;

        assert_eq!(f.mem.get_available_mb(), 1000);
        assert_eq!(f.backend.live_processes().await, 0);
        assert!(!f.temp.path().join("cache").exists());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_factory_rejects_buffer_larger_than_memory() -> WarmboxResult<()> {
        let f = Fixture::new()?;

        // Root plus two slots of 50 MiB need 150 MiB.
        let cache = CacheConfig::builder()
            .buffer_size(2)
            .mem_limit_mb(50)
            .cache_dir(f.temp.path().join("cache"))
            .build();
        let small_pool = PoolConfig::builder()
            .name("test")
            .mem_pool_mb(100)
            .cgroup_root(f.temp.path().join("cgroups"))
            .build();
        let result =
            ProcessCacheFactory::new(&small_pool, &cache, Arc::clone(&f.mem), f.backend.clone())
                .await;
        assert!(matches!(result, Err(WarmboxError::Config(_))));

        // The config fits, but the shared memory pool does not.
        let result = ProcessCacheFactory::new(
            &f.pool,
            &cache,
            Arc::new(MemPool::new(100)?),
            f.backend.clone(),
        )
        .await;
        assert!(matches!(result, Err(WarmboxError::Config(_))));
        assert!(!f.temp.path().join("cache").exists());
        Ok(())
    }
}
