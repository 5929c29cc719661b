//! The sandbox pool: memory-admitted sandbox creation with rollback.
//!
//! [`SandboxPool::create`] runs these stages, in order:
//!
//! 1. reject a leaf without code before anything is allocated
//! 2. take the sandbox's memory limit from the memory pool, waiting if necessary
//! 3. take a cgroup (charges move in only for sandboxes without a parent)
//! 4. allocate an id and a root filesystem directory
//! 5. populate the root filesystem and write the bootstrap script
//! 6. wrap the container and announce it to listeners
//! 7. fork from the parent, or start a fresh process
//!
//! If any stage fails, whatever the earlier stages acquired is given back before the error is
//! returned. A failed fork is reported as [`WarmboxError::ForkFailed`], distinct from other
//! failures.

mod resources;

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Instant,
};

use warmbox_utils::{DirMaker, BOOTSTRAP_FILENAME, ROOT_DIRS_PREFIX, SANDBOX_DIR_PREFIX};

use crate::{
    cgroup::CgroupPool,
    config::{PoolConfig, SandboxMeta},
    mem::MemPool,
    sandbox::{
        Container, IsolationBackend, Listeners, ProcessContext, SafeSandbox, Sandbox,
        SandboxEventFn, SandboxId, SandboxKind, SandboxRef,
    },
    WarmboxError, WarmboxResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use resources::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates sandboxes against a shared memory budget and tears them all down on cleanup.
#[derive(Debug)]
pub struct SandboxPool {
    config: PoolConfig,
    resources: Arc<PoolResources>,
    root_dirs: DirMaker,
    backend: Arc<dyn IsolationBackend>,
    listeners: Listeners,
    next_id: AtomicU64,
    sandboxes: Mutex<HashMap<SandboxId, Weak<dyn Sandbox>>>,
    cleaned_up: AtomicBool,
}

/// Logs how long each creation stage took.
struct StageTimer {
    id: SandboxId,
    started: Instant,
    last: Instant,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxPool {
    /// Creates a pool drawing memory from `mem` and running sandboxes on `backend`.
    ///
    /// The pool's cgroup directory and its root filesystem directory
    /// (`<root_dir>/root-<name>`) are created here. A root filesystem directory left behind by
    /// an earlier run is removed.
    pub async fn new(
        config: PoolConfig,
        mem: Arc<MemPool>,
        backend: Arc<dyn IsolationBackend>,
    ) -> WarmboxResult<Self> {
        config.validate()?;

        let cgroups = CgroupPool::new(config.get_cgroup_root(), config.get_name()).await?;
        let root_dirs = DirMaker::new(
            config.get_root_dir(),
            format!("{}{}", ROOT_DIRS_PREFIX, config.get_name()),
            true,
        )
        .await?;

        tracing::info!(
            "sandbox pool {} ready ({} MiB, roots at {})",
            config.get_name(),
            mem.get_total_mb(),
            root_dirs.root().display()
        );

        Ok(Self {
            config,
            resources: Arc::new(PoolResources::new(mem, cgroups)),
            root_dirs,
            backend,
            listeners: Listeners::default(),
            next_id: AtomicU64::new(1),
            sandboxes: Mutex::new(HashMap::new()),
            cleaned_up: AtomicBool::new(false),
        })
    }

    /// The pool's name.
    pub fn get_name(&self) -> &str {
        self.config.get_name()
    }

    /// The accounting shared with the pool's sandboxes.
    pub fn get_resources(&self) -> &PoolResources {
        &self.resources
    }

    /// Creates a sandbox.
    ///
    /// With a `parent`, the sandbox is forked from it; otherwise a fresh process is started.
    /// Leaves must be given a non-empty `code_dir`. `scratch_dir` must exist; the bootstrap
    /// script is written into it. `meta` defaults to the pool's memory limit.
    pub async fn create(
        &self,
        parent: Option<&SandboxRef>,
        is_leaf: bool,
        code_dir: Option<&Path>,
        scratch_dir: &Path,
        meta: Option<SandboxMeta>,
    ) -> WarmboxResult<SandboxRef> {
        if is_leaf && code_dir.map_or(true, |dir| dir.as_os_str().is_empty()) {
            return Err(WarmboxError::LeafWithoutCodeDir);
        }

        let kind = SandboxKind::from_is_leaf(is_leaf);
        let meta = meta
            .unwrap_or_default()
            .fill_defaults(self.config.get_default_mem_limit_mb());
        let mem_limit_mb = meta.mem_limit_mb;
        let id = SandboxId::new(self.next_id.fetch_add(1, Ordering::Relaxed));

        tracing::info!(
            "<{}>.create(kind={}, parent={:?}, mem={}MiB) -> sandbox {}",
            self.get_name(),
            kind,
            parent.map(|p| p.id().as_u64()),
            mem_limit_mb,
            id
        );

        let mut timer = StageTimer::new(id);

        self.resources.get_mem().acquire(mem_limit_mb).await?;
        timer.lap("acquire memory");

        let cgroup = self
            .resources
            .attach(id, kind, mem_limit_mb, parent.is_none())
            .await
            .map_err(|e| WarmboxError::create_failed(id, e))?;
        timer.lap("acquire cgroup");

        let dir_name = format!("{}{}", SANDBOX_DIR_PREFIX, id);
        let mut command = self.config.get_runtime_cmd().clone();
        command.push(
            scratch_dir
                .join(BOOTSTRAP_FILENAME)
                .to_string_lossy()
                .into_owned(),
        );

        let ctx = ProcessContext {
            id,
            kind,
            root_dir: self.root_dirs.root().join(&dir_name),
            scratch_dir: scratch_dir.to_path_buf(),
            code_dir: code_dir.map(Path::to_path_buf),
            command,
            cgroup,
        };

        let container = Arc::new(Container::new(
            meta,
            ctx,
            Arc::clone(&self.backend),
            Arc::clone(&self.resources),
        ));

        if let Err(e) = self.prepare(&container, &dir_name, &mut timer).await {
            if let Err(rollback_err) = container.destroy().await {
                tracing::error!("sandbox {}: rollback failed: {}", id, rollback_err);
            }
            return Err(WarmboxError::create_failed(id, e));
        }

        let sandbox: SandboxRef = Arc::new(SafeSandbox::new(
            Arc::clone(&container),
            self.listeners.clone(),
        ));
        self.track(&sandbox);

        let started = match parent {
            Some(parent) => parent
                .fork(&container)
                .await
                .map_err(|e| WarmboxError::ForkFailed {
                    parent: parent.id(),
                    source: Box::new(e),
                }),
            None => container
                .start()
                .await
                .map_err(|e| WarmboxError::create_failed(id, e)),
        };
        timer.lap(if parent.is_some() { "fork" } else { "start" });

        if let Err(e) = started {
            if let Err(rollback_err) = sandbox.destroy().await {
                tracing::error!("sandbox {}: rollback failed: {}", id, rollback_err);
            }
            return Err(e);
        }

        timer.finish();
        Ok(sandbox)
    }

    /// Registers a listener for events of every sandbox of this pool, including ones created
    /// before it was registered.
    pub fn add_listener(&self, listener: SandboxEventFn) {
        self.listeners.add(listener);
    }

    /// A live sandbox of this pool.
    pub fn get(&self, id: SandboxId) -> Option<SandboxRef> {
        self.lock_sandboxes().get(&id).and_then(Weak::upgrade)
    }

    /// Destroys `id` and every sandbox forked from it, children first.
    pub async fn destroy_tree(&self, id: SandboxId) -> WarmboxResult<()> {
        let order = self.resources.get_arena().descendants_post_order(id);
        if order.is_empty() {
            return Err(WarmboxError::SandboxNotFound(id));
        }

        let mut first_err = None;
        for member in order {
            match self.get(member) {
                Some(sandbox) => {
                    if let Err(e) = sandbox.destroy().await {
                        tracing::warn!("failed to destroy sandbox {}: {}", member, e);
                        first_err.get_or_insert(e);
                    }
                }
                None => tracing::warn!("sandbox {} has no live handle, skipping", member),
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// A human-readable dump of the pool's accounting and sandbox tree.
    pub fn debug_string(&self) -> String {
        let mem = self.resources.get_mem();
        let cgroups = self.resources.get_cgroups();

        format!(
            "<{}> memory {}/{} MiB available, cgroups {} in use / {} free\n{}",
            self.get_name(),
            mem.get_available_mb(),
            mem.get_total_mb(),
            cgroups.outstanding(),
            cgroups.free(),
            self.resources.get_arena().render()
        )
    }

    /// Reclaims all of the pool's memory, cgroups and root filesystems.
    ///
    /// Every sandbox must have been destroyed. Anything that cannot be reclaimed is reported
    /// as [`WarmboxError::Fatal`]. Calling this again after it succeeded does nothing.
    pub async fn cleanup(&self) -> WarmboxResult<()> {
        if self.cleaned_up.load(Ordering::Acquire) {
            tracing::warn!("<{}> already cleaned up", self.get_name());
            return Ok(());
        }

        tracing::info!("<{}> cleanup: make sure all memory is free", self.get_name());
        self.resources.get_mem().drain()?;

        tracing::info!("<{}> cleanup: remove cgroups", self.get_name());
        self.resources.get_cgroups().destroy().await?;

        tracing::info!("<{}> cleanup: remove root filesystems", self.get_name());
        self.root_dirs.cleanup().await.map_err(|e| {
            WarmboxError::Fatal(format!(
                "failed to remove {}: {}",
                self.root_dirs.root().display(),
                e
            ))
        })?;

        self.cleaned_up.store(true, Ordering::Release);
        Ok(())
    }

    async fn prepare(
        &self,
        container: &Container,
        dir_name: &str,
        timer: &mut StageTimer,
    ) -> WarmboxResult<()> {
        self.root_dirs.make(dir_name).await?;
        container.populate_root().await?;
        timer.lap("populate root");

        container.write_bootstrap().await?;
        timer.lap("write bootstrap");
        Ok(())
    }

    fn track(&self, sandbox: &SandboxRef) {
        let mut sandboxes = self.lock_sandboxes();
        sandboxes.retain(|_, weak| weak.strong_count() > 0);
        sandboxes.insert(sandbox.id(), Arc::downgrade(sandbox));
    }

    fn lock_sandboxes(&self) -> MutexGuard<'_, HashMap<SandboxId, Weak<dyn Sandbox>>> {
        self.sandboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StageTimer {
    fn new(id: SandboxId) -> Self {
        let now = Instant::now();
        Self {
            id,
            started: now,
            last: now,
        }
    }

    fn lap(&mut self, stage: &str) {
        let now = Instant::now();
        tracing::debug!("sandbox {}: {} took {:?}", self.id, stage, now - self.last);
        self.last = now;
    }

    fn finish(self) {
        tracing::info!("sandbox {} created in {:?}", self.id, self.started.elapsed());
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
