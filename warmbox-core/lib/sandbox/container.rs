use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::fs;
use warmbox_utils::BOOTSTRAP_FILENAME;

use crate::{
    cgroup::Cgroup,
    config::SandboxMeta,
    pool::PoolResources,
    sandbox::{
        IsolationBackend, ProcessContext, ProcessHandle, Sandbox, SandboxId, SandboxKind,
        SandboxOp, SandboxState,
    },
    WarmboxError, WarmboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A raw sandbox: one process tree in its own root filesystem and cgroup.
///
/// A `Container` does not serialize its operations or check whether they are allowed. The
/// pool only ever hands it out wrapped in a [`SafeSandbox`](crate::sandbox::SafeSandbox).
#[derive(Debug)]
pub struct Container {
    meta: SandboxMeta,
    ctx: ProcessContext,
    backend: Arc<dyn IsolationBackend>,
    resources: Arc<PoolResources>,
    process: Mutex<Option<ProcessHandle>>,
    state: Mutex<SandboxState>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Container {
    pub(crate) fn new(
        meta: SandboxMeta,
        ctx: ProcessContext,
        backend: Arc<dyn IsolationBackend>,
        resources: Arc<PoolResources>,
    ) -> Self {
        Self {
            meta,
            ctx,
            backend,
            resources,
            process: Mutex::new(None),
            state: Mutex::new(SandboxState::Created),
        }
    }

    /// The host directory shared with the sandbox.
    pub fn get_scratch_dir(&self) -> &Path {
        &self.ctx.scratch_dir
    }

    /// The user's code, for leaves.
    pub fn get_code_dir(&self) -> Option<&Path> {
        self.ctx.code_dir.as_deref()
    }

    /// The sandbox's memory cgroup.
    pub fn get_cgroup(&self) -> &Cgroup {
        &self.ctx.cgroup
    }

    /// The sandbox's main process, once started.
    pub fn process(&self) -> Option<ProcessHandle> {
        *lock(&self.process)
    }

    /// Where the bootstrap script is written.
    pub fn bootstrap_path(&self) -> PathBuf {
        self.ctx.scratch_dir.join(BOOTSTRAP_FILENAME)
    }

    pub(crate) async fn populate_root(&self) -> WarmboxResult<()> {
        self.backend.populate_root(&self.ctx).await
    }

    /// Writes the bootstrap script into the scratch directory, readable by the owner only.
    pub(crate) async fn write_bootstrap(&self) -> WarmboxResult<()> {
        let path = self.bootstrap_path();
        let script = self.meta.bootstrap_script(self.ctx.kind.is_leaf());

        fs::write(&path, script).await?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        Ok(())
    }

    /// Starts a fresh process.
    pub(crate) async fn start(&self) -> WarmboxResult<()> {
        self.state().check(self.id(), SandboxOp::Start)?;

        let process = self.backend.start(&self.ctx).await?;
        self.set_running(process);
        Ok(())
    }

    /// Takes over a process that a parent forked into this sandbox.
    async fn adopt(&self, process: ProcessHandle) -> WarmboxResult<()> {
        if let Err(e) = self.state().check(self.id(), SandboxOp::Start) {
            if let Err(kill_err) = self.backend.kill(process).await {
                tracing::warn!("failed to kill orphaned {}: {}", process, kill_err);
            }
            return Err(e);
        }

        self.set_running(process);
        Ok(())
    }

    fn set_running(&self, process: ProcessHandle) {
        *lock(&self.process) = Some(process);
        *lock(&self.state) = SandboxState::Running;
    }

    fn require_process(&self) -> WarmboxResult<ProcessHandle> {
        self.process().ok_or_else(|| {
            WarmboxError::Isolation(format!("sandbox {} has no process", self.id()))
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Sandbox for Container {
    fn id(&self) -> SandboxId {
        self.ctx.id
    }

    fn kind(&self) -> SandboxKind {
        self.ctx.kind
    }

    fn state(&self) -> SandboxState {
        *lock(&self.state)
    }

    fn meta(&self) -> &SandboxMeta {
        &self.meta
    }

    fn root_dir(&self) -> &Path {
        &self.ctx.root_dir
    }

    async fn pause(&self) -> WarmboxResult<()> {
        self.backend.pause(self.require_process()?).await?;
        *lock(&self.state) = SandboxState::Paused;
        Ok(())
    }

    async fn unpause(&self) -> WarmboxResult<()> {
        self.backend.unpause(self.require_process()?).await?;
        *lock(&self.state) = SandboxState::Running;
        Ok(())
    }

    async fn destroy(&self) -> WarmboxResult<()> {
        {
            let mut state = lock(&self.state);
            if state.is_destroyed() {
                return Ok(());
            }
            *state = SandboxState::Destroyed;
        }

        let mut first_err = None;

        let process = lock(&self.process).take();
        if let Some(process) = process {
            if let Err(e) = self.backend.kill(process).await {
                tracing::warn!("sandbox {}: failed to kill {}: {}", self.id(), process, e);
                first_err.get_or_insert(e);
            }
        }

        if let Err(e) = self.backend.remove_root(&self.ctx).await {
            tracing::warn!("sandbox {}: failed to remove root: {}", self.id(), e);
            first_err.get_or_insert(e);
        }

        // Released even if teardown failed.
        if let Err(e) = self.resources.release_sandbox(self.id()) {
            tracing::error!("sandbox {}: failed to release resources: {}", self.id(), e);
            first_err.get_or_insert(e);
        }

        tracing::debug!("sandbox {} destroyed", self.id());
        first_err.map_or(Ok(()), Err)
    }

    async fn fork(&self, child: &Container) -> WarmboxResult<()> {
        let parent = self.require_process()?;

        let process = self.backend.fork(parent, &child.ctx).await?;
        child.adopt(process).await?;
        self.resources.get_arena().link(self.id(), child.id())?;

        tracing::debug!("sandbox {} forked {} as {}", self.id(), child.id(), process);
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
