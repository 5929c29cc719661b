use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    config::SandboxMeta,
    sandbox::{
        Container, Listeners, Sandbox, SandboxEvent, SandboxEventKind, SandboxId, SandboxKind,
        SandboxOp, SandboxState,
    },
    WarmboxError, WarmboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Wraps a [`Container`] so it can be shared between tasks.
///
/// - Operations on one sandbox run one at a time.
/// - An operation the current state does not allow fails without touching the container.
/// - If a pause, unpause or fork fails halfway, the sandbox is destroyed and
///   [`WarmboxError::SandboxDead`] is returned.
/// - Listeners hear about an operation only after it has completed.
#[derive(Debug)]
pub struct SafeSandbox {
    inner: Arc<Container>,
    op_lock: Mutex<()>,
    listeners: Listeners,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SafeSandbox {
    /// Wraps `inner` and announces it to `listeners`.
    pub(crate) fn new(inner: Arc<Container>, listeners: Listeners) -> Self {
        let sandbox = Self {
            inner,
            op_lock: Mutex::new(()),
            listeners,
        };
        sandbox.notify(SandboxEventKind::Create);
        sandbox
    }

    /// The wrapped container.
    pub fn get_inner(&self) -> &Container {
        &self.inner
    }

    fn notify(&self, kind: SandboxEventKind) {
        self.listeners.notify(SandboxEvent::new(self.id(), kind));
    }

    async fn destroy_on_error(&self, err: WarmboxError, guard: MutexGuard<'_, ()>) -> WarmboxError {
        tracing::warn!("sandbox {} failed, destroying it: {}", self.id(), err);

        if let Err(e) = self.inner.destroy().await {
            tracing::error!("sandbox {}: destroy after failure also failed: {}", self.id(), e);
        }
        drop(guard);
        self.notify(SandboxEventKind::Destroy);

        WarmboxError::SandboxDead {
            id: self.id(),
            source: Box::new(err),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Sandbox for SafeSandbox {
    fn id(&self) -> SandboxId {
        self.inner.id()
    }

    fn kind(&self) -> SandboxKind {
        self.inner.kind()
    }

    fn state(&self) -> SandboxState {
        self.inner.state()
    }

    fn meta(&self) -> &SandboxMeta {
        self.inner.meta()
    }

    fn root_dir(&self) -> &Path {
        self.inner.root_dir()
    }

    async fn pause(&self) -> WarmboxResult<()> {
        let guard = self.op_lock.lock().await;
        self.state().check(self.id(), SandboxOp::Pause)?;

        if let Err(e) = self.inner.pause().await {
            return Err(self.destroy_on_error(e, guard).await);
        }

        drop(guard);
        self.notify(SandboxEventKind::Pause);
        Ok(())
    }

    async fn unpause(&self) -> WarmboxResult<()> {
        let guard = self.op_lock.lock().await;
        self.state().check(self.id(), SandboxOp::Unpause)?;

        if let Err(e) = self.inner.unpause().await {
            return Err(self.destroy_on_error(e, guard).await);
        }

        drop(guard);
        self.notify(SandboxEventKind::Unpause);
        Ok(())
    }

    async fn destroy(&self) -> WarmboxResult<()> {
        let guard = self.op_lock.lock().await;
        if self.state().is_destroyed() {
            return Ok(());
        }

        let result = self.inner.destroy().await;

        drop(guard);
        self.notify(SandboxEventKind::Destroy);
        result
    }

    async fn fork(&self, child: &Container) -> WarmboxResult<()> {
        let guard = self.op_lock.lock().await;
        if self.kind().is_leaf() {
            return Err(WarmboxError::LeafCannotFork(self.id()));
        }
        self.state().check(self.id(), SandboxOp::Fork)?;

        if let Err(e) = self.inner.fork(child).await {
            return Err(self.destroy_on_error(e, guard).await);
        }

        drop(guard);
        self.notify(SandboxEventKind::Fork { child: child.id() });
        Ok(())
    }
}
