//! An in-memory [`IsolationBackend`] for tests.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use tokio::fs;

use crate::{
    sandbox::{IsolationBackend, ProcessContext, ProcessHandle},
    WarmboxError, WarmboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Records every call and fails the operations it is told to.
#[derive(Debug, Default)]
pub(crate) struct FakeBackend {
    next_pid: AtomicU32,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    live: Mutex<HashSet<u32>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeBackend {
    /// Makes every later call of `op` fail.
    pub(crate) fn fail_on(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.split(' ').next() == Some(op))
            .count()
    }

    pub(crate) fn live_processes(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    fn record(&self, op: &'static str, detail: String) -> WarmboxResult<()> {
        self.calls.lock().unwrap().push(format!("{} {}", op, detail));
        if self.failing.lock().unwrap().contains(op) {
            return Err(WarmboxError::Isolation(format!("injected {} failure", op)));
        }
        Ok(())
    }

    fn spawn(&self) -> ProcessHandle {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) + 1000;
        self.live.lock().unwrap().insert(pid);
        ProcessHandle { pid }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl IsolationBackend for FakeBackend {
    async fn populate_root(&self, ctx: &ProcessContext) -> WarmboxResult<()> {
        self.record("populate_root", ctx.id.to_string())?;
        fs::create_dir_all(ctx.root_dir.join("tmp")).await?;
        Ok(())
    }

    async fn start(&self, ctx: &ProcessContext) -> WarmboxResult<ProcessHandle> {
        self.record("start", ctx.id.to_string())?;
        Ok(self.spawn())
    }

    async fn fork(
        &self,
        parent: ProcessHandle,
        ctx: &ProcessContext,
    ) -> WarmboxResult<ProcessHandle> {
        self.record("fork", format!("{}->{}", parent.pid, ctx.id))?;
        if !self.live.lock().unwrap().contains(&parent.pid) {
            return Err(WarmboxError::Isolation(format!("{} is gone", parent)));
        }
        Ok(self.spawn())
    }

    async fn pause(&self, process: ProcessHandle) -> WarmboxResult<()> {
        self.record("pause", process.pid.to_string())
    }

    async fn unpause(&self, process: ProcessHandle) -> WarmboxResult<()> {
        self.record("unpause", process.pid.to_string())
    }

    async fn kill(&self, process: ProcessHandle) -> WarmboxResult<()> {
        self.live.lock().unwrap().remove(&process.pid);
        self.record("kill", process.pid.to_string())
    }

    async fn remove_root(&self, ctx: &ProcessContext) -> WarmboxResult<()> {
        self.record("remove_root", ctx.id.to_string())?;
        match fs::remove_dir_all(&ctx.root_dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
