use std::{fmt, path::PathBuf};

use async_trait::async_trait;

use crate::{
    cgroup::Cgroup,
    sandbox::{SandboxId, SandboxKind},
    WarmboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything an [`IsolationBackend`] needs to know to build and run one sandbox.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    /// The sandbox being built.
    pub id: SandboxId,

    /// Whether it runs user code.
    pub kind: SandboxKind,

    /// The root filesystem to populate.
    pub root_dir: PathBuf,

    /// The host-side scratch directory, seen as `/host` inside the sandbox.
    pub scratch_dir: PathBuf,

    /// The user's code, seen as `/handler`. Only leaves have one.
    pub code_dir: Option<PathBuf>,

    /// The program and arguments started in the sandbox.
    pub command: Vec<String>,

    /// The memory cgroup the sandbox's processes join.
    pub cgroup: Cgroup,
}

/// Identifies the main process of a running sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    /// The host pid.
    pub pid: u32,
}

/// The isolation mechanism behind sandboxes: root filesystems, processes and signals.
///
/// The pool decides when things happen; the backend decides how.
#[async_trait]
pub trait IsolationBackend: Send + Sync + fmt::Debug + 'static {
    /// Lays out the sandbox's root filesystem.
    async fn populate_root(&self, ctx: &ProcessContext) -> WarmboxResult<()>;

    /// Starts a fresh process in the sandbox and places it in the sandbox's cgroup.
    async fn start(&self, ctx: &ProcessContext) -> WarmboxResult<ProcessHandle>;

    /// Has `parent` fork a child into the sandbox described by `ctx`.
    async fn fork(
        &self,
        parent: ProcessHandle,
        ctx: &ProcessContext,
    ) -> WarmboxResult<ProcessHandle>;

    /// Freezes the process.
    async fn pause(&self, process: ProcessHandle) -> WarmboxResult<()>;

    /// Thaws the process.
    async fn unpause(&self, process: ProcessHandle) -> WarmboxResult<()>;

    /// Kills the process and reaps it. Killing a process that is already gone succeeds.
    async fn kill(&self, process: ProcessHandle) -> WarmboxResult<()>;

    /// Removes the root filesystem. Removing a missing root succeeds.
    async fn remove_root(&self, ctx: &ProcessContext) -> WarmboxResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.pid)
    }
}
