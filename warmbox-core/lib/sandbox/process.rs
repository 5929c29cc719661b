//! An [`IsolationBackend`] built from plain host processes.
//!
//! Each sandbox gets a directory tree instead of a mounted image, runs its command as a
//! child process of the worker, joins its memory cgroup by pid and is frozen with
//! `SIGSTOP`/`SIGCONT`. A fork is a fresh process started with the parent's pid in
//! [`FORK_PARENT_ENV_VAR`] once the parent is confirmed alive, so the fork server inside the
//! parent can hand over its warm state.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::{
    fs,
    process::{Child, Command},
    sync::Mutex,
};

use crate::{
    sandbox::{IsolationBackend, ProcessContext, ProcessHandle},
    WarmboxError, WarmboxResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable carrying the sandbox id into the sandbox.
pub const SANDBOX_ID_ENV_VAR: &str = "WARMBOX_SANDBOX_ID";

/// Environment variable carrying the parent's pid into a forked sandbox.
pub const FORK_PARENT_ENV_VAR: &str = "WARMBOX_FORK_PARENT";

const HANDLER_DIR: &str = "handler";
const HOST_DIR: &str = "host";
const PACKAGES_DIR: &str = "packages";
const TMP_DIR: &str = "tmp";
const STDOUT_FILE: &str = "stdout";
const STDERR_FILE: &str = "stderr";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs sandboxes as host processes.
#[derive(Debug)]
pub struct ProcessBackend {
    packages_dir: PathBuf,
    children: Mutex<HashMap<u32, Child>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProcessBackend {
    /// Creates a backend that exposes `packages_dir` as `/packages` in every sandbox.
    pub fn new(packages_dir: impl Into<PathBuf>) -> Self {
        Self {
            packages_dir: packages_dir.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// The number of processes started and not yet killed.
    pub async fn live_processes(&self) -> usize {
        self.children.lock().await.len()
    }

    async fn spawn(
        &self,
        ctx: &ProcessContext,
        parent: Option<ProcessHandle>,
    ) -> WarmboxResult<ProcessHandle> {
        let (program, args) = ctx.command.split_first().ok_or_else(|| {
            WarmboxError::Isolation(format!("sandbox {} has an empty command", ctx.id))
        })?;

        let stdout = fs::File::create(ctx.scratch_dir.join(STDOUT_FILE))
            .await?
            .into_std()
            .await;
        let stderr = fs::File::create(ctx.scratch_dir.join(STDERR_FILE))
            .await?
            .into_std()
            .await;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&ctx.root_dir)
            .env(SANDBOX_ID_ENV_VAR, ctx.id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        if let Some(parent) = parent {
            command.env(FORK_PARENT_ENV_VAR, parent.pid.to_string());
        }

        let mut child = command.spawn().map_err(|e| {
            WarmboxError::Isolation(format!("failed to start {:?}: {}", program, e))
        })?;

        let Some(pid) = child.id() else {
            return Err(WarmboxError::Isolation(format!(
                "{:?} exited before it could be placed in a cgroup",
                program
            )));
        };

        if let Err(e) = ctx.cgroup.add_pid(pid).await {
            if let Err(kill_err) = child.kill().await {
                tracing::warn!("failed to kill pid {} after cgroup error: {}", pid, kill_err);
            }
            return Err(e);
        }

        self.children.lock().await.insert(pid, child);
        tracing::debug!("sandbox {} started as pid {}", ctx.id, pid);

        Ok(ProcessHandle { pid })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl IsolationBackend for ProcessBackend {
    async fn populate_root(&self, ctx: &ProcessContext) -> WarmboxResult<()> {
        let root = &ctx.root_dir;
        let root_err = |what: &str, e: io::Error| {
            WarmboxError::RootFs(root.clone(), format!("{}: {}", what, e))
        };

        fs::create_dir_all(root.join(TMP_DIR))
            .await
            .map_err(|e| root_err(TMP_DIR, e))?;

        fs::symlink(&ctx.scratch_dir, root.join(HOST_DIR))
            .await
            .map_err(|e| root_err(HOST_DIR, e))?;

        fs::symlink(&self.packages_dir, root.join(PACKAGES_DIR))
            .await
            .map_err(|e| root_err(PACKAGES_DIR, e))?;

        match &ctx.code_dir {
            Some(code_dir) => fs::symlink(code_dir, root.join(HANDLER_DIR)).await,
            None => fs::create_dir(root.join(HANDLER_DIR)).await,
        }
        .map_err(|e| root_err(HANDLER_DIR, e))?;

        Ok(())
    }

    async fn start(&self, ctx: &ProcessContext) -> WarmboxResult<ProcessHandle> {
        self.spawn(ctx, None).await
    }

    async fn fork(
        &self,
        parent: ProcessHandle,
        ctx: &ProcessContext,
    ) -> WarmboxResult<ProcessHandle> {
        signal::kill(to_pid(parent), None).map_err(|e| {
            WarmboxError::Isolation(format!("parent {} cannot fork: {}", parent, e))
        })?;

        self.spawn(ctx, Some(parent)).await
    }

    async fn pause(&self, process: ProcessHandle) -> WarmboxResult<()> {
        signal::kill(to_pid(process), Signal::SIGSTOP).map_err(|e| {
            WarmboxError::Isolation(format!("failed to stop {}: {}", process, e))
        })
    }

    async fn unpause(&self, process: ProcessHandle) -> WarmboxResult<()> {
        signal::kill(to_pid(process), Signal::SIGCONT).map_err(|e| {
            WarmboxError::Isolation(format!("failed to continue {}: {}", process, e))
        })
    }

    async fn kill(&self, process: ProcessHandle) -> WarmboxResult<()> {
        let child = self.children.lock().await.remove(&process.pid);

        match child {
            Some(mut child) => {
                if let Err(e) = child.kill().await {
                    // Already exited and reaped.
                    if child.try_wait()?.is_none() {
                        return Err(WarmboxError::Isolation(format!(
                            "failed to kill {}: {}",
                            process, e
                        )));
                    }
                }
                Ok(())
            }
            None => match signal::kill(to_pid(process), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(WarmboxError::Isolation(format!(
                    "failed to kill {}: {}",
                    process, e
                ))),
            },
        }
    }

    async fn remove_root(&self, ctx: &ProcessContext) -> WarmboxResult<()> {
        remove_tree(&ctx.root_dir).await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn to_pid(process: ProcessHandle) -> Pid {
    Pid::from_raw(process.pid as i32)
}

async fn remove_tree(path: &Path) -> WarmboxResult<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WarmboxError::RootFs(
            path.to_path_buf(),
            format!("failed to remove: {}", e),
        )),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
