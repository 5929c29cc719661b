use std::path::PathBuf;

use thiserror::Error;
use warmbox_utils::WarmboxUtilsError;

use crate::sandbox::{SandboxId, SandboxOp, SandboxState};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a warmbox-related operation.
pub type WarmboxResult<T> = Result<T, WarmboxError>;

/// An error that occurred during a warmbox operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum WarmboxError {
    /// A memory request larger than the whole pool. It can never be satisfied.
    #[error("requested {requested_mb} MiB but the memory pool only holds {total_mb} MiB")]
    MemoryRequestExceedsCapacity {
        /// The size of the request.
        requested_mb: u64,
        /// The capacity of the pool.
        total_mb: u64,
    },

    /// More memory was returned to the pool than was ever taken from it.
    #[error(
        "releasing {released_mb} MiB would raise available memory above the total \
         ({available_mb}/{total_mb} MiB available)"
    )]
    MemoryOverRelease {
        /// The size of the release.
        released_mb: u64,
        /// Available memory at the time of the release.
        available_mb: u64,
        /// The capacity of the pool.
        total_mb: u64,
    },

    /// The memory pool has been drained and no longer admits requests.
    #[error("the memory pool is closed")]
    MemoryPoolClosed,

    /// A leaf sandbox was requested without code to run.
    #[error("leaf sandboxes must have codeDir set")]
    LeafWithoutCodeDir,

    /// An operation is not allowed in the sandbox's current state.
    #[error("cannot {op} sandbox {id} while it is {state}")]
    InvalidStateTransition {
        /// The sandbox.
        id: SandboxId,
        /// The attempted operation.
        op: SandboxOp,
        /// The state the sandbox was in.
        state: SandboxState,
    },

    /// A fork was requested from a leaf. Only zygotes fork.
    #[error("sandbox {0} is a leaf and cannot fork")]
    LeafCannotFork(SandboxId),

    /// The sandbox is not known to the pool's arena.
    #[error("sandbox {0} not found")]
    SandboxNotFound(SandboxId),

    /// An error that occurred while configuring a cgroup.
    #[error("cgroup error: {0}")]
    Cgroup(String),

    /// An error that occurred while materializing a root filesystem.
    #[error("failed to create root FS at {0}: {1}")]
    RootFs(PathBuf, String),

    /// An error reported by the isolation backend.
    #[error("isolation error: {0}")]
    Isolation(String),

    /// The parent could not fork a child process into the new sandbox.
    #[error("fork failed: parent {parent} could not fork a child: {source}")]
    ForkFailed {
        /// The sandbox that was asked to fork.
        parent: SandboxId,
        /// The underlying failure.
        #[source]
        source: Box<WarmboxError>,
    },

    /// A creation stage other than forking failed.
    #[error("failed to create sandbox {id}: {source}")]
    CreateFailed {
        /// The id that was allocated to the sandbox.
        id: SandboxId,
        /// The underlying failure.
        #[source]
        source: Box<WarmboxError>,
    },

    /// A state-changing operation failed and the sandbox was torn down.
    #[error("sandbox {id} is dead: {source}")]
    SandboxDead {
        /// The sandbox.
        id: SandboxId,
        /// The failure that killed it.
        #[source]
        source: Box<WarmboxError>,
    },

    /// A pre-warm producer failed to build its slot.
    #[error("pre-warm error: {0}")]
    Prewarm(String),

    /// The pre-warm cache has been shut down.
    #[error("the pre-warm cache is closed")]
    CacheClosed,

    /// The configuration is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// Cleanup could not reclaim resources. The process should not continue.
    #[error("fatal: {0}")]
    Fatal(String),

    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An error from the utils crate.
    #[error(transparent)]
    Utils(#[from] WarmboxUtilsError),

    /// An error decoding YAML configuration.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// An error from a system call.
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WarmboxError {
    /// Whether this error is the distinct fork failure. Callers may retry against another parent.
    pub fn is_fork_failed(&self) -> bool {
        matches!(self, WarmboxError::ForkFailed { .. })
    }

    /// Whether this error must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WarmboxError::Fatal(_))
    }

    pub(crate) fn create_failed(id: SandboxId, source: WarmboxError) -> Self {
        match source {
            e @ (WarmboxError::ForkFailed { .. } | WarmboxError::CreateFailed { .. }) => e,
            e => WarmboxError::CreateFailed {
                id,
                source: Box::new(e),
            },
        }
    }
}
