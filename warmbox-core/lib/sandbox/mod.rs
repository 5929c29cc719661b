//! Sandboxes: the unit of isolation handed out by a [`SandboxPool`](crate::pool::SandboxPool).
//!
//! A sandbox is a process tree with its own root filesystem and memory cgroup. It either runs
//! user code (a leaf) or a generic fork server (a zygote) that new sandboxes are forked from.
//!
//! The pool builds a raw [`Container`] and wraps it in a [`SafeSandbox`] before anyone else
//! sees it. Parent/child links and cgroup reference counts live in the pool's
//! [`SandboxArena`], keyed by [`SandboxId`].

mod arena;
mod backend;
mod container;
mod event;
mod process;
mod safe;
mod state;

#[cfg(test)]
pub(crate) mod testing;

use std::{fmt, path::Path, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{config::SandboxMeta, WarmboxResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use arena::*;
pub use backend::*;
pub use container::*;
pub use event::*;
pub use process::*;
pub use safe::*;
pub use state::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Unique identity of a sandbox within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SandboxId(u64);

/// What a sandbox runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// A warm fork server that other sandboxes are forked from.
    Zygote,

    /// A sandbox running user code.
    Leaf,
}

/// A shared handle to a sandbox.
pub type SandboxRef = Arc<dyn Sandbox>;

/// Operations every sandbox supports.
#[async_trait]
pub trait Sandbox: Send + Sync + fmt::Debug {
    /// The sandbox's identity.
    fn id(&self) -> SandboxId;

    /// Whether the sandbox is a zygote or a leaf.
    fn kind(&self) -> SandboxKind;

    /// The current lifecycle state.
    fn state(&self) -> SandboxState;

    /// The requirements the sandbox was created with.
    fn meta(&self) -> &SandboxMeta;

    /// The sandbox's root filesystem.
    fn root_dir(&self) -> &Path;

    /// Freezes every process of the sandbox.
    async fn pause(&self) -> WarmboxResult<()>;

    /// Resumes a paused sandbox.
    async fn unpause(&self) -> WarmboxResult<()>;

    /// Kills the sandbox's processes and releases its resources. Destroying a destroyed
    /// sandbox does nothing.
    async fn destroy(&self) -> WarmboxResult<()>;

    /// Forks a child process of this sandbox into `child`'s context and links the two.
    async fn fork(&self, child: &Container) -> WarmboxResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxId {
    /// Wraps a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl SandboxKind {
    /// The kind of sandbox created for the given leaf flag.
    pub fn from_is_leaf(is_leaf: bool) -> Self {
        if is_leaf {
            Self::Leaf
        } else {
            Self::Zygote
        }
    }

    /// Whether this is a leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zygote => write!(f, "zygote"),
            Self::Leaf => write!(f, "leaf"),
        }
    }
}
