use std::sync::Arc;

use getset::Getters;

use crate::{
    cgroup::{Cgroup, CgroupPool},
    mem::MemPool,
    sandbox::{SandboxArena, SandboxId, SandboxKind},
    WarmboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The accounting shared by a pool and every sandbox it created: committed memory, cgroups
/// and the parent/child arena.
#[derive(Debug, Getters)]
#[getset(get = "pub with_prefix")]
pub struct PoolResources {
    /// Parent/child links and cgroup reference counts.
    arena: SandboxArena,

    /// The memory budget.
    mem: Arc<MemPool>,

    /// The pool's cgroups.
    cgroups: CgroupPool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PoolResources {
    /// Bundles the accounting of one pool.
    pub fn new(mem: Arc<MemPool>, cgroups: CgroupPool) -> Self {
        Self {
            arena: SandboxArena::new(),
            mem,
            cgroups,
        }
    }

    /// Gives a new sandbox a cgroup and registers it in the arena.
    ///
    /// `mem_limit_mb` must already have been taken from the memory pool. On failure it is
    /// returned, so the caller is left holding nothing.
    pub async fn attach(
        &self,
        id: SandboxId,
        kind: SandboxKind,
        mem_limit_mb: u64,
        move_charge: bool,
    ) -> WarmboxResult<Cgroup> {
        let cgroup = match self.cgroups.get_cgroup(mem_limit_mb, move_charge).await {
            Ok(cgroup) => cgroup,
            Err(e) => {
                self.return_memory(mem_limit_mb);
                return Err(e);
            }
        };

        if let Err(e) = self
            .arena
            .register(id, kind, cgroup.clone(), mem_limit_mb)
        {
            if let Err(release_err) = self.cgroups.release(cgroup) {
                tracing::error!("failed to return cgroup of sandbox {}: {}", id, release_err);
            }
            self.return_memory(mem_limit_mb);
            return Err(e);
        }

        Ok(cgroup)
    }

    /// Drops the sandbox's own reference and frees whatever reached zero: the cgroup first,
    /// then its memory.
    pub fn release_sandbox(&self, id: SandboxId) -> WarmboxResult<()> {
        let mut first_err = None;

        for released in self.arena.release(id)? {
            if let Err(e) = self.cgroups.release(released.cgroup) {
                tracing::error!("failed to return cgroup of sandbox {}: {}", released.id, e);
                first_err.get_or_insert(e);
            }

            if let Err(e) = self.mem.release(released.mem_limit_mb) {
                tracing::error!("failed to return memory of sandbox {}: {}", released.id, e);
                first_err.get_or_insert(e);
            }

            tracing::debug!(
                "sandbox {} released {} MiB, {} MiB available",
                released.id,
                released.mem_limit_mb,
                self.mem.get_available_mb()
            );
        }

        first_err.map_or(Ok(()), Err)
    }

    fn return_memory(&self, mem_limit_mb: u64) {
        if let Err(e) = self.mem.release(mem_limit_mb) {
            tracing::error!("failed to return {} MiB: {}", mem_limit_mb, e);
        }
    }
}
