//! Memory cgroup management.
//!
//! A [`CgroupPool`] owns one directory in the memory cgroup hierarchy
//! (`<cgroup_root>/<pool name>`) and hands out child groups (`cg-<slot>`) configured with a
//! memory ceiling. Released groups are kept and reconfigured for the next caller instead of
//! being recreated.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
};

use getset::{CopyGetters, Getters};
use tokio::{fs, io::AsyncWriteExt};
use warmbox_utils::CGROUP_PREFIX;

use crate::{WarmboxError, WarmboxResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Control file holding the memory ceiling in bytes.
pub const MEMORY_LIMIT_FILE: &str = "memory.limit_in_bytes";

/// Control file deciding whether a joining process brings its memory charge along.
pub const MOVE_CHARGE_FILE: &str = "memory.move_charge_at_immigrate";

/// Control file listing, and accepting, member processes.
pub const PROCS_FILE: &str = "cgroup.procs";

const BYTES_PER_MB: u64 = 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A handle to one memory cgroup handed out by a [`CgroupPool`].
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Cgroup {
    /// The pool slot this group occupies.
    #[getset(get_copy = "pub with_prefix")]
    slot: usize,

    /// The group's directory in the cgroup hierarchy.
    #[getset(get = "pub with_prefix")]
    path: PathBuf,

    /// The configured memory ceiling.
    #[getset(get_copy = "pub with_prefix")]
    mem_limit_mb: u64,

    /// Whether processes joining the group move their existing charge into it.
    #[getset(get_copy = "pub with_prefix")]
    move_charge: bool,
}

/// Hands out reusable memory cgroups.
#[derive(Debug)]
pub struct CgroupPool {
    name: String,
    dir: PathBuf,
    next_slot: AtomicUsize,
    state: Mutex<CgroupPoolState>,
}

#[derive(Debug, Default)]
struct CgroupPoolState {
    /// Released groups ready for reuse.
    free: Vec<Cgroup>,

    /// Slots currently handed out.
    outstanding: HashSet<usize>,

    destroyed: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Cgroup {
    /// Adds a process to the group.
    pub async fn add_pid(&self, pid: u32) -> WarmboxResult<()> {
        let procs = self.path.join(PROCS_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&procs)
            .await
            .map_err(|e| {
                WarmboxError::Cgroup(format!("failed to open {}: {}", procs.display(), e))
            })?;

        file.write_all(format!("{}\n", pid).as_bytes())
            .await
            .map_err(|e| {
                WarmboxError::Cgroup(format!(
                    "failed to add pid {} to {}: {}",
                    pid,
                    self.path.display(),
                    e
                ))
            })?;

        Ok(())
    }

    async fn configure(&mut self, mem_limit_mb: u64, move_charge: bool) -> WarmboxResult<()> {
        write_control(
            &self.path,
            MEMORY_LIMIT_FILE,
            &(mem_limit_mb * BYTES_PER_MB).to_string(),
        )
        .await?;
        write_control(
            &self.path,
            MOVE_CHARGE_FILE,
            if move_charge { "1" } else { "0" },
        )
        .await?;

        self.mem_limit_mb = mem_limit_mb;
        self.move_charge = move_charge;
        Ok(())
    }
}

impl CgroupPool {
    /// Creates the pool's directory `<cgroup_root>/<name>`.
    pub async fn new(cgroup_root: impl AsRef<Path>, name: impl Into<String>) -> WarmboxResult<Self> {
        let name = name.into();
        let dir = cgroup_root.as_ref().join(&name);

        fs::create_dir_all(&dir).await.map_err(|e| {
            WarmboxError::Cgroup(format!(
                "failed to create cgroup pool directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        tracing::info!("created cgroup pool {} at {}", name, dir.display());

        Ok(Self {
            name,
            dir,
            next_slot: AtomicUsize::new(0),
            state: Mutex::new(CgroupPoolState::default()),
        })
    }

    /// The pool's directory in the cgroup hierarchy.
    pub fn get_dir(&self) -> &Path {
        &self.dir
    }

    /// Number of groups handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.lock_state()
            .map(|state| state.outstanding.len())
            .unwrap_or(0)
    }

    /// Number of released groups waiting for reuse.
    pub fn free(&self) -> usize {
        self.lock_state().map(|state| state.free.len()).unwrap_or(0)
    }

    /// Returns a group with the given memory ceiling.
    ///
    /// With `move_charge`, memory already charged to a process that joins the group moves in
    /// with it. Only parent-less sandboxes ask for this: a forked child would otherwise take
    /// the blame for all of its parent's allocations.
    pub async fn get_cgroup(&self, mem_limit_mb: u64, move_charge: bool) -> WarmboxResult<Cgroup> {
        let reused = {
            let mut state = self.lock_state()?;
            if state.destroyed {
                return Err(WarmboxError::Cgroup(format!(
                    "cgroup pool {} has been destroyed",
                    self.name
                )));
            }
            state.free.pop()
        };

        let mut cgroup = match reused {
            Some(cgroup) => cgroup,
            None => {
                let slot = self.next_slot.fetch_add(1, Ordering::AcqRel);
                let path = self.dir.join(format!("{}{}", CGROUP_PREFIX, slot));
                fs::create_dir(&path).await.map_err(|e| {
                    WarmboxError::Cgroup(format!(
                        "failed to create cgroup {}: {}",
                        path.display(),
                        e
                    ))
                })?;

                Cgroup {
                    slot,
                    path,
                    mem_limit_mb: 0,
                    move_charge: false,
                }
            }
        };

        if let Err(e) = cgroup.configure(mem_limit_mb, move_charge).await {
            // Not handed out yet, keep it for the next caller.
            self.lock_state()?.free.push(cgroup);
            return Err(e);
        }

        self.lock_state()?.outstanding.insert(cgroup.slot);

        tracing::debug!(
            "cgroup {} ready (limit {} MiB, move charge {})",
            cgroup.path.display(),
            mem_limit_mb,
            move_charge
        );

        Ok(cgroup)
    }

    /// Takes a group back for reuse. Releasing a group twice is an error.
    pub fn release(&self, cgroup: Cgroup) -> WarmboxResult<()> {
        let mut state = self.lock_state()?;
        if !state.outstanding.remove(&cgroup.slot) {
            return Err(WarmboxError::Cgroup(format!(
                "cgroup {} released but not handed out",
                cgroup.path.display()
            )));
        }

        tracing::debug!("cgroup {} released", cgroup.path.display());
        state.free.push(cgroup);
        Ok(())
    }

    /// Removes every group and the pool's directory.
    ///
    /// All groups must have been released. Failing to reclaim any of them is fatal.
    pub async fn destroy(&self) -> WarmboxResult<()> {
        let free = {
            let mut state = self.lock_state()?;
            if state.destroyed {
                return Ok(());
            }

            if !state.outstanding.is_empty() {
                return Err(WarmboxError::Fatal(format!(
                    "cgroup pool {} destroyed with {} groups still in use",
                    self.name,
                    state.outstanding.len()
                )));
            }

            state.destroyed = true;
            std::mem::take(&mut state.free)
        };

        for cgroup in free {
            remove_cgroup_dir(&cgroup.path).await?;
        }
        remove_cgroup_dir(&self.dir).await?;

        tracing::info!("destroyed cgroup pool {}", self.name);
        Ok(())
    }

    fn lock_state(&self) -> WarmboxResult<MutexGuard<'_, CgroupPoolState>> {
        self.state
            .lock()
            .map_err(|e| WarmboxError::Fatal(format!("cgroup pool lock poisoned: {}", e)))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn write_control(dir: &Path, file: &str, value: &str) -> WarmboxResult<()> {
    let path = dir.join(file);
    fs::write(&path, value).await.map_err(|e| {
        WarmboxError::Cgroup(format!("failed to write {:?} to {}: {}", value, path.display(), e))
    })
}

/// Removes a cgroup directory. On a real cgroup filesystem `rmdir` succeeds with the control
/// files still present; anywhere else they have to go first.
async fn remove_cgroup_dir(path: &Path) -> WarmboxResult<()> {
    match fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(_) => fs::remove_dir_all(path).await.map_err(|e| {
            WarmboxError::Fatal(format!("failed to remove cgroup {}: {}", path.display(), e))
        }),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
