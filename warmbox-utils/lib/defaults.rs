//! Default paths and names shared across the warmbox crates.

use std::{path::PathBuf, sync::LazyLock};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory name for warmbox's global data.
pub const WARMBOX_HOME_DIR: &str = ".warmbox";

/// The default warmbox home directory.
pub static DEFAULT_WARMBOX_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(WARMBOX_HOME_DIR)
});

/// The default root of the memory cgroup hierarchy.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/memory";

/// The default config file name.
pub const WARMBOX_CONFIG_FILENAME: &str = "warmbox.yaml";

/// Prefix of the per-pool directory holding sandbox root filesystems.
pub const ROOT_DIRS_PREFIX: &str = "root-";

/// Prefix of each sandbox's root filesystem directory.
pub const SANDBOX_DIR_PREFIX: &str = "SB-";

/// Prefix of each cgroup created by a cgroup pool.
pub const CGROUP_PREFIX: &str = "cg-";

/// Name of the startup script written to a sandbox's scratch directory.
pub const BOOTSTRAP_FILENAME: &str = "bootstrap.py";

/// Sub directory of the home directory holding the pre-warm cache.
pub const CACHE_SUBDIR: &str = "cache";

/// Sub directory of the home directory holding installed packages.
pub const PACKAGES_SUBDIR: &str = "packages";

/// Directory inside the cache directory that hosts the root sandbox.
pub const CACHE_ROOT_DIR: &str = "root";
