//! Utility functions for working with environment variables.

use std::path::PathBuf;

use crate::{DEFAULT_CGROUP_ROOT, DEFAULT_WARMBOX_HOME};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable for the warmbox home directory
pub const WARMBOX_HOME_ENV_VAR: &str = "WARMBOX_HOME";

/// Environment variable for the memory cgroup hierarchy root
pub const WARMBOX_CGROUP_ROOT_ENV_VAR: &str = "WARMBOX_CGROUP_ROOT";

/// Environment variable overriding the memory pool capacity in MiB
pub const WARMBOX_MEM_POOL_MB_ENV_VAR: &str = "WARMBOX_MEM_POOL_MB";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the path to the warmbox home directory.
/// If the WARMBOX_HOME environment variable is set, returns that path.
/// Otherwise, returns the default warmbox home path.
pub fn get_warmbox_home_path() -> PathBuf {
    if let Ok(warmbox_home) = std::env::var(WARMBOX_HOME_ENV_VAR) {
        PathBuf::from(warmbox_home)
    } else {
        DEFAULT_WARMBOX_HOME.to_owned()
    }
}

/// Returns the root of the memory cgroup hierarchy.
pub fn get_cgroup_root() -> PathBuf {
    std::env::var(WARMBOX_CGROUP_ROOT_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CGROUP_ROOT))
}

/// Returns the memory pool capacity override, if one is set and parses.
pub fn get_mem_pool_mb_override() -> Option<u64> {
    let value = std::env::var(WARMBOX_MEM_POOL_MB_ENV_VAR).ok()?;
    match value.trim().parse::<u64>() {
        Ok(mb) => Some(mb),
        Err(e) => {
            tracing::warn!(
                "ignoring {}={:?}: {}",
                WARMBOX_MEM_POOL_MB_ENV_VAR,
                value,
                e
            );
            None
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_home_path_honours_env_var() {
        std::env::set_var(WARMBOX_HOME_ENV_VAR, "/srv/warmbox");
        assert_eq!(get_warmbox_home_path(), PathBuf::from("/srv/warmbox"));

        std::env::remove_var(WARMBOX_HOME_ENV_VAR);
        assert_eq!(get_warmbox_home_path(), *DEFAULT_WARMBOX_HOME);
    }

    #[test]
    #[serial]
    fn test_mem_pool_override() {
        std::env::set_var(WARMBOX_MEM_POOL_MB_ENV_VAR, "2048");
        assert_eq!(get_mem_pool_mb_override(), Some(2048));

        std::env::set_var(WARMBOX_MEM_POOL_MB_ENV_VAR, "lots");
        assert_eq!(get_mem_pool_mb_override(), None);

        std::env::remove_var(WARMBOX_MEM_POOL_MB_ENV_VAR);
        assert_eq!(get_mem_pool_mb_override(), None);
    }

    #[test]
    #[serial]
    fn test_cgroup_root_default() {
        std::env::remove_var(WARMBOX_CGROUP_ROOT_ENV_VAR);
        assert_eq!(get_cgroup_root(), PathBuf::from(DEFAULT_CGROUP_ROOT));
    }
}
