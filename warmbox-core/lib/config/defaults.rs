//! Default values for the pool and cache configuration.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default pool name. It names the root-fs directory and the cgroup directory.
pub const DEFAULT_POOL_NAME: &str = "default";

/// The default memory pool capacity in MiB.
pub const DEFAULT_MEM_POOL_MB: u64 = 1024;

/// The default per-sandbox memory limit in MiB, used when a request does not set one.
pub const DEFAULT_MEM_LIMIT_MB: u64 = 50;

/// The default number of pre-warm producers.
pub const DEFAULT_PRODUCERS: usize = 5;

/// The default number of ready slots kept by the pre-warm cache.
pub const DEFAULT_BUFFER_SIZE: usize = 8;

/// The default interpreter used to run a sandbox's bootstrap script.
pub const DEFAULT_RUNTIME_CMD: &[&str] = &["/usr/bin/python3"];

/// The default command of the pre-warm cache's root sandbox.
pub const DEFAULT_ROOT_CMD: &[&str] = &["/usr/bin/python", "/server.py"];

/// The default command of every pre-warmed sandbox.
pub const DEFAULT_INIT_CMD: &[&str] = &["/init"];

/// How often the cache constructor checks whether the buffer has filled up, in milliseconds.
pub const CACHE_FILL_POLL_MS: u64 = 20;
