//! The warmbox configuration file.
//!
//! The configuration is a YAML document with a `pool` section for the sandbox pool and a
//! `cache` section for the buffered pre-warm cache. Every field has a default, so an empty or
//! missing file yields a usable configuration.
//!
//! ```yaml
//! pool:
//!   name: worker-1
//!   mem_pool_mb: 4096
//!   default_mem_limit_mb: 128
//! cache:
//!   producers: 5
//!   buffer_size: 16
//! ```

use std::path::{Path, PathBuf};

use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use tokio::fs;
use typed_builder::TypedBuilder;
use warmbox_utils::{env, CACHE_SUBDIR, PACKAGES_SUBDIR, WARMBOX_CONFIG_FILENAME};

use crate::{
    config::{
        DEFAULT_BUFFER_SIZE, DEFAULT_INIT_CMD, DEFAULT_MEM_LIMIT_MB, DEFAULT_MEM_POOL_MB,
        DEFAULT_POOL_NAME, DEFAULT_PRODUCERS, DEFAULT_ROOT_CMD, DEFAULT_RUNTIME_CMD,
    },
    WarmboxError, WarmboxResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The complete warmbox configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct WarmboxConfig {
    /// Sandbox pool settings.
    #[builder(default)]
    pool: PoolConfig,

    /// Pre-warm cache settings.
    #[builder(default)]
    cache: CacheConfig,
}

/// Settings of a sandbox pool.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, CopyGetters, TypedBuilder)]
#[serde(default)]
pub struct PoolConfig {
    /// Name of the pool. Used for the root-fs and cgroup directory names.
    #[getset(get = "pub with_prefix")]
    #[builder(default = DEFAULT_POOL_NAME.to_string(), setter(into))]
    name: String,

    /// Total memory, in MiB, that sandboxes of this pool may commit.
    #[getset(get_copy = "pub with_prefix")]
    #[builder(default = DEFAULT_MEM_POOL_MB)]
    mem_pool_mb: u64,

    /// Memory limit, in MiB, for sandboxes whose request does not set one.
    #[getset(get_copy = "pub with_prefix")]
    #[builder(default = DEFAULT_MEM_LIMIT_MB)]
    default_mem_limit_mb: u64,

    /// Directory under which sandbox root filesystems are created.
    #[getset(get = "pub with_prefix")]
    #[builder(default = env::get_warmbox_home_path(), setter(into))]
    root_dir: PathBuf,

    /// Root of the memory cgroup hierarchy.
    #[getset(get = "pub with_prefix")]
    #[builder(default = env::get_cgroup_root(), setter(into))]
    cgroup_root: PathBuf,

    /// Directory of installed packages exposed to sandboxes at `/packages`.
    #[getset(get = "pub with_prefix")]
    #[builder(default = env::get_warmbox_home_path().join(PACKAGES_SUBDIR), setter(into))]
    packages_dir: PathBuf,

    /// Interpreter that runs a sandbox's bootstrap script.
    #[getset(get = "pub with_prefix")]
    #[builder(default = to_strings(DEFAULT_RUNTIME_CMD))]
    runtime_cmd: Vec<String>,
}

/// Settings of the buffered pre-warm cache.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, CopyGetters, TypedBuilder)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of ready slots the cache keeps.
    #[getset(get_copy = "pub with_prefix")]
    #[builder(default = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Number of concurrent producers refilling the buffer.
    #[getset(get_copy = "pub with_prefix")]
    #[builder(default = DEFAULT_PRODUCERS)]
    producers: usize,

    /// Memory limit, in MiB, of each cached sandbox.
    #[getset(get_copy = "pub with_prefix")]
    #[builder(default = DEFAULT_MEM_LIMIT_MB)]
    mem_limit_mb: u64,

    /// Directory holding one subdirectory per cached sandbox.
    #[getset(get = "pub with_prefix")]
    #[builder(default = env::get_warmbox_home_path().join(CACHE_SUBDIR), setter(into))]
    cache_dir: PathBuf,

    /// Command of the root sandbox.
    #[getset(get = "pub with_prefix")]
    #[builder(default = to_strings(DEFAULT_ROOT_CMD))]
    root_cmd: Vec<String>,

    /// Command of every pre-warmed sandbox.
    #[getset(get = "pub with_prefix")]
    #[builder(default = to_strings(DEFAULT_INIT_CMD))]
    init_cmd: Vec<String>,

    /// Package index host handed to the root sandbox.
    #[getset(get = "pub with_prefix")]
    #[builder(default, setter(strip_option, into))]
    index_host: Option<String>,

    /// Package index port handed to the root sandbox.
    #[getset(get = "pub with_prefix")]
    #[builder(default, setter(strip_option, into))]
    index_port: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WarmboxConfig {
    /// Loads the configuration from `path`, or from `<warmbox home>/warmbox.yaml` when no path
    /// is given. A missing file yields the defaults. Environment overrides are applied and the
    /// result is validated.
    pub async fn load(path: Option<&Path>) -> WarmboxResult<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| env::get_warmbox_home_path().join(WARMBOX_CONFIG_FILENAME));

        let mut config = if fs::try_exists(&path).await? {
            let contents = fs::read_to_string(&path).await?;
            tracing::info!("loaded config from {}", path.display());
            Self::from_yaml(&contents)?
        } else {
            tracing::info!("no config at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parses a YAML document. An empty document yields the defaults.
    pub fn from_yaml(contents: &str) -> WarmboxResult<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        Ok(serde_yaml::from_str(contents)?)
    }

    /// Applies overrides taken from environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Some(mem_pool_mb) = env::get_mem_pool_mb_override() {
            tracing::debug!("memory pool overridden to {} MiB", mem_pool_mb);
            self.pool.mem_pool_mb = mem_pool_mb;
        }
    }

    /// Checks the configuration for values the pool and cache cannot work with.
    pub fn validate(&self) -> WarmboxResult<()> {
        self.pool.validate()?;
        self.cache.validate(&self.pool)
    }
}

impl PoolConfig {
    /// Checks the pool settings.
    pub fn validate(&self) -> WarmboxResult<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(WarmboxError::Config(format!(
                "pool name must be a non-empty single path segment, got {:?}",
                self.name
            )));
        }

        if self.mem_pool_mb == 0 {
            return Err(WarmboxError::Config(
                "memory pool must hold at least 1 MiB".to_string(),
            ));
        }

        if self.default_mem_limit_mb == 0 || self.default_mem_limit_mb > self.mem_pool_mb {
            return Err(WarmboxError::Config(format!(
                "default memory limit must be between 1 and {} MiB, got {}",
                self.mem_pool_mb, self.default_mem_limit_mb
            )));
        }

        if self.runtime_cmd.is_empty() {
            return Err(WarmboxError::Config("runtime command is empty".to_string()));
        }

        Ok(())
    }
}

impl CacheConfig {
    /// Checks the cache settings against the pool they draw memory from.
    pub fn validate(&self, pool: &PoolConfig) -> WarmboxResult<()> {
        if self.buffer_size == 0 {
            return Err(WarmboxError::Config(
                "cache buffer must hold at least one sandbox".to_string(),
            ));
        }

        if self.producers == 0 {
            return Err(WarmboxError::Config(
                "cache needs at least one producer".to_string(),
            ));
        }

        if self.mem_limit_mb == 0 || self.mem_limit_mb > pool.mem_pool_mb {
            return Err(WarmboxError::Config(format!(
                "cache memory limit must be between 1 and {} MiB, got {}",
                pool.mem_pool_mb, self.mem_limit_mb
            )));
        }

        if self.min_mem_pool_mb() > pool.mem_pool_mb {
            return Err(WarmboxError::Config(format!(
                "cache needs {} MiB for its root and {} buffered sandboxes of {} MiB, \
                 but the memory pool only holds {} MiB",
                self.min_mem_pool_mb(),
                self.buffer_size,
                self.mem_limit_mb,
                pool.mem_pool_mb
            )));
        }

        if self.root_cmd.is_empty() || self.init_cmd.is_empty() {
            return Err(WarmboxError::Config(
                "cache root and init commands must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Memory the cache holds once its buffer is full: the root plus one sandbox per slot.
    pub fn min_mem_pool_mb(&self) -> u64 {
        (self.buffer_size as u64)
            .saturating_add(1)
            .saturating_mul(self.mem_limit_mb)
    }

    /// The root sandbox's command, with the package index appended when both host and port
    /// are configured.
    pub fn root_cmd_with_index(&self) -> Vec<String> {
        let mut cmd = self.root_cmd.clone();
        if let (Some(host), Some(port)) = (&self.index_host, &self.index_port) {
            if !host.is_empty() && !port.is_empty() {
                cmd.push(host.clone());
                cmd.push(port.clone());
            }
        }

        cmd
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;
    use warmbox_utils::WARMBOX_MEM_POOL_MB_ENV_VAR;

    #[test]
    fn test_config_from_yaml_partial() -> WarmboxResult<()> {
        let config = WarmboxConfig::from_yaml(
            r#"
pool:
  name: worker-1
  mem_pool_mb: 4096
cache:
  producers: 3
  index_host: index.local
  index_port: "8000"
"#,
        )?;

        assert_eq!(config.get_pool().get_name(), "worker-1");
        assert_eq!(config.get_pool().get_mem_pool_mb(), 4096);
        assert_eq!(
            config.get_pool().get_default_mem_limit_mb(),
            DEFAULT_MEM_LIMIT_MB
        );
        assert_eq!(config.get_cache().get_producers(), 3);
        assert_eq!(config.get_cache().get_buffer_size(), DEFAULT_BUFFER_SIZE);
        assert_eq!(
            config.get_cache().root_cmd_with_index(),
            vec!["/usr/bin/python", "/server.py", "index.local", "8000"]
        );
        config.validate()
    }

    #[test]
    fn test_config_empty_yaml_is_default() -> WarmboxResult<()> {
        let config = WarmboxConfig::from_yaml("  \n")?;
        assert_eq!(config.get_pool().get_name(), DEFAULT_POOL_NAME);
        assert_eq!(config.get_cache().get_init_cmd(), &vec!["/init".to_string()]);
        assert_eq!(
            config.get_cache().root_cmd_with_index(),
            vec!["/usr/bin/python", "/server.py"]
        );
        Ok(())
    }

    #[test]
    fn test_config_validation() {
        let bad_pool = WarmboxConfig::builder()
            .pool(PoolConfig::builder().mem_pool_mb(0).build())
            .build();
        assert!(matches!(bad_pool.validate(), Err(WarmboxError::Config(_))));

        let bad_limit = WarmboxConfig::builder()
            .pool(
                PoolConfig::builder()
                    .mem_pool_mb(100)
                    .default_mem_limit_mb(200)
                    .build(),
            )
            .build();
        assert!(matches!(bad_limit.validate(), Err(WarmboxError::Config(_))));

        let bad_cache = WarmboxConfig::builder()
            .cache(CacheConfig::builder().producers(0).build())
            .build();
        assert!(matches!(bad_cache.validate(), Err(WarmboxError::Config(_))));

        // Root plus two slots of 50 MiB cannot fit in 100 MiB.
        let cache_too_big = WarmboxConfig::builder()
            .pool(PoolConfig::builder().mem_pool_mb(100).build())
            .cache(
                CacheConfig::builder()
                    .buffer_size(2)
                    .mem_limit_mb(50)
                    .build(),
            )
            .build();
        assert!(matches!(
            cache_too_big.validate(),
            Err(WarmboxError::Config(_))
        ));

        let cache_fits = WarmboxConfig::builder()
            .pool(PoolConfig::builder().mem_pool_mb(150).build())
            .cache(
                CacheConfig::builder()
                    .buffer_size(2)
                    .mem_limit_mb(50)
                    .build(),
            )
            .build();
        assert!(cache_fits.validate().is_ok());

        let bad_name = WarmboxConfig::builder()
            .pool(PoolConfig::builder().name("a/b").build())
            .build();
        assert!(matches!(bad_name.validate(), Err(WarmboxError::Config(_))));
    }

    #[test_log::test(tokio::test)]
    #[serial]
    async fn test_config_load_applies_env_override() -> WarmboxResult<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("warmbox.yaml");
        fs::write(&path, "pool:\n  mem_pool_mb: 512\n").await?;

        std::env::set_var(WARMBOX_MEM_POOL_MB_ENV_VAR, "2048");
        let config = WarmboxConfig::load(Some(&path)).await;
        std::env::remove_var(WARMBOX_MEM_POOL_MB_ENV_VAR);

        assert_eq!(config?.get_pool().get_mem_pool_mb(), 2048);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    #[serial]
    async fn test_config_load_missing_file_uses_defaults() -> WarmboxResult<()> {
        let temp_dir = TempDir::new()?;
        let config = WarmboxConfig::load(Some(&temp_dir.path().join("absent.yaml"))).await?;
        assert_eq!(config.get_pool().get_mem_pool_mb(), DEFAULT_MEM_POOL_MB);
        Ok(())
    }
}
