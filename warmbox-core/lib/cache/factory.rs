use std::{
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;

use crate::{sandbox::SandboxId, WarmboxResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A sandbox built by a [`CacheFactory`].
#[async_trait]
pub trait CacheSandbox: Send + Sync + fmt::Debug + 'static {
    /// The sandbox's identity.
    fn id(&self) -> SandboxId;

    /// Starts the sandbox's process, forking it from the parent if it has one.
    async fn start(&self) -> WarmboxResult<()>;

    /// Freezes the sandbox.
    async fn pause(&self) -> WarmboxResult<()>;

    /// Thaws the sandbox.
    async fn unpause(&self) -> WarmboxResult<()>;

    /// Stops the sandbox's process.
    async fn stop(&self) -> WarmboxResult<()>;

    /// Releases everything the sandbox holds. Removing twice does nothing.
    async fn remove(&self) -> WarmboxResult<()>;
}

/// Builds the sandboxes a [`BufferedCache`](crate::cache::BufferedCache) keeps warm.
#[async_trait]
pub trait CacheFactory: Send + Sync + 'static {
    /// The sandboxes this factory builds.
    type Sandbox: CacheSandbox;

    /// Builds an unstarted sandbox living in `sandbox_dir` that will run `cmd`, forked from
    /// `parent` if given. Returns the sandbox and its memory cgroup directory.
    async fn create(
        &self,
        parent: Option<&Self::Sandbox>,
        sandbox_dir: &Path,
        cmd: &[String],
    ) -> WarmboxResult<(Self::Sandbox, PathBuf)>;

    /// Releases the factory's own resources. Every sandbox must have been removed first.
    async fn cleanup(&self) -> WarmboxResult<()>;
}
