use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use warmbox_cli::{WarmboxCliError, WarmboxCliResult, CHECKMARK};
use warmbox_core::{
    cache::{BufferedCache, CacheSandbox, ProcessCacheFactory},
    config::{SandboxMeta, WarmboxConfig},
    mem::MemPool,
    pool::SandboxPool,
    sandbox::{ProcessBackend, SandboxEvent, SandboxRef},
};
use warmbox_utils::DirMaker;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const SCRATCH_DIRS_PREFIX: &str = "scratch-";

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

pub async fn run_subcommand(
    config: WarmboxConfig,
    code_dir: PathBuf,
    leaves: usize,
    mem_limit_mb: Option<u64>,
) -> WarmboxCliResult<()> {
    if !code_dir.is_dir() {
        return Err(WarmboxCliError::InvalidArgument(format!(
            "code dir {} is not a directory",
            code_dir.display()
        )));
    }

    let pool_config = config.get_pool().clone();
    let mem = Arc::new(MemPool::new(pool_config.get_mem_pool_mb())?);
    let backend = Arc::new(ProcessBackend::new(pool_config.get_packages_dir()));
    let scratch = DirMaker::new(
        pool_config.get_root_dir(),
        format!("{}{}", SCRATCH_DIRS_PREFIX, pool_config.get_name()),
        true,
    )
    .await?;

    let pool = SandboxPool::new(pool_config, mem, backend).await?;
    pool.add_listener(Arc::new(|event: &SandboxEvent| {
        tracing::info!("sandbox {}: {:?}", event.id, event.kind);
    }));

    let mut sandboxes = Vec::new();
    let result = drive_pool(
        &pool,
        &scratch,
        &code_dir,
        leaves,
        mem_limit_mb,
        &mut sandboxes,
    )
    .await;

    // Leaves first, then the zygote.
    for sandbox in sandboxes.iter().rev() {
        if let Err(e) = sandbox.destroy().await {
            tracing::warn!("failed to destroy sandbox {}: {}", sandbox.id(), e);
        }
    }
    drop(sandboxes);

    pool.cleanup().await?;
    scratch.cleanup().await?;
    result?;

    println!("{} pool {} cleaned up", &*CHECKMARK, pool.get_name());
    Ok(())
}

pub async fn prewarm_subcommand(config: WarmboxConfig, take: usize) -> WarmboxCliResult<()> {
    let pool_config = config.get_pool();
    let cache_config = config.get_cache();

    let mem = Arc::new(MemPool::new(pool_config.get_mem_pool_mb())?);
    let backend = Arc::new(ProcessBackend::new(pool_config.get_packages_dir()));
    let factory =
        ProcessCacheFactory::new(pool_config, cache_config, Arc::clone(&mem), backend).await?;

    let cache = BufferedCache::new(factory, cache_config).await?;
    println!(
        "{} pre-warm cache ready with {} sandboxes",
        &*CHECKMARK,
        console::style(cache.get_capacity()).yellow()
    );

    let mut taken = Vec::with_capacity(take);
    for _ in 0..take {
        match cache.create().await {
            Ok((sandbox, dir)) => {
                println!(
                    "{} took sandbox {} from {}",
                    &*CHECKMARK,
                    sandbox.id(),
                    dir.display()
                );
                taken.push(sandbox);
            }
            Err(e) => tracing::warn!("pre-warmed sandbox unusable: {}", e),
        }
    }

    wait_for_ctrl_c().await?;

    for sandbox in &taken {
        if let Err(e) = sandbox.remove().await {
            tracing::warn!("failed to remove sandbox {}: {}", sandbox.id(), e);
        }
    }

    cache.cleanup().await?;
    mem.drain()?;

    println!("{} pre-warm cache cleaned up", &*CHECKMARK);
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Creates a zygote and `leaves` leaves forked from it, shows the pool and waits for Ctrl-C.
/// Every sandbox created is pushed onto `sandboxes` so the caller can tear it down.
async fn drive_pool(
    pool: &SandboxPool,
    scratch: &DirMaker,
    code_dir: &Path,
    leaves: usize,
    mem_limit_mb: Option<u64>,
    sandboxes: &mut Vec<SandboxRef>,
) -> WarmboxCliResult<()> {
    let zygote = pool
        .create(None, false, None, &scratch.make("zygote").await?, None)
        .await?;
    sandboxes.push(Arc::clone(&zygote));

    let meta = mem_limit_mb.map(|mb| SandboxMeta::builder().mem_limit_mb(mb).build());
    let created = futures::future::join_all((0..leaves).map(|i| {
        let meta = meta.clone();
        let zygote = &zygote;
        async move {
            let dir = scratch.make(format!("leaf-{}", i)).await?;
            create_leaf(pool, zygote, code_dir, &dir, meta).await
        }
    }))
    .await;

    let mut first_err = None;
    for result in created {
        match result {
            Ok(leaf) => sandboxes.push(leaf),
            Err(e) => {
                tracing::error!("failed to create leaf: {}", e);
                first_err.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    println!("{}", pool.debug_string());
    println!(
        "{} {} sandboxes running",
        &*CHECKMARK,
        console::style(sandboxes.len()).yellow()
    );

    wait_for_ctrl_c().await
}

/// Forks a leaf from the zygote, falling back to a fresh process if the fork fails.
async fn create_leaf(
    pool: &SandboxPool,
    zygote: &SandboxRef,
    code_dir: &Path,
    scratch_dir: &Path,
    meta: Option<SandboxMeta>,
) -> WarmboxCliResult<SandboxRef> {
    match pool
        .create(Some(zygote), true, Some(code_dir), scratch_dir, meta.clone())
        .await
    {
        Ok(leaf) => Ok(leaf),
        Err(e) if e.is_fork_failed() => {
            tracing::warn!("{}, starting a fresh leaf instead", e);
            Ok(pool
                .create(None, true, Some(code_dir), scratch_dir, meta)
                .await?)
        }
        Err(e) => Err(e.into()),
    }
}

async fn wait_for_ctrl_c() -> WarmboxCliResult<()> {
    println!("press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl-C, shutting down");
    Ok(())
}
