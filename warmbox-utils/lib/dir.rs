//! Directory allocation for per-sandbox state.
//!
//! A [`DirMaker`] owns one directory tree (`<base>/<prefix><name>`) and hands out fresh
//! subdirectories inside it. The whole tree is removed in one go on cleanup.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::{WarmboxUtilsError, WarmboxUtilsResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Allocates uniquely named directories under a single owned root.
#[derive(Debug, Clone)]
pub struct DirMaker {
    root: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DirMaker {
    /// Creates the directory `<base>/<name>` and returns a maker rooted there.
    ///
    /// When `clean` is set, any tree left behind by a previous run is removed first.
    pub async fn new(
        base: impl AsRef<Path>,
        name: impl AsRef<str>,
        clean: bool,
    ) -> WarmboxUtilsResult<Self> {
        let name = name.as_ref();
        if name.is_empty() || name.contains('/') {
            return Err(WarmboxUtilsError::PathValidation(format!(
                "invalid directory name {:?}",
                name
            )));
        }

        let root = base.as_ref().join(name);
        if clean && fs::try_exists(&root).await? {
            tracing::warn!("removing stale directory tree at {}", root.display());
            fs::remove_dir_all(&root)
                .await
                .map_err(|e| WarmboxUtilsError::RemoveDir(root.clone(), e))?;
        }

        fs::create_dir_all(&root)
            .await
            .map_err(|e| WarmboxUtilsError::CreateDir(root.clone(), e))?;

        Ok(Self { root })
    }

    /// The directory every allocated path lives under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates and returns `<root>/<name>`. The directory must not already exist.
    pub async fn make(&self, name: impl AsRef<str>) -> WarmboxUtilsResult<PathBuf> {
        let name = name.as_ref();
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(WarmboxUtilsError::PathValidation(format!(
                "invalid directory name {:?}",
                name
            )));
        }

        let path = self.root.join(name);
        fs::create_dir(&path)
            .await
            .map_err(|e| WarmboxUtilsError::CreateDir(path.clone(), e))?;

        Ok(path)
    }

    /// Removes the whole tree. A tree that is already gone is not an error.
    pub async fn cleanup(&self) -> WarmboxUtilsResult<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                tracing::info!("removed directory tree at {}", self.root.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WarmboxUtilsError::RemoveDir(self.root.clone(), e)),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
