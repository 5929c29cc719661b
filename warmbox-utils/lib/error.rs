use std::path::PathBuf;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a warmbox-utils related operation.
pub type WarmboxUtilsResult<T> = Result<T, WarmboxUtilsError>;

/// An error that occurred during a warmbox-utils operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum WarmboxUtilsError {
    /// An error that occurred when validating a path
    #[error("path validation error: {0}")]
    PathValidation(String),

    /// A directory could not be created.
    #[error("failed to create directory {0}: {1}")]
    CreateDir(PathBuf, #[source] std::io::Error),

    /// A directory tree could not be removed.
    #[error("failed to remove directory {0}: {1}")]
    RemoveDir(PathBuf, #[source] std::io::Error),

    /// An I/O error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
