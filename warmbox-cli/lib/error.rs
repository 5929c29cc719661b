use thiserror::Error;
use warmbox_core::WarmboxError;
use warmbox_utils::WarmboxUtilsError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a warmbox CLI operation.
pub type WarmboxCliResult<T> = Result<T, WarmboxCliError>;

/// An error that occurred while running a warmbox command.
#[derive(pretty_error_debug::Debug, Error)]
pub enum WarmboxCliError {
    /// An error from the core crate.
    #[error(transparent)]
    Core(#[from] WarmboxError),

    /// An error from the utils crate.
    #[error(transparent)]
    Utils(#[from] WarmboxUtilsError),

    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A command line argument is unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WarmboxCliError {
    /// Whether resources may have been left behind and the process must not carry on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WarmboxCliError::Core(e) if e.is_fatal())
    }

    /// The process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        if self.is_fatal() {
            2
        } else {
            1
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors_get_their_own_exit_code() {
        let fatal = WarmboxCliError::from(WarmboxError::Fatal("leak".into()));
        assert!(fatal.is_fatal());
        assert_eq!(fatal.exit_code(), 2);

        let other = WarmboxCliError::InvalidArgument("--leaves".into());
        assert!(!other.is_fatal());
        assert_eq!(other.exit_code(), 1);
    }
}
