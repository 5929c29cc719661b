//! `warmbox-utils` is a library containing general utilities for the warmbox project.

#![warn(missing_docs)]

pub mod defaults;
pub mod dir;
pub mod env;
pub mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use dir::*;
pub use env::*;
pub use error::*;
