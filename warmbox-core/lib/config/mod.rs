//! Configuration types and helpers.

mod defaults;
mod meta;
mod warmbox;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use meta::*;
pub use warmbox::*;
