//! A buffered supply of paused, pre-initialized sandboxes.
//!
//! [`BufferedCache`] keeps a bounded buffer full of sandboxes that are already started and
//! paused, so a caller only pays for an unpause. It does not build sandboxes itself: a
//! [`CacheFactory`] delegate does, and [`ProcessCacheFactory`] is the delegate backed by
//! host processes.

mod buffered;
mod factory;
mod process;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use buffered::*;
pub use factory::*;
pub use process::*;
