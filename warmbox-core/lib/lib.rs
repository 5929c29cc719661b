//! `warmbox` is the sandbox-pooling core of a serverless worker.
//!
//! # Overview
//!
//! warmbox creates, isolates and recycles per-invocation execution environments ("sandboxes")
//! with strict memory accounting and minimal cold-start latency. It handles:
//! - Admission control against a fixed memory budget
//! - Memory cgroup allocation, reuse and charge moving
//! - Sandbox creation, either fresh or forked from a warm zygote
//! - A buffered supply of paused, pre-initialized sandboxes
//!
//! # Architecture
//!
//! - **Memory Pool**: blocking gate bounding total committed memory
//! - **Cgroup Pool**: reusable memory-limited cgroups
//! - **Sandbox**: arena-tracked process trees behind a thread-safe decorator
//! - **Sandbox Pool**: the admission-controlled creation protocol with rollback
//! - **Buffered Cache**: background producers keeping paused sandboxes ready
//!
//! # Modules
//!
//! - [`cache`] - Buffered pre-warm cache and its delegate factories
//! - [`cgroup`] - Memory cgroup pool
//! - [`config`] - Configuration types, defaults and loading
//! - [`mem`] - Memory admission pool
//! - [`pool`] - Sandbox pool orchestrator
//! - [`sandbox`] - Sandbox types, lifecycle, events and isolation backends

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cache;
pub mod cgroup;
pub mod config;
pub mod mem;
pub mod pool;
pub mod sandbox;

pub use error::*;
