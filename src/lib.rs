//! Cluster-wide coordination primitives layered over a distributed,
//! transactional key-value cache: an atomic long, an atomic reference, an
//! atomic stamped reference, a monotonic sequence generator with local
//! reservation, a count-down latch, and a bounded FIFO queue.
//!
//! Every primitive is identified by a user-visible string name and is lazily
//! materialized in the backing cache the first time any cluster node asks
//! for it. [`manager::Manager`] is the entry point.

pub mod cache;
pub mod config;
pub mod error;
pub mod key;
pub mod manager;
pub mod proxy;
pub mod value;
mod watcher;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use error::{Error, Result};
pub use manager::Manager;
