//! Caching primitives for service lookups.
//!
//! Currently there is a [`CoalescingCache`] that provides request coalescing and keeps
//! settled values in memory for as long as their [`CacheEntry::time_to_live`] allows.

#![warn(missing_docs)]

mod coalescing;
mod defer;
mod eviction;

use std::time::Duration;

pub use coalescing::*;

/// This trait tells the [`CoalescingCache`] how long a settled value may be served from memory.
pub trait CacheEntry {
    /// The duration after which the entry is evicted.
    ///
    /// Returning `None` evicts the entry as soon as its computation has settled. Waiters that
    /// joined before that still receive the value.
    fn time_to_live(&self) -> Option<Duration> {
        None
    }
}

/// The error handed to waiters when a computation was dropped before it could settle.
///
/// This happens when the computation panics or the runtime shuts down underneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("computation dropped before completion")]
pub struct Interrupted;
