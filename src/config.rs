//! Cache-mode inspection and the mode guards the manager applies
//! before materializing a primitive.

use crate::Error;

/// How the backing cache distributes its entries across the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    Local,
    Replicated,
    Partitioned,
}

/// Whether the backing cache is transactional or uses single-operation
/// atomic consistency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtomicityMode {
    Transactional,
    Atomic,
}

/// Ordering discipline for writes to an atomic (non-transactional) cache.
/// `Clock` is refused outright for queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtomicWriteOrderMode {
    Primary,
    Clock,
}

/// A read-only snapshot of the backing cache's configuration, as surfaced by
/// the `config()` external collaborator contract.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    pub cache_mode: CacheMode,
    pub atomicity_mode: AtomicityMode,
    pub atomic_write_order_mode: AtomicWriteOrderMode,
    pub near_enabled: bool,
    /// `config().atomicSequenceReserveSize()`: the number of ids a node
    /// reserves at a time from the sequence generator.
    pub atomic_sequence_reserve_size: i64,
}

impl CacheConfig {
    /// Counter/reference/stamped/sequence/latch require a transactional
    /// cache; near-caching is additionally required on a partitioned cache
    /// (spec: "transactional with near-cache enabled (or replicated/local)"
    /// — near-caching only matters once entries are actually partitioned
    /// across the cluster, so a replicated or local cache is exempt).
    pub fn require_transactional_with_near(&self) -> crate::Result<()> {
        if self.atomicity_mode != AtomicityMode::Transactional {
            return Err(Error::ModeMismatch(
                "this primitive requires a transactional cache",
            ));
        }
        if self.cache_mode == CacheMode::Partitioned && !self.near_enabled {
            return Err(Error::ModeMismatch(
                "this primitive requires near-caching enabled on a partitioned cache",
            ));
        }
        Ok(())
    }

    /// Queues additionally forbid atomic caches using `CLOCK` write order.
    pub fn require_queue_compatible(&self) -> crate::Result<()> {
        if self.atomicity_mode == AtomicityMode::Atomic
            && self.atomic_write_order_mode == AtomicWriteOrderMode::Clock
        {
            return Err(Error::ModeMismatch(
                "queues are not supported on an atomic cache using CLOCK write order",
            ));
        }
        Ok(())
    }

    /// A partitioned cache takes `collocated` as given; any other mode
    /// forces collocation to `true`.
    pub fn effective_collocated(&self, requested: bool) -> bool {
        match self.cache_mode {
            CacheMode::Partitioned => requested,
            CacheMode::Local | CacheMode::Replicated => true,
        }
    }
}
