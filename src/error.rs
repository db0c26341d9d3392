//! Error kinds surfaced to callers of [`crate::manager::Manager`].
//!
//! Local transactional failures abort the in-flight operation, remove any
//! tentative registry entry, and are wrapped in [`Error::CacheFailure`] for
//! the caller. Continuous-query callback failures and shutdown errors on the
//! continuous query are logged and swallowed; they never reach this enum.

/// Crate-wide result alias, mirroring the one failure type callers see.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The manager never completed its one-shot initialization.
    #[error("data-structures manager is not initialized")]
    NotInitialized,

    /// A wait on the init latch was interrupted.
    #[error("interrupted while waiting for manager initialization")]
    Interrupted,

    /// The backing cache's configuration forbids the requested primitive.
    #[error("cache mode does not support this data structure: {0}")]
    ModeMismatch(&'static str),

    /// A cache entry or local proxy under this name exists, but of a
    /// different kind than requested.
    #[error("'{name}' already exists as a {existing}, not a {requested}")]
    TypeMismatch {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    /// A queue of this name already exists with a different capacity or
    /// collocation flag.
    #[error("queue '{name}' already exists with capacity={existing_capacity} collocated={existing_collocated}, not capacity={requested_capacity} collocated={requested_collocated}")]
    QueueConflict {
        name: String,
        existing_capacity: i32,
        existing_collocated: bool,
        requested_capacity: i32,
        requested_collocated: bool,
    },

    /// Removal of a latch was attempted while its count is still non-zero.
    #[error("latch '{0}' cannot be removed while its count is non-zero")]
    BusyLatch(String),

    /// An operation was attempted on a proxy whose backing entry has been
    /// removed.
    #[error("data structure '{0}' has been removed")]
    Removed(String),

    /// A queue proxy observed that its backing header is gone.
    #[error("queue '{0}' has been removed")]
    QueueRemoved(String),

    /// The underlying cache transaction or operation failed.
    #[error("cache operation failed")]
    CacheFailure(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wraps an arbitrary backend error as [`Error::CacheFailure`], the way
    /// every `CacheBackend`/`View`/`Tx` method surfaces its failures to
    /// callers in this crate.
    pub fn cache_failure(
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::CacheFailure(Box::new(err))
    }
}
