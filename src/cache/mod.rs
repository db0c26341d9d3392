//! The Cache Façade (spec §4 intro / §6): the contract this crate consumes
//! from the surrounding distributed-cache platform, never implements.
//!
//! This is deliberately an external-collaborator boundary (spec §1
//! Non-goals: "the underlying distributed cache ... we consume its
//! contracts only"). [`CacheBackend`] plays the same role here that
//! `agent::controlplane::ControlPlane` plays in the teacher workspace: a
//! `#[async_trait] trait ...: Send + Sync` wrapping a remote system that
//! production code implements once and tests implement with an in-memory
//! double (see [`crate::testutil`]).
//!
//! Scalar primitives (counter, reference, stamped reference, sequence,
//! latch) share one physical cache keyed by [`crate::key::InternalKey`],
//! storing the tagged-union [`ScalarValue`] (spec §9's "re-architect as a
//! tagged-variant" redesign note: a wrongly-kinded read is a decoding
//! error, surfaced by the manager as [`crate::Error::TypeMismatch`]).
//! Queue headers live in a distinct cache keyed by
//! [`crate::key::QueueHeaderKey`] (spec §3).

use async_trait::async_trait;

use crate::config::CacheConfig;
use crate::key::{InternalKey, QueueHeaderKey};
use crate::value::{AtomicLongValue, LatchValue, QueueHeader, SequenceValue};

/// The tagged union stored for every non-queue primitive. `Reference` and
/// `Stamped` carry application values as `serde_json::Value`: the backing
/// cache only ever marshals bytes, so the generic `T`/`S` of
/// [`crate::proxy::atomic_reference::AtomicReference`] and
/// [`crate::proxy::atomic_stamped::AtomicStamped`] exists only at the proxy
/// layer, the same way a real distributed cache's wire format is opaque to
/// its own storage engine.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum ScalarValue {
    Sequence(SequenceValue),
    AtomicLong(AtomicLongValue),
    Reference(serde_json::Value),
    Stamped {
        v: serde_json::Value,
        stamp: serde_json::Value,
    },
    Latch(LatchValue),
}

impl ScalarValue {
    pub fn kind(&self) -> crate::proxy::Kind {
        match self {
            ScalarValue::Sequence(_) => crate::proxy::Kind::Sequence,
            ScalarValue::AtomicLong(_) => crate::proxy::Kind::AtomicLong,
            ScalarValue::Reference(_) => crate::proxy::Kind::Reference,
            ScalarValue::Stamped { .. } => crate::proxy::Kind::Stamped,
            ScalarValue::Latch(_) => crate::proxy::Kind::Latch,
        }
    }
}

/// A transactional scope opened with [`CacheBackend::tx_start_pessimistic_rr`].
///
/// Implementations must release any held locks on every exit path,
/// including an early `drop` without a call to `commit` (treated as
/// rollback) — mirroring the teacher's own "guaranteed release on all exit
/// paths" transaction contract (spec §6).
#[async_trait]
pub trait Tx: Send {
    async fn commit(&mut self) -> crate::Result<()>;
    fn set_rollback_only(&mut self);
}

/// Entry written by one committed transaction, delivered to commit-hook
/// subscribers (spec §4.3, §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOp {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug)]
pub struct CommitEntry {
    pub op: CommitOp,
    pub key: InternalKey,
    /// `None` for a `Delete` op.
    pub value: Option<ScalarValue>,
}

#[derive(Clone, Debug, Default)]
pub struct CommitEvent {
    pub entries: Vec<CommitEntry>,
}

/// An event delivered by the continuous query over queue-header entries
/// (spec §4.4).
#[derive(Clone, Debug)]
pub enum QueueHeaderEvent {
    Changed {
        key: QueueHeaderKey,
        header: QueueHeader,
    },
    Removed {
        key: QueueHeaderKey,
    },
}

/// A mutator sent to [`CacheBackend::scalar_transform`] — the `transformAsync`
/// collaborator contract of spec §6. Scalar primitives in this crate always
/// require a transactional cache (see [`CacheConfig::require_transactional_with_near`])
/// and so never reach for this path themselves; it is exposed because real
/// backends offer it as part of the same facade, and a future atomic-mode
/// scalar primitive would use it the way [`crate::proxy::replace_scalar`]
/// uses an explicit transaction today.
pub type Transform =
    Box<dyn FnOnce(Option<ScalarValue>) -> crate::Result<Option<ScalarValue>> + Send>;

/// The distributed, transactional cache platform this crate builds named
/// coordination primitives on top of (spec §1, §6). Every method here is an
/// external-collaborator contract: this crate never implements it for a
/// real cluster, only consumes it (see [`crate::testutil::MemoryCache`] for
/// the in-memory double used by this crate's own tests).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Cache-mode inspection (spec §6): `atomic()`, `transactional()`,
    /// `nearEnabled()`, `config().cacheMode()`, etc.
    fn config(&self) -> CacheConfig;

    /// Opens a pessimistic, repeatable-read transaction scoped to the
    /// internal-values view (spec §4.1 step 4). Holding the returned `Tx`
    /// guarantees stable reads of the scalar and queue-header caches until
    /// it is committed or dropped.
    async fn tx_start_pessimistic_rr(&self) -> crate::Result<Box<dyn Tx>>;

    async fn scalar_get(&self, key: &InternalKey) -> crate::Result<Option<ScalarValue>>;
    async fn scalar_put(&self, key: InternalKey, value: ScalarValue) -> crate::Result<()>;
    async fn scalar_put_if_absent(
        &self,
        key: InternalKey,
        value: ScalarValue,
    ) -> crate::Result<Option<ScalarValue>>;
    async fn scalar_remove(&self, key: &InternalKey) -> crate::Result<bool>;
    async fn scalar_transform(
        &self,
        key: InternalKey,
        transform: Transform,
    ) -> crate::Result<Option<ScalarValue>>;

    async fn queue_header_get(
        &self,
        key: &QueueHeaderKey,
    ) -> crate::Result<Option<QueueHeader>>;
    async fn queue_header_put_if_absent(
        &self,
        key: QueueHeaderKey,
        value: QueueHeader,
    ) -> crate::Result<Option<QueueHeader>>;
    async fn queue_header_remove(&self, key: &QueueHeaderKey) -> crate::Result<bool>;

    /// A long-lived subscription over queue-header changes. Local/replicated
    /// caches project onto the local node; partitioned caches default to
    /// cluster-wide (spec §4.4).
    fn subscribe_queue_headers(&self) -> tokio::sync::broadcast::Receiver<QueueHeaderEvent>;

    /// A feed of locally-committed write entries (spec §4.3, §6).
    fn subscribe_commits(&self) -> tokio::sync::broadcast::Receiver<CommitEvent>;

    /// Remove a queue's element keys in batches; `batch_size` is a
    /// concurrency hint only (spec §4.5). The element data path itself is
    /// out of scope (spec §1 Non-goals).
    async fn remove_queue_element_keys(&self, name: &str, batch_size: usize) -> crate::Result<()>;
}
