//! Local proxies (spec §4.6) and the `kind`-tag redesign of spec §9's
//! Design Notes: rather than a reflected class token, every local proxy
//! carries a `Kind` discriminator, and cache values are addressed through
//! per-kind views so a wrongly-kinded value read through a view is already
//! a decoding error.

pub mod atomic_long;
pub mod atomic_reference;
pub mod atomic_stamped;
pub mod latch;
pub mod queue;
pub mod sequence;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use atomic_long::AtomicLong;
pub use atomic_reference::AtomicReference;
pub use atomic_stamped::AtomicStamped;
pub use latch::Latch;
pub use queue::Queue;
pub use sequence::Sequence;

/// The kind discriminator every local proxy and `ScalarValue` variant
/// carries, replacing the source's reflected class-token check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Sequence,
    AtomicLong,
    Reference,
    Stamped,
    Latch,
    Queue,
}

impl Kind {
    pub fn label(&self) -> &'static str {
        match self {
            Kind::Sequence => "sequence",
            Kind::AtomicLong => "atomic long",
            Kind::Reference => "atomic reference",
            Kind::Stamped => "atomic stamped reference",
            Kind::Latch => "latch",
            Kind::Queue => "queue",
        }
    }
}

/// Shared `removed` flag plumbing (spec §4.6): "Every public operation fails
/// with `Removed` if the proxy has been removed locally." Kept as a small
/// struct rather than duplicated per proxy type.
#[derive(Debug, Default)]
pub(crate) struct RemovedFlag(AtomicBool);

impl RemovedFlag {
    pub(crate) fn mark_removed(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self, name: &str) -> crate::Result<()> {
        if self.is_removed() {
            Err(crate::Error::Removed(name.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Every local proxy the manager can register, regardless of kind — used by
/// the registry so a single `InternalKey -> proxy` map can hold proxies of
/// any scalar kind and still answer "what kind is already registered under
/// this name?" for the manager's local fast path (spec §4.1 step 3).
pub trait AnyProxy: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn kind(&self) -> Kind;
    /// Invoked by the commit-hook dispatcher and the shutdown path; marks
    /// this proxy locally removed so subsequent operations fail with
    /// `Removed` (spec §3 "Ownership", §4.3).
    fn on_removed(&self);
    /// Recovers the concrete proxy type the manager's fast path returned it
    /// as, so a heterogeneous `InternalKey -> Arc<dyn AnyProxy>` registry can
    /// still hand back a typed `Arc<Sequence>`/`Arc<AtomicReference<T>>`/etc.
    /// Every implementor writes this identically; it only exists because
    /// `Arc<dyn Any>`'s unsizing coercion requires a concrete `Self`.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync>;
}

/// Decodes a cache-resident `ScalarValue`, raising `Removed` if absent or
/// `TypeMismatch` if present under a different kind than expected — the
/// "wrongly-kinded value read through a view is already a decoding error"
/// redesign of spec §9.
pub(crate) fn expect_scalar(
    value: Option<crate::cache::ScalarValue>,
    want: Kind,
    name: &str,
) -> crate::Result<crate::cache::ScalarValue> {
    match value {
        None => Err(crate::Error::Removed(name.to_string())),
        Some(v) if v.kind() == want => Ok(v),
        Some(v) => Err(crate::Error::TypeMismatch {
            name: name.to_string(),
            existing: v.kind().label(),
            requested: want.label(),
        }),
    }
}

/// Single-entry pessimistic transaction used by every scalar proxy's
/// mutating operation (spec §4.6: "atomic-long's `compareAndSet` becomes a
/// single-entry pessimistic transaction"). Reads the current value,
/// type-checks it, applies `f`, writes the result back, and commits;
/// `f` returning `Err` leaves the entry untouched (the transaction rolls
/// back on drop without a commit).
pub(crate) async fn replace_scalar(
    backend: &dyn crate::cache::CacheBackend,
    key: &crate::key::InternalKey,
    want: Kind,
    name: &str,
    f: impl FnOnce(crate::cache::ScalarValue) -> crate::Result<crate::cache::ScalarValue>,
) -> crate::Result<crate::cache::ScalarValue> {
    let mut tx = backend.tx_start_pessimistic_rr().await?;
    let current = backend.scalar_get(key).await?;
    let current = match expect_scalar(current, want, name) {
        Ok(v) => v,
        Err(err) => {
            tx.set_rollback_only();
            return Err(err);
        }
    };
    let next = match f(current) {
        Ok(v) => v,
        Err(err) => {
            tx.set_rollback_only();
            return Err(err);
        }
    };
    backend.scalar_put(key.clone(), next.clone()).await?;
    tx.commit().await?;
    Ok(next)
}
