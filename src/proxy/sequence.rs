//! The Sequence Reservation Engine (spec §4.2): each local `Sequence` proxy
//! holds a private `[local, upper]` range and serves `next()` locally until
//! the range is exhausted, then reserves the next range under a pessimistic
//! transaction.
//!
//! The reservation's fast/slow path is grounded on `gazette::router::Router
//! ::route`'s `DialState` shape: an `Arc<futures::lock::Mutex<..>>` guarding
//! a "maybe ready" value, with a fast path returning immediately when ready
//! and a slow path performing async work (there: dialing a channel; here:
//! reserving a range) while the lock is held, so concurrent callers on the
//! same node queue behind one reservation rather than racing the cache.

use std::fmt;
use std::sync::Arc;

use futures::lock::Mutex;

use crate::cache::{CacheBackend, ScalarValue};
use crate::key::InternalKey;
use crate::proxy::{expect_scalar, AnyProxy, Kind, RemovedFlag};
use crate::value::SequenceValue;

#[derive(Debug)]
struct SequenceExhausted;

impl fmt::Display for SequenceExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sequence has exhausted the signed 64-bit id space")
    }
}

impl std::error::Error for SequenceExhausted {}

/// A reserved-but-not-fully-consumed range. `exhausted` is tracked
/// explicitly rather than via `local > upper`: when a saturated reservation
/// (spec §9 Open Question) lands `upper` on `i64::MAX`, the last in-range id
/// is `local == upper == i64::MAX`, and incrementing `local` past it to
/// signal exhaustion would itself overflow.
struct Range {
    local: i64,
    upper: i64,
    exhausted: bool,
}

impl Range {
    fn exhausted(&self) -> bool {
        self.exhausted
    }
}

pub struct Sequence {
    name: String,
    key: InternalKey,
    backend: Arc<dyn CacheBackend>,
    removed: RemovedFlag,
    reserve_size: i64,
    range: Mutex<Range>,
}

impl Sequence {
    /// Every newly constructed proxy starts with an exhausted range, whether
    /// it belongs to the node that just created the backing `SequenceValue`
    /// or adopted an existing one: the first `next()` call performs a
    /// reservation either way, reading whatever `next` the creator (or a
    /// prior reservation) persisted. This yields the same externally
    /// observable ranges as precomputing the creator's first range (spec
    /// §4.2) at the cost of one extra transaction on the creating node's
    /// first call.
    pub(crate) fn new(
        name: String,
        key: InternalKey,
        backend: Arc<dyn CacheBackend>,
        reserve_size: i64,
    ) -> Self {
        Self {
            name,
            key,
            backend,
            removed: RemovedFlag::default(),
            reserve_size: reserve_size.max(1),
            range: Mutex::new(Range {
                local: 0,
                upper: 0,
                exhausted: true,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Atomically post-increments the local counter and returns the old
    /// value (spec §4.2). Reserves a new range from the cache when the
    /// current one is exhausted.
    pub async fn next(&self) -> crate::Result<i64> {
        self.removed.check(&self.name)?;

        // Acquire the async-aware, per-instance lock: concurrent callers on
        // this node queue here rather than each reserving their own range.
        let mut range = self.range.lock().await;

        if range.exhausted() {
            let (local, upper) = self.reserve().await?;
            range.local = local;
            range.upper = upper;
            range.exhausted = false;
        }

        let value = range.local;
        if value == range.upper {
            // Last id in this range: mark exhausted directly instead of
            // incrementing `local` past `upper`, which would overflow when
            // `upper` has saturated at `i64::MAX`.
            range.exhausted = true;
        } else {
            range.local = value + 1;
        }
        Ok(value)
    }

    /// Reserve `[global, global + reserve_size - 1]` under a pessimistic
    /// transaction, persisting `next = upper + 1`. Saturates rather than
    /// silently wrapping on overflow (spec §9 Open Question).
    async fn reserve(&self) -> crate::Result<(i64, i64)> {
        let mut tx = self.backend.tx_start_pessimistic_rr().await?;

        let current = self.backend.scalar_get(&self.key).await?;
        let current = match expect_scalar(current, Kind::Sequence, &self.name) {
            Ok(v) => v,
            Err(err) => {
                tx.set_rollback_only();
                return Err(err);
            }
        };
        let global = match current {
            ScalarValue::Sequence(v) => v.next,
            _ => unreachable!("expect_scalar already checked the kind"),
        };

        if global == i64::MAX {
            tx.set_rollback_only();
            return Err(crate::Error::cache_failure(SequenceExhausted));
        }

        let upper = global.saturating_add(self.reserve_size - 1);
        let to_persist = match upper.checked_add(1) {
            Some(next) => next,
            None => {
                tracing::warn!(
                    name = %self.name,
                    %upper,
                    "sequence reservation saturated at i64::MAX instead of wrapping",
                );
                i64::MAX
            }
        };

        self.backend
            .scalar_put(
                self.key.clone(),
                ScalarValue::Sequence(SequenceValue { next: to_persist }),
            )
            .await?;
        tx.commit().await?;

        Ok((global, upper))
    }
}

impl AnyProxy for Sequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Sequence
    }

    fn on_removed(&self) {
        self.removed.mark_removed();
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::cache::CacheBackend;
    use crate::key::InternalKey;
    use crate::testutil::MemoryCache;
    use crate::value::SequenceValue;

    use super::Sequence;

    /// A reservation that saturates at `i64::MAX` (spec §9 Open Question)
    /// must still let `next()` serve every id in the range, including the
    /// final one, without an overflow panic on the post-increment.
    #[tokio::test]
    async fn next_does_not_overflow_when_a_reservation_saturates_at_i64_max() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::default());
        let key = InternalKey::new("near-the-edge");
        backend
            .scalar_put(
                key.clone(),
                crate::cache::ScalarValue::Sequence(SequenceValue {
                    next: i64::MAX - 2,
                }),
            )
            .await
            .unwrap();

        let seq = Sequence::new("near-the-edge".to_string(), key, backend, 10);

        assert_eq!(seq.next().await.unwrap(), i64::MAX - 2);
        assert_eq!(seq.next().await.unwrap(), i64::MAX - 1);
        assert_eq!(seq.next().await.unwrap(), i64::MAX);

        // The range is exhausted at `i64::MAX`; the next call must reserve
        // again rather than incrementing past it, and fail cleanly because
        // the persisted `next` has nowhere left to go.
        assert!(seq.next().await.is_err());
    }
}
