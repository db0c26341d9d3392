//! The count-down latch primitive and its state machine (spec §4.3):
//! `Active -> Counting` (transient, per `count_down`) `-> Fired` (count
//! reaches zero) `-> Removed`. A transition from `Active` straight to
//! `Removed` only happens via an explicit `remove_latch`, itself only
//! allowed once `Fired`.
//!
//! `Latch` itself never decides auto-deletion or dispatches notifications —
//! that is [`crate::manager::LatchNotifier`]'s job, driven by the backing
//! cache's commit hook, the way `gazette`'s
//! `journal::list::subscriber::Subscriber` is driven by a streaming diff
//! rather than by the thing it's watching.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::cache::ScalarValue;
use crate::cache::CacheBackend;
use crate::key::InternalKey;
use crate::proxy::{replace_scalar, AnyProxy, Kind};
use crate::value::LatchValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Active,
    Fired,
    Removed,
}

struct State {
    count: i32,
    phase: Phase,
}

pub struct Latch {
    name: String,
    key: InternalKey,
    backend: Arc<dyn CacheBackend>,
    auto_delete: bool,
    removed: AtomicBool,
    state: Mutex<State>,
    notify: Notify,
}

impl Latch {
    pub(crate) fn new(
        name: String,
        key: InternalKey,
        backend: Arc<dyn CacheBackend>,
        initial_count: i32,
        auto_delete: bool,
    ) -> Self {
        let phase = if initial_count == 0 {
            Phase::Fired
        } else {
            Phase::Active
        };
        Self {
            name,
            key,
            backend,
            auto_delete,
            removed: AtomicBool::new(false),
            state: Mutex::new(State {
                count: initial_count,
                phase,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    /// The count as most recently observed via a commit notification (or,
    /// before the first notification, the count this proxy was constructed
    /// with).
    pub fn count(&self) -> i32 {
        self.state.lock().unwrap().count
    }

    fn check_removed(&self) -> crate::Result<()> {
        if self.removed.load(Ordering::SeqCst) {
            Err(crate::Error::Removed(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Decrements the count by one (floored at zero) under a single-entry
    /// pessimistic transaction; returns the post-commit count. The caller's
    /// own local `onUpdate` arrives asynchronously via the commit hook, same
    /// as every other node's.
    pub async fn count_down(&self) -> crate::Result<i32> {
        self.check_removed()?;
        let next = replace_scalar(
            self.backend.as_ref(),
            &self.key,
            Kind::Latch,
            &self.name,
            |current| match current {
                ScalarValue::Latch(v) => {
                    let count = v.count_down(1);
                    Ok(ScalarValue::Latch(LatchValue { count, ..v }))
                }
                _ => unreachable!("expect_scalar already checked the kind"),
            },
        )
        .await?;
        match next {
            ScalarValue::Latch(v) => Ok(v.count),
            _ => unreachable!(),
        }
    }

    /// Suspends until the count reaches zero or the latch is removed.
    pub async fn await_zero(&self) -> crate::Result<()> {
        loop {
            self.check_removed()?;
            // Register interest before checking the phase: `notified()`
            // captures any `notify_waiters()` call that happens after this
            // point, even ahead of being polled, so a transition landing
            // between the check below and the `.await` is never missed.
            let notified = self.notify.notified();
            {
                let state = self.state.lock().unwrap();
                if state.phase != Phase::Active {
                    break;
                }
            }
            notified.await;
        }
        Ok(())
    }

    /// Dispatched by [`crate::manager::LatchNotifier`] on every committed
    /// write to this latch's entry (spec §4.3).
    pub(crate) fn on_update(&self, new_count: i32) {
        let mut state = self.state.lock().unwrap();
        state.count = new_count;
        if new_count == 0 && state.phase == Phase::Active {
            state.phase = Phase::Fired;
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

impl AnyProxy for Latch {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Latch
    }

    fn on_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
        self.state.lock().unwrap().phase = Phase::Removed;
        self.notify.notify_waiters();
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
