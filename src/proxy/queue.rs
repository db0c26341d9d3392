//! The bounded FIFO queue's local proxy and lifecycle (spec §4.5). The
//! per-element data path (layout, batch key removal) is an explicit
//! Non-goal (spec §1); this proxy only surfaces the header object that
//! names, sizes, and threads the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::cache::CacheBackend;
use crate::key::QueueHeaderKey;
use crate::proxy::{AnyProxy, Kind};
use crate::value::QueueHeader;

/// Selects solely by the backend's atomicity mode (spec §4.5): transactional
/// queue operations run inside a manager-supplied transaction scope, atomic
/// queue operations run without one. The public contract is identical
/// either way — this only affects how a future element-data operation would
/// be wrapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Execution {
    Transactional,
    Atomic,
}

pub struct Queue {
    name: String,
    queue_key: QueueHeaderKey,
    id: Uuid,
    backend: Arc<dyn CacheBackend>,
    execution: Execution,
    removed: AtomicBool,
    header: Mutex<QueueHeader>,
}

impl Queue {
    pub(crate) fn new(
        name: String,
        queue_key: QueueHeaderKey,
        backend: Arc<dyn CacheBackend>,
        execution: Execution,
        header: QueueHeader,
    ) -> Self {
        Self {
            name,
            queue_key,
            id: header.id,
            backend,
            execution,
            removed: AtomicBool::new(header.removed),
            header: Mutex::new(header),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn capacity(&self) -> i32 {
        self.header.lock().unwrap().capacity
    }

    pub fn collocated(&self) -> bool {
        self.header.lock().unwrap().collocated
    }

    pub fn execution(&self) -> Execution {
        self.execution
    }

    fn check_removed(&self) -> crate::Result<()> {
        if self.removed.load(Ordering::SeqCst) {
            Err(crate::Error::QueueRemoved(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// `tail - head` of the locally held header view, kept current by the
    /// Queue Header Watcher's `on_header_changed` callback — served without
    /// a cache round trip, per the continuous-query "no polling" design.
    pub fn size(&self) -> crate::Result<i64> {
        self.check_removed()?;
        Ok(self.header.lock().unwrap().size())
    }

    pub fn is_empty(&self) -> crate::Result<bool> {
        self.check_removed()?;
        Ok(self.header.lock().unwrap().is_empty())
    }

    /// Runs `f` inside a transaction when this queue's execution is
    /// `Transactional`, or directly when `Atomic`. This is the hook a real
    /// element-data operation would use to participate in a larger cache
    /// transaction (spec §4.5 "Wrapping"); no element operations are
    /// implemented in this crate (spec §1 Non-goals).
    pub async fn with_scope<F, Fut, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = crate::Result<R>>,
    {
        self.check_removed()?;
        match self.execution {
            Execution::Atomic => f().await,
            Execution::Transactional => {
                let mut tx = self.backend.tx_start_pessimistic_rr().await?;
                match f().await {
                    Ok(v) => {
                        tx.commit().await?;
                        Ok(v)
                    }
                    Err(err) => {
                        tx.set_rollback_only();
                        Err(err)
                    }
                }
            }
        }
    }

    /// Delivered by the Queue Header Watcher whenever the backing header
    /// changes, including a soft-delete (`header.removed == true`) — spec
    /// §4.4.
    pub(crate) fn on_header_changed(&self, header: QueueHeader) {
        if header.removed {
            self.mark_removed();
        }
        *self.header.lock().unwrap() = header;
    }

    fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    /// The watcher's two-step disambiguation for a hard-deleted header
    /// entry (spec §4.4): "my queue was just recreated under the same name
    /// with a new id" vs. "my queue is truly gone". Re-reads the current
    /// header by name; if it is absent, or present under a different id,
    /// this proxy's generation is gone.
    pub(crate) async fn probe_removed(&self) -> crate::Result<()> {
        match self.backend.queue_header_get(&self.queue_key).await? {
            Some(h) if h.id == self.id && !h.removed => {
                *self.header.lock().unwrap() = h;
                Ok(())
            }
            _ => {
                self.mark_removed();
                Err(crate::Error::QueueRemoved(self.name.clone()))
            }
        }
    }
}

impl AnyProxy for Queue {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Queue
    }

    fn on_removed(&self) {
        self.mark_removed();
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
