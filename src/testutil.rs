//! An in-memory [`CacheBackend`] double, used by this crate's own tests and
//! exported (behind the `test-util` feature) so a downstream crate can test
//! against the same contract without standing up a real cluster — the same
//! role `agent::controlplane::ControlPlane`'s in-memory fake plays in the
//! teacher workspace.
//!
//! `MemoryCache` serialises every transaction behind one
//! `tokio::sync::Mutex`: there is never more than one pessimistic
//! transaction in flight, so "rollback" only ever needs to discard writes
//! nobody else could have observed yet. Real backends hold per-key locks and
//! genuinely undo partial writes; this double trades that away for
//! simplicity, which is fine for exercising this crate's own call
//! discipline but not a model of real contention.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};

use crate::cache::{
    CacheBackend, CommitEntry, CommitEvent, CommitOp, QueueHeaderEvent, ScalarValue, Transform, Tx,
};
use crate::config::{AtomicWriteOrderMode, AtomicityMode, CacheConfig, CacheMode};
use crate::key::{InternalKey, QueueHeaderKey};
use crate::value::QueueHeader;

const CHANNEL_CAPACITY: usize = 1024;

/// An in-process, single-cache-mode stand-in for the distributed cache this
/// crate consumes as an external collaborator (spec §6). Defaults to
/// `Transactional`/near-enabled/`Primary` write order — the mode every
/// scalar primitive requires — so a test only needs to override `config`
/// when it specifically wants to exercise a mode guard.
pub struct MemoryCache {
    config: CacheConfig,
    scalars: StdMutex<HashMap<InternalKey, ScalarValue>>,
    queue_headers: StdMutex<HashMap<QueueHeaderKey, QueueHeader>>,
    tx_lock: Arc<AsyncMutex<()>>,
    commits: broadcast::Sender<CommitEvent>,
    queue_events: broadcast::Sender<QueueHeaderEvent>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(CacheConfig {
            cache_mode: CacheMode::Replicated,
            atomicity_mode: AtomicityMode::Transactional,
            atomic_write_order_mode: AtomicWriteOrderMode::Primary,
            near_enabled: true,
            atomic_sequence_reserve_size: 10,
        })
    }
}

impl MemoryCache {
    pub fn new(config: CacheConfig) -> Self {
        let (commits, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (queue_events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            config,
            scalars: StdMutex::new(HashMap::new()),
            queue_headers: StdMutex::new(HashMap::new()),
            tx_lock: Arc::new(AsyncMutex::new(())),
            commits,
            queue_events,
        }
    }

    fn publish_commit(&self, op: CommitOp, key: InternalKey, value: Option<ScalarValue>) {
        // A send fails only when nobody is subscribed; that's fine, there's
        // nothing to deliver to.
        let _ = self.commits.send(CommitEvent {
            entries: vec![CommitEntry { op, key, value }],
        });
    }

    fn publish_queue_changed(&self, key: QueueHeaderKey, header: QueueHeader) {
        let _ = self.queue_events.send(QueueHeaderEvent::Changed { key, header });
    }

    fn publish_queue_removed(&self, key: QueueHeaderKey) {
        let _ = self.queue_events.send(QueueHeaderEvent::Removed { key });
    }
}

struct MemoryTx {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl Tx for MemoryTx {
    async fn commit(&mut self) -> crate::Result<()> {
        Ok(())
    }

    fn set_rollback_only(&mut self) {
        // Writes made before this call have already landed directly in the
        // maps above; every caller in this crate only performs writes after
        // its own checks succeed, so there is nothing left to undo here.
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn config(&self) -> CacheConfig {
        self.config
    }

    async fn tx_start_pessimistic_rr(&self) -> crate::Result<Box<dyn Tx>> {
        let guard = self.tx_lock.clone().lock_owned().await;
        Ok(Box::new(MemoryTx { _guard: guard }))
    }

    async fn scalar_get(&self, key: &InternalKey) -> crate::Result<Option<ScalarValue>> {
        Ok(self.scalars.lock().unwrap().get(key).cloned())
    }

    async fn scalar_put(&self, key: InternalKey, value: ScalarValue) -> crate::Result<()> {
        let mut scalars = self.scalars.lock().unwrap();
        let op = if scalars.contains_key(&key) {
            CommitOp::Update
        } else {
            CommitOp::Create
        };
        scalars.insert(key.clone(), value.clone());
        drop(scalars);
        self.publish_commit(op, key, Some(value));
        Ok(())
    }

    async fn scalar_put_if_absent(
        &self,
        key: InternalKey,
        value: ScalarValue,
    ) -> crate::Result<Option<ScalarValue>> {
        let mut scalars = self.scalars.lock().unwrap();
        if let Some(existing) = scalars.get(&key) {
            return Ok(Some(existing.clone()));
        }
        scalars.insert(key.clone(), value.clone());
        drop(scalars);
        self.publish_commit(CommitOp::Create, key, Some(value));
        Ok(None)
    }

    async fn scalar_remove(&self, key: &InternalKey) -> crate::Result<bool> {
        let removed = self.scalars.lock().unwrap().remove(key).is_some();
        if removed {
            self.publish_commit(CommitOp::Delete, key.clone(), None);
        }
        Ok(removed)
    }

    async fn scalar_transform(
        &self,
        key: InternalKey,
        transform: Transform,
    ) -> crate::Result<Option<ScalarValue>> {
        let mut scalars = self.scalars.lock().unwrap();
        let current = scalars.get(&key).cloned();
        drop(scalars);
        let next = transform(current)?;
        scalars = self.scalars.lock().unwrap();
        match &next {
            Some(value) => {
                let op = if scalars.contains_key(&key) {
                    CommitOp::Update
                } else {
                    CommitOp::Create
                };
                scalars.insert(key.clone(), value.clone());
                drop(scalars);
                self.publish_commit(op, key, Some(value.clone()));
            }
            None => {
                let existed = scalars.remove(&key).is_some();
                drop(scalars);
                if existed {
                    self.publish_commit(CommitOp::Delete, key, None);
                }
            }
        }
        Ok(next)
    }

    async fn queue_header_get(&self, key: &QueueHeaderKey) -> crate::Result<Option<QueueHeader>> {
        Ok(self.queue_headers.lock().unwrap().get(key).copied())
    }

    async fn queue_header_put_if_absent(
        &self,
        key: QueueHeaderKey,
        value: QueueHeader,
    ) -> crate::Result<Option<QueueHeader>> {
        let mut headers = self.queue_headers.lock().unwrap();
        if let Some(existing) = headers.get(&key) {
            return Ok(Some(*existing));
        }
        headers.insert(key.clone(), value);
        drop(headers);
        self.publish_queue_changed(key, value);
        Ok(None)
    }

    async fn queue_header_remove(&self, key: &QueueHeaderKey) -> crate::Result<bool> {
        let removed = self.queue_headers.lock().unwrap().remove(key).is_some();
        if removed {
            self.publish_queue_removed(key.clone());
        }
        Ok(removed)
    }

    fn subscribe_queue_headers(&self) -> broadcast::Receiver<QueueHeaderEvent> {
        self.queue_events.subscribe()
    }

    fn subscribe_commits(&self) -> broadcast::Receiver<CommitEvent> {
        self.commits.subscribe()
    }

    async fn remove_queue_element_keys(&self, _name: &str, _batch_size: usize) -> crate::Result<()> {
        // Out of scope: there is no element-data path to clean up (spec §1
        // Non-goals), so the double has nothing to do here.
        Ok(())
    }
}

/// Convenience constructor used across this crate's tests: a fully
/// initialized [`crate::manager::Manager`] over a fresh [`MemoryCache`].
#[cfg(test)]
pub(crate) async fn manager() -> Arc<crate::manager::Manager> {
    let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::default());
    let manager = crate::manager::Manager::new(backend);
    manager.initialize().await.expect("initialize never fails in tests");
    manager
}
