//! The Data-Structures Manager (spec §4.1): the orchestrator that holds the
//! local proxy registries, serialises create/lookup/remove of every named
//! primitive through the backing cache, gates initialization, and brokers
//! shutdown.
//!
//! Modeled on the teacher's top-level client type (`gazette::Client`): a
//! cheaply-`Clone`able handle over `Arc`-shared state, constructed once and
//! passed around, with long-lived background work (there: journal listing;
//! here: the commit-hook and queue-header subscriptions) spawned as
//! `tokio` tasks owned by the handle's state rather than by a global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};

use crate::cache::{CacheBackend, CommitOp, ScalarValue};
use crate::key::{InternalKey, QueueHeaderKey};
use crate::proxy::queue::Execution;
use crate::proxy::{
    AnyProxy, AtomicLong, AtomicReference, AtomicStamped, Kind, Latch, Queue, Sequence,
};
use crate::value::{AtomicLongValue, LatchValue, QueueHeader, SequenceValue};
use crate::watcher::{QueueRegistry, QueueWatcher};
use crate::Error;

type ScalarRegistry = Arc<AsyncMutex<HashMap<InternalKey, Arc<dyn AnyProxy>>>>;
type LatchRegistry = Arc<AsyncMutex<HashMap<InternalKey, Arc<Latch>>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Init {
    Pending,
    Ready,
    Failed,
}

/// Registry sizes as surfaced by [`Manager::memory_stats`], the
/// `printMemoryStats()` diagnostic of spec §6.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryStats {
    pub scalar_count: usize,
    pub queue_count: usize,
}

impl std::fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scalar proxies: {}, queue proxies: {}",
            self.scalar_count, self.queue_count
        )
    }
}

pub struct Manager {
    backend: Arc<dyn CacheBackend>,
    init_tx: watch::Sender<Init>,
    registry: ScalarRegistry,
    latches: LatchRegistry,
    queues: QueueRegistry,
    busy_lock: Arc<RwLock<()>>,
    queue_watcher: AsyncMutex<Option<QueueWatcher>>,
    queue_watcher_started: AtomicBool,
    latch_notifier: AsyncMutex<Option<LatchNotifier>>,
    shut_down: AtomicBool,
}

impl Manager {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Arc<Self> {
        let (init_tx, _) = watch::channel(Init::Pending);
        Arc::new(Self {
            backend,
            init_tx,
            registry: Arc::new(AsyncMutex::new(HashMap::new())),
            latches: Arc::new(AsyncMutex::new(HashMap::new())),
            queues: Arc::new(AsyncMutex::new(HashMap::new())),
            busy_lock: Arc::new(RwLock::new(())),
            queue_watcher: AsyncMutex::new(None),
            queue_watcher_started: AtomicBool::new(false),
            latch_notifier: AsyncMutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// The one-shot initialization the kernel-start hook runs (spec §4.1
    /// step 1, §5 `initLatch`). Starts the Latch Notifier. Idempotent: a
    /// second call is a no-op once the first has settled.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(self: &Arc<Self>) -> crate::Result<()> {
        if *self.init_tx.borrow() != Init::Pending {
            return self.wait_initialized().await;
        }
        let notifier = LatchNotifier::spawn(
            self.backend.clone(),
            self.registry.clone(),
            self.latches.clone(),
            self.busy_lock.clone(),
        );
        *self.latch_notifier.lock().await = Some(notifier);
        let _ = self.init_tx.send(Init::Ready);
        tracing::debug!("data-structures manager initialized");
        Ok(())
    }

    async fn wait_initialized(&self) -> crate::Result<()> {
        let mut rx = self.init_tx.subscribe();
        loop {
            match *rx.borrow() {
                Init::Ready => return Ok(()),
                Init::Failed => return Err(Error::NotInitialized),
                Init::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::Interrupted);
            }
        }
    }

    async fn ensure_ready(&self) -> crate::Result<()> {
        self.wait_initialized().await?;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    /// Step 3's local fast path: a read-only registry probe performed
    /// before any cache round trip.
    async fn lookup_registry<T: AnyProxy>(
        &self,
        key: &InternalKey,
        kind: Kind,
    ) -> crate::Result<Option<Arc<T>>> {
        let registry = self.registry.lock().await;
        match registry.get(key) {
            Some(proxy) if proxy.kind() == kind => {
                Ok(Some(downcast(Arc::clone(proxy), key, kind)?))
            }
            Some(proxy) => Err(Error::TypeMismatch {
                name: key.name.clone(),
                existing: proxy.kind().label(),
                requested: kind.label(),
            }),
            None => Ok(None),
        }
    }

    /// Step 4's registry re-check, performed atomically with the insert:
    /// returns whichever proxy ends up registered for `key`, constructing
    /// one from `make` only if nobody beat us to it.
    async fn register_or_get<T: AnyProxy>(
        &self,
        key: &InternalKey,
        kind: Kind,
        make: impl FnOnce() -> Arc<T>,
    ) -> crate::Result<Arc<T>> {
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(key) {
            return if existing.kind() == kind {
                downcast(Arc::clone(existing), key, kind)
            } else {
                Err(Error::TypeMismatch {
                    name: key.name.clone(),
                    existing: existing.kind().label(),
                    requested: kind.label(),
                })
            };
        }
        let proxy = make();
        tracing::debug!(name = %key.name, kind = kind.label(), "registered local proxy");
        registry.insert(key.clone(), Arc::clone(&proxy) as Arc<dyn AnyProxy>);
        Ok(proxy)
    }

    /// The transactional slow path common to every scalar kind (spec §4.1
    /// step 4): read, re-read inside a transaction, create-if-absent.
    async fn scalar_get_or_create(
        &self,
        key: &InternalKey,
        create: bool,
        initial: impl FnOnce() -> crate::Result<ScalarValue>,
    ) -> crate::Result<Option<ScalarValue>> {
        if let Some(v) = self.backend.scalar_get(key).await? {
            return Ok(Some(v));
        }
        if !create {
            return Ok(None);
        }
        let mut tx = self.backend.tx_start_pessimistic_rr().await?;
        if let Some(v) = self.backend.scalar_get(key).await? {
            tx.commit().await?;
            return Ok(Some(v));
        }
        let value = match initial() {
            Ok(v) => v,
            Err(err) => {
                tx.set_rollback_only();
                return Err(err);
            }
        };
        match self
            .backend
            .scalar_put_if_absent(key.clone(), value.clone())
            .await
        {
            Ok(Some(existing)) => {
                tx.commit().await?;
                Ok(Some(existing))
            }
            Ok(None) => {
                tx.commit().await?;
                Ok(Some(value))
            }
            Err(err) => {
                tx.set_rollback_only();
                Err(err)
            }
        }
    }

    pub async fn sequence(
        self: &Arc<Self>,
        name: &str,
        init_val: i64,
        create: bool,
    ) -> crate::Result<Option<Arc<Sequence>>> {
        self.ensure_ready().await?;
        self.backend.config().require_transactional_with_near()?;
        let key = InternalKey::new(name);

        if let Some(existing) = self.lookup_registry::<Sequence>(&key, Kind::Sequence).await? {
            return Ok(Some(existing));
        }

        let value = match self
            .scalar_get_or_create(&key, create, || {
                Ok(ScalarValue::Sequence(SequenceValue { next: init_val }))
            })
            .await?
        {
            Some(v) => v,
            None => return Ok(None),
        };
        crate::proxy::expect_scalar(Some(value), Kind::Sequence, name)?;

        let reserve_size = self.backend.config().atomic_sequence_reserve_size;
        let backend = self.backend.clone();
        let name_owned = name.to_string();
        let proxy_key = key.clone();
        let proxy = self
            .register_or_get(&key, Kind::Sequence, move || {
                Arc::new(Sequence::new(name_owned, proxy_key, backend, reserve_size))
            })
            .await?;
        Ok(Some(proxy))
    }

    pub async fn atomic_long(
        self: &Arc<Self>,
        name: &str,
        init_val: i64,
        create: bool,
    ) -> crate::Result<Option<Arc<AtomicLong>>> {
        self.ensure_ready().await?;
        self.backend.config().require_transactional_with_near()?;
        let key = InternalKey::new(name);

        if let Some(existing) = self
            .lookup_registry::<AtomicLong>(&key, Kind::AtomicLong)
            .await?
        {
            return Ok(Some(existing));
        }

        let value = match self
            .scalar_get_or_create(&key, create, || {
                Ok(ScalarValue::AtomicLong(AtomicLongValue { v: init_val }))
            })
            .await?
        {
            Some(v) => v,
            None => return Ok(None),
        };
        crate::proxy::expect_scalar(Some(value), Kind::AtomicLong, name)?;

        let backend = self.backend.clone();
        let name_owned = name.to_string();
        let proxy_key = key.clone();
        let proxy = self
            .register_or_get(&key, Kind::AtomicLong, move || {
                Arc::new(AtomicLong::new(name_owned, proxy_key, backend))
            })
            .await?;
        Ok(Some(proxy))
    }

    pub async fn atomic_reference<T>(
        self: &Arc<Self>,
        name: &str,
        init_val: T,
        create: bool,
    ) -> crate::Result<Option<Arc<AtomicReference<T>>>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.ensure_ready().await?;
        self.backend.config().require_transactional_with_near()?;
        let key = InternalKey::new(name);

        if let Some(existing) = self
            .lookup_registry::<AtomicReference<T>>(&key, Kind::Reference)
            .await?
        {
            return Ok(Some(existing));
        }

        let value = match self
            .scalar_get_or_create(&key, create, || {
                Ok(ScalarValue::Reference(
                    serde_json::to_value(&init_val).map_err(Error::cache_failure)?,
                ))
            })
            .await?
        {
            Some(v) => v,
            None => return Ok(None),
        };
        crate::proxy::expect_scalar(Some(value), Kind::Reference, name)?;

        let backend = self.backend.clone();
        let name_owned = name.to_string();
        let proxy_key = key.clone();
        let proxy = self
            .register_or_get(&key, Kind::Reference, move || {
                Arc::new(AtomicReference::new(name_owned, proxy_key, backend))
            })
            .await?;
        Ok(Some(proxy))
    }

    pub async fn atomic_stamped<T, S>(
        self: &Arc<Self>,
        name: &str,
        init_val: T,
        init_stamp: S,
        create: bool,
    ) -> crate::Result<Option<Arc<AtomicStamped<T, S>>>>
    where
        T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
        S: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
    {
        self.ensure_ready().await?;
        self.backend.config().require_transactional_with_near()?;
        let key = InternalKey::new(name);

        if let Some(existing) = self
            .lookup_registry::<AtomicStamped<T, S>>(&key, Kind::Stamped)
            .await?
        {
            return Ok(Some(existing));
        }

        let value = match self
            .scalar_get_or_create(&key, create, || {
                Ok(ScalarValue::Stamped {
                    v: serde_json::to_value(&init_val).map_err(Error::cache_failure)?,
                    stamp: serde_json::to_value(&init_stamp).map_err(Error::cache_failure)?,
                })
            })
            .await?
        {
            Some(v) => v,
            None => return Ok(None),
        };
        crate::proxy::expect_scalar(Some(value), Kind::Stamped, name)?;

        let backend = self.backend.clone();
        let name_owned = name.to_string();
        let proxy_key = key.clone();
        let proxy = self
            .register_or_get(&key, Kind::Stamped, move || {
                Arc::new(AtomicStamped::new(name_owned, proxy_key, backend))
            })
            .await?;
        Ok(Some(proxy))
    }

    pub async fn latch(
        self: &Arc<Self>,
        name: &str,
        count: i32,
        auto_delete: bool,
        create: bool,
    ) -> crate::Result<Option<Arc<Latch>>> {
        // The init gate takes priority over every other check (spec.md
        // §4.1 step 1: block on/report init status before anything else).
        self.ensure_ready().await?;
        if count < 0 {
            return Err(Error::ModeMismatch("latch count must be non-negative"));
        }
        self.backend.config().require_transactional_with_near()?;
        let key = InternalKey::new(name);

        if let Some(existing) = self.lookup_registry::<Latch>(&key, Kind::Latch).await? {
            return Ok(Some(existing));
        }

        let value = match self
            .scalar_get_or_create(&key, create, || {
                Ok(ScalarValue::Latch(LatchValue::new(count, auto_delete)))
            })
            .await?
        {
            Some(v) => v,
            None => return Ok(None),
        };
        let value = crate::proxy::expect_scalar(Some(value), Kind::Latch, name)?;
        let latch_value = match value {
            ScalarValue::Latch(v) => v,
            _ => unreachable!("expect_scalar already checked the kind"),
        };

        let backend = self.backend.clone();
        let name_owned = name.to_string();
        let proxy_key = key.clone();
        let proxy = self
            .register_or_get(&key, Kind::Latch, move || {
                Arc::new(Latch::new(
                    name_owned,
                    proxy_key,
                    backend,
                    latch_value.count,
                    latch_value.auto_delete,
                ))
            })
            .await?;
        self.latches.lock().await.insert(key, proxy.clone());
        Ok(Some(proxy))
    }

    async fn remove_scalar(&self, name: &str, kind: Kind) -> crate::Result<bool> {
        self.ensure_ready().await?;
        let key = InternalKey::new(name);
        let mut tx = self.backend.tx_start_pessimistic_rr().await?;
        let current = match self.backend.scalar_get(&key).await {
            Ok(v) => v,
            Err(err) => {
                tx.set_rollback_only();
                return Err(err);
            }
        };
        match &current {
            None => {
                tx.commit().await?;
                return Ok(false);
            }
            Some(v) if v.kind() != kind => {
                tx.set_rollback_only();
                return Err(Error::TypeMismatch {
                    name: name.to_string(),
                    existing: v.kind().label(),
                    requested: kind.label(),
                });
            }
            Some(_) => {}
        }
        let removed = match self.backend.scalar_remove(&key).await {
            Ok(b) => b,
            Err(err) => {
                tx.set_rollback_only();
                return Err(err);
            }
        };
        tx.commit().await?;
        if removed {
            self.drop_and_notify(&key).await;
        }
        Ok(removed)
    }

    pub async fn remove_sequence(&self, name: &str) -> crate::Result<bool> {
        self.remove_scalar(name, Kind::Sequence).await
    }

    pub async fn remove_atomic_long(&self, name: &str) -> crate::Result<bool> {
        self.remove_scalar(name, Kind::AtomicLong).await
    }

    pub async fn remove_atomic_reference(&self, name: &str) -> crate::Result<bool> {
        self.remove_scalar(name, Kind::Reference).await
    }

    pub async fn remove_atomic_stamped(&self, name: &str) -> crate::Result<bool> {
        self.remove_scalar(name, Kind::Stamped).await
    }

    /// Refuses with `BusyLatch` — rolling back first — unless the latch's
    /// count has reached zero (spec §9 Open Question: every failure path,
    /// including this one, rolls the transaction back before returning).
    pub async fn remove_latch(&self, name: &str) -> crate::Result<bool> {
        self.ensure_ready().await?;
        let key = InternalKey::new(name);
        let mut tx = self.backend.tx_start_pessimistic_rr().await?;
        let current = match self.backend.scalar_get(&key).await {
            Ok(v) => v,
            Err(err) => {
                tx.set_rollback_only();
                return Err(err);
            }
        };
        let latch_value = match current {
            None => {
                tx.commit().await?;
                return Ok(false);
            }
            Some(ScalarValue::Latch(v)) => v,
            Some(other) => {
                tx.set_rollback_only();
                return Err(Error::TypeMismatch {
                    name: name.to_string(),
                    existing: other.kind().label(),
                    requested: Kind::Latch.label(),
                });
            }
        };
        if latch_value.count != 0 {
            tx.set_rollback_only();
            return Err(Error::BusyLatch(name.to_string()));
        }
        let removed = match self.backend.scalar_remove(&key).await {
            Ok(b) => b,
            Err(err) => {
                tx.set_rollback_only();
                return Err(err);
            }
        };
        tx.commit().await?;
        if removed {
            self.drop_and_notify(&key).await;
        }
        Ok(removed)
    }

    async fn drop_and_notify(&self, key: &InternalKey) {
        let mut registry = self.registry.lock().await;
        if let Some(proxy) = registry.remove(key) {
            tracing::debug!(name = %key.name, kind = proxy.kind().label(), "removed local proxy");
            proxy.on_removed();
        }
        drop(registry);
        self.latches.lock().await.remove(key);
    }

    /// Lazily starts the queue header watcher, guarded by a once-only flag
    /// (spec §4.4, §5 `queueQryGuard`).
    async fn ensure_queue_watcher(self: &Arc<Self>) {
        if self
            .queue_watcher_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let watcher = QueueWatcher::spawn(
                self.backend.clone(),
                self.queues.clone(),
                self.busy_lock.clone(),
            );
            *self.queue_watcher.lock().await = Some(watcher);
        }
    }

    pub async fn queue(
        self: &Arc<Self>,
        name: &str,
        capacity: i32,
        collocated: bool,
        create: bool,
    ) -> crate::Result<Option<Arc<Queue>>> {
        self.ensure_ready().await?;
        let config = self.backend.config();
        config.require_queue_compatible()?;
        let effective_collocated = config.effective_collocated(collocated);
        let key = QueueHeaderKey::new(name);

        let header = if create {
            let fresh = QueueHeader::fresh(capacity, effective_collocated);
            match self
                .backend
                .queue_header_put_if_absent(key.clone(), fresh)
                .await?
            {
                Some(existing) => {
                    if existing.capacity != capacity || existing.collocated != effective_collocated
                    {
                        return Err(Error::QueueConflict {
                            name: name.to_string(),
                            existing_capacity: existing.capacity,
                            existing_collocated: existing.collocated,
                            requested_capacity: capacity,
                            requested_collocated: effective_collocated,
                        });
                    }
                    existing
                }
                None => fresh,
            }
        } else {
            match self.backend.queue_header_get(&key).await? {
                Some(h) => h,
                None => return Ok(None),
            }
        };

        self.ensure_queue_watcher().await;

        let execution = if config.atomicity_mode == crate::config::AtomicityMode::Atomic {
            Execution::Atomic
        } else {
            Execution::Transactional
        };

        let backend = self.backend.clone();
        let name_owned = name.to_string();
        let mut queues = self.queues.lock().await;
        let proxy = queues
            .entry(header.id)
            .or_insert_with(|| {
                Arc::new(Queue::new(name_owned, key, backend, execution, header))
            })
            .clone();
        Ok(Some(proxy))
    }

    /// Removes the header; if non-empty, hands the element cleanup off to
    /// the external "remove queue element keys in batches" collaborator
    /// (spec §4.5). The element data path itself is out of scope.
    pub async fn remove_queue(&self, name: &str, batch_size: usize) -> crate::Result<bool> {
        self.ensure_ready().await?;
        let key = QueueHeaderKey::new(name);
        let header = match self.backend.queue_header_get(&key).await? {
            Some(h) => h,
            None => return Ok(false),
        };
        let removed = self.backend.queue_header_remove(&key).await?;
        if removed {
            if header.size() > 0 {
                self.backend
                    .remove_queue_element_keys(name, batch_size)
                    .await?;
            }
            if let Some(proxy) = self.queues.lock().await.remove(&header.id) {
                proxy.on_removed();
            }
        }
        Ok(removed)
    }

    pub async fn memory_stats(&self) -> MemoryStats {
        let stats = MemoryStats {
            scalar_count: self.registry.lock().await.len(),
            queue_count: self.queues.lock().await.len(),
        };
        tracing::info!(%stats, "data-structures manager memory stats");
        stats
    }

    /// Blocks the busy-lock, stops the latch notifier and queue watcher,
    /// and marks the manager shut down so no further proxies are registered
    /// (spec §5 "Resource release", §8 "Shutdown safety").
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _exclusive = self.busy_lock.write().await;
        self.shut_down.store(true, Ordering::SeqCst);
        if let Some(notifier) = self.latch_notifier.lock().await.take() {
            notifier.shutdown();
        }
        if let Some(watcher) = self.queue_watcher.lock().await.take() {
            watcher.shutdown();
        }
        tracing::debug!("data-structures manager shut down");
    }
}

/// The `Kind` tag alone doesn't pin down the generic `T`/`S` a reference or
/// stamped-reference proxy was built with, so two callers requesting the
/// same name under the same `Kind` but different Rust types still reach
/// here and must fail the `Arc<dyn Any>::downcast::<T>()` — that is ordinary
/// caller misuse, not a programmer error, and is reported as `TypeMismatch`
/// rather than panicking.
fn downcast<T: AnyProxy>(
    proxy: Arc<dyn AnyProxy>,
    key: &InternalKey,
    kind: Kind,
) -> crate::Result<Arc<T>> {
    let proxy_kind = proxy.kind();
    proxy.as_any_arc().downcast::<T>().map_err(|_| Error::TypeMismatch {
        name: key.name.clone(),
        existing: proxy_kind.label(),
        requested: kind.label(),
    })
}

/// Observes transactional commits of the backing cache and dispatches
/// `onUpdate`/`onRemoved` to the local latch proxy (spec §4.3). Re-architected
/// per spec §9 as a broadcast-channel consumer, grounded the same way as
/// [`crate::watcher::QueueWatcher`] on `gazette`'s `Subscriber` pattern.
struct LatchNotifier {
    task: tokio::task::JoinHandle<()>,
}

impl LatchNotifier {
    fn spawn(
        backend: Arc<dyn CacheBackend>,
        registry: ScalarRegistry,
        latches: LatchRegistry,
        busy_lock: Arc<RwLock<()>>,
    ) -> Self {
        let mut events = backend.subscribe_commits();
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "latch notifier lagged, resuming");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        tracing::debug!("latch notifier subscription closed, exiting");
                        break;
                    }
                };

                let Ok(_permit) = busy_lock.clone().try_read_owned() else {
                    tracing::debug!("latch notifier skipped a commit: manager is shutting down");
                    continue;
                };

                for entry in event.entries {
                    handle_commit_entry(&backend, &registry, &latches, entry.op, entry.key, entry.value)
                        .await;
                }
            }
        });
        Self { task }
    }

    fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for LatchNotifier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_commit_entry(
    backend: &Arc<dyn CacheBackend>,
    registry: &ScalarRegistry,
    latches: &LatchRegistry,
    op: CommitOp,
    key: InternalKey,
    value: Option<ScalarValue>,
) {
    if op == CommitOp::Delete {
        let mut reg = registry.lock().await;
        if let Some(proxy) = reg.remove(&key) {
            proxy.on_removed();
        }
        drop(reg);
        latches.lock().await.remove(&key);
        return;
    }

    let Some(ScalarValue::Latch(latch_value)) = value else {
        return;
    };
    let Some(latch) = latches.lock().await.get(&key).cloned() else {
        return;
    };
    tracing::trace!(name = %key.name, count = latch_value.count, "dispatching latch update");
    latch.on_update(latch_value.count);

    if latch_value.count == 0 && latch_value.auto_delete {
        match backend.scalar_remove(&key).await {
            Ok(_) => {
                registry.lock().await.remove(&key);
                latches.lock().await.remove(&key);
                latch.on_removed();
            }
            Err(err) => {
                tracing::warn!(error = %err, name = %key.name, "failed to auto-delete fired latch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::cache::CacheBackend;
    use crate::config::{AtomicWriteOrderMode, AtomicityMode, CacheConfig, CacheMode};
    use crate::testutil::MemoryCache;
    use crate::Error;

    use super::Manager;

    async fn new_manager() -> Arc<Manager> {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::default());
        let manager = Manager::new(backend);
        manager.initialize().await.unwrap();
        manager
    }

    async fn new_manager_with(config: CacheConfig) -> Arc<Manager> {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new(config));
        let manager = Manager::new(backend);
        manager.initialize().await.unwrap();
        manager
    }

    async fn yield_a_few() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn atomic_long_create_get_set_cas() {
        let m = new_manager().await;
        let counter = m.atomic_long("hits", 0, true).await.unwrap().unwrap();
        assert_eq!(counter.get().await.unwrap(), 0);
        assert_eq!(counter.increment_and_get().await.unwrap(), 1);
        assert_eq!(counter.add_and_get(4).await.unwrap(), 5);
        counter.set(10).await.unwrap();
        assert_eq!(counter.get().await.unwrap(), 10);
        assert!(counter.compare_and_set(10, 20).await.unwrap());
        assert!(!counter.compare_and_set(10, 30).await.unwrap());
        assert_eq!(counter.get().await.unwrap(), 20);

        // A second lookup by the same manager returns the same registered proxy.
        let again = m.atomic_long("hits", 0, false).await.unwrap().unwrap();
        assert_eq!(again.get().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn atomic_long_lookup_without_create_on_missing_name() {
        let m = new_manager().await;
        assert!(m.atomic_long("absent", 0, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn atomic_reference_and_stamped_generic_values() {
        let m = new_manager().await;

        let reference = m
            .atomic_reference("cfg", vec!["a".to_string()], true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reference.get().await.unwrap(), vec!["a".to_string()]);
        assert!(reference
            .compare_and_set(&vec!["a".to_string()], vec!["b".to_string()])
            .await
            .unwrap());
        assert_eq!(reference.get().await.unwrap(), vec!["b".to_string()]);

        let stamped = m
            .atomic_stamped("version", 1i64, "v1".to_string(), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stamped.get().await.unwrap(), (1, "v1".to_string()));
        assert!(stamped
            .compare_and_set(&1, 2, &"v1".to_string(), "v2".to_string())
            .await
            .unwrap());
        assert!(!stamped
            .compare_and_set(&1, 3, &"v1".to_string(), "v3".to_string())
            .await
            .unwrap());
        assert_eq!(stamped.get().await.unwrap(), (2, "v2".to_string()));
    }

    #[tokio::test]
    async fn sequence_reserves_in_batches_and_is_monotonic() {
        // MemoryCache::default() reserves 10 ids per round trip.
        let m = new_manager().await;
        let seq = m.sequence("orders", 100, true).await.unwrap().unwrap();

        let mut seen = Vec::new();
        for _ in 0..11 {
            seen.push(seq.next().await.unwrap());
        }
        assert_eq!(
            seen,
            vec![100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110]
        );

        // Strictly increasing and gap-free across the reservation boundary.
        for pair in seen.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[tokio::test]
    async fn sequence_adopted_by_a_second_manager_continues_the_same_stream() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::default());
        let a = Manager::new(backend.clone());
        a.initialize().await.unwrap();
        let b = Manager::new(backend);
        b.initialize().await.unwrap();

        let seq_a = a.sequence("shared", 0, true).await.unwrap().unwrap();
        let seq_b = b.sequence("shared", 0, false).await.unwrap().unwrap();

        let first_a = seq_a.next().await.unwrap();
        let first_b = seq_b.next().await.unwrap();
        assert_ne!(first_a, first_b);
        assert!(first_b > first_a);
    }

    #[tokio::test]
    async fn latch_counts_down_and_auto_deletes_across_managers() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::default());
        let a = Manager::new(backend.clone());
        a.initialize().await.unwrap();
        let b = Manager::new(backend);
        b.initialize().await.unwrap();

        let latch_a = a.latch("barrier", 1, true, true).await.unwrap().unwrap();
        let latch_b = b.latch("barrier", 1, true, true).await.unwrap().unwrap();

        assert_eq!(latch_a.count_down().await.unwrap(), 0);

        // Both managers' notifiers observe the commit independently and
        // auto-delete; either proxy reaching zero satisfies await_zero.
        latch_b.await_zero().await.unwrap();
        yield_a_few().await;

        // Auto-delete removes the backing entry, so a fresh lookup on either
        // manager finds nothing left to adopt.
        assert!(a.latch("barrier", 0, false, false).await.unwrap().is_none());
        assert!(b.latch("barrier", 0, false, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_latch_refuses_while_busy() {
        let m = new_manager().await;
        let latch = m.latch("gate", 2, false, true).await.unwrap().unwrap();
        latch.count_down().await.unwrap();

        match m.remove_latch("gate").await {
            Err(Error::BusyLatch(name)) => assert_eq!(name, "gate"),
            other => panic!("expected BusyLatch, got {other:?}"),
        }

        latch.count_down().await.unwrap();
        yield_a_few().await;
        assert!(m.remove_latch("gate").await.unwrap());
    }

    #[tokio::test]
    async fn queue_create_then_conflicting_recreate_is_rejected() {
        let m = new_manager().await;
        let q = m.queue("tasks", 16, true, true).await.unwrap().unwrap();
        assert_eq!(q.capacity(), 16);
        assert!(q.is_empty().unwrap());

        match m.queue("tasks", 32, true, true).await {
            Err(Error::QueueConflict { name, .. }) => assert_eq!(name, "tasks"),
            Ok(_) => panic!("expected QueueConflict, got Ok"),
            Err(other) => panic!("expected QueueConflict, got {other:?}"),
        }

        // Same capacity/collocation: adopts the existing queue instead.
        let again = m.queue("tasks", 16, true, true).await.unwrap().unwrap();
        assert_eq!(again.id(), q.id());
    }

    #[tokio::test]
    async fn queue_removal_is_observed_by_another_manager_via_header_watch() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::default());
        let a = Manager::new(backend.clone());
        a.initialize().await.unwrap();
        let b = Manager::new(backend);
        b.initialize().await.unwrap();

        let q_a = a.queue("events", 8, true, true).await.unwrap().unwrap();
        let q_b = b.queue("events", 8, true, false).await.unwrap().unwrap();
        assert_eq!(q_a.id(), q_b.id());

        assert!(a.remove_queue("events", 64).await.unwrap());

        for _ in 0..50 {
            if q_b.size().is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(q_b.size().is_err());
    }

    #[tokio::test]
    async fn remove_queue_on_missing_name_is_a_no_op() {
        let m = new_manager().await;
        assert!(!m.remove_queue("nope", 64).await.unwrap());
    }

    #[tokio::test]
    async fn scalar_primitives_refuse_atomic_mode_cache() {
        let m = new_manager_with(CacheConfig {
            cache_mode: CacheMode::Replicated,
            atomicity_mode: AtomicityMode::Atomic,
            atomic_write_order_mode: AtomicWriteOrderMode::Primary,
            near_enabled: true,
            atomic_sequence_reserve_size: 10,
        })
        .await;

        assert!(matches!(
            m.atomic_long("x", 0, true).await,
            Err(Error::ModeMismatch(_))
        ));
        assert!(matches!(
            m.latch("x", 1, false, true).await,
            Err(Error::ModeMismatch(_))
        ));
    }

    /// A replicated (or local) transactional cache needs no near-cache: the
    /// requirement only bites a partitioned cache (spec §4.1 step 2: "...with
    /// near-cache enabled (or replicated/local)").
    #[tokio::test]
    async fn scalar_primitives_allow_replicated_cache_without_near_cache() {
        let m = new_manager_with(CacheConfig {
            cache_mode: CacheMode::Replicated,
            atomicity_mode: AtomicityMode::Transactional,
            atomic_write_order_mode: AtomicWriteOrderMode::Primary,
            near_enabled: false,
            atomic_sequence_reserve_size: 10,
        })
        .await;

        assert!(m.atomic_long("x", 0, true).await.unwrap().is_some());
    }

    /// The same transactional cache, but partitioned and without near-cache,
    /// is refused.
    #[tokio::test]
    async fn scalar_primitives_refuse_partitioned_cache_without_near_cache() {
        let m = new_manager_with(CacheConfig {
            cache_mode: CacheMode::Partitioned,
            atomicity_mode: AtomicityMode::Transactional,
            atomic_write_order_mode: AtomicWriteOrderMode::Primary,
            near_enabled: false,
            atomic_sequence_reserve_size: 10,
        })
        .await;

        assert!(matches!(
            m.atomic_long("x", 0, true).await,
            Err(Error::ModeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn queue_refuses_atomic_cache_with_clock_write_order() {
        let m = new_manager_with(CacheConfig {
            cache_mode: CacheMode::Partitioned,
            atomicity_mode: AtomicityMode::Atomic,
            atomic_write_order_mode: AtomicWriteOrderMode::Clock,
            near_enabled: false,
            atomic_sequence_reserve_size: 10,
        })
        .await;

        assert!(matches!(
            m.queue("q", 4, true, true).await,
            Err(Error::ModeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn name_reused_across_kinds_is_a_type_mismatch() {
        let m = new_manager().await;
        m.atomic_long("thing", 0, true).await.unwrap();

        match m.sequence("thing", 0, true).await {
            Err(Error::TypeMismatch { existing, requested, .. }) => {
                assert_eq!(existing, "atomic long");
                assert_eq!(requested, "sequence");
            }
            Ok(_) => panic!("expected TypeMismatch, got Ok"),
            Err(other) => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    /// `Kind::Reference` alone doesn't pin down the generic `T` a reference
    /// proxy was constructed with; a second caller reusing the name under a
    /// different Rust type must get `TypeMismatch`, not a panic.
    #[tokio::test]
    async fn atomic_reference_reused_with_a_different_rust_type_is_a_type_mismatch() {
        let m = new_manager().await;
        m.atomic_reference("cfg", "initial".to_string(), true)
            .await
            .unwrap();

        match m.atomic_reference::<i64>("cfg", 0, false).await {
            Err(Error::TypeMismatch { existing, requested, .. }) => {
                assert_eq!(existing, "atomic reference");
                assert_eq!(requested, "atomic reference");
            }
            Ok(_) => panic!("expected TypeMismatch, got Ok"),
            Err(other) => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn latch_rejects_negative_count() {
        let m = new_manager().await;
        assert!(matches!(
            m.latch("neg", -1, false, true).await,
            Err(Error::ModeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_blocks_further_materialization() {
        let m = new_manager().await;
        m.atomic_long("before", 0, true).await.unwrap();
        m.shutdown().await;

        assert!(matches!(
            m.atomic_long("after", 0, true).await,
            Err(Error::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn memory_stats_counts_registered_proxies() {
        let m = new_manager().await;
        m.atomic_long("a", 0, true).await.unwrap();
        m.atomic_long("b", 0, true).await.unwrap();
        m.queue("q", 4, true, true).await.unwrap();

        let stats = m.memory_stats().await;
        assert_eq!(stats.scalar_count, 2);
        assert_eq!(stats.queue_count, 1);
    }
}
