use moka::{future::Cache, Expiry};
use std::{
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{Mutex, MutexGuard};

/// A lazily created piece of per-key state.
///
/// The mutex serializes read-modify-write on the state so that two concurrent
/// requests cannot both observe the same count.
pub struct StateSlot<V> {
    retention_millis: AtomicU64,
    state: Mutex<V>,
}

impl<V> StateSlot<V> {
    fn new(state: V, retention: Duration) -> Self {
        Self {
            retention_millis: AtomicU64::new(retention.as_millis() as u64),
            state: Mutex::new(state),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, V> {
        self.state.lock().await
    }

    fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_millis.load(Ordering::Relaxed))
    }

    fn set_retention(&self, retention: Duration) {
        self.retention_millis
            .store(retention.as_millis() as u64, Ordering::Relaxed);
    }
}

/// Idle entries are evicted once their retention passes without access.
pub struct SlotExpiry;

impl<K, V> Expiry<K, Arc<StateSlot<V>>> for SlotExpiry {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &Arc<StateSlot<V>>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.retention())
    }

    fn expire_after_read(
        &self,
        _key: &K,
        value: &Arc<StateSlot<V>>,
        _read_at: Instant,
        _duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        Some(value.retention())
    }
}

/// Table of per-key state with idle eviction.
///
/// Entries leave only once their retention passes untouched. There is no
/// size bound: a live counter or block must never be dropped to make room.
pub struct StateTable<K, V> {
    slots: Cache<K, Arc<StateSlot<V>>>,
}

impl<K, V> StateTable<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        let slots = Cache::builder().expire_after(SlotExpiry).build();
        Self { slots }
    }

    /// Fetch the slot for `key`, creating it from `init` on first observation.
    ///
    /// `retention` is how long the slot survives without being touched again.
    pub async fn slot(
        &self,
        key: K,
        retention: Duration,
        init: impl FnOnce() -> V,
    ) -> Arc<StateSlot<V>> {
        let slot = self
            .slots
            .get_with(key, async move { Arc::new(StateSlot::new(init(), retention)) })
            .await;
        slot.set_retention(retention);
        slot
    }

    /// Fetch an existing slot without creating one
    pub async fn get(&self, key: &K) -> Option<Arc<StateSlot<V>>> {
        self.slots.get(key).await
    }

    pub async fn remove(&self, key: &K) {
        self.slots.invalidate(key).await;
    }

    /// Number of live entries, after flushing pending maintenance
    pub async fn len(&self) -> u64 {
        self.slots.run_pending_tasks().await;
        self.slots.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<K, V> Default for StateTable<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
