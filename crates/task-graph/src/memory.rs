//! Reference-counted cache of computed pipeline items.
//!
//! Items are keyed by the owning source and the canonical request string of
//! the computation that produced them. Every live reference is represented
//! by a [`Reservation`]; when the last reservation of an item is dropped the
//! item moves to the released LRU, where it stays available until memory
//! pressure evicts it.
//!
//! ```text
//!  store_data / get_or_compute          release (refs == 0)
//!  ─────────────────────────► ACTIVE ─────────────────────► RELEASED (LRU)
//!                               ▲                              │    │
//!                               └──── contains / get_data ─────┘    │ evict under
//!                                                                   ▼ memory pressure
//! ```
//!
//! At most one computation per key is in flight: concurrent
//! [`MemoryManager::get_or_compute`] callers for a pending key wait for the
//! first caller's result instead of computing it again.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use jet_common::{DataItem, JetError, JetResult};
use lru::LruCache;
use serde::Serialize;
use tracing::{debug, error, warn};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a data source owning cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocate a fresh, process-unique identifier.
    pub fn next() -> Self {
        SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// Cache key: owning source plus canonical request string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub owner: SourceId,
    pub request: String,
}

impl CacheKey {
    pub fn new(owner: SourceId, request: impl Into<String>) -> Self {
        Self {
            owner,
            request: request.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.request)
    }
}

type SharedItem = Arc<dyn Any + Send + Sync>;

struct Slot {
    item: SharedItem,
    size_kb: usize,
}

struct ActiveSlot {
    slot: Slot,
    refs: usize,
}

struct CacheState {
    active: HashMap<CacheKey, ActiveSlot>,
    released: LruCache<CacheKey, Slot>,
    pending: HashSet<CacheKey>,
    usage_kb: usize,
}

impl CacheState {
    fn contains(&self, key: &CacheKey) -> bool {
        self.active.contains_key(key) || self.released.contains(key)
    }
}

/// Cache statistics.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub declined_stores: u64,
    pub active_entries: usize,
    pub released_entries: usize,
    pub memory_usage_kb: usize,
    pub memory_limit_kb: usize,
}

impl CacheStats {
    /// Hit rate in percent.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Shared, reference-counted store of computed items.
pub struct MemoryManager {
    identifier: String,
    limit_kb: usize,
    state: Mutex<CacheState>,
    computed: Condvar,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    declined_stores: AtomicU64,
}

impl MemoryManager {
    /// Create a memory manager holding at most `limit_kb` kilobytes.
    pub fn new(identifier: impl Into<String>, limit_kb: usize) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.into(),
            limit_kb,
            state: Mutex::new(CacheState {
                active: HashMap::new(),
                released: LruCache::unbounded(),
                pending: HashSet::new(),
                usage_kb: 0,
            }),
            computed: Condvar::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            declined_stores: AtomicU64::new(0),
        })
    }

    pub fn with_limit_mb(identifier: impl Into<String>, limit_mb: usize) -> Arc<Self> {
        Self::new(identifier, limit_mb * 1024)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn limit_kb(&self) -> usize {
        self.limit_kb
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one reference on a cached item, reactivating it if released.
    fn acquire(state: &mut CacheState, key: &CacheKey) -> Option<SharedItem> {
        if let Some(active) = state.active.get_mut(key) {
            active.refs += 1;
            return Some(active.slot.item.clone());
        }
        let slot = state.released.pop(key)?;
        let item = slot.item.clone();
        state
            .active
            .insert(key.clone(), ActiveSlot { slot, refs: 1 });
        Some(item)
    }

    /// Insert a new active item with one reference.
    ///
    /// Returns Ok(false) if the key is already present.
    fn insert(&self, state: &mut CacheState, key: &CacheKey, slot: Slot) -> JetResult<bool> {
        if state.contains(key) {
            return Ok(false);
        }

        while state.usage_kb + slot.size_kb > self.limit_kb {
            let Some((evicted_key, evicted)) = state.released.pop_lru() else {
                break;
            };
            state.usage_kb -= evicted.size_kb;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(
                cache = %self.identifier,
                key = %evicted_key,
                size_kb = evicted.size_kb,
                "Evicted released item"
            );
        }

        if state.usage_kb + slot.size_kb > self.limit_kb {
            return Err(JetError::MemoryLimitExceeded {
                key: key.to_string(),
                size_kb: slot.size_kb,
                usage_kb: state.usage_kb,
                limit_kb: self.limit_kb,
            });
        }

        state.usage_kb += slot.size_kb;
        state
            .active
            .insert(key.clone(), ActiveSlot { slot, refs: 1 });
        Ok(true)
    }

    fn typed_handle<T: DataItem>(
        self: &Arc<Self>,
        key: CacheKey,
        item: SharedItem,
    ) -> JetResult<CacheHandle<T>> {
        let reservation = Reservation {
            manager: Arc::clone(self),
            key,
        };
        match item.downcast::<T>() {
            Ok(item) => Ok(CacheHandle { item, reservation }),
            Err(_) => Err(JetError::wiring(format!(
                "cached item {} is not of type {}",
                reservation.key,
                std::any::type_name::<T>()
            ))),
        }
    }

    /// Check whether an item is cached, taking a reference if it is.
    ///
    /// A `true` result transfers one reference to the caller, who must give
    /// it back with [`MemoryManager::release_key`]. Prefer
    /// [`MemoryManager::reserve`], which does so on drop.
    pub fn contains_data(&self, owner: SourceId, request: &str) -> bool {
        let key = CacheKey::new(owner, request);
        let mut state = self.lock_state();
        Self::acquire(&mut state, &key).is_some()
    }

    /// Take a reference on a cached item without reading it.
    pub fn reserve(self: &Arc<Self>, owner: SourceId, request: &str) -> Option<Reservation> {
        if self.contains_data(owner, request) {
            Some(Reservation {
                manager: Arc::clone(self),
                key: CacheKey::new(owner, request),
            })
        } else {
            None
        }
    }

    /// True if the item is cached, without taking a reference.
    pub fn is_cached(&self, owner: SourceId, request: &str) -> bool {
        self.lock_state().contains(&CacheKey::new(owner, request))
    }

    /// Store a computed item with an initial reference owned by the caller.
    ///
    /// Returns Ok(None) if another thread already stored the key; the
    /// caller's copy is dropped.
    pub fn store_data<T: DataItem>(
        self: &Arc<Self>,
        owner: SourceId,
        request: &str,
        item: T,
    ) -> JetResult<Option<CacheHandle<T>>> {
        let key = CacheKey::new(owner, request);
        let item = Arc::new(item);
        let slot = Slot {
            item: item.clone(),
            size_kb: item.memory_size_kb(),
        };
        let stored = {
            let mut state = self.lock_state();
            self.insert(&mut state, &key, slot)?
        };
        if !stored {
            self.declined_stores.fetch_add(1, Ordering::Relaxed);
            warn!(cache = %self.identifier, key = %key, "Declined store of existing item");
            return Ok(None);
        }
        Ok(Some(CacheHandle {
            item,
            reservation: Reservation {
                manager: Arc::clone(self),
                key,
            },
        }))
    }

    /// Get a cached item, taking a reference.
    pub fn get_data<T: DataItem>(
        self: &Arc<Self>,
        owner: SourceId,
        request: &str,
    ) -> Option<CacheHandle<T>> {
        let key = CacheKey::new(owner, request);
        let item = {
            let mut state = self.lock_state();
            Self::acquire(&mut state, &key)?
        };
        match self.typed_handle(key, item) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(cache = %self.identifier, error = %e, "Type mismatch on cache read");
                None
            }
        }
    }

    /// Get a cached item or compute and store it.
    ///
    /// Concurrent callers for the same key observe exactly one call to
    /// `compute`; the others block until it finishes and share its result.
    pub fn get_or_compute<T, F>(
        self: &Arc<Self>,
        owner: SourceId,
        request: &str,
        compute: F,
    ) -> JetResult<CacheHandle<T>>
    where
        T: DataItem,
        F: FnOnce() -> JetResult<T>,
    {
        let key = CacheKey::new(owner, request);

        {
            let mut state = self.lock_state();
            loop {
                if let Some(item) = Self::acquire(&mut state, &key) {
                    drop(state);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(cache = %self.identifier, key = %key, "Cache hit");
                    return self.typed_handle(key, item);
                }
                if !state.pending.contains(&key) {
                    break;
                }
                state = self
                    .computed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.pending.insert(key.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(cache = %self.identifier, key = %key, "Cache miss, computing");
        let guard = PendingGuard {
            memory: self,
            key: Some(key.clone()),
        };
        let computed = compute();
        guard.disarm();

        let outcome = {
            let mut state = self.lock_state();
            state.pending.remove(&key);
            match computed {
                Ok(item) => {
                    let size_kb = item.memory_size_kb();
                    let item: SharedItem = Arc::new(item);
                    let slot = Slot {
                        item: item.clone(),
                        size_kb,
                    };
                    match self.insert(&mut state, &key, slot) {
                        Ok(true) => Ok(Some(item)),
                        // Stored directly by another caller meanwhile.
                        Ok(false) => Ok(Self::acquire(&mut state, &key)),
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        };
        self.computed.notify_all();

        match outcome? {
            Some(item) => self.typed_handle(key, item),
            None => Err(JetError::NotActive(key.to_string())),
        }
    }

    /// Give back one reference to an item.
    ///
    /// Items whose count drops to zero become eligible for eviction.
    pub fn release_key(&self, key: &CacheKey) -> JetResult<()> {
        let mut state = self.lock_state();
        let Some(active) = state.active.get_mut(key) else {
            return Err(JetError::NotActive(key.to_string()));
        };
        active.refs -= 1;
        if active.refs == 0 {
            if let Some(active) = state.active.remove(key) {
                state.released.put(key.clone(), active.slot);
            }
        }
        Ok(())
    }

    /// Release a handle. Equivalent to dropping it.
    pub fn release_data<T: DataItem>(&self, handle: CacheHandle<T>) {
        drop(handle);
    }

    /// Current number of references on an item; zero if released or absent.
    pub fn reference_count(&self, owner: SourceId, request: &str) -> usize {
        self.lock_state()
            .active
            .get(&CacheKey::new(owner, request))
            .map_or(0, |a| a.refs)
    }

    /// Drop all released items.
    pub fn clear_cache(&self) {
        let mut state = self.lock_state();
        let mut freed = 0;
        while let Some((_, slot)) = state.released.pop_lru() {
            freed += slot.size_kb;
        }
        state.usage_kb -= freed;
        debug!(cache = %self.identifier, freed_kb = freed, "Cleared released items");
    }

    pub fn memory_usage_kb(&self) -> usize {
        self.lock_state().usage_kb
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock_state();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            declined_stores: self.declined_stores.load(Ordering::Relaxed),
            active_entries: state.active.len(),
            released_entries: state.released.len(),
            memory_usage_kb: state.usage_kb,
            memory_limit_kb: self.limit_kb,
        }
    }
}

/// Clears a pending key if `compute` unwinds, so waiters retry instead of
/// blocking forever.
struct PendingGuard<'a> {
    memory: &'a MemoryManager,
    key: Option<CacheKey>,
}

impl PendingGuard<'_> {
    fn disarm(mut self) {
        self.key = None;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        warn!(cache = %self.memory.identifier, key = %key, "Computation panicked");
        self.memory.lock_state().pending.remove(&key);
        self.memory.computed.notify_all();
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("identifier", &self.identifier)
            .field("limit_kb", &self.limit_kb)
            .finish()
    }
}

/// One reference on a cache entry, given back on drop.
pub struct Reservation {
    manager: Arc<MemoryManager>,
    key: CacheKey,
}

impl Reservation {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release_key(&self.key) {
            error!(cache = %self.manager.identifier, error = %e, "Failed to release cache entry");
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reservation").field(&self.key).finish()
    }
}

/// A referenced, typed cache item.
pub struct CacheHandle<T> {
    item: Arc<T>,
    reservation: Reservation,
}

impl<T> CacheHandle<T> {
    pub fn item(&self) -> &Arc<T> {
        &self.item
    }

    pub fn key(&self) -> &CacheKey {
        &self.reservation.key
    }

    /// True if both handles refer to the same cached object.
    pub fn ptr_eq(a: &CacheHandle<T>, b: &CacheHandle<T>) -> bool {
        Arc::ptr_eq(&a.item, &b.item)
    }

    /// Drop the typed view, keeping the reference.
    pub fn into_reservation(self) -> Reservation {
        self.reservation
    }
}

impl<T> Deref for CacheHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T> fmt::Debug for CacheHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheHandle").field(&self.reservation.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    struct Blob(usize);

    impl DataItem for Blob {
        fn memory_size_kb(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn test_store_then_get_counts_references() {
        let mm = MemoryManager::new("test", 1024);
        let owner = SourceId::next();

        let stored = mm.store_data(owner, "K=1;", Blob(1)).unwrap().unwrap();
        let again = mm.get_data::<Blob>(owner, "K=1;").unwrap();

        assert!(CacheHandle::ptr_eq(&stored, &again));
        assert_eq!(mm.reference_count(owner, "K=1;"), 2);

        drop(stored);
        assert_eq!(mm.reference_count(owner, "K=1;"), 1);
        drop(again);
        assert_eq!(mm.reference_count(owner, "K=1;"), 0);
        assert!(mm.is_cached(owner, "K=1;"));
    }

    #[test]
    fn test_second_store_is_declined() {
        let mm = MemoryManager::new("test", 1024);
        let owner = SourceId::next();

        let _first = mm.store_data(owner, "K=1;", Blob(1)).unwrap().unwrap();
        let second = mm.store_data(owner, "K=1;", Blob(1)).unwrap();

        assert!(second.is_none());
        assert_eq!(mm.reference_count(owner, "K=1;"), 1);
        assert_eq!(mm.stats().declined_stores, 1);
    }

    #[test]
    fn test_keys_are_scoped_by_owner() {
        let mm = MemoryManager::new("test", 1024);
        let a = SourceId::next();
        let b = SourceId::next();

        let _h = mm.store_data(a, "K=1;", Blob(1)).unwrap().unwrap();
        assert!(mm.get_data::<Blob>(b, "K=1;").is_none());
    }

    #[test]
    fn test_contains_reactivates_released_item() {
        let mm = MemoryManager::new("test", 1024);
        let owner = SourceId::next();
        drop(mm.store_data(owner, "K=1;", Blob(1)).unwrap());

        assert_eq!(mm.stats().released_entries, 1);
        let reservation = mm.reserve(owner, "K=1;").unwrap();
        assert_eq!(mm.reference_count(owner, "K=1;"), 1);
        assert_eq!(mm.stats().active_entries, 1);
        drop(reservation);
        assert_eq!(mm.stats().released_entries, 1);
    }

    #[test]
    fn test_release_of_unknown_key_fails() {
        let mm = MemoryManager::new("test", 1024);
        let key = CacheKey::new(SourceId::next(), "K=1;");
        assert!(matches!(mm.release_key(&key), Err(JetError::NotActive(_))));
    }

    #[test]
    fn test_released_items_are_evicted_in_lru_order() {
        let mm = MemoryManager::new("test", 10);
        let owner = SourceId::next();

        drop(mm.store_data(owner, "A;", Blob(4)).unwrap());
        drop(mm.store_data(owner, "B;", Blob(4)).unwrap());
        // Touch A so that B becomes least recently released.
        drop(mm.get_data::<Blob>(owner, "A;"));

        let _c = mm.store_data(owner, "C;", Blob(4)).unwrap().unwrap();

        assert!(mm.is_cached(owner, "A;"));
        assert!(!mm.is_cached(owner, "B;"));
        assert_eq!(mm.stats().evictions, 1);
        assert_eq!(mm.memory_usage_kb(), 8);
    }

    #[test]
    fn test_active_items_are_never_evicted() {
        let mm = MemoryManager::new("test", 10);
        let owner = SourceId::next();

        let _a = mm.store_data(owner, "A;", Blob(8)).unwrap().unwrap();
        let result = mm.store_data(owner, "B;", Blob(4));

        assert!(matches!(result, Err(JetError::MemoryLimitExceeded { .. })));
        assert!(mm.is_cached(owner, "A;"));
    }

    #[test]
    fn test_clear_cache_drops_only_released_items() {
        let mm = MemoryManager::new("test", 100);
        let owner = SourceId::next();

        let _kept = mm.store_data(owner, "A;", Blob(3)).unwrap().unwrap();
        drop(mm.store_data(owner, "B;", Blob(5)).unwrap());
        mm.clear_cache();

        assert!(mm.is_cached(owner, "A;"));
        assert!(!mm.is_cached(owner, "B;"));
        assert_eq!(mm.memory_usage_kb(), 3);
    }

    #[test]
    fn test_get_or_compute_runs_once_under_contention() {
        let mm = MemoryManager::new("test", 1024);
        let owner = SourceId::next();
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mm = Arc::clone(&mm);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    mm.get_or_compute(owner, "K=1;", || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok(Blob(1))
                    })
                    .unwrap()
                })
            })
            .collect();

        let results: Vec<CacheHandle<Blob>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|h| CacheHandle::ptr_eq(h, &results[0])));
        assert_eq!(mm.reference_count(owner, "K=1;"), 8);
    }

    #[test]
    fn test_panicking_compute_releases_waiters() {
        let mm = MemoryManager::new("test", 1024);
        let owner = SourceId::next();

        let panicking = {
            let mm = Arc::clone(&mm);
            thread::spawn(move || {
                let _ = mm.get_or_compute::<Blob, _>(owner, "K=1;", || {
                    thread::sleep(Duration::from_millis(50));
                    panic!("index out of range");
                });
            })
        };
        thread::sleep(Duration::from_millis(10));
        let waiter = {
            let mm = Arc::clone(&mm);
            thread::spawn(move || mm.get_or_compute(owner, "K=1;", || Ok(Blob(2))).unwrap())
        };

        assert!(panicking.join().is_err());
        let handle = waiter.join().unwrap();
        assert_eq!(handle.0, 2);
        assert_eq!(mm.reference_count(owner, "K=1;"), 1);
    }

    #[test]
    fn test_failed_compute_is_not_cached() {
        let mm = MemoryManager::new("test", 1024);
        let owner = SourceId::next();

        let result: JetResult<CacheHandle<Blob>> =
            mm.get_or_compute(owner, "K=1;", || Err(JetError::unavailable("no data")));
        assert!(result.is_err());
        assert!(!mm.is_cached(owner, "K=1;"));

        let retry = mm.get_or_compute(owner, "K=1;", || Ok(Blob(1)));
        assert!(retry.is_ok());
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        struct Other;
        impl DataItem for Other {
            fn memory_size_kb(&self) -> usize {
                1
            }
        }

        let mm = MemoryManager::new("test", 1024);
        let owner = SourceId::next();
        let _h = mm.store_data(owner, "K=1;", Blob(1)).unwrap().unwrap();

        assert!(mm.get_data::<Other>(owner, "K=1;").is_none());
        // The failed read gave its reference back.
        assert_eq!(mm.reference_count(owner, "K=1;"), 1);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 75.0);
    }
}
