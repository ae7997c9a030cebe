//! Cache of unwrapped system and intermediate keys.
//!
//! Layout:
//! ```text
//! KeyCache
//!   RwLock<HashMap<key id, Arc<Slot>>>    write-locked only for a new id
//!     Slot
//!       entries:     Mutex<Entries>       held only to read or insert
//!         created -> (Arc<CryptoKey>, loaded_at, last_used)
//!         latest: created of the newest key handed out for encryption
//!       latest_load: Mutex<()>            one latest load per id at a time
//!       exact_loads: created -> Arc<Mutex<()>>  one load per version at a time
//! ```
//!
//! Lookups take the `entries` lock just long enough to copy out an `Arc`, so
//! a hit never waits behind a load. A miss runs its loader under a load guard
//! instead: concurrent misses for the same version load once, and a latest
//! miss is serialized per id so one process creates at most one new key at a
//! time.
//!
//! Entries are handed out as `Arc<CryptoKey>`. Evicting an entry drops the
//! cache's handle only; callers holding a clone keep a valid key until they
//! drop it, at which point the bytes are zeroised.
//!
//! Expiry is lazy. An entry older than the revoke-check interval is treated
//! as a miss and reloaded, which is how a revocation recorded in the
//! metastore becomes visible.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::clock::{self, Clock};
use crate::error::KeystrataError;
use crate::keys::{CryptoKey, KeyMeta};
use crate::metrics::Metrics;

struct Entry {
    key: Arc<CryptoKey>,
    loaded_at: DateTime<Utc>,
    last_used: u64,
}

#[derive(Default)]
struct Entries {
    entries: HashMap<i64, Entry>,
    latest: Option<i64>,
    tick: u64,
}

impl Entries {
    fn fresh(&mut self, created: i64, now: DateTime<Utc>, ttl: Duration) -> Option<Arc<CryptoKey>> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(&created)?;
        if clock::elapsed(now, entry.loaded_at) >= ttl {
            return None;
        }
        entry.last_used = tick;
        Some(Arc::clone(&entry.key))
    }

    fn insert(&mut self, key: CryptoKey, now: DateTime<Utc>, max_entries: usize) -> Arc<CryptoKey> {
        self.tick += 1;
        let key = Arc::new(key);
        self.entries.insert(
            key.created(),
            Entry {
                key: Arc::clone(&key),
                loaded_at: now,
                last_used: self.tick,
            },
        );
        self.evict(max_entries);
        key
    }

    /// Drop least recently used entries until at most `max_entries` remain.
    /// The latest key is kept whenever another victim exists.
    fn evict(&mut self, max_entries: usize) {
        while self.entries.len() > max_entries.max(1) {
            let victim = self
                .entries
                .iter()
                .filter(|(created, _)| Some(**created) != self.latest)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(created, _)| *created);
            match victim {
                Some(created) => {
                    self.entries.remove(&created);
                }
                None => break,
            }
        }
    }
}

#[derive(Default)]
struct Slot {
    entries: Mutex<Entries>,
    latest_load: Mutex<()>,
    exact_loads: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Slot {
    fn exact_guard(&self, created: i64) -> Arc<Mutex<()>> {
        Arc::clone(self.exact_loads.lock().entry(created).or_default())
    }

    /// Forget the guard for `created` once no other loader holds it.
    fn release_exact_guard(&self, created: i64, guard: Arc<Mutex<()>>) {
        let mut loads = self.exact_loads.lock();
        drop(guard);
        // Only the map's reference is left once every loader has released.
        if loads
            .get(&created)
            .is_some_and(|guard| Arc::strong_count(guard) == 1)
        {
            loads.remove(&created);
        }
    }
}

/// Per-id key cache. Cheap to share behind an `Arc`.
pub struct KeyCache {
    name: &'static str,
    enabled: bool,
    max_entries: usize,
    revoke_check_interval: Duration,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
}

impl KeyCache {
    pub fn new(
        name: &'static str,
        enabled: bool,
        max_entries: usize,
        revoke_check_interval: Duration,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        Self {
            name,
            enabled,
            max_entries,
            revoke_check_interval,
            clock,
            metrics,
            slots: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, key_id: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().get(key_id) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(key_id.to_owned()).or_default())
    }

    fn lookup(&self, slot: &Slot, created: i64) -> Option<Arc<CryptoKey>> {
        slot.entries
            .lock()
            .fresh(created, self.clock.now(), self.revoke_check_interval)
    }

    fn lookup_latest<P>(&self, slot: &Slot, is_usable: &P) -> Option<Arc<CryptoKey>>
    where
        P: Fn(&CryptoKey) -> bool,
    {
        let key = {
            let mut entries = slot.entries.lock();
            let created = entries.latest?;
            entries.fresh(created, self.clock.now(), self.revoke_check_interval)?
        };
        is_usable(&key).then_some(key)
    }

    fn insert(&self, slot: &Slot, key: CryptoKey, latest: bool) -> Arc<CryptoKey> {
        let mut entries = slot.entries.lock();
        if latest {
            entries.latest = Some(key.created());
        }
        entries.insert(key, self.clock.now(), self.max_entries)
    }

    /// The key named exactly by `meta`, loading it on a miss.
    pub fn get_or_load<F>(&self, meta: &KeyMeta, load: F) -> Result<Arc<CryptoKey>, KeystrataError>
    where
        F: FnOnce() -> Result<CryptoKey, KeystrataError>,
    {
        if !self.enabled {
            return load().map(Arc::new);
        }
        let slot = self.slot(&meta.id);
        if let Some(key) = self.lookup(&slot, meta.created) {
            self.metrics.cache_hit(self.name);
            return Ok(key);
        }
        self.metrics.cache_miss(self.name);
        tracing::debug!(cache = self.name, key = %meta, "key cache miss");

        let guard = slot.exact_guard(meta.created);
        let result = {
            let _loading = guard.lock();
            // A concurrent miss on this version may have filled it meanwhile.
            match self.lookup(&slot, meta.created) {
                Some(key) => Ok(key),
                None => load().map(|key| self.insert(&slot, key, false)),
            }
        };
        slot.release_exact_guard(meta.created, guard);
        result
    }

    /// The newest key for `key_id` that passes `is_usable`, calling `load` to
    /// produce one when the cached latest is missing, stale or unusable.
    ///
    /// `load` must return a key for `key_id`; it becomes the new latest.
    pub fn get_or_load_latest<P, F>(
        &self,
        key_id: &str,
        is_usable: P,
        load: F,
    ) -> Result<Arc<CryptoKey>, KeystrataError>
    where
        P: Fn(&CryptoKey) -> bool,
        F: FnOnce() -> Result<CryptoKey, KeystrataError>,
    {
        if !self.enabled {
            return load().map(Arc::new);
        }
        let slot = self.slot(key_id);
        if let Some(key) = self.lookup_latest(&slot, &is_usable) {
            self.metrics.cache_hit(self.name);
            return Ok(key);
        }
        self.metrics.cache_miss(self.name);
        tracing::debug!(cache = self.name, key_id, "latest key cache miss");

        let _loading = slot.latest_load.lock();
        if let Some(key) = self.lookup_latest(&slot, &is_usable) {
            return Ok(key);
        }
        let key = load()?;
        Ok(self.insert(&slot, key, true))
    }

    /// Number of cached keys across all ids.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .values()
            .map(|slot| slot.entries.lock().entries.len())
            .sum()
    }

    /// Drop every cached handle.
    pub fn clear(&self) {
        self.slots.write().clear();
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::{MetricsRecorder, MetricsSink};

    const ID: &str = "_IK_a_svc_prod";

    fn cache(clock: Arc<ManualClock>, enabled: bool, max_entries: usize) -> KeyCache {
        KeyCache::new(
            "test",
            enabled,
            max_entries,
            Duration::from_secs(60),
            clock,
            Metrics::default(),
        )
    }

    fn key(created: i64, revoked: bool) -> CryptoKey {
        CryptoKey::from_slice(KeyMeta::new(ID, created), revoked, &[created as u8; 32]).unwrap()
    }

    #[test]
    fn hit_does_not_call_loader() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let cache = cache(clock, true, 8);
        let loads = Cell::new(0);
        for _ in 0..3 {
            let k = cache
                .get_or_load(&KeyMeta::new(ID, 60), || {
                    loads.set(loads.get() + 1);
                    Ok(key(60, false))
                })
                .unwrap();
            assert_eq!(k.created(), 60);
        }
        assert_eq!(loads.get(), 1);
    }

    #[test]
    fn disabled_cache_always_loads() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let cache = cache(clock, false, 8);
        let loads = Cell::new(0);
        for _ in 0..3 {
            cache
                .get_or_load_latest(ID, |_| true, || {
                    loads.set(loads.get() + 1);
                    Ok(key(60, false))
                })
                .unwrap();
        }
        assert_eq!(loads.get(), 3);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn stale_entries_are_reloaded_after_check_interval() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let cache = cache(Arc::clone(&clock), true, 8);
        let loads = Cell::new(0);
        let load = || {
            loads.set(loads.get() + 1);
            Ok(key(60, false))
        };
        cache.get_or_load_latest(ID, |_| true, load).unwrap();
        clock.advance(Duration::from_secs(59));
        cache.get_or_load_latest(ID, |_| true, load).unwrap();
        assert_eq!(loads.get(), 1);
        clock.advance(Duration::from_secs(1));
        cache.get_or_load_latest(ID, |_| true, load).unwrap();
        assert_eq!(loads.get(), 2);
    }

    #[test]
    fn unusable_latest_triggers_load() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let cache = cache(clock, true, 8);
        cache
            .get_or_load_latest(ID, |_| true, || Ok(key(60, true)))
            .unwrap();
        let fresh = cache
            .get_or_load_latest(ID, |k| !k.is_revoked(), || Ok(key(120, false)))
            .unwrap();
        assert_eq!(fresh.created(), 120);
        let exact_old = cache
            .get_or_load(&KeyMeta::new(ID, 60), || panic!("old key should still be cached"))
            .unwrap();
        assert!(exact_old.is_revoked());
    }

    #[test]
    fn lru_eviction_keeps_latest_and_outstanding_handles() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let cache = cache(clock, true, 2);
        let latest = cache
            .get_or_load_latest(ID, |_| true, || Ok(key(300, false)))
            .unwrap();
        let held = cache.get_or_load(&KeyMeta::new(ID, 60), || Ok(key(60, false))).unwrap();
        cache.get_or_load(&KeyMeta::new(ID, 120), || Ok(key(120, false))).unwrap();

        assert_eq!(cache.len(), 2);
        // 60 was evicted, but the handle taken before eviction still works.
        assert_eq!(held.as_bytes(), &[60u8; 32]);
        let reloaded = Cell::new(false);
        cache
            .get_or_load(&KeyMeta::new(ID, 60), || {
                reloaded.set(true);
                Ok(key(60, false))
            })
            .unwrap();
        assert!(reloaded.get());
        assert_eq!(latest.created(), 300);
        cache
            .get_or_load_latest(ID, |_| true, || panic!("latest should survive eviction"))
            .unwrap();
    }

    #[test]
    fn loader_errors_are_not_cached() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let cache = cache(clock, true, 8);
        let meta = KeyMeta::new(ID, 60);
        assert!(cache
            .get_or_load(&meta, || Err(KeystrataError::KeyNotFound(ID.into())))
            .is_err());
        assert!(cache.get_or_load(&meta, || Ok(key(60, false))).is_ok());
    }

    #[test]
    fn hits_do_not_wait_for_a_slow_load_on_the_same_id() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let cache = cache(clock, true, 8);
        cache
            .get_or_load_latest(ID, |_| true, || Ok(key(300, false)))
            .unwrap();
        cache.get_or_load(&KeyMeta::new(ID, 60), || Ok(key(60, false))).unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (hit_tx, hit_rx) = mpsc::channel();
        let cache = &cache;
        thread::scope(|s| {
            s.spawn(move || {
                cache.get_or_load(&KeyMeta::new(ID, 42), || {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Err(KeystrataError::KeyNotFound(ID.into()))
                })
            });
            started_rx.recv().unwrap();

            s.spawn(move || {
                let latest = cache
                    .get_or_load_latest(ID, |_| true, || panic!("latest is cached"))
                    .unwrap();
                let exact = cache
                    .get_or_load(&KeyMeta::new(ID, 60), || panic!("version 60 is cached"))
                    .unwrap();
                hit_tx.send((latest.created(), exact.created())).unwrap();
            });
            let hits = hit_rx.recv_timeout(Duration::from_secs(5));
            release_tx.send(()).unwrap();
            assert_eq!(hits.unwrap(), (300, 60));
        });
    }

    #[test]
    fn concurrent_misses_on_one_version_load_once() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let cache = cache(clock, true, 8);
        let loads = std::sync::atomic::AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    cache
                        .get_or_load(&KeyMeta::new(ID, 60), || {
                            loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok(key(60, false))
                        })
                        .unwrap()
                });
            }
        });
        assert_eq!(loads.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(cache.slot(ID).exact_loads.lock().is_empty());
    }

    #[test]
    fn hits_and_misses_are_counted() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let recorder = Arc::new(MetricsRecorder::new());
        let cache = KeyCache::new(
            "intermediate",
            true,
            8,
            Duration::from_secs(60),
            clock,
            Metrics::new(vec![recorder.clone() as Arc<dyn MetricsSink>]),
        );
        cache
            .get_or_load_latest(ID, |_| true, || Ok(key(60, false)))
            .unwrap();
        cache
            .get_or_load_latest(ID, |_| true, || Ok(key(60, false)))
            .unwrap();
        cache.get_or_load(&KeyMeta::new(ID, 60), || Ok(key(60, false))).unwrap();
        cache.get_or_load(&KeyMeta::new(ID, 120), || Ok(key(120, false))).unwrap();

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.intermediate_cache_hits, 2);
        assert_eq!(snapshot.intermediate_cache_misses, 2);
        assert_eq!(snapshot.system_cache_hits + snapshot.system_cache_misses, 0);
    }
}
