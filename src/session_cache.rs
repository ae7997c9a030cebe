//! Reference-counted registry of shared session state.
//!
//! ```text
//! SessionCache
//!   RwLock<HashMap<partition id, Arc<Entry>>>   write-locked only to insert or tear down
//!     Entry { core: Arc<SessionCore>, Mutex<{ refs, last_used }> }
//! ```
//!
//! `acquire` on a live entry takes the read lock plus that entry's mutex,
//! so sessions for unrelated partitions never wait on each other.
//! An entry at zero references stays warm for reuse. It is torn down when it
//! has been idle for the TTL, when the registry is over capacity (least
//! recently used idle entries first), or when the factory closes. An entry
//! with outstanding references is only torn down by factory close.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::clock::{self, Clock};
use crate::session::SessionCore;

struct Usage {
    refs: usize,
    last_used: DateTime<Utc>,
}

struct Entry {
    core: Arc<SessionCore>,
    usage: Mutex<Usage>,
}

pub(crate) struct SessionCache {
    max_size: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, Arc<Entry>>>,
}

impl SessionCache {
    pub(crate) fn new(max_size: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_size: max_size.max(1),
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Take a reference to the shared state for `partition_id`, building it
    /// with `create` when no live entry exists.
    pub(crate) fn acquire<F>(&self, partition_id: &str, create: F) -> Arc<SessionCore>
    where
        F: FnOnce() -> SessionCore,
    {
        let now = self.clock.now();
        if let Some(core) = self.try_acquire(&self.entries.read(), partition_id, now) {
            return core;
        }

        let mut entries = self.entries.write();
        if let Some(core) = self.try_acquire(&entries, partition_id, now) {
            return core;
        }
        if let Some(stale) = entries.remove(partition_id) {
            debug!(partition = partition_id, "session cache entry expired");
            stale.core.retire();
        }

        let core = Arc::new(create());
        entries.insert(
            partition_id.to_owned(),
            Arc::new(Entry {
                core: Arc::clone(&core),
                usage: Mutex::new(Usage {
                    refs: 1,
                    last_used: now,
                }),
            }),
        );
        self.sweep(&mut entries, now);
        core
    }

    fn try_acquire(
        &self,
        entries: &HashMap<String, Arc<Entry>>,
        partition_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Arc<SessionCore>> {
        let entry = entries.get(partition_id)?;
        let mut usage = entry.usage.lock();
        if usage.refs == 0 && clock::elapsed(now, usage.last_used) >= self.ttl {
            return None;
        }
        usage.refs += 1;
        usage.last_used = now;
        Some(Arc::clone(&entry.core))
    }

    /// Give back a reference taken by `acquire`. A release for state that
    /// has already been torn down is ignored.
    pub(crate) fn release(&self, core: &Arc<SessionCore>) {
        let entries = self.entries.read();
        let Some(entry) = entries.get(core.partition().id()) else {
            return;
        };
        if !Arc::ptr_eq(&entry.core, core) {
            return;
        }
        let mut usage = entry.usage.lock();
        usage.refs = usage.refs.saturating_sub(1);
        usage.last_used = self.clock.now();
    }

    /// Tear down idle entries past the TTL, then idle entries in LRU order
    /// until the registry fits.
    fn sweep(&self, entries: &mut HashMap<String, Arc<Entry>>, now: DateTime<Utc>) {
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| {
                let usage = entry.usage.lock();
                usage.refs == 0 && clock::elapsed(now, usage.last_used) >= self.ttl
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(entry) = entries.remove(&id) {
                entry.core.retire();
            }
        }

        while entries.len() > self.max_size {
            let victim = entries
                .iter()
                .filter_map(|(id, entry)| {
                    let usage = entry.usage.lock();
                    (usage.refs == 0).then(|| (id.clone(), usage.last_used))
                })
                .min_by_key(|(_, last_used)| *last_used)
                .map(|(id, _)| id);
            let Some(id) = victim else {
                break;
            };
            if let Some(entry) = entries.remove(&id) {
                debug!(partition = %id, "session cache entry evicted");
                entry.core.retire();
            }
        }
    }

    /// Tear down every entry, referenced or not.
    pub(crate) fn close(&self) {
        let drained: Vec<Arc<Entry>> = self.entries.write().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.core.retire();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Outstanding references for `partition_id`, if it has an entry.
    pub(crate) fn refs(&self, partition_id: &str) -> Option<usize> {
        self.entries
            .read()
            .get(partition_id)
            .map(|entry| entry.usage.lock().refs)
    }
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("max_size", &self.max_size)
            .field("ttl", &self.ttl)
            .field("len", &self.len())
            .finish()
    }
}
