//! Pending-request tables keyed by correlation id.
//!
//! Each entry owns the task that will report its timeout. Removing an entry
//! by any path drops that task's guard, which aborts the timer, so a
//! resolved entry can never be expired later. Timers report back through a
//! weak sender: they never keep the owning actor alive on their own.
//!
//! Expiry notifications carry the generation of the entry they were armed
//! for. `claim_expired` only removes an entry whose generation still matches,
//! so a timer firing for an entry that was already claimed (and whose key was
//! reused) is a no-op.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type Generation = u64;

/// Aborts the timer task when dropped.
#[derive(Debug)]
struct TimerGuard(JoinHandle<()>);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
struct PendingEntry<V> {
    value: V,
    generation: Generation,
    _timer: TimerGuard,
}

#[derive(Debug)]
pub struct PendingTable<K, V> {
    entries: HashMap<K, PendingEntry<V>>,
    next_generation: Generation,
}

impl<K, V> Default for PendingTable<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_generation: 1,
        }
    }
}

impl<K: Eq + Hash + Clone, V> PendingTable<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry and arm its timer. When the timer fires,
    /// `on_expire(generation)` is sent to `notify`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn insert<C, F>(
        &mut self,
        key: K,
        value: V,
        timeout: Duration,
        notify: &mpsc::WeakSender<C>,
        on_expire: F,
    ) -> Generation
    where
        C: Send + 'static,
        F: FnOnce(Generation) -> C + Send + 'static,
    {
        let generation = self.next_generation;
        self.next_generation += 1;

        let notify = notify.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = notify.upgrade() {
                let _ = tx.send(on_expire(generation)).await;
            }
        });

        self.entries.insert(
            key,
            PendingEntry {
                value,
                generation,
                _timer: TimerGuard(timer),
            },
        );
        generation
    }

    /// Remove an entry for completion. The timer is cancelled before the
    /// value is handed back.
    pub fn claim(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Remove an entry on behalf of its timer.
    pub fn claim_expired(&mut self, key: &K, generation: Generation) -> Option<V> {
        if self.entries.get(key)?.generation != generation {
            return None;
        }
        self.claim(key)
    }

    /// Remove every entry matching `predicate`.
    pub fn claim_where(&mut self, mut predicate: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)> {
        let keys: Vec<K> = self
            .entries
            .iter()
            .filter(|(k, entry)| predicate(k, &entry.value))
            .map(|(k, _)| k.clone())
            .collect();

        keys.into_iter()
            .filter_map(|k| self.claim(&k).map(|v| (k, v)))
            .collect()
    }

    pub fn claim_all(&mut self) -> Vec<(K, V)> {
        self.entries
            .drain()
            .map(|(k, entry)| (k, entry.value))
            .collect()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
