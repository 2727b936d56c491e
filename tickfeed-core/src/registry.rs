//! Concurrent, resizable key/value registry
//!
//! The table is split into buckets that are locked independently, so
//! operations on different keys rarely contend. A single table-wide lock is
//! taken in shared mode by every operation and in exclusive mode only while
//! the table is being resized.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

/// Bucket count used by [`ConcurrentRegistry::new`]
pub const DEFAULT_BUCKETS: usize = 16;

/// Resize once `len > LOAD_FACTOR * buckets`
const LOAD_FACTOR: f64 = 0.75;

type Bucket<K, V> = RwLock<Vec<(K, V)>>;

fn new_table<K, V>(buckets: usize) -> Vec<Bucket<K, V>> {
    (0..buckets).map(|_| RwLock::new(Vec::new())).collect()
}

fn exceeds_load(len: usize, buckets: usize) -> bool {
    len as f64 > LOAD_FACTOR * buckets as f64
}

/// Thread-safe hash map with per-bucket locking
///
/// Values are handed out by clone; no reference into the table ever escapes
/// a lock. None of the operations block on I/O, so callers may use the
/// registry freely from async code as long as they do not hold the result of
/// one call's closure across an `.await`.
pub struct ConcurrentRegistry<K, V, S = RandomState> {
    /// Table-wide lock: shared for entry operations, exclusive for resizing
    table: RwLock<Vec<Bucket<K, V>>>,
    len: AtomicUsize,
    hasher: S,
}

impl<K, V> ConcurrentRegistry<K, V, RandomState>
where
    K: Hash + Eq,
{
    /// Create a registry with [`DEFAULT_BUCKETS`] buckets
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS)
    }

    /// Create a registry with the given initial bucket count (at least 1)
    pub fn with_buckets(buckets: usize) -> Self {
        Self::with_buckets_and_hasher(buckets, RandomState::new())
    }
}

impl<K, V, S> ConcurrentRegistry<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    pub fn with_buckets_and_hasher(buckets: usize, hasher: S) -> Self {
        Self {
            table: RwLock::new(new_table(buckets.max(1))),
            len: AtomicUsize::new(0),
            hasher,
        }
    }

    fn index_of<Q>(&self, key: &Q, buckets: usize) -> usize
    where
        Q: Hash + ?Sized,
    {
        (self.hasher.hash_one(key) % buckets as u64) as usize
    }

    /// Insert or overwrite a value, returning the previous one
    ///
    /// Overwriting does not change the element count. If the insert pushes
    /// the load over the threshold the table is resized before returning.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let (previous, needs_resize) = {
            let table = self.table.read();
            let mut bucket = table[self.index_of(&key, table.len())].write();

            if let Some((_, slot)) = bucket.iter_mut().find(|(k, _)| *k == key) {
                (Some(std::mem::replace(slot, value)), false)
            } else {
                bucket.push((key, value));
                let len = self.len.fetch_add(1, Ordering::AcqRel) + 1;
                (None, exceeds_load(len, table.len()))
            }
        };

        if needs_resize {
            self.resize();
        }
        previous
    }

    /// Look up a value by key
    pub fn find<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let table = self.table.read();
        let bucket = table[self.index_of(key, table.len())].read();
        bucket
            .iter()
            .find(|(k, _)| k.borrow() == key)
            .map(|(_, v)| v.clone())
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let table = self.table.read();
        let bucket = table[self.index_of(key, table.len())].read();
        bucket.iter().any(|(k, _)| k.borrow() == key)
    }

    /// Remove an entry, returning whether it existed
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.take(key).is_some()
    }

    /// Remove an entry and return its value
    pub fn take<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let table = self.table.read();
        let mut bucket = table[self.index_of(key, table.len())].write();
        let pos = bucket.iter().position(|(k, _)| k.borrow() == key)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(bucket.swap_remove(pos).1)
    }

    /// Atomically read-modify-write a single entry
    ///
    /// The closure sees `Some(value)` if the key exists and `None` otherwise.
    /// Whatever it leaves behind is stored: `Some` creates or replaces the
    /// entry, `None` deletes it. The bucket stays locked for the duration of
    /// the closure, so it must not call back into this registry.
    pub fn alter<R>(&self, key: K, f: impl FnOnce(&mut Option<V>) -> R) -> R {
        let (result, needs_resize) = {
            let table = self.table.read();
            let mut bucket = table[self.index_of(&key, table.len())].write();

            let existed = bucket.iter().position(|(k, _)| *k == key);
            let mut slot = existed.map(|pos| bucket.swap_remove(pos).1);
            let result = f(&mut slot);

            let mut needs_resize = false;
            match (existed.is_some(), slot) {
                (true, Some(value)) => bucket.push((key, value)),
                (false, Some(value)) => {
                    bucket.push((key, value));
                    let len = self.len.fetch_add(1, Ordering::AcqRel) + 1;
                    needs_resize = exceeds_load(len, table.len());
                }
                (true, None) => {
                    self.len.fetch_sub(1, Ordering::AcqRel);
                }
                (false, None) => {}
            }
            (result, needs_resize)
        };

        if needs_resize {
            self.resize();
        }
        result
    }

    /// Grow the table and rehash every entry
    ///
    /// Callers race to get here; whoever arrives after a completed resize
    /// sees the load back under the threshold and returns.
    fn resize(&self) {
        let mut table = self.table.write();
        let len = self.len.load(Ordering::Acquire);
        if !exceeds_load(len, table.len()) {
            return;
        }

        let mut buckets = table.len() * 2;
        while exceeds_load(len, buckets) {
            buckets *= 2;
        }

        let mut next: Vec<Bucket<K, V>> = new_table(buckets);
        for bucket in table.drain(..) {
            for (key, value) in bucket.into_inner() {
                let idx = self.index_of(&key, buckets);
                next[idx].get_mut().push((key, value));
            }
        }
        *table = next;
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current number of buckets
    pub fn bucket_count(&self) -> usize {
        self.table.read().len()
    }

    /// Snapshot of all entries
    ///
    /// Buckets are visited one at a time, so the snapshot is consistent per
    /// key but not across keys while writers are active.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let table = self.table.read();
        let mut entries = Vec::with_capacity(self.len());
        for bucket in table.iter() {
            entries.extend(bucket.read().iter().cloned());
        }
        entries
    }
}

impl<K, V> Default for ConcurrentRegistry<K, V, RandomState>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> std::fmt::Debug for ConcurrentRegistry<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentRegistry")
            .field("len", &self.len())
            .field("buckets", &self.bucket_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_insert_find_remove() {
        let registry: ConcurrentRegistry<String, u32> = ConcurrentRegistry::new();
        assert!(registry.is_empty());

        assert_eq!(registry.insert("BTC".to_string(), 1), None);
        assert_eq!(registry.find("BTC"), Some(1));
        assert_eq!(registry.find("ETH"), None);

        assert!(registry.remove("BTC"));
        assert!(!registry.remove("BTC"));
        assert_eq!(registry.find("BTC"), None);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_duplicate_insert_overwrites_without_growing() {
        let registry = ConcurrentRegistry::new();
        registry.insert("BTC", 1);
        assert_eq!(registry.insert("BTC", 2), Some(1));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find("BTC"), Some(2));
    }

    #[test]
    fn test_growth_keeps_every_entry() {
        let registry = ConcurrentRegistry::with_buckets(2);
        for i in 0..10_000u32 {
            registry.insert(i, i * 2);
        }

        assert_eq!(registry.len(), 10_000);
        assert!(registry.bucket_count() >= 10_000 * 4 / 3);
        for i in 0..10_000u32 {
            assert_eq!(registry.find(&i), Some(i * 2), "lost key {}", i);
        }
    }

    #[test]
    fn test_take_returns_value() {
        let registry = ConcurrentRegistry::new();
        registry.insert(7u64, vec!["a", "b"]);
        assert_eq!(registry.take(&7), Some(vec!["a", "b"]));
        assert_eq!(registry.take(&7), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_alter_creates_updates_and_deletes() {
        let registry: ConcurrentRegistry<&str, Vec<u32>> = ConcurrentRegistry::new();

        registry.alter("BTC", |entry| entry.get_or_insert_with(Vec::new).push(1));
        registry.alter("BTC", |entry| entry.get_or_insert_with(Vec::new).push(2));
        assert_eq!(registry.find("BTC"), Some(vec![1, 2]));
        assert_eq!(registry.len(), 1);

        let removed = registry.alter("BTC", |entry| entry.take());
        assert_eq!(removed, Some(vec![1, 2]));
        assert!(!registry.contains_key("BTC"));
        assert_eq!(registry.len(), 0);

        // Leaving an absent entry absent is a no-op
        registry.alter("ETH", |entry| assert!(entry.is_none()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_alter_triggers_resize() {
        let registry = ConcurrentRegistry::with_buckets(1);
        for i in 0..100u32 {
            registry.alter(i, |entry| *entry = Some(i));
        }
        assert_eq!(registry.len(), 100);
        assert!(registry.bucket_count() > 100);
        assert!((0..100u32).all(|i| registry.find(&i) == Some(i)));
    }

    #[test]
    fn test_concurrent_inserts_across_resizes() {
        let registry = Arc::new(ConcurrentRegistry::with_buckets(1));
        let threads = 8u32;
        let per_thread = 2_000u32;

        thread::scope(|scope| {
            for t in 0..threads {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    for i in 0..per_thread {
                        let key = t * per_thread + i;
                        registry.insert(key, key);
                        // Every key this thread wrote stays visible through resizes
                        assert_eq!(registry.find(&key), Some(key));
                    }
                });
            }
        });

        assert_eq!(registry.len(), (threads * per_thread) as usize);
        let keys: HashSet<u32> = registry.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), (threads * per_thread) as usize);
    }

    #[test]
    fn test_concurrent_mixed_operations() {
        let registry = Arc::new(ConcurrentRegistry::with_buckets(4));

        // Stable keys that are never removed must survive every resize
        for i in 0..500u32 {
            registry.insert(i, i);
        }

        thread::scope(|scope| {
            for t in 0..4u32 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    let base = 10_000 + t * 10_000;
                    for i in 0..2_000u32 {
                        registry.insert(base + i, i);
                        if i % 2 == 0 {
                            assert!(registry.remove(&(base + i)));
                        }
                    }
                });
            }
            let reader = Arc::clone(&registry);
            scope.spawn(move || {
                for _ in 0..20 {
                    for i in 0..500u32 {
                        assert_eq!(reader.find(&i), Some(i));
                    }
                }
            });
        });

        // 500 stable keys plus the odd half of each writer's range
        assert_eq!(registry.len(), 500 + 4 * 1_000);
        assert_eq!(registry.entries().len(), registry.len());
    }

    #[test]
    fn test_concurrent_alter_is_atomic_per_key() {
        let registry: Arc<ConcurrentRegistry<&str, u64>> = Arc::new(ConcurrentRegistry::new());

        thread::scope(|scope| {
            for _ in 0..8 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    for _ in 0..1_000 {
                        registry.alter("counter", |entry| *entry = Some(entry.unwrap_or(0) + 1));
                    }
                });
            }
        });

        assert_eq!(registry.find("counter"), Some(8_000));
    }
}
