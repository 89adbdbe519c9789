use std::{
    cmp::min,
    collections::{HashMap, HashSet, VecDeque},
    fmt::Debug,
    hash::Hash,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use crate::encoding::keycode::PackKey;
use crate::pack::block::Block;

/// Maximum frequency limit for an entry in the cache.
const MAX_FREQUENCY_LIMIT: u8 = 3;

/// Cache key of one column block: the data bucket it was read from and
/// its pack key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub bucket: Arc<str>,
    pub key: PackKey,
}

/// Cache of decoded column blocks keyed by their storage location.
///
/// Values are shared handles. The cache never owns a loaded pack, it only
/// lets readers skip decoding a block they have seen before.
pub type BlockCache = Cache<BlockKey, Arc<Block>>;

/// One index's view of a [`BlockCache`] that may be shared with other
/// indexes. Lookups and removals only touch blocks of its own data bucket.
#[derive(Clone)]
pub struct BucketCache {
    bucket: Arc<str>,
    inner: Arc<Mutex<BlockCache>>,
}

impl BucketCache {
    pub fn new(bucket: &str, inner: Arc<Mutex<BlockCache>>) -> Self {
        Self {
            bucket: Arc::from(bucket),
            inner,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BlockCache> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn block_key(&self, key: PackKey) -> BlockKey {
        BlockKey {
            bucket: self.bucket.clone(),
            key,
        }
    }

    pub fn get(&self, key: PackKey) -> Option<Arc<Block>> {
        self.lock().get(&self.block_key(key))
    }

    pub fn insert(&self, key: PackKey, block: Arc<Block>) {
        let k = self.block_key(key);
        self.lock().insert(k, block);
    }

    pub fn remove(&self, key: PackKey) -> bool {
        let k = self.block_key(key);
        self.lock().remove(&k)
    }

    /// Drops every cached block, including those of other indexes.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Returns (hits, misses) of the underlying cache.
    pub fn stats(&self) -> (usize, usize) {
        self.lock().stats()
    }
}

struct Entry<V> {
    value: V,
    freq: AtomicU8,
}

/// S3-FIFO style cache: new keys enter the small queue, keys read again
/// before eviction are promoted to the main queue, and keys evicted from
/// the small queue are remembered as ghosts so a quick re-insert goes
/// straight to main.
pub struct Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    max_main_size: usize,
    max_cache_size: usize,
    /// new entries are added to this queue
    small: VecDeque<K>,
    /// entries that have been accessed at least twice are moved to this queue
    main: VecDeque<K>,
    /// keys evicted from small before being accessed twice
    ghost: VecDeque<K>,
    ghost_set: HashSet<K>,
    /// live entries
    entries: HashMap<K, Entry<V>>,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(max_cache_size: usize) -> Self {
        let max_cache_size = max_cache_size.max(1);
        let max_small_size = max_cache_size / 10;
        let max_main_size = max_cache_size - max_small_size;

        Cache {
            max_main_size,
            max_cache_size,
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            ghost_set: HashSet::new(),
            entries: HashMap::new(),
            stats: Stats::default(),
        }
    }

    /// Returns a clone of the value for `key` if it is cached.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            let freq = min(entry.freq.load(Ordering::Relaxed) + 1, MAX_FREQUENCY_LIMIT);
            entry.freq.store(freq, Ordering::Relaxed);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.value.clone())
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            return;
        }

        while self.len() >= self.max_cache_size {
            self.evict();
        }

        let entry = Entry {
            value,
            freq: AtomicU8::new(0),
        };
        if self.ghost_set.remove(&key) {
            self.ghost.retain(|k| k != &key);
            self.main.push_back(key.clone());
        } else {
            self.small.push_back(key.clone());
        }
        self.entries.insert(key, entry);
    }

    /// Drops `key` from the cache, returning whether it was present.
    pub fn remove(&mut self, key: &K) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        self.small.retain(|k| k != key);
        self.main.retain(|k| k != key);
        true
    }

    pub fn clear(&mut self) {
        self.small.clear();
        self.main.clear();
        self.ghost.clear();
        self.ghost_set.clear();
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns (hits, misses).
    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
        )
    }

    fn evict(&mut self) {
        if self.main.len() >= self.max_main_size || self.small.is_empty() {
            self.evict_main();
        } else {
            self.evict_small();
        }
    }

    fn evict_main(&mut self) {
        while let Some(key) = self.main.pop_front() {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            let freq = entry.freq.load(Ordering::Relaxed);
            if freq > 0 {
                entry.freq.store(freq - 1, Ordering::Relaxed);
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                return;
            }
        }
    }

    fn evict_small(&mut self) {
        while let Some(key) = self.small.pop_front() {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            if entry.freq.load(Ordering::Relaxed) > 1 {
                self.main.push_back(key);
            } else {
                self.entries.remove(&key);
                self.push_ghost(key);
                return;
            }
        }
    }

    fn push_ghost(&mut self, key: K) {
        if self.ghost.len() >= self.max_cache_size {
            if let Some(old) = self.ghost.pop_front() {
                self.ghost_set.remove(&old);
            }
        }
        self.ghost_set.insert(key.clone());
        self.ghost.push_back(key);
    }
}

#[derive(Default)]
struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}
