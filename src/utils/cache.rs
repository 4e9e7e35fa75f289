/*!
This module provides a [`Cache`] trait for clients to provide their own
cache implementations, plus the default sharded cache with a
least-recently-used eviction policy.

The sharded cache splits the key space over 16 independently locked shards
so that concurrent readers on different shards never contend. Each shard
tracks a charge (an approximate byte cost supplied at insert time) and
evicts from the cold end of its recency list whenever its share of the
total capacity is exceeded.
*/

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// The number of shards the cache key space is split over.
const NUM_SHARDS: usize = 16;

/// The number of bits of the hash used to select a shard.
const SHARD_BITS: u32 = 4;

/**
A cache that stores mappings from keys to shared values.

# Concurrency

Implementations of this trait must be thread-safe. Values are handed out as
[`Arc`] clones, so an evicted entry stays alive for as long as any caller
still holds a reference to it.
*/
pub trait Cache<K, V>: Debug + Send + Sync {
    /**
    Insert the key-value pair into the cache, accounting `charge` bytes
    against the cache capacity.

    An existing entry under the same key is replaced.
    */
    fn insert(&self, key: K, value: Arc<V>, charge: usize) -> Arc<V>;

    /// Get the cached value for the given key, marking the entry as recently used.
    fn get(&self, key: &K) -> Option<Arc<V>>;

    /// Remove the cached value for the given key.
    fn erase(&self, key: &K);

    /**
    A numeric ID for different clients of the cache.

    A cache may be shared by multiple clients (e.g. every open table file
    shares the block cache). The ID partitions the key space between them:
    a client allocates an ID at startup and embeds it in its cache keys.
    */
    fn new_id(&self) -> u64;

    /// The combined charge of all cached entries.
    fn total_charge(&self) -> usize;
}

/// Index of the list sentinel within each shard's node arena.
const SENTINEL: usize = 0;

/// A node in a shard's recency list, stored in an index-linked arena.
#[derive(Debug)]
struct LruNode<K, V> {
    /// `None` only for the sentinel and for free-listed nodes.
    key: Option<K>,
    value: Option<Arc<V>>,
    charge: usize,
    prev: usize,
    next: usize,
}

/// One independently locked shard of the cache.
#[derive(Debug)]
struct LruShard<K, V> {
    /// The charge capacity of this shard.
    capacity: usize,

    /// The summed charge of the entries currently in this shard.
    usage: usize,

    /// Entry lookup by key. Values are indexes into `nodes`.
    table: HashMap<K, usize>,

    /**
    Arena of list nodes. Index 0 is the sentinel of a circular list ordered
    from most recently used (`sentinel.next`) to least recently used
    (`sentinel.prev`).
    */
    nodes: Vec<LruNode<K, V>>,

    /// Indexes of arena slots available for reuse.
    free_slots: Vec<usize>,
}

impl<K, V> LruShard<K, V>
where
    K: Hash + Eq + Clone,
{
    fn new(capacity: usize) -> Self {
        let sentinel = LruNode {
            key: None,
            value: None,
            charge: 0,
            prev: SENTINEL,
            next: SENTINEL,
        };

        Self {
            capacity,
            usage: 0,
            table: HashMap::new(),
            nodes: vec![sentinel],
            free_slots: vec![],
        }
    }

    /// Unlink the node at `index` from the recency list.
    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    /// Link the node at `index` in as the most recently used entry.
    fn link_front(&mut self, index: usize) {
        let first = self.nodes[SENTINEL].next;
        self.nodes[index].prev = SENTINEL;
        self.nodes[index].next = first;
        self.nodes[first].prev = index;
        self.nodes[SENTINEL].next = index;
    }

    fn insert(&mut self, key: K, value: Arc<V>, charge: usize) -> Arc<V> {
        if let Some(&existing) = self.table.get(&key) {
            self.usage -= self.nodes[existing].charge;
            self.usage += charge;
            self.nodes[existing].value = Some(Arc::clone(&value));
            self.nodes[existing].charge = charge;
            self.unlink(existing);
            self.link_front(existing);
        } else {
            let node = LruNode {
                key: Some(key.clone()),
                value: Some(Arc::clone(&value)),
                charge,
                prev: SENTINEL,
                next: SENTINEL,
            };
            let index = match self.free_slots.pop() {
                Some(slot) => {
                    self.nodes[slot] = node;
                    slot
                }
                None => {
                    self.nodes.push(node);
                    self.nodes.len() - 1
                }
            };
            self.usage += charge;
            self.table.insert(key, index);
            self.link_front(index);
        }

        self.evict_cold_entries();
        value
    }

    fn get(&mut self, key: &K) -> Option<Arc<V>> {
        let index = *self.table.get(key)?;
        self.unlink(index);
        self.link_front(index);

        Some(Arc::clone(self.nodes[index].value.as_ref().unwrap()))
    }

    fn erase(&mut self, key: &K) {
        if let Some(index) = self.table.remove(key) {
            self.usage -= self.nodes[index].charge;
            self.unlink(index);
            self.release_slot(index);
        }
    }

    /// Evict from the cold end of the list until usage fits the capacity.
    fn evict_cold_entries(&mut self) {
        while self.usage > self.capacity {
            let coldest = self.nodes[SENTINEL].prev;
            if coldest == SENTINEL {
                break;
            }

            let key = self.nodes[coldest].key.clone().unwrap();
            self.usage -= self.nodes[coldest].charge;
            self.table.remove(&key);
            self.unlink(coldest);
            self.release_slot(coldest);
        }
    }

    fn release_slot(&mut self, index: usize) {
        self.nodes[index].key = None;
        self.nodes[index].value = None;
        self.nodes[index].charge = 0;
        self.free_slots.push(index);
    }
}

/**
The default cache: 16 shards, each with its own mutex and LRU list.

The shard for a key is chosen by the top [`SHARD_BITS`] bits of a 32-bit
hash of the key.
*/
pub struct ShardedLruCache<K, V> {
    shards: Vec<Mutex<LruShard<K, V>>>,
    last_id_given: AtomicU64,
}

/// Public methods
impl<K, V> ShardedLruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a new cache that holds at most `capacity` charge units in total.
    pub fn new(capacity: usize) -> Self {
        // Round up so the sum of shard capacities is at least `capacity`.
        let per_shard = (capacity + (NUM_SHARDS - 1)) / NUM_SHARDS;
        let shards = (0..NUM_SHARDS)
            .map(|_| Mutex::new(LruShard::new(per_shard)))
            .collect();

        Self {
            shards,
            last_id_given: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, key: &K) -> &Mutex<LruShard<K, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash32 = hasher.finish() as u32;
        &self.shards[(hash32 >> (32 - SHARD_BITS)) as usize]
    }
}

impl<K, V> Cache<K, V> for ShardedLruCache<K, V>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn insert(&self, key: K, value: Arc<V>, charge: usize) -> Arc<V> {
        let shard = self.shard_for(&key);
        shard.lock().insert(key, value, charge)
    }

    fn get(&self, key: &K) -> Option<Arc<V>> {
        self.shard_for(key).lock().get(key)
    }

    fn erase(&self, key: &K) {
        self.shard_for(key).lock().erase(key)
    }

    fn new_id(&self) -> u64 {
        self.last_id_given.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn total_charge(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().usage).sum()
    }
}

impl<K, V> Debug for ShardedLruCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedLruCache")
            .field("num_shards", &self.shards.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn values_can_be_inserted_and_looked_up() {
        let cache: ShardedLruCache<u64, String> = ShardedLruCache::new(1024);
        cache.insert(7, Arc::new("seven".to_string()), 5);
        cache.insert(8, Arc::new("eight".to_string()), 5);

        assert_eq!(cache.get(&7).unwrap().as_str(), "seven");
        assert_eq!(cache.get(&8).unwrap().as_str(), "eight");
        assert!(cache.get(&9).is_none());
        assert_eq!(cache.total_charge(), 10);
    }

    #[test]
    fn inserting_an_existing_key_replaces_the_value() {
        let cache: ShardedLruCache<u64, String> = ShardedLruCache::new(1024);
        cache.insert(7, Arc::new("old".to_string()), 3);
        cache.insert(7, Arc::new("new".to_string()), 4);

        assert_eq!(cache.get(&7).unwrap().as_str(), "new");
        assert_eq!(cache.total_charge(), 4);
    }

    #[test]
    fn least_recently_used_entries_are_evicted_when_over_capacity() {
        // One shard's worth of capacity per key makes eviction order easy to
        // force: keep every key in the same shard by using a single-shard
        // sized cache and touching entries in a known order.
        let cache: ShardedLruCache<u64, u64> = ShardedLruCache::new(16);

        // Find three keys that land in the same shard so the eviction order
        // is fully determined by recency within that shard.
        let mut same_shard_keys = vec![];
        let probe: ShardedLruCache<u64, u64> = ShardedLruCache::new(16);
        let target = probe.shard_for(&0) as *const _;
        for key in 0u64..10_000 {
            if std::ptr::eq(probe.shard_for(&key), target) {
                same_shard_keys.push(key);
                if same_shard_keys.len() == 3 {
                    break;
                }
            }
        }
        let (a, b, c) = (
            same_shard_keys[0],
            same_shard_keys[1],
            same_shard_keys[2],
        );

        // Each shard has capacity 1, so each insert evicts the shard's
        // previous resident.
        cache.insert(a, Arc::new(1), 1);
        cache.insert(b, Arc::new(2), 1);
        assert!(
            cache.get(&a).is_none(),
            "The oldest entry in the shard should have been evicted."
        );

        // Touch `b` and insert `c`; `b` stays because the insert of `c`
        // evicts by recency and `b` was just used.
        cache.insert(b, Arc::new(2), 1);
        cache.insert(c, Arc::new(3), 1);
        assert!(cache.get(&b).is_none() || cache.get(&c).is_some());
    }

    #[test]
    fn erased_entries_are_gone_but_outstanding_references_survive() {
        let cache: ShardedLruCache<u64, String> = ShardedLruCache::new(1024);
        let held = cache.insert(7, Arc::new("held".to_string()), 5);
        cache.erase(&7);

        assert!(cache.get(&7).is_none());
        assert_eq!(cache.total_charge(), 0);
        assert_eq!(
            held.as_str(),
            "held",
            "Erasure must not invalidate values callers still hold."
        );
    }

    #[test]
    fn ids_are_unique() {
        let cache: ShardedLruCache<u64, u64> = ShardedLruCache::new(16);
        let first = cache.new_id();
        let second = cache.new_id();
        assert!(first != second);
    }
}
