//! XOR-distance bucketed routing tables.
use std::collections::{BTreeMap, HashSet};

use rand::seq::SliceRandom;

use crate::common::Key;

/// The maximum size of a bucket.
pub const MAX_BUCKET_SIZE: usize = 20;

/// A record that can live in a routing table.
pub trait TableEntry: Clone {
    /// The key the entry is bucketed and resolved by.
    fn table_key(&self) -> Key;

    /// Expired entries are evicted to make room in a full bucket.
    fn is_expired(&self, now: u64) -> bool;
}

#[derive(Debug, Clone)]
/// Entries bucketed by XOR distance from a local id. Two instances back the
/// DHT: router contacts and service introduction sets.
pub struct RoutingTable<T: TableEntry> {
    id: Key,
    buckets: BTreeMap<u16, Bucket<T>>,
}

impl<T: TableEntry> RoutingTable<T> {
    /// Create a new [RoutingTable] centered on `id`.
    pub fn new(id: Key) -> Self {
        RoutingTable {
            id,
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [Key] of this node, where the distance is measured from.
    pub fn id(&self) -> &Key {
        &self.id
    }

    // === Public Methods ===

    /// Insert or replace an entry, and return `true` if it was kept.
    pub fn put(&mut self, entry: T, now: u64) -> bool {
        let distance = self.id.distance(&entry.table_key());

        if distance == 0 {
            // Do not add self to the routing table
            return false;
        }

        let bucket = self.buckets.entry(distance).or_default();

        bucket.put(entry, now)
    }

    pub fn remove(&mut self, key: &Key) {
        let distance = self.id.distance(key);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.remove(key)
        }
    }

    pub fn get(&self, key: &Key) -> Option<&T> {
        let distance = self.id.distance(key);

        self.buckets.get(&distance).and_then(|bucket| bucket.get(key))
    }

    /// The single closest entry key to `target`, or `None` when empty.
    pub fn find_closest(&self, target: Key) -> Option<Key> {
        self.keys()
            .min_by(|a, b| (*a ^ target).cmp(&(*b ^ target)).then_with(|| a.cmp(b)))
    }

    /// Up to `n` entry keys not in `exclude`, ordered by ascending XOR
    /// distance from `target`. Ties break on raw key order, which only
    /// matters for duplicates since XOR distances of distinct keys differ.
    pub fn find_many(&self, target: Key, n: usize, exclude: &HashSet<Key>) -> Vec<Key> {
        let mut keys: Vec<Key> = self.keys().filter(|key| !exclude.contains(key)).collect();

        keys.sort_unstable_by(|a, b| (*a ^ target).cmp(&(*b ^ target)).then_with(|| a.cmp(b)));
        keys.truncate(n);

        keys
    }

    /// Up to `n` entry keys preferring sparsely populated buckets; used to
    /// pick exploration candidates.
    pub fn sample_underfilled(&self, n: usize) -> Vec<Key> {
        let mut rng = rand::thread_rng();

        let mut buckets: Vec<&Bucket<T>> = self.buckets.values().collect();
        buckets.sort_by_key(|bucket| bucket.entries.len());

        buckets
            .iter()
            .filter_map(|bucket| bucket.entries.choose(&mut rng))
            .map(|entry| entry.table_key())
            .take(n)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of entries in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.entries.len())
    }

    /// Returns an iterator over the entries in this routing table.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buckets.values().flat_map(|bucket| bucket.entries.iter())
    }

    fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.iter().map(|entry| entry.table_key())
    }
}

#[derive(Debug, Clone)]
struct Bucket<T> {
    entries: Vec<T>,
}

impl<T: TableEntry> Bucket<T> {
    fn put(&mut self, incoming: T, now: u64) -> bool {
        let key = incoming.table_key();

        if let Some(index) = self.entries.iter().position(|e| e.table_key() == key) {
            self.entries[index] = incoming;

            true
        } else if self.entries.len() < MAX_BUCKET_SIZE {
            self.entries.push(incoming);

            true
        } else if let Some(index) = self.entries.iter().position(|e| e.is_expired(now)) {
            // evict an expired entry rather than reject the new one
            self.entries.remove(index);
            self.entries.push(incoming);

            true
        } else {
            false
        }
    }

    fn remove(&mut self, key: &Key) {
        self.entries.retain(|entry| entry.table_key() != *key);
    }

    fn get(&self, key: &Key) -> Option<&T> {
        self.entries.iter().find(|entry| entry.table_key() == *key)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for Bucket<T> {
    fn default() -> Self {
        Bucket {
            entries: Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone, Debug)]
    struct Entry {
        key: Key,
        expires_at: u64,
    }

    impl Entry {
        fn new(key: Key) -> Self {
            Entry {
                key,
                expires_at: u64::MAX,
            }
        }
    }

    impl TableEntry for Entry {
        fn table_key(&self) -> Key {
            self.key
        }

        fn is_expired(&self, now: u64) -> bool {
            now >= self.expires_at
        }
    }

    fn table() -> RoutingTable<Entry> {
        RoutingTable::new(Key::random())
    }

    #[test]
    fn table_is_empty() {
        let mut table = table();
        assert!(table.is_empty());

        table.put(Entry::new(Key::random()), 0);
        assert!(!table.is_empty());
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn put_is_a_set_by_key() {
        let mut table = table();
        let key = Key::random();

        table.put(Entry::new(key), 0);
        table.put(Entry::new(key), 0);

        assert_eq!(table.size(), 1);
    }

    #[test]
    fn should_not_add_self() {
        let mut table = table();

        assert!(!table.put(Entry::new(*table.id()), 0));
        assert!(table.is_empty());
    }

    #[test]
    fn remove() {
        let mut table = table();
        let key = Key::random();

        table.put(Entry::new(key), 0);
        assert!(table.get(&key).is_some());

        table.remove(&key);
        assert!(table.get(&key).is_none());
    }

    #[test]
    fn closest_matches_brute_force() {
        let mut table = table();
        let mut keys = Vec::new();

        for _ in 0..64 {
            let key = Key::random();
            keys.push(key);
            table.put(Entry::new(key), 0);
        }

        for _ in 0..16 {
            let target = Key::random();

            let expected = *keys
                .iter()
                .min_by_key(|key| **key ^ target)
                .expect("keys is non-empty");

            assert_eq!(table.find_closest(target), Some(expected));

            let mut sorted = keys.clone();
            sorted.sort_by_key(|key| *key ^ target);
            sorted.truncate(4);

            assert_eq!(table.find_many(target, 4, &HashSet::new()), sorted);
        }
    }

    #[test]
    fn find_many_excludes() {
        let mut table = table();
        let target = Key::random();

        for _ in 0..8 {
            table.put(Entry::new(Key::random()), 0);
        }

        let all = table.find_many(target, 8, &HashSet::new());
        let exclude: HashSet<Key> = all[..2].iter().copied().collect();
        let rest = table.find_many(target, 8, &exclude);

        assert_eq!(rest, all[2..].to_vec());
        assert!(table.find_many(target, 8, &all.iter().copied().collect()).is_empty());
    }

    #[test]
    fn full_bucket_evicts_expired_entries_only() {
        // distance is measured from the zero key; every entry has its top
        // bit set, so they all land in the deepest bucket
        let mut table = RoutingTable::new(Key([0; 32]));

        let mut filler = Vec::new();
        for i in 0..MAX_BUCKET_SIZE {
            let mut entry = Entry::new(Key(odd_key(1 + i as u8)));
            entry.expires_at = u64::MAX;
            filler.push(entry.key);
            table.put(entry, 0);
        }
        assert_eq!(table.size(), MAX_BUCKET_SIZE);

        let rejected = Entry::new(Key(odd_key(200)));
        assert!(!table.put(rejected.clone(), 0));

        // expire one resident and retry
        let mut stale = Entry::new(filler[0]);
        stale.expires_at = 50;
        table.put(stale, 0);

        assert!(table.put(rejected, 100));
        assert!(table.get(&filler[0]).is_none());
    }

    fn odd_key(low: u8) -> [u8; 32] {
        let mut bytes = [0; 32];
        bytes[0] = 0x80;
        bytes[31] = low;
        bytes
    }

    #[test]
    fn sample_underfilled_prefers_sparse_buckets() {
        let mut table = RoutingTable::new(Key([0; 32]));

        // a crowded bucket...
        for i in 0..8u8 {
            table.put(Entry::new(Key(odd_key(1 + i))), 0);
        }
        // ...and a lone entry in a different bucket
        let mut lone = [0; 32];
        lone[1] = 0x80;
        table.put(Entry::new(Key(lone)), 0);

        let sample = table.sample_underfilled(1);
        assert_eq!(sample, vec![Key(lone)]);

        assert_eq!(table.sample_underfilled(8).len(), 2);
    }
}
