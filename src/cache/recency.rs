//! Recency Map Module
//!
//! Keyed entry storage that iterates in recency order.

use std::collections::{BTreeMap, HashMap};

use crate::cache::CacheEntry;

// == Recency Map ==
/// Entries keyed by string, iterated from least to most recently touched.
///
/// Every insert or touch stamps the key with a fresh sequence number; the
/// `order` index maps sequence numbers back to keys so the front of the
/// index is always the least recently touched entry. Also keeps the running
/// sum of entry sizes.
#[derive(Debug)]
pub struct RecencyMap<V> {
    /// Entries with their current sequence number
    entries: HashMap<String, (u64, CacheEntry<V>)>,
    /// Sequence number -> key, ascending = least recent first
    order: BTreeMap<u64, String>,
    /// Next sequence number to hand out
    next_seq: u64,
    /// Sum of `size` over all entries
    total_size: usize,
}

impl<V> Default for RecencyMap<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            total_size: 0,
        }
    }
}

impl<V> RecencyMap<V> {
    // == Constructor ==
    /// Creates a new empty map.
    pub fn new() -> Self {
        Self::default()
    }

    // == Insert ==
    /// Inserts or replaces an entry and moves it to the most recent position.
    ///
    /// Returns the replaced entry, if any.
    pub fn insert(&mut self, key: String, entry: CacheEntry<V>) -> Option<CacheEntry<V>> {
        let seq = self.bump_seq();
        self.total_size += entry.size;
        self.order.insert(seq, key.clone());

        let previous = self.entries.insert(key, (seq, entry));
        previous.map(|(old_seq, old_entry)| {
            self.order.remove(&old_seq);
            self.total_size -= old_entry.size;
            old_entry
        })
    }

    // == Touch ==
    /// Moves an existing key to the most recent position.
    ///
    /// Returns false if the key is not present.
    pub fn touch(&mut self, key: &str) -> bool {
        let seq = self.next_seq;
        match self.entries.get_mut(key) {
            Some((entry_seq, _)) => {
                self.order.remove(entry_seq);
                *entry_seq = seq;
                self.order.insert(seq, key.to_string());
                self.next_seq += 1;
                true
            }
            None => false,
        }
    }

    // == Lookup ==
    /// Returns the entry for `key` without changing its position.
    pub fn get(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key).map(|(_, entry)| entry)
    }

    /// Returns the entry for `key` mutably without changing its position.
    ///
    /// Callers must not change `size` through this reference.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry<V>> {
        self.entries.get_mut(key).map(|(_, entry)| entry)
    }

    /// Checks if a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    // == Remove ==
    /// Removes a key and returns its entry.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let (seq, entry) = self.entries.remove(key)?;
        self.order.remove(&seq);
        self.total_size -= entry.size;
        Some(entry)
    }

    // == Iteration ==
    /// Iterates entries from least to most recently touched.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CacheEntry<V>)> {
        self.order.values().filter_map(|key| {
            self.entries
                .get(key)
                .map(|(_, entry)| (key.as_str(), entry))
        })
    }

    // == Clear ==
    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.total_size = 0;
    }

    // == Size Accessors ==
    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the sum of entry sizes in bytes.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_VERSION;

    fn entry(size: usize) -> CacheEntry<&'static str> {
        CacheEntry::new("v", size, DEFAULT_VERSION, 0)
    }

    fn keys(map: &RecencyMap<&'static str>) -> Vec<String> {
        map.iter().map(|(k, _)| k.to_string()).collect()
    }

    #[test]
    fn test_recency_new() {
        let map: RecencyMap<&str> = RecencyMap::new();
        assert!(map.is_empty());
        assert_eq!(map.len(), 0);
        assert_eq!(map.total_size(), 0);
    }

    #[test]
    fn test_insert_order() {
        let mut map = RecencyMap::new();
        map.insert("key1".to_string(), entry(1));
        map.insert("key2".to_string(), entry(1));
        map.insert("key3".to_string(), entry(1));

        assert_eq!(map.len(), 3);
        assert_eq!(keys(&map), vec!["key1", "key2", "key3"]);
    }

    #[test]
    fn test_touch_moves_to_tail() {
        let mut map = RecencyMap::new();
        map.insert("a".to_string(), entry(1));
        map.insert("b".to_string(), entry(1));
        map.insert("c".to_string(), entry(1));

        assert!(map.touch("a"));
        assert_eq!(keys(&map), vec!["b", "c", "a"]);

        assert!(map.touch("c"));
        assert!(map.touch("b"));
        assert_eq!(keys(&map), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_touch_missing_key() {
        let mut map = RecencyMap::new();
        map.insert("a".to_string(), entry(1));

        assert!(!map.touch("nonexistent"));
        assert_eq!(keys(&map), vec!["a"]);
    }

    #[test]
    fn test_reinsert_replaces_and_moves() {
        let mut map = RecencyMap::new();
        map.insert("a".to_string(), entry(10));
        map.insert("b".to_string(), entry(20));

        let previous = map.insert("a".to_string(), entry(5));

        assert_eq!(previous.map(|e| e.size), Some(10));
        assert_eq!(map.len(), 2);
        assert_eq!(keys(&map), vec!["b", "a"]);
        assert_eq!(map.total_size(), 25);
    }

    #[test]
    fn test_remove() {
        let mut map = RecencyMap::new();
        map.insert("key1".to_string(), entry(3));
        map.insert("key2".to_string(), entry(4));
        map.insert("key3".to_string(), entry(5));

        let removed = map.remove("key2");

        assert_eq!(removed.map(|e| e.size), Some(4));
        assert_eq!(map.len(), 2);
        assert!(!map.contains("key2"));
        assert_eq!(map.total_size(), 8);
        assert_eq!(keys(&map), vec!["key1", "key3"]);
        assert!(map.remove("key2").is_none());
    }

    #[test]
    fn test_clear() {
        let mut map = RecencyMap::new();
        map.insert("a".to_string(), entry(3));
        map.insert("b".to_string(), entry(4));

        map.clear();

        assert!(map.is_empty());
        assert_eq!(map.total_size(), 0);
        assert_eq!(map.iter().count(), 0);
    }
}
