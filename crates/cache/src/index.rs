//! Bounded in-memory LRU index in front of the disk store
//!
//! Pure acceleration: cache correctness never depends on the index
//! retaining an entry. On a miss the manager falls back to the disk store.

use crate::entry::CacheEntry;
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;

/// Fixed-capacity, access-ordered map of hot cache entries
pub struct MemoryIndex {
    inner: LruCache<String, CacheEntry>,
}

impl fmt::Debug for MemoryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryIndex")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl MemoryIndex {
    /// Create an index holding at most `capacity` entries
    ///
    /// A zero capacity is clamped to one slot.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Look up an entry, promoting it to most-recently-used
    pub fn get(&mut self, id: &str) -> Option<&CacheEntry> {
        self.inner.get(id)
    }

    /// Look up an entry mutably, promoting it to most-recently-used
    pub fn get_mut(&mut self, id: &str) -> Option<&mut CacheEntry> {
        self.inner.get_mut(id)
    }

    /// Insert or overwrite an entry
    ///
    /// Returns the least-recently-used entry displaced to make room, if any.
    /// Overwriting an existing key is not a displacement.
    pub fn put(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let id = entry.id.clone();
        self.inner
            .push(id.clone(), entry)
            .and_then(|(evicted_id, evicted)| (evicted_id != id).then_some(evicted))
    }

    /// Remove an entry, returning it if present
    pub fn remove(&mut self, id: &str) -> Option<CacheEntry> {
        self.inner.pop(id)
    }

    /// Membership check without touching LRU order
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains(id)
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Number of entries currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Configured capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    /// Snapshot of all held entries, most-recently-used first
    #[must_use]
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.inner.iter().map(|(_, entry)| entry.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entry(template_id: &str) -> CacheEntry {
        CacheEntry::new(
            template_id,
            "1.0.0",
            PathBuf::from(format!("/cache/{template_id}@1.0.0")),
            "checksum",
            100,
        )
    }

    #[test]
    fn test_overflow_evicts_least_recently_used() {
        let mut index = MemoryIndex::new(3);
        assert!(index.put(entry("a")).is_none());
        assert!(index.put(entry("b")).is_none());
        assert!(index.put(entry("c")).is_none());

        let evicted = index.put(entry("d")).unwrap();
        assert_eq!(evicted.template_id, "a");
        assert_eq!(index.len(), 3);
        assert!(!index.contains("a@1.0.0"));
    }

    #[test]
    fn test_get_promotes_against_eviction() {
        let mut index = MemoryIndex::new(3);
        index.put(entry("a"));
        index.put(entry("b"));
        index.put(entry("c"));

        // Promote "a"; the next overflow must take "b" instead
        assert!(index.get("a@1.0.0").is_some());
        let evicted = index.put(entry("d")).unwrap();
        assert_eq!(evicted.template_id, "b");
        assert!(index.contains("a@1.0.0"));
    }

    #[test]
    fn test_overwrite_same_key_is_not_eviction() {
        let mut index = MemoryIndex::new(2);
        index.put(entry("a"));
        index.put(entry("b"));

        let mut updated = entry("a");
        updated.access_count = 7;
        assert!(index.put(updated).is_none());
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("a@1.0.0").unwrap().access_count, 7);
    }

    #[test]
    fn test_contains_does_not_promote() {
        let mut index = MemoryIndex::new(2);
        index.put(entry("a"));
        index.put(entry("b"));

        // A membership probe must not rescue "a" from eviction
        assert!(index.contains("a@1.0.0"));
        let evicted = index.put(entry("c")).unwrap();
        assert_eq!(evicted.template_id, "a");
    }

    #[test]
    fn test_remove_and_clear() {
        let mut index = MemoryIndex::new(4);
        index.put(entry("a"));
        index.put(entry("b"));

        assert!(index.remove("a@1.0.0").is_some());
        assert!(index.remove("a@1.0.0").is_none());
        assert_eq!(index.len(), 1);

        index.clear();
        assert!(index.is_empty());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let index = MemoryIndex::new(0);
        assert_eq!(index.capacity(), 1);
    }
}
