use indexmap::IndexMap;

/// Default number of entries a per-object cache holds.
pub const DEFAULT_CACHE_SIZE: usize = 32;

/// A bounded `f64 -> f64` memo for a single math object, stamped with the
/// revision of the definition its entries were computed against.
///
/// Eviction is by insertion age, not read recency: sequences and data
/// series are typically read over large contiguous index ranges, and
/// keeping the recently written tail resident costs none of the
/// bookkeeping a read-tracking LRU would. Re-inserting an existing key
/// refreshes it to youngest.
#[derive(Debug, Clone)]
pub struct ObjectCache {
    /// Keys are the bit patterns of the (non-NaN, zero-normalized)
    /// lookup values; iteration order is insertion order, oldest first.
    entries: IndexMap<u64, f64>,
    buffer_size: usize,
    revision: u64,
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

/// `-0.0` and `0.0` compare equal and must share a cache line.
fn key_bits(key: f64) -> u64 {
    if key == 0.0 { 0.0f64.to_bits() } else { key.to_bits() }
}

impl ObjectCache {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(buffer_size),
            buffer_size,
            revision: 0,
        }
    }

    /// The revision the current contents were computed against.
    pub fn cached_revision(&self) -> u64 {
        self.revision
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records `key -> value` computed against `revision`.
    ///
    /// A revision different from the cached one clears the cache first;
    /// stale values never survive a definition change. NaN keys are
    /// rejected. When the buffer is full the oldest-inserted entry is
    /// evicted to make room.
    pub fn insert(&mut self, revision: u64, key: f64, value: f64) {
        if key.is_nan() {
            return;
        }
        if self.revision != revision {
            self.clear();
            self.revision = revision;
        }
        if self.buffer_size == 0 {
            return;
        }

        let bits = key_bits(key);
        if let Some(index) = self.entries.get_index_of(&bits) {
            // Refresh to youngest.
            self.entries[index] = value;
            self.entries.move_index(index, self.entries.len() - 1);
            return;
        }
        if self.entries.len() >= self.buffer_size {
            self.entries.shift_remove_index(0);
        }
        self.entries.insert(bits, value);
    }

    /// The cached value for `key`, if the cache holds one computed
    /// against `revision`. Lookups do not affect eviction order.
    pub fn get(&self, revision: u64, key: f64) -> Option<f64> {
        if self.revision != revision || key.is_nan() {
            return None;
        }
        self.entries.get(&key_bits(key)).copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Changes the buffer size; shrinking discards oldest-inserted
    /// entries until the contents fit.
    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        while self.entries.len() > buffer_size {
            self.entries.shift_remove_index(0);
        }
        self.buffer_size = buffer_size;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn insert_and_get() {
        let mut cache = ObjectCache::new(4);
        cache.insert(1, 2.0, 20.0);
        cache.insert(1, 3.0, 30.0);
        assert_eq!(cache.get(1, 2.0), Some(20.0));
        assert_eq!(cache.get(1, 3.0), Some(30.0));
        assert_eq!(cache.get(1, 4.0), None);
    }

    #[test]
    fn revision_mismatch_misses_and_clears() {
        let mut cache = ObjectCache::new(4);
        cache.insert(1, 2.0, 20.0);
        assert_eq!(cache.get(2, 2.0), None);

        cache.insert(2, 3.0, 30.0);
        assert_eq!(cache.cached_revision(), 2);
        assert_eq!(cache.get(2, 2.0), None, "old-revision entry must be gone");
        assert_eq!(cache.get(2, 3.0), Some(30.0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_oldest_inserted() {
        let mut cache = ObjectCache::new(3);
        cache.insert(1, 1.0, 10.0);
        cache.insert(1, 2.0, 20.0);
        cache.insert(1, 3.0, 30.0);
        cache.insert(1, 4.0, 40.0);
        assert_eq!(cache.get(1, 1.0), None);
        assert_eq!(cache.get(1, 2.0), Some(20.0));
        assert_eq!(cache.get(1, 4.0), Some(40.0));
    }

    #[test]
    fn reinsert_refreshes_to_youngest() {
        let mut cache = ObjectCache::new(3);
        cache.insert(1, 1.0, 10.0);
        cache.insert(1, 2.0, 20.0);
        cache.insert(1, 3.0, 30.0);
        // Touch the oldest, then overflow: the second-oldest goes.
        cache.insert(1, 1.0, 11.0);
        cache.insert(1, 4.0, 40.0);
        assert_eq!(cache.get(1, 1.0), Some(11.0));
        assert_eq!(cache.get(1, 2.0), None);
        assert_eq!(cache.get(1, 3.0), Some(30.0));
    }

    #[test]
    fn reads_do_not_affect_eviction_order() {
        let mut cache = ObjectCache::new(2);
        cache.insert(1, 1.0, 10.0);
        cache.insert(1, 2.0, 20.0);
        // Reading the oldest does not save it.
        assert_eq!(cache.get(1, 1.0), Some(10.0));
        cache.insert(1, 3.0, 30.0);
        assert_eq!(cache.get(1, 1.0), None);
        assert_eq!(cache.get(1, 2.0), Some(20.0));
    }

    #[test]
    fn rejects_nan_keys() {
        let mut cache = ObjectCache::new(4);
        cache.insert(1, f64::NAN, 1.0);
        assert!(cache.is_empty());
        assert_eq!(cache.get(1, f64::NAN), None);
    }

    #[test]
    fn shrinking_discards_oldest() {
        let mut cache = ObjectCache::new(4);
        for i in 0..4 {
            cache.insert(1, f64::from(i), f64::from(i) * 10.0);
        }
        cache.set_buffer_size(2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(1, 0.0), None);
        assert_eq!(cache.get(1, 1.0), None);
        assert_eq!(cache.get(1, 2.0), Some(20.0));
        assert_eq!(cache.get(1, 3.0), Some(30.0));
    }

    #[test]
    fn negative_zero_shares_the_positive_zero_line() {
        let mut cache = ObjectCache::new(4);
        cache.insert(1, -0.0, 5.0);
        assert_eq!(cache.get(1, 0.0), Some(5.0));
        cache.insert(1, 0.0, 6.0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(1, -0.0), Some(6.0));
    }
}
