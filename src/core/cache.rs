//! Bounded LRU cache of decompressed blocks
//!
//! Random reads inside a multi-gigabyte archive keep hitting the same few
//! blocks (neighbouring sectors share a block, deduplicated sectors share
//! it across the whole image). The cache keeps recently decoded blocks
//! resident under two fixed ceilings: total payload bytes and entry count.
//!
//! Eviction only costs performance. Every block can be re-read and
//! re-decompressed from the block store, so a miss is always recoverable.

use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub resident_bytes: usize,
    pub max_bytes: usize,
    pub max_entries: usize,
}

impl CacheStats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct CacheInner {
    entries: LruCache<u64, Arc<Vec<u8>>>,
    resident_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// LRU cache keyed by block index
pub struct BlockCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
    max_entries: usize,
}

impl BlockCache {
    /// Create a cache holding at most `max_bytes` of payload in at most
    /// `max_entries` blocks. Either ceiling at zero disables caching.
    pub fn new(max_bytes: usize, max_entries: usize) -> Self {
        BlockCache {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                resident_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_bytes,
            max_entries,
        }
    }

    /// Complete decoded payload of `block`, or `None` on a miss
    pub fn get(&self, block: u64) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match inner.entries.get(&block).cloned() {
            Some(data) => {
                inner.hits += 1;
                Some(data)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert a decoded block, evicting least recently used blocks until
    /// both ceilings hold. A block larger than the whole byte budget is not
    /// cached.
    pub fn put(&self, block: u64, data: Arc<Vec<u8>>) {
        let cost = data.len();
        if self.max_entries == 0 || cost > self.max_bytes {
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.entries.pop(&block) {
            inner.resident_bytes -= previous.len();
        }

        while inner.entries.len() >= self.max_entries
            || inner.resident_bytes + cost > self.max_bytes
        {
            match inner.entries.pop_lru() {
                Some((evicted, payload)) => {
                    inner.resident_bytes -= payload.len();
                    inner.evictions += 1;
                    debug!("Evicted block {} ({} bytes) from cache", evicted, payload.len());
                }
                None => break,
            }
        }

        inner.resident_bytes += cost;
        inner.entries.put(block, data);
    }

    #[cfg(test)]
    fn contains(&self, block: u64) -> bool {
        self.inner.lock().entries.contains(&block)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resident_bytes(&self) -> usize {
        self.inner.lock().resident_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.entries.len(),
            resident_bytes: inner.resident_bytes,
            max_bytes: self.max_bytes,
            max_entries: self.max_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(len: usize, fill: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![fill; len])
    }

    #[test]
    fn test_cache_basic() {
        let cache = BlockCache::new(1024, 10);
        assert!(cache.get(1).is_none());

        cache.put(1, block(100, 1));
        assert_eq!(cache.get(1).unwrap().as_slice(), &[1u8; 100][..]);
        assert_eq!(cache.resident_bytes(), 100);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 50.0);
    }

    #[test]
    fn test_byte_budget_evicts_lru_first() {
        let cache = BlockCache::new(300, 100);
        cache.put(1, block(100, 1));
        cache.put(2, block(100, 2));
        cache.put(3, block(100, 3));

        // Touch 1 so 2 becomes least recently used
        assert!(cache.get(1).is_some());
        cache.put(4, block(100, 4));

        assert!(cache.resident_bytes() <= 300);
        assert!(!cache.contains(2));
        assert!(cache.contains(1));
        assert!(cache.contains(3));
        assert!(cache.contains(4));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_entry_ceiling() {
        let cache = BlockCache::new(usize::MAX, 2);
        cache.put(1, block(1, 1));
        cache.put(2, block(1, 2));
        cache.put(3, block(1, 3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn test_oversized_block_is_not_cached() {
        let cache = BlockCache::new(64, 4);
        cache.put(1, block(32, 1));
        cache.put(2, block(65, 2));

        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert_eq!(cache.resident_bytes(), 32);
    }

    #[test]
    fn test_replacing_key_recounts_bytes() {
        let cache = BlockCache::new(1000, 10);
        cache.put(1, block(400, 1));
        cache.put(1, block(100, 9));
        assert_eq!(cache.resident_bytes(), 100);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(1).unwrap()[0], 9);
    }

    #[test]
    fn test_disabled_cache() {
        let cache = BlockCache::new(1024, 0);
        cache.put(1, block(10, 1));
        assert!(cache.is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_ceilings_always_hold(
                max_bytes in 1usize..4096,
                max_entries in 0usize..16,
                puts in prop::collection::vec((0u64..32, 0usize..1024), 1..200),
            ) {
                let cache = BlockCache::new(max_bytes, max_entries);
                for (id, len) in puts {
                    cache.put(id, Arc::new(vec![id as u8; len]));
                    prop_assert!(cache.len() <= max_entries);
                    prop_assert!(cache.resident_bytes() <= max_bytes);
                    if let Some(hit) = cache.get(id) {
                        prop_assert!(hit.iter().all(|&b| b == id as u8));
                    }
                }
            }
        }
    }
}
