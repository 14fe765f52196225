//! Process-wide cache of loaded file chunk pages.
//!
//! The cache does not own page data; file chunks do. It tracks which pages
//! are resident and their sizes, decides eviction order, and reports evicted
//! page keys so the environment can drop them from the owning chunk. Bulk
//! loads (scans) enter at the cold end so they cannot flush the working set.
//!
//! Only ever accessed from the event-loop thread.

use silo_api_types::ChunkId;
use silo_tools::lru_cache::LruSizeCache;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PageKind {
    Bloom,
    Index,
    Data(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub chunk_id: ChunkId,
    pub kind: PageKind,
}

pub struct PageCache {
    cache: LruSizeCache<PageKey, ()>,
    pending_evictions: Vec<PageKey>,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruSizeCache::new(capacity),
            pending_evictions: Vec::new(),
        }
    }

    /// Track a freshly loaded page at the hot end.
    pub fn add_page(&mut self, key: PageKey, size: usize) {
        let evicted = self.cache.insert(key, (), size);
        self.pending_evictions
            .extend(evicted.into_iter().map(|(k, ())| k));
    }

    /// Track a bulk-loaded page at the cold end.
    pub fn add_page_bulk(&mut self, key: PageKey, size: usize) {
        let evicted = self.cache.insert_cold(key, (), size);
        self.pending_evictions
            .extend(evicted.into_iter().map(|(k, ())| k));
    }

    /// Update recency on a cache hit.
    pub fn register_hit(&mut self, key: PageKey) {
        self.cache.touch(key);
    }

    pub fn contains(&self, key: PageKey) -> bool {
        self.cache.contains(key)
    }

    /// Stop tracking a page (owning chunk is going away).
    pub fn remove_page(&mut self, key: PageKey) {
        self.cache.remove(key);
    }

    /// Drain the keys evicted since the last call. The caller must drop the
    /// corresponding pages from their owning chunks.
    pub fn take_evictions(&mut self) -> Vec<PageKey> {
        std::mem::take(&mut self.pending_evictions)
    }

    pub fn used(&self) -> usize {
        self.cache.used()
    }

    pub fn num_pages(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(chunk_id: ChunkId, kind: PageKind) -> PageKey {
        PageKey { chunk_id, kind }
    }

    #[test]
    fn eviction_reported_once() {
        let mut cache = PageCache::new(100);
        cache.add_page(key(1, PageKind::Index), 60);
        cache.add_page(key(1, PageKind::Data(0)), 60);

        let evicted = cache.take_evictions();
        assert_eq!(evicted, vec![key(1, PageKind::Index)]);
        assert!(cache.take_evictions().is_empty());
    }

    #[test]
    fn bulk_pages_evicted_before_hot() {
        let mut cache = PageCache::new(100);
        cache.add_page(key(1, PageKind::Data(0)), 50);
        cache.add_page_bulk(key(1, PageKind::Data(1)), 50);
        cache.add_page(key(1, PageKind::Data(2)), 50);

        let evicted = cache.take_evictions();
        assert_eq!(evicted, vec![key(1, PageKind::Data(1))]);
    }
}
