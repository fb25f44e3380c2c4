//! The in-memory tier.

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::MemoryCacheConfig;
use crate::types::Image;

#[derive(Debug)]
struct MemoryEntry {
    image: Image,
    cost: u64,
}

#[derive(Debug)]
struct MemoryState {
    entries: LruCache<String, MemoryEntry>,
    total_cost: u64,
    max_cost: Option<u64>,
    max_count: Option<usize>,
}

impl MemoryState {
    fn is_over_limits(&self) -> bool {
        let over_cost = self.max_cost.is_some_and(|max| self.total_cost > max);
        let over_count = self.max_count.is_some_and(|max| self.entries.len() > max);
        over_cost || over_count
    }

    /// Drops least recently used entries until both limits hold.
    fn evict(&mut self) {
        let mut evicted = 0i64;
        while self.is_over_limits() {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            tracing::trace!(%key, cost = entry.cost, "Evicting image from memory");
            self.total_cost -= entry.cost;
            evicted += 1;
        }
        if evicted > 0 {
            metric!(counter("caches.memory.evicted") += evicted);
        }
    }
}

/// Decoded images bounded by total cost and entry count, evicting least recently used first.
#[derive(Debug)]
pub struct MemoryCache {
    state: Mutex<MemoryState>,
}

impl MemoryCache {
    pub fn new(config: &MemoryCacheConfig) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: LruCache::unbounded(),
                total_cost: 0,
                max_cost: config.max_cost,
                max_count: config.max_count,
            }),
        }
    }

    /// Returns the image for `key`, marking it as recently used.
    pub fn get(&self, key: &str) -> Option<Image> {
        let mut state = self.state.lock();
        state.entries.get(key).map(|entry| entry.image.clone())
    }

    /// Checks for `key` without affecting the eviction order.
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// Inserts or replaces the image for `key`, evicting other images as needed.
    pub fn insert(&self, key: String, image: Image) {
        let cost = image.cost();
        let mut state = self.state.lock();
        if let Some(previous) = state.entries.put(key, MemoryEntry { image, cost }) {
            state.total_cost -= previous.cost;
        }
        state.total_cost += cost;
        state.evict();
    }

    pub fn remove(&self, key: &str) -> Option<Image> {
        let mut state = self.state.lock();
        let entry = state.entries.pop(key)?;
        state.total_cost -= entry.cost;
        Some(entry.image)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_cost = 0;
    }

    /// The number of cached images.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The summed cost of all cached images.
    pub fn total_cost(&self) -> u64 {
        self.state.lock().total_cost
    }

    pub fn set_max_cost(&self, max_cost: Option<u64>) {
        let mut state = self.state.lock();
        state.max_cost = max_cost;
        state.evict();
    }

    pub fn set_max_count(&self, max_count: Option<usize>) {
        let mut state = self.state.lock();
        state.max_count = max_count;
        state.evict();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(width: u32) -> Image {
        Image::new(width, 1, vec![0; width as usize * 4])
    }

    #[test]
    fn test_cost_bound() {
        let cache = MemoryCache::new(&MemoryCacheConfig {
            max_cost: Some(100),
            ..Default::default()
        });

        for i in 0..10 {
            cache.insert(format!("image-{i}"), image(30));
            assert!(cache.total_cost() <= 100);
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.total_cost(), 90);

        // the most recent ones survive
        assert!(cache.contains("image-9"));
        assert!(cache.contains("image-7"));
        assert!(!cache.contains("image-6"));
    }

    #[test]
    fn test_count_bound() {
        let cache = MemoryCache::new(&MemoryCacheConfig {
            max_count: Some(2),
            ..Default::default()
        });

        cache.insert("a".into(), image(1));
        cache.insert("b".into(), image(1));
        // touch `a` so `b` is the least recently used
        assert!(cache.get("a").is_some());
        cache.insert("c".into(), image(1));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn test_oversized_image() {
        let cache = MemoryCache::new(&MemoryCacheConfig {
            max_cost: Some(10),
            ..Default::default()
        });

        cache.insert("small".into(), image(5));
        cache.insert("huge".into(), image(50));
        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_replace_and_remove() {
        let cache = MemoryCache::new(&MemoryCacheConfig::default());

        cache.insert("a".into(), image(10));
        cache.insert("a".into(), image(20));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_cost(), 20);

        assert_eq!(cache.remove("a").map(|image| image.width()), Some(20));
        assert_eq!(cache.remove("a"), None);
        assert_eq!(cache.total_cost(), 0);

        cache.insert("b".into(), image(10));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_shrinking_limits() {
        let cache = MemoryCache::new(&MemoryCacheConfig::default());
        for i in 0..5 {
            cache.insert(format!("image-{i}"), image(10));
        }

        cache.set_max_count(Some(3));
        assert_eq!(cache.len(), 3);

        cache.set_max_cost(Some(15));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("image-4"));
    }
}
