use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

/// Thread-safe LRU cache keyed by string
///
/// Backs the query-embedding cache and the language-model response cache.
/// Uses LRU eviction to keep memory bounded.
pub struct MemoCache<V> {
    cache: Mutex<LruCache<String, V>>,
}

/// Query text to embedding.
pub type EmbeddingCache = MemoCache<Vec<f32>>;

/// Request digest to raw model response.
pub type ResponseCache = MemoCache<String>;

impl<V: Clone> MemoCache<V> {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, V>> {
        // A panic while holding the lock cannot leave the LRU half-updated
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up `key`, marking it most recently used
    pub fn get(&self, key: &str) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn put(&self, key: String, value: V) {
        self.lock().put(key, value);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_put_and_get() {
        let cache = EmbeddingCache::new(10);
        cache.put("test query".to_string(), vec![1.0, 2.0, 3.0]);
        assert_eq!(cache.get("test query"), Some(vec![1.0, 2.0, 3.0]));
        assert!(cache.get("nonexistent query").is_none());
    }

    #[test]
    fn test_cache_get_updates_lru() {
        let cache = ResponseCache::new(2);
        cache.put("a".to_string(), "1".to_string());
        cache.put("b".to_string(), "2".to_string());

        // Touch a so b becomes the eviction candidate
        let _ = cache.get("a");
        cache.put("c".to_string(), "3".to_string());

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let cache = EmbeddingCache::new(0);
        cache.put("q1".to_string(), vec![1.0]);
        cache.put("q2".to_string(), vec![2.0]);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("q2").is_some());

        cache.clear();
        assert!(cache.is_empty());
    }
}
