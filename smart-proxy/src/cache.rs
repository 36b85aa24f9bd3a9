use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use tracing::debug;

/// Key/value memo of which transport config worked for a domain.
///
/// Implementations must be safe for concurrent use. `get` returns an empty string for a missing
/// key and `put` with an empty value removes the key, so an empty string is never stored.
pub trait StrategyCache: Send + Sync {
    fn get(&self, key: &str) -> String;
    fn put(&self, key: &str, value: &str);
}

/// Process-lifetime cache backed by a map.
#[derive(Default)]
pub struct MemoryStrategyCache {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStrategyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryStrategyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStrategyCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl StrategyCache for MemoryStrategyCache {
    fn get(&self, key: &str) -> String {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn put(&self, key: &str, value: &str) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if value.is_empty() {
            entries.remove(key);
        } else {
            entries.insert(key.to_string(), value.to_string());
        }
    }
}

/// Presence-typed view over a [`StrategyCache`] used by the resolver.
#[derive(Clone)]
pub(crate) struct StrategyMemo {
    cache: Arc<dyn StrategyCache>,
}

impl StrategyMemo {
    pub(crate) fn new(cache: Arc<dyn StrategyCache>) -> Self {
        Self { cache }
    }

    pub(crate) fn lookup(&self, domain: &str) -> Option<String> {
        let value = self.cache.get(domain);
        if value.is_empty() { None } else { Some(value) }
    }

    /// Callers pass the persisted form of a transport, which is never empty.
    pub(crate) fn remember(&self, domain: &str, transport: &str) {
        if transport.is_empty() {
            debug!("refusing to memoize empty transport for {domain}");
            return;
        }
        self.cache.put(domain, transport);
    }

    pub(crate) fn forget(&self, domain: &str) {
        self.cache.put(domain, "");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn put_then_get_returns_value() {
        let cache = MemoryStrategyCache::new();
        cache.put("example.com", "split:2");
        assert_eq!(cache.get("example.com"), "split:2");
    }

    #[test]
    fn get_on_missing_key_returns_empty() {
        let cache = MemoryStrategyCache::new();
        assert_eq!(cache.get("never-set.example"), "");
        assert!(cache.is_empty());
    }

    #[test]
    fn put_empty_value_deletes_entry() {
        let cache = MemoryStrategyCache::new();
        cache.put("example.com", "split:2");
        cache.put("example.com", "");
        assert_eq!(cache.get("example.com"), "");
        assert!(!cache.contains_key("example.com"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn put_empty_on_missing_key_stores_nothing() {
        let cache = MemoryStrategyCache::new();
        cache.put("example.com", "");
        assert!(!cache.contains_key("example.com"));
    }

    #[test]
    fn keys_are_case_sensitive() {
        let cache = MemoryStrategyCache::new();
        cache.put("Example.com", "split:1");
        assert_eq!(cache.get("example.com"), "");
        assert_eq!(cache.get("Example.com"), "split:1");
    }

    #[test]
    fn put_overwrites_previous_value() {
        let cache = MemoryStrategyCache::new();
        cache.put("example.com", "split:1");
        cache.put("example.com", "tlsfrag:1");
        assert_eq!(cache.get("example.com"), "tlsfrag:1");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_on_distinct_keys_are_not_lost() {
        let cache = Arc::new(MemoryStrategyCache::new());
        let mut tasks = Vec::new();
        for worker in 0..8 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let key = format!("w{worker}-k{i}");
                    cache.put(&key, "stale");
                    cache.put(&key, &format!("split:{}", i + 1));
                    let _ = cache.get(&key);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.len(), 8 * 50);
        for worker in 0..8 {
            for i in 0..50 {
                assert_eq!(
                    cache.get(&format!("w{worker}-k{i}")),
                    format!("split:{}", i + 1)
                );
            }
        }
    }

    #[test]
    fn memo_maps_empty_to_absent() {
        let cache = Arc::new(MemoryStrategyCache::new());
        let memo = StrategyMemo::new(cache.clone());
        assert_eq!(memo.lookup("example.com"), None);

        memo.remember("example.com", "split:3");
        assert_eq!(memo.lookup("example.com"), Some("split:3".to_string()));

        memo.forget("example.com");
        assert_eq!(memo.lookup("example.com"), None);
        assert!(!cache.contains_key("example.com"));
    }
}
