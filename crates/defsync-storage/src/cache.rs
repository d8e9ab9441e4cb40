use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Injected blob cache. Implementations must be safe to share across fetch tasks.
pub trait ContentCache: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl ContentCache for NoopCache {
    fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }

    fn set(&self, _key: &str, _value: Vec<u8>) {}
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: Vec<u8>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_cache_returns_what_was_set() {
        let cache = MemoryCache::new();
        assert!(cache.is_empty());
        cache.set("acme/defs@abc", b"one".to_vec());
        cache.set("acme/defs@abc", b"two".to_vec());
        assert_eq!(cache.get("acme/defs@abc").as_deref(), Some(&b"two"[..]));
        assert_eq!(cache.get("acme/defs@def"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn noop_cache_never_hits() {
        let cache = NoopCache;
        cache.set("k", b"v".to_vec());
        assert_eq!(cache.get("k"), None);
    }
}
