//! Bounded in-memory cache for synthesized speech
//!
//! Entries are keyed by voice and text. When the cache is full the oldest
//! insert is evicted first; reads do not refresh an entry's position.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// Default number of cached clips
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    voice: String,
    text: String,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Arc<Vec<u8>>>,
    order: VecDeque<CacheKey>,
}

/// Thread-safe FIFO cache of audio clips
pub struct TtsCache {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl Default for TtsCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TtsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, voice: &str, text: &str) -> Option<Arc<Vec<u8>>> {
        let inner = self.inner.read().ok()?;
        inner
            .entries
            .get(&CacheKey {
                voice: voice.to_string(),
                text: text.to_string(),
            })
            .cloned()
    }

    /// Store a clip, evicting the oldest entries beyond capacity
    pub fn insert(&self, voice: &str, text: &str, audio: Arc<Vec<u8>>) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        let key = CacheKey {
            voice: voice.to_string(),
            text: text.to_string(),
        };

        if inner.entries.insert(key.clone(), audio).is_some() {
            // Replacing an existing clip keeps its original position
            return;
        }
        inner.order.push_back(key);

        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.read().map(|i| i.entries.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(byte: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![byte])
    }

    #[test]
    fn test_get_after_insert() {
        let cache = TtsCache::new(4);
        cache.insert("alloy", "hello", clip(1));

        assert_eq!(cache.get("alloy", "hello").as_deref(), Some(&vec![1]));
        assert!(cache.get("nova", "hello").is_none());
    }

    #[test]
    fn test_evicts_oldest_beyond_capacity() {
        let cache = TtsCache::new(DEFAULT_CAPACITY);
        for i in 0..=DEFAULT_CAPACITY {
            cache.insert("alloy", &format!("line {}", i), clip(i as u8));
        }

        assert_eq!(cache.len(), DEFAULT_CAPACITY);
        assert!(cache.get("alloy", "line 0").is_none());
        assert!(cache.get("alloy", "line 1").is_some());
        assert!(cache.get("alloy", &format!("line {}", DEFAULT_CAPACITY)).is_some());
    }

    #[test]
    fn test_reads_do_not_refresh_position() {
        let cache = TtsCache::new(2);
        cache.insert("alloy", "a", clip(1));
        cache.insert("alloy", "b", clip(2));
        let _ = cache.get("alloy", "a");
        cache.insert("alloy", "c", clip(3));

        assert!(cache.get("alloy", "a").is_none());
        assert!(cache.get("alloy", "b").is_some());
    }

    #[test]
    fn test_reinsert_does_not_grow() {
        let cache = TtsCache::new(2);
        cache.insert("alloy", "a", clip(1));
        cache.insert("alloy", "a", clip(9));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("alloy", "a").as_deref(), Some(&vec![9]));
    }
}
