use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct CacheEntry {
    encoded: Vec<u8>,
    last_access_run_count: u64,
}

impl CacheEntry {
    fn age(&self, current_run_count: u64) -> u64 {
        current_run_count.saturating_sub(self.last_access_run_count)
    }
}

/// Encoded forward messages keyed by hash.
///
/// Age is measured in completed script runs since an entry was last
/// written or read, not in wall-clock time. The run counter only ever moves
/// forward for the lifetime of the store.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: HashMap<String, CacheEntry>,
    script_run_count: u64,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, hash: impl Into<String>, encoded: Vec<u8>) {
        let hash = hash.into();
        debug!(hash = %hash, bytes = encoded.len(), "caching forward message");
        self.entries.insert(
            hash,
            CacheEntry {
                encoded,
                last_access_run_count: self.script_run_count,
            },
        );
    }

    /// A hit counts as an access: the entry is protected from eviction as if
    /// it had just been written.
    pub fn get(&mut self, hash: &str) -> Option<&[u8]> {
        let current = self.script_run_count;
        let entry = self.entries.get_mut(hash)?;
        entry.last_access_run_count = current;
        Some(&entry.encoded)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn last_access(&self, hash: &str) -> Option<u64> {
        self.entries.get(hash).map(|entry| entry.last_access_run_count)
    }

    pub fn script_run_count(&self) -> u64 {
        self.script_run_count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Call once per completed script run. Returns how many entries expired.
    pub fn advance_run_count_and_evict(&mut self, max_age: u32) -> usize {
        self.script_run_count += 1;
        let current = self.script_run_count;
        let before = self.entries.len();

        self.entries.retain(|hash, entry| {
            if entry.age(current) > u64::from(max_age) {
                info!(hash = %hash, "removing expired forward message");
                false
            } else {
                true
            }
        });

        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_returns_same_bytes() {
        let mut cache = CacheStore::new();
        cache.put("h1", b"payload".to_vec());

        assert_eq!(cache.get("h1"), Some(&b"payload"[..]));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn put_overwrites_existing_entry() {
        let mut cache = CacheStore::new();
        cache.put("h1", b"old".to_vec());
        cache.advance_run_count_and_evict(5);
        cache.put("h1", b"new".to_vec());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.last_access("h1"), Some(1));
        assert_eq!(cache.get("h1"), Some(&b"new"[..]));
    }

    #[test]
    fn get_refreshes_access_stamp() {
        let mut cache = CacheStore::new();
        cache.put("h1", b"a".to_vec());
        cache.advance_run_count_and_evict(10);
        cache.advance_run_count_and_evict(10);
        assert_eq!(cache.last_access("h1"), Some(0));

        cache.get("h1").expect("entry present");
        assert_eq!(cache.last_access("h1"), Some(2));
    }

    #[test]
    fn contains_does_not_refresh_access_stamp() {
        let mut cache = CacheStore::new();
        cache.put("h1", b"a".to_vec());
        cache.advance_run_count_and_evict(10);

        assert!(cache.contains("h1"));
        assert_eq!(cache.last_access("h1"), Some(0));
    }

    #[test]
    fn entries_expire_once_older_than_max_age() {
        let mut cache = CacheStore::new();
        cache.put("h1", b"a".to_vec());

        assert_eq!(cache.advance_run_count_and_evict(2), 0);
        assert_eq!(cache.advance_run_count_and_evict(2), 0);
        assert!(cache.contains("h1"));

        assert_eq!(cache.advance_run_count_and_evict(2), 1);
        assert!(!cache.contains("h1"));
    }

    #[test]
    fn accessed_entries_outlive_untouched_ones() {
        let mut cache = CacheStore::new();
        cache.put("kept", b"a".to_vec());
        cache.put("dropped", b"b".to_vec());

        for _ in 0..3 {
            cache.get("kept").expect("kept entry present");
            cache.advance_run_count_and_evict(1);
        }

        assert!(cache.contains("kept"));
        assert!(!cache.contains("dropped"));
    }

    #[test]
    fn zero_max_age_evicts_everything_on_next_run() {
        let mut cache = CacheStore::new();
        for i in 0..64 {
            cache.put(format!("h{i}"), vec![i as u8]);
        }

        assert_eq!(cache.advance_run_count_and_evict(0), 64);
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_sweep_visits_every_entry_once() {
        let mut cache = CacheStore::new();
        for i in 0..100 {
            cache.put(format!("old{i}"), vec![0]);
        }
        cache.advance_run_count_and_evict(10);
        for i in 0..100 {
            cache.put(format!("new{i}"), vec![1]);
        }

        // old entries are age 2, new entries age 1
        assert_eq!(cache.advance_run_count_and_evict(1), 100);
        assert_eq!(cache.len(), 100);
        assert!((0..100).all(|i| cache.contains(&format!("new{i}"))));
    }

    #[test]
    fn run_count_only_moves_forward() {
        let mut cache = CacheStore::new();
        let mut last = cache.script_run_count();
        for _ in 0..5 {
            cache.advance_run_count_and_evict(0);
            assert!(cache.script_run_count() > last);
            last = cache.script_run_count();
        }
    }
}
