//! Hot cache.
//!
//! An in-process LRU over recently touched records. It is never the only
//! copy of anything: every record is written to the store before it is put
//! here, so dropping the cache (or a restart) only costs lookups.

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::types::{CacheStats, EpisodicRecord, SemanticFact, SkillMemory};

/// What a cache entry is looked up by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Episode(i64),
    Fact(i64),
    /// Best fact for a topic.
    FactTopic(String),
    /// Skill by name.
    Skill(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedRecord {
    Episode(EpisodicRecord),
    Fact(SemanticFact),
    Skill(SkillMemory),
}

impl CachedRecord {
    fn same_record(&self, other: &CachedRecord) -> bool {
        match (self, other) {
            (CachedRecord::Episode(a), CachedRecord::Episode(b)) => a.id == b.id,
            (CachedRecord::Fact(a), CachedRecord::Fact(b)) => a.id == b.id,
            (CachedRecord::Skill(a), CachedRecord::Skill(b)) => a.id == b.id,
            _ => false,
        }
    }
}

/// LRU cache with hit/miss accounting.
pub struct HotCache {
    entries: LruCache<CacheKey, CachedRecord>,
    hits: u64,
    misses: u64,
}

impl HotCache {
    /// `capacity` of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up and mark as most recently used. Never touches storage.
    pub fn get(&mut self, key: &CacheKey) -> Option<CachedRecord> {
        match self.entries.get(key) {
            Some(record) => {
                self.hits += 1;
                Some(record.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Look up without touching LRU order or counters.
    pub fn peek(&self, key: &CacheKey) -> Option<&CachedRecord> {
        self.entries.peek(key)
    }

    /// Insert or overwrite. Returns the least recently used entry if one
    /// had to make room.
    pub fn put(&mut self, key: CacheKey, record: CachedRecord) -> Option<(CacheKey, CachedRecord)> {
        match self.entries.push(key.clone(), record) {
            // push hands back the old value on overwrite; that is not an eviction
            Some((old_key, _)) if old_key == key => None,
            other => other,
        }
    }

    pub fn evict(&mut self, key: &CacheKey) -> Option<CachedRecord> {
        self.entries.pop(key)
    }

    /// True if `record` is still held under any key.
    pub fn is_resident(&self, record: &CachedRecord) -> bool {
        self.entries.iter().any(|(_, held)| held.same_record(record))
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.size(),
            capacity: self.capacity(),
            hits: self.hits,
            misses: self.misses,
            hit_rate: self.hit_rate(),
        }
    }
}
