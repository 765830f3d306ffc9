use fuser::FileAttr;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::config::{CacheStrategy, Config};

// Cache entry with an expiry timestamp, used by the TTL strategy.
#[derive(Debug)]
pub struct TtlEntry {
    attr: FileAttr,
    expiry: Instant,
}

/// Attribute cache for `getattr`, keyed by inode.
///
/// Attributes of annexed paths are derived (link-target metadata plus mode
/// faking), so a short-lived cache saves one `lstat`+`readlink` round per
/// kernel query. Every mutating operation invalidates the affected inode;
/// a sync run clears the cache outright.
#[derive(Debug)]
pub enum AttributeCache {
    Ttl(HashMap<u64, TtlEntry>),
    Lru(LruCache<u64, FileAttr>),
    None,
}

impl AttributeCache {
    pub fn new(config: &Config) -> Self {
        match config.cache_strategy {
            CacheStrategy::Ttl => AttributeCache::Ttl(HashMap::new()),
            CacheStrategy::Lru => {
                let capacity = NonZeroUsize::new(config.cache_lru_capacity)
                    .unwrap_or(NonZeroUsize::new(1).unwrap());
                AttributeCache::Lru(LruCache::new(capacity))
            }
            CacheStrategy::None => AttributeCache::None,
        }
    }

    pub fn get(&mut self, ino: &u64) -> Option<FileAttr> {
        match self {
            AttributeCache::Ttl(cache) => {
                if let Some(entry) = cache.get(ino) {
                    if entry.expiry > Instant::now() {
                        log::debug!("cache hit (ttl) for inode {}", ino);
                        return Some(entry.attr);
                    }
                    cache.remove(ino);
                }
            }
            AttributeCache::Lru(cache) => {
                if let Some(attr) = cache.get(ino) {
                    log::debug!("cache hit (lru) for inode {}", ino);
                    return Some(*attr);
                }
            }
            AttributeCache::None => {}
        }
        None
    }

    pub fn put(&mut self, ino: u64, attr: FileAttr, ttl_duration: Duration) {
        match self {
            AttributeCache::Ttl(cache) => {
                let entry = TtlEntry {
                    attr,
                    expiry: Instant::now() + ttl_duration,
                };
                cache.insert(ino, entry);
            }
            AttributeCache::Lru(cache) => {
                cache.put(ino, attr);
            }
            AttributeCache::None => {}
        }
    }

    pub fn remove(&mut self, ino: &u64) {
        match self {
            AttributeCache::Ttl(cache) => {
                cache.remove(ino);
            }
            AttributeCache::Lru(cache) => {
                cache.pop(ino);
            }
            AttributeCache::None => {}
        }
    }

    /// Drops everything. Used after merges, which can rewrite any path.
    pub fn clear(&mut self) {
        match self {
            AttributeCache::Ttl(cache) => cache.clear(),
            AttributeCache::Lru(cache) => cache.clear(),
            AttributeCache::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuser::FileType;
    use std::time::UNIX_EPOCH;

    fn attr(ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: 10,
            blocks: 1,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
            blksize: 4096,
        }
    }

    fn config(strategy: CacheStrategy) -> Config {
        Config {
            cache_strategy: strategy,
            ..Config::default()
        }
    }

    #[test]
    fn test_ttl_expiry() {
        let mut cache = AttributeCache::new(&config(CacheStrategy::Ttl));
        cache.put(1, attr(1), Duration::from_secs(60));
        assert!(cache.get(&1).is_some());
        cache.put(2, attr(2), Duration::ZERO);
        assert!(cache.get(&2).is_none());
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = AttributeCache::new(&config(CacheStrategy::Lru));
        cache.put(1, attr(1), Duration::from_secs(60));
        cache.put(2, attr(2), Duration::from_secs(60));
        cache.remove(&1);
        assert!(cache.get(&1).is_none());
        assert!(cache.get(&2).is_some());
        cache.clear();
        assert!(cache.get(&2).is_none());
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let mut cache = AttributeCache::new(&config(CacheStrategy::None));
        cache.put(1, attr(1), Duration::from_secs(60));
        assert!(cache.get(&1).is_none());
    }
}
