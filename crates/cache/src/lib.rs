//! Content cache: durable local store of khet records keyed by khet id.
//!
//! # Invariants
//! - A record is always the full khet, including resident asset bytes.
//! - Reads never fail: I/O or decode problems are logged and reported as a miss.
//! - No eviction. Concurrent writers to one id resolve last-writer-wins.

mod file;
mod memory;

pub use file::{CacheError, CacheMeta, CacheStats, FileCache};
pub use memory::MemoryCache;

use khetworld_common::{Khet, KhetId};

/// Key-value store of khet records.
///
/// Methods take `&self`; implementations own whatever interior state they
/// need, so one cache can be handed to both the remote sync path and the peer
/// replication path.
pub trait ContentCache {
    /// Look up a record. Any failure is a miss.
    fn get(&self, id: &KhetId) -> Option<Khet>;

    /// Store or overwrite a record. Returns whether the write was acknowledged.
    fn put(&self, khet: &Khet) -> bool;

    /// Drop a record. Returns whether one existed.
    fn remove(&self, id: &KhetId) -> bool;

    /// Number of records currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: ContentCache + ?Sized> ContentCache for &C {
    fn get(&self, id: &KhetId) -> Option<Khet> {
        (**self).get(id)
    }

    fn put(&self, khet: &Khet) -> bool {
        (**self).put(khet)
    }

    fn remove(&self, id: &KhetId) -> bool {
        (**self).remove(id)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// Reject a record whose bytes no longer match its recorded hash.
fn checked(requested: &KhetId, khet: Khet) -> Option<Khet> {
    if &khet.id != requested {
        tracing::warn!(%requested, stored = %khet.id, "cache record id mismatch, treating as miss");
        return None;
    }
    if let Err(e) = khet.verify_content_hash() {
        tracing::warn!(id = %requested, error = %e, "stale cache record, treating as miss");
        return None;
    }
    Some(khet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use khetworld_common::{KhetType, content_hash};

    fn roundtrip_preserves_hash(cache: &dyn ContentCache) {
        let khet = Khet::author(KhetType::SceneObject, (0..=255).collect());
        assert!(cache.put(&khet));

        let cached = cache.get(&khet.id).unwrap();
        let bytes = cached.asset_bytes.as_ref().unwrap();
        assert_eq!(content_hash(bytes), khet.content_hash);
        assert_eq!(cached, khet);
    }

    #[test]
    fn memory_cache_roundtrip_preserves_hash() {
        roundtrip_preserves_hash(&MemoryCache::new());
    }

    #[test]
    fn file_cache_roundtrip_preserves_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::open(tmp.path().join("cache")).unwrap();
        roundtrip_preserves_hash(&cache);
    }

    #[test]
    fn borrowed_cache_delegates() {
        let cache = MemoryCache::new();
        let borrowed = &cache;
        let khet = Khet::author(KhetType::Entity, vec![1]);
        assert!(borrowed.put(&khet));
        assert_eq!(cache.len(), 1);
        assert!(borrowed.remove(&khet.id));
        assert!(borrowed.is_empty());
    }
}
