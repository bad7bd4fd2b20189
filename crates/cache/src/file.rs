//! Directory-backed content cache.
//!
//! Layout inside the cache directory:
//! ```text
//! cache.meta.json                  - schema version
//! entries/
//!   <sha256(id)>.khet.cbor.zst     - CBOR+zstd compressed khet record
//! ```
//! Entry names hash the khet id so arbitrary id strings are filesystem-safe.

use crate::{ContentCache, checked};
use khetworld_common::{Khet, KhetId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Current on-disk record schema.
const CACHE_SCHEMA_VERSION: u32 = 1;

const ENTRY_SUFFIX: &str = ".khet.cbor.zst";

/// Errors from file-backed cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("schema version mismatch: cache has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
}

/// Metadata stored in cache.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub schema_version: u32,
}

/// Size summary of a cache directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes_on_disk: u64,
}

/// Durable cache rooted at a directory. Survives process restarts.
#[derive(Debug)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    /// Open or create a cache at the given path.
    ///
    /// An existing cache written with a different schema version is refused.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("entries"))?;

        let meta_path = root.join("cache.meta.json");
        if meta_path.exists() {
            let meta: CacheMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.schema_version != CACHE_SCHEMA_VERSION {
                return Err(CacheError::SchemaMismatch {
                    file_version: meta.schema_version,
                    expected_version: CACHE_SCHEMA_VERSION,
                });
            }
        } else {
            let meta = CacheMeta {
                schema_version: CACHE_SCHEMA_VERSION,
            };
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
        }

        tracing::debug!(root = %root.display(), "content cache opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a record, surfacing failures instead of folding them into a miss.
    pub fn read(&self, id: &KhetId) -> Result<Option<Khet>, CacheError> {
        let path = self.entry_path(id);
        let compressed = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let cbor_bytes = zstd_decompress(&compressed)?;
        cbor_deserialize(&cbor_bytes).map(Some)
    }

    /// Write a record. The entry is replaced atomically via a rename.
    pub fn write(&self, khet: &Khet) -> Result<(), CacheError> {
        let path = self.entry_path(&khet.id);
        let tmp = path.with_extension("tmp");

        let cbor_bytes = cbor_serialize(khet)?;
        let compressed = zstd_compress(&cbor_bytes)?;
        std::fs::write(&tmp, &compressed)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn delete(&self, id: &KhetId) -> Result<bool, CacheError> {
        match std::fs::remove_file(self.entry_path(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();
        for entry in std::fs::read_dir(self.root.join("entries"))? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().ends_with(ENTRY_SUFFIX) {
                stats.entries += 1;
                stats.bytes_on_disk += entry.metadata()?.len();
            }
        }
        Ok(stats)
    }

    fn entry_path(&self, id: &KhetId) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(id.as_str().as_bytes());
        let name = format!("{:x}{ENTRY_SUFFIX}", hasher.finalize());
        self.root.join("entries").join(name)
    }
}

impl ContentCache for FileCache {
    fn get(&self, id: &KhetId) -> Option<Khet> {
        match self.read(id) {
            Ok(Some(khet)) => checked(id, khet),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(%id, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    fn put(&self, khet: &Khet) -> bool {
        match self.write(khet) {
            Ok(()) => {
                tracing::trace!(id = %khet.id, "cache record written");
                true
            }
            Err(e) => {
                tracing::warn!(id = %khet.id, error = %e, "cache write failed");
                false
            }
        }
    }

    fn remove(&self, id: &KhetId) -> bool {
        match self.delete(id) {
            Ok(existed) => existed,
            Err(e) => {
                tracing::warn!(%id, error = %e, "cache delete failed");
                false
            }
        }
    }

    fn len(&self) -> usize {
        match self.stats() {
            Ok(stats) => stats.entries,
            Err(e) => {
                tracing::warn!(error = %e, "cache scan failed");
                0
            }
        }
    }
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CacheError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CacheError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, CacheError> {
    ciborium::from_reader(data).map_err(|e| CacheError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use khetworld_common::KhetType;

    #[test]
    fn open_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::open(tmp.path().join("cache")).unwrap();
        assert!(cache.root().join("entries").is_dir());
        assert!(cache.root().join("cache.meta.json").is_file());
        assert!(cache.is_empty());
    }

    #[test]
    fn records_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache");
        let khet = Khet::author(KhetType::MobileObject, vec![42; 4096]);

        {
            let cache = FileCache::open(&path).unwrap();
            assert!(cache.put(&khet));
        }

        let reopened = FileCache::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(&khet.id), Some(khet));
    }

    #[test]
    fn ids_with_path_separators_are_safe() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::open(tmp.path()).unwrap();
        let khet = Khet::new("../../etc/passwd", KhetType::Entity).with_asset(vec![1]);
        assert!(cache.put(&khet));
        assert!(cache.get(&khet.id).is_some());
        assert_eq!(cache.stats().unwrap().entries, 1);
    }

    #[test]
    fn corrupted_entry_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::open(tmp.path()).unwrap();
        let khet = Khet::author(KhetType::SceneObject, vec![5; 128]);
        cache.put(&khet);

        let path = cache.entry_path(&khet.id);
        let mut data = std::fs::read(&path).unwrap();
        data.truncate(data.len() / 2);
        std::fs::write(&path, &data).unwrap();

        assert!(cache.read(&khet.id).is_err());
        assert!(cache.get(&khet.id).is_none());
    }

    #[test]
    fn remove_deletes_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::open(tmp.path()).unwrap();
        let khet = Khet::author(KhetType::SceneObject, vec![1, 2]);
        cache.put(&khet);
        assert!(cache.remove(&khet.id));
        assert!(!cache.remove(&khet.id));
        assert!(cache.get(&khet.id).is_none());
    }

    #[test]
    fn schema_mismatch_fail_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache");
        let _cache = FileCache::open(&path).unwrap();

        let meta_path = path.join("cache.meta.json");
        let meta = CacheMeta { schema_version: 999 };
        serde_json::to_writer_pretty(std::fs::File::create(&meta_path).unwrap(), &meta).unwrap();

        match FileCache::open(&path) {
            Err(CacheError::SchemaMismatch {
                file_version,
                expected_version,
            }) => {
                assert_eq!(file_version, 999);
                assert_eq!(expected_version, CACHE_SCHEMA_VERSION);
            }
            Err(e) => panic!("expected SchemaMismatch, got: {e}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }
}
