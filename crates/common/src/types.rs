use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a khet.
///
/// Opaque to the core. Ids assigned by a remote store are taken verbatim;
/// client-authored khets get a random one from [`KhetId::generate`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KhetId(pub String);

impl KhetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for a khet authored locally, before any network identity exists.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KhetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KhetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for KhetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of the remote store that owns uploaded blobs.
///
/// Canonical text form is the hyphenated UUID; that is what crosses the peer
/// link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreId(pub Uuid);

impl StoreId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn to_text(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for StoreId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a blob inside a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(pub String);

impl BlobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable reference to an uploaded asset payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRef {
    pub store_id: StoreId,
    pub blob_id: BlobId,
    pub byte_length: u64,
}

impl AssetRef {
    /// Number of chunks this asset occupies for the given chunk size.
    pub fn chunk_count(&self, chunk_size: usize) -> Option<u64> {
        chunk_count(self.byte_length, chunk_size)
    }
}

/// Number of fixed-size chunks needed to carry `byte_length` bytes.
///
/// A zero-length payload has no chunks. `None` for a zero chunk size.
pub fn chunk_count(byte_length: u64, chunk_size: usize) -> Option<u64> {
    (chunk_size > 0).then(|| byte_length.div_ceil(chunk_size as u64))
}

/// Position and orientation of a streamed transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: DVec3,
    pub orientation: DQuat,
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: DVec3::ZERO,
            orientation: DQuat::IDENTITY,
        }
    }
}
