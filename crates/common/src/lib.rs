//! Shared data model for the khetworld core.
//!
//! # Invariants
//! - A khet id never changes once assigned.
//! - Resident asset bytes always hash to the recorded content hash.
//! - Avatars never carry interaction points.

mod config;
mod hash;
mod khet;
mod types;

pub use config::{
    ClientConfig, ConfigError, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_ASSET_BYTES,
    DEFAULT_POSE_INTERVAL_MS,
};
pub use hash::content_hash;
pub use khet::{InteractionPoint, Khet, KhetError, KhetType};
pub use types::{AssetRef, BlobId, KhetId, Pose, StoreId, chunk_count};
