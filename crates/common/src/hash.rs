use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of an asset payload. Used for dedup and integrity.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
