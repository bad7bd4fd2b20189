//! Chunked asset transport: moves asset payloads across the remote asset
//! service boundary in fixed-size chunks.
//!
//! # Invariants
//! - Chunks travel strictly in index order, one round-trip at a time.
//! - A download either yields exactly `byte_length` bytes or fails; partial
//!   payloads never reach the caller.
//! - A failed upload is compensated (placeholder aborted, fresh blob deleted)
//!   and never retried.

mod chunked;
mod memory;
mod service;

pub use chunked::{ChunkedTransport, Direction, TransferUpdate, TransportConfig, TransportError};
pub use memory::{MemoryAssetService, ServiceCall};
pub use service::{AssetService, InitUpload, ServiceError};
pub use tokio_util::sync::CancellationToken;
