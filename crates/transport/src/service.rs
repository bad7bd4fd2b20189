use khetworld_common::{BlobId, Khet, KhetId, StoreId};

/// Answer to an upload placeholder request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitUpload {
    /// The store already holds a blob with the same content hash.
    Existing(BlobId),
    /// A fresh placeholder blob awaiting chunks.
    New(BlobId),
}

/// Errors reported by the remote asset service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("remote call failed: {0}")]
    Call(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Remote side of the chunked asset protocol.
///
/// Every method is one round-trip and one suspension point.
#[allow(async_fn_in_trait)]
pub trait AssetService {
    /// Create an upload placeholder for `metadata` (asset bytes stripped),
    /// deduplicating by its content hash.
    async fn init_upload(&self, metadata: &Khet, store_id: StoreId)
    -> Result<InitUpload, ServiceError>;

    async fn store_chunk(&self, blob: &BlobId, index: u64, bytes: &[u8])
    -> Result<(), ServiceError>;

    /// Bind khet `id` to a complete blob. `Rejected` carries the remote reason.
    async fn finalize(
        &self,
        id: &KhetId,
        store_id: StoreId,
        blob: &BlobId,
        chunk_count: u64,
    ) -> Result<(), ServiceError>;

    async fn abort_upload(&self, id: &KhetId) -> Result<(), ServiceError>;

    /// `Ok(None)` when the chunk is absent.
    async fn get_chunk(&self, blob: &BlobId, index: u64) -> Result<Option<Vec<u8>>, ServiceError>;

    async fn delete_blob(&self, blob: &BlobId) -> Result<(), ServiceError>;
}

impl<S: AssetService> AssetService for &S {
    async fn init_upload(
        &self,
        metadata: &Khet,
        store_id: StoreId,
    ) -> Result<InitUpload, ServiceError> {
        (**self).init_upload(metadata, store_id).await
    }

    async fn store_chunk(
        &self,
        blob: &BlobId,
        index: u64,
        bytes: &[u8],
    ) -> Result<(), ServiceError> {
        (**self).store_chunk(blob, index, bytes).await
    }

    async fn finalize(
        &self,
        id: &KhetId,
        store_id: StoreId,
        blob: &BlobId,
        chunk_count: u64,
    ) -> Result<(), ServiceError> {
        (**self).finalize(id, store_id, blob, chunk_count).await
    }

    async fn abort_upload(&self, id: &KhetId) -> Result<(), ServiceError> {
        (**self).abort_upload(id).await
    }

    async fn get_chunk(&self, blob: &BlobId, index: u64) -> Result<Option<Vec<u8>>, ServiceError> {
        (**self).get_chunk(blob, index).await
    }

    async fn delete_blob(&self, blob: &BlobId) -> Result<(), ServiceError> {
        (**self).delete_blob(blob).await
    }
}
