use crate::service::{AssetService, InitUpload, ServiceError};
use khetworld_common::{
    AssetRef, BlobId, ClientConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_ASSET_BYTES, Khet, KhetId,
    StoreId, chunk_count,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Chunking parameters. Both ends must agree on `chunk_size` out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub chunk_size: usize,
    /// Largest declared `byteLength` a download will accept.
    pub max_asset_bytes: u64,
}

impl TransportConfig {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_asset_bytes: DEFAULT_MAX_ASSET_BYTES,
        }
    }
}

impl From<&ClientConfig> for TransportConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_asset_bytes: config.max_asset_bytes,
        }
    }
}

/// Errors from chunked transfers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid transport config: {0}")]
    InvalidConfig(&'static str),
    #[error("khet {0} has no resident asset to upload")]
    NoResidentAsset(KhetId),
    #[error("transport failure: {0}")]
    Service(#[from] ServiceError),
    #[error("integrity gap in blob {blob}: chunk {index} of {expected} missing")]
    IntegrityGap {
        blob: BlobId,
        index: u64,
        expected: u64,
    },
    #[error("length mismatch in blob {blob}: declared {declared} bytes, reassembled {actual}")]
    LengthMismatch {
        blob: BlobId,
        declared: u64,
        actual: u64,
    },
    #[error("blob {blob} declares {declared} bytes, above the {limit} byte limit")]
    TooLarge {
        blob: BlobId,
        declared: u64,
        limit: u64,
    },
    #[error("finalize rejected for {id}: {reason}")]
    FinalizeRejected { id: KhetId, reason: String },
    #[error("transfer cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Progress notifications for a status indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferUpdate {
    Started {
        direction: Direction,
        total_chunks: u64,
    },
    Chunk {
        direction: Direction,
        index: u64,
        total_chunks: u64,
    },
    Finished {
        direction: Direction,
    },
    Failed {
        direction: Direction,
        reason: String,
    },
}

/// Splits asset payloads into fixed-size chunks and moves them across an
/// [`AssetService`] strictly in index order.
#[derive(Debug)]
pub struct ChunkedTransport<S> {
    service: S,
    config: TransportConfig,
}

impl<S: AssetService> ChunkedTransport<S> {
    pub fn new(service: S, config: TransportConfig) -> Result<Self, TransportError> {
        if config.chunk_size == 0 {
            return Err(TransportError::InvalidConfig("chunk_size must be positive"));
        }
        if config.max_asset_bytes == 0 {
            return Err(TransportError::InvalidConfig("max_asset_bytes must be positive"));
        }
        Ok(Self { service, config })
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Upload the khet's resident asset and return its durable reference.
    pub async fn upload(
        &self,
        khet: &Khet,
        store_id: StoreId,
        cancel: &CancellationToken,
    ) -> Result<AssetRef, TransportError> {
        self.upload_with_progress(khet, store_id, cancel, &mut |_| {})
            .await
    }

    pub async fn upload_with_progress(
        &self,
        khet: &Khet,
        store_id: StoreId,
        cancel: &CancellationToken,
        progress: &mut impl FnMut(TransferUpdate),
    ) -> Result<AssetRef, TransportError> {
        let span = tracing::info_span!("asset_upload", id = %khet.id, %store_id);
        let result = self
            .upload_inner(khet, store_id, cancel, progress)
            .instrument(span)
            .await;
        report_outcome(Direction::Upload, &result, progress);
        result
    }

    /// Fetch and reassemble an asset. Never returns a partial payload.
    pub async fn download(
        &self,
        asset_ref: &AssetRef,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransportError> {
        self.download_with_progress(asset_ref, cancel, &mut |_| {})
            .await
    }

    pub async fn download_with_progress(
        &self,
        asset_ref: &AssetRef,
        cancel: &CancellationToken,
        progress: &mut impl FnMut(TransferUpdate),
    ) -> Result<Vec<u8>, TransportError> {
        let span = tracing::info_span!(
            "asset_download",
            blob = %asset_ref.blob_id,
            bytes = asset_ref.byte_length
        );
        let result = self
            .download_inner(asset_ref, cancel, progress)
            .instrument(span)
            .await;
        report_outcome(Direction::Download, &result, progress);
        result
    }

    async fn upload_inner(
        &self,
        khet: &Khet,
        store_id: StoreId,
        cancel: &CancellationToken,
        progress: &mut impl FnMut(TransferUpdate),
    ) -> Result<AssetRef, TransportError> {
        let bytes = khet
            .asset_bytes
            .as_deref()
            .ok_or_else(|| TransportError::NoResidentAsset(khet.id.clone()))?;
        let byte_length = bytes.len() as u64;
        let total_chunks = chunk_count(byte_length, self.config.chunk_size)
            .ok_or(TransportError::InvalidConfig("chunk_size must be positive"))?;

        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let (blob_id, fresh) = match self.service.init_upload(&khet.metadata(), store_id).await? {
            InitUpload::Existing(blob) => (blob, false),
            InitUpload::New(blob) => (blob, true),
        };

        if fresh {
            progress(TransferUpdate::Started {
                direction: Direction::Upload,
                total_chunks,
            });
            for (index, chunk) in bytes.chunks(self.config.chunk_size).enumerate() {
                let index = index as u64;
                if cancel.is_cancelled() {
                    self.compensate(&khet.id, &blob_id, fresh).await;
                    return Err(TransportError::Cancelled);
                }
                if let Err(e) = self.service.store_chunk(&blob_id, index, chunk).await {
                    tracing::warn!(index, error = %e, "chunk upload failed");
                    self.compensate(&khet.id, &blob_id, fresh).await;
                    return Err(e.into());
                }
                tracing::trace!(index, total_chunks, "chunk stored");
                progress(TransferUpdate::Chunk {
                    direction: Direction::Upload,
                    index,
                    total_chunks,
                });
            }
        } else {
            tracing::debug!(blob = %blob_id, "store already holds this content, skipping chunks");
            progress(TransferUpdate::Started {
                direction: Direction::Upload,
                total_chunks: 0,
            });
        }

        if let Err(e) = self
            .service
            .finalize(&khet.id, store_id, &blob_id, total_chunks)
            .await
        {
            tracing::warn!(error = %e, "finalize failed");
            self.compensate(&khet.id, &blob_id, fresh).await;
            return Err(match e {
                ServiceError::Rejected(reason) => TransportError::FinalizeRejected {
                    id: khet.id.clone(),
                    reason,
                },
                other => other.into(),
            });
        }

        tracing::info!(blob = %blob_id, byte_length, chunks = total_chunks, "asset uploaded");
        Ok(AssetRef {
            store_id,
            blob_id,
            byte_length,
        })
    }

    async fn download_inner(
        &self,
        asset_ref: &AssetRef,
        cancel: &CancellationToken,
        progress: &mut impl FnMut(TransferUpdate),
    ) -> Result<Vec<u8>, TransportError> {
        let blob = &asset_ref.blob_id;
        let declared = asset_ref.byte_length;
        if declared > self.config.max_asset_bytes {
            tracing::warn!(declared, limit = self.config.max_asset_bytes, "declared length over limit");
            return Err(TransportError::TooLarge {
                blob: blob.clone(),
                declared,
                limit: self.config.max_asset_bytes,
            });
        }
        let total_chunks = asset_ref
            .chunk_count(self.config.chunk_size)
            .ok_or(TransportError::InvalidConfig("chunk_size must be positive"))?;
        progress(TransferUpdate::Started {
            direction: Direction::Download,
            total_chunks,
        });

        // The declared length is untrusted; grow past one chunk as data arrives.
        let mut buf = Vec::with_capacity(declared.min(self.config.chunk_size as u64) as usize);
        for index in 0..total_chunks {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let chunk = match self.service.get_chunk(blob, index).await? {
                Some(chunk) if !chunk.is_empty() => chunk,
                _ => {
                    tracing::warn!(index, total_chunks, "chunk missing, aborting download");
                    return Err(TransportError::IntegrityGap {
                        blob: blob.clone(),
                        index,
                        expected: total_chunks,
                    });
                }
            };
            if (buf.len() + chunk.len()) as u64 > declared {
                return Err(TransportError::LengthMismatch {
                    blob: blob.clone(),
                    declared,
                    actual: (buf.len() + chunk.len()) as u64,
                });
            }
            buf.extend_from_slice(&chunk);
            progress(TransferUpdate::Chunk {
                direction: Direction::Download,
                index,
                total_chunks,
            });
        }

        if buf.len() as u64 != declared {
            return Err(TransportError::LengthMismatch {
                blob: blob.clone(),
                declared,
                actual: buf.len() as u64,
            });
        }
        tracing::debug!(bytes = declared, chunks = total_chunks, "asset downloaded");
        Ok(buf)
    }

    /// Best-effort cleanup after a failed upload. A deduplicated blob belongs
    /// to other khets and is never deleted.
    async fn compensate(&self, id: &KhetId, blob: &BlobId, fresh: bool) {
        if fresh {
            if let Err(e) = self.service.delete_blob(blob).await {
                tracing::warn!(%blob, error = %e, "cleanup: delete_blob failed");
            }
        }
        if let Err(e) = self.service.abort_upload(id).await {
            tracing::warn!(%id, error = %e, "cleanup: abort_upload failed");
        }
    }
}

fn report_outcome<T>(
    direction: Direction,
    result: &Result<T, TransportError>,
    progress: &mut impl FnMut(TransferUpdate),
) {
    match result {
        Ok(_) => progress(TransferUpdate::Finished { direction }),
        Err(e) => progress(TransferUpdate::Failed {
            direction,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAssetService, ServiceCall};
    use khetworld_common::{KhetType, content_hash};

    const MIB: usize = 1024 * 1024;

    fn transport(chunk_size: usize) -> ChunkedTransport<MemoryAssetService> {
        ChunkedTransport::new(
            MemoryAssetService::new(),
            TransportConfig::with_chunk_size(chunk_size),
        )
        .unwrap()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn four_and_a_half_mib_upload_uses_three_chunks() {
        let transport = transport(2 * MIB);
        let khet = Khet::author(KhetType::SceneObject, payload(4 * MIB + MIB / 2));
        let store = StoreId::new();

        let asset_ref = transport
            .upload(&khet, store, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(asset_ref.byte_length, (4 * MIB + MIB / 2) as u64);

        let calls = transport.service().calls();
        let chunk_indices: Vec<u64> = calls
            .iter()
            .filter_map(|c| match c {
                ServiceCall::StoreChunk { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(chunk_indices, vec![0, 1, 2]);
        assert!(calls.iter().any(|c| matches!(
            c,
            ServiceCall::Finalize { chunk_count: 3, .. }
        )));
    }

    #[tokio::test]
    async fn reassembly_is_bit_identical() {
        let transport = transport(1000);
        let bytes = payload(4321);
        let khet = Khet::author(KhetType::MobileObject, bytes.clone());
        let cancel = CancellationToken::new();

        let asset_ref = transport.upload(&khet, StoreId::new(), &cancel).await.unwrap();
        let downloaded = transport.download(&asset_ref, &cancel).await.unwrap();

        assert_eq!(downloaded.len() as u64, asset_ref.byte_length);
        assert_eq!(downloaded, bytes);
        assert_eq!(content_hash(&downloaded), khet.content_hash);
    }

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let transport = transport(64);
        let store = StoreId::new();
        let cancel = CancellationToken::new();
        let a = Khet::author(KhetType::SceneObject, payload(300));
        let b = Khet::author(KhetType::InteractiveObject, payload(300));
        assert_ne!(a.id, b.id);

        let ref_a = transport.upload(&a, store, &cancel).await.unwrap();
        transport.service().clear_calls();
        let ref_b = transport.upload(&b, store, &cancel).await.unwrap();

        assert_eq!(transport.service().blob_count(), 1);
        assert_eq!(ref_a.blob_id, ref_b.blob_id);
        let second_calls = transport.service().calls();
        assert!(
            !second_calls
                .iter()
                .any(|c| matches!(c, ServiceCall::StoreChunk { .. }))
        );
        assert_eq!(transport.service().finalized_khets().len(), 2);
    }

    #[tokio::test]
    async fn missing_chunk_fails_whole_download() {
        let transport = transport(100);
        let khet = Khet::author(KhetType::SceneObject, payload(500));
        let cancel = CancellationToken::new();
        let asset_ref = transport.upload(&khet, StoreId::new(), &cancel).await.unwrap();

        transport.service().withhold_chunk(&asset_ref.blob_id, 2);
        match transport.download(&asset_ref, &cancel).await {
            Err(TransportError::IntegrityGap {
                index, expected, ..
            }) => {
                assert_eq!(index, 2);
                assert_eq!(expected, 5);
            }
            other => panic!("expected IntegrityGap, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunk_failure_triggers_cleanup() {
        let transport = transport(10);
        let khet = Khet::author(KhetType::SceneObject, payload(35));
        transport.service().fail_store_chunk_at(1);

        let result = transport
            .upload(&khet, StoreId::new(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransportError::Service(_))));

        let calls = transport.service().calls();
        assert!(calls.iter().any(|c| matches!(c, ServiceCall::DeleteBlob { .. })));
        assert!(calls.iter().any(|c| matches!(c, ServiceCall::AbortUpload { .. })));
        assert!(!calls.iter().any(|c| matches!(c, ServiceCall::Finalize { .. })));
        assert_eq!(transport.service().blob_count(), 0);
    }

    #[tokio::test]
    async fn finalize_rejection_surfaces_reason() {
        let transport = transport(10);
        let khet = Khet::author(KhetType::SceneObject, payload(25));
        transport.service().reject_finalize("quota exceeded");

        match transport
            .upload(&khet, StoreId::new(), &CancellationToken::new())
            .await
        {
            Err(TransportError::FinalizeRejected { reason, .. }) => {
                assert_eq!(reason, "quota exceeded");
            }
            other => panic!("expected FinalizeRejected, got {other:?}"),
        }
        assert_eq!(transport.service().blob_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_honored_at_chunk_boundary() {
        let transport = transport(10);
        let khet = Khet::author(KhetType::SceneObject, payload(50));
        let cancel = CancellationToken::new();

        let result = transport
            .upload_with_progress(&khet, StoreId::new(), &cancel, &mut |update| {
                if let TransferUpdate::Chunk { index: 0, .. } = update {
                    cancel.cancel();
                }
            })
            .await;
        assert!(matches!(result, Err(TransportError::Cancelled)));

        let stored = transport
            .service()
            .calls()
            .iter()
            .filter(|c| matches!(c, ServiceCall::StoreChunk { .. }))
            .count();
        assert_eq!(stored, 1);
        assert_eq!(transport.service().blob_count(), 0);
    }

    #[tokio::test]
    async fn upload_without_asset_is_rejected() {
        let transport = transport(10);
        let khet = Khet::new("bare", KhetType::SceneObject);
        let result = transport
            .upload(&khet, StoreId::new(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TransportError::NoResidentAsset(_))));
        assert!(transport.service().calls().is_empty());
    }

    #[tokio::test]
    async fn progress_reports_every_chunk() {
        let transport = transport(10);
        let khet = Khet::author(KhetType::SceneObject, payload(30));
        let mut updates = Vec::new();
        transport
            .upload_with_progress(&khet, StoreId::new(), &CancellationToken::new(), &mut |u| {
                updates.push(u)
            })
            .await
            .unwrap();

        assert_eq!(
            updates.first(),
            Some(&TransferUpdate::Started {
                direction: Direction::Upload,
                total_chunks: 3
            })
        );
        assert_eq!(
            updates.last(),
            Some(&TransferUpdate::Finished {
                direction: Direction::Upload
            })
        );
        assert_eq!(updates.len(), 5);
    }

    #[tokio::test]
    async fn empty_asset_has_no_chunks() {
        let transport = transport(10);
        let khet = Khet::author(KhetType::SceneObject, Vec::new());
        let cancel = CancellationToken::new();
        let asset_ref = transport.upload(&khet, StoreId::new(), &cancel).await.unwrap();
        assert_eq!(asset_ref.byte_length, 0);
        assert!(transport.download(&asset_ref, &cancel).await.unwrap().is_empty());
    }

    fn get_chunk_calls(transport: &ChunkedTransport<MemoryAssetService>) -> usize {
        transport
            .service()
            .calls()
            .iter()
            .filter(|c| matches!(c, ServiceCall::GetChunk { .. }))
            .count()
    }

    #[test]
    fn zero_sized_config_is_rejected() {
        let zero_chunk = ChunkedTransport::new(
            MemoryAssetService::new(),
            TransportConfig::with_chunk_size(0),
        );
        assert!(matches!(zero_chunk, Err(TransportError::InvalidConfig(_))));

        let zero_limit = ChunkedTransport::new(
            MemoryAssetService::new(),
            TransportConfig {
                chunk_size: 10,
                max_asset_bytes: 0,
            },
        );
        assert!(matches!(zero_limit, Err(TransportError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn absurd_declared_length_fails_before_fetching() {
        let transport = transport(10);
        let asset_ref = AssetRef {
            store_id: StoreId::new(),
            blob_id: BlobId::new("blob-huge"),
            byte_length: u64::MAX,
        };

        match transport.download(&asset_ref, &CancellationToken::new()).await {
            Err(TransportError::TooLarge {
                declared, limit, ..
            }) => {
                assert_eq!(declared, u64::MAX);
                assert_eq!(limit, DEFAULT_MAX_ASSET_BYTES);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
        assert_eq!(get_chunk_calls(&transport), 0);
    }

    #[tokio::test]
    async fn configured_limit_bounds_downloads() {
        let transport = ChunkedTransport::new(
            MemoryAssetService::new(),
            TransportConfig {
                chunk_size: 10,
                max_asset_bytes: 40,
            },
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let small = Khet::author(KhetType::SceneObject, payload(40));
        let large = Khet::author(KhetType::SceneObject, payload(41));
        let small_ref = transport.upload(&small, StoreId::new(), &cancel).await.unwrap();
        let large_ref = transport.upload(&large, StoreId::new(), &cancel).await.unwrap();

        assert_eq!(transport.download(&small_ref, &cancel).await.unwrap().len(), 40);
        assert!(matches!(
            transport.download(&large_ref, &cancel).await,
            Err(TransportError::TooLarge { declared: 41, limit: 40, .. })
        ));
    }

    #[tokio::test]
    async fn download_cancelled_after_first_chunk() {
        let transport = transport(10);
        let khet = Khet::author(KhetType::SceneObject, payload(50));
        let asset_ref = transport
            .upload(&khet, StoreId::new(), &CancellationToken::new())
            .await
            .unwrap();
        transport.service().clear_calls();

        let cancel = CancellationToken::new();
        let result = transport
            .download_with_progress(&asset_ref, &cancel, &mut |update| {
                if let TransferUpdate::Chunk {
                    direction: Direction::Download,
                    index: 0,
                    ..
                } = update
                {
                    cancel.cancel();
                }
            })
            .await;

        assert!(matches!(result, Err(TransportError::Cancelled)));
        assert_eq!(get_chunk_calls(&transport), 1);
    }

    #[tokio::test]
    async fn declared_length_must_match_reassembly() {
        let transport = transport(10);
        let cancel = CancellationToken::new();
        let khet = Khet::author(KhetType::SceneObject, payload(45));
        let stored = transport.upload(&khet, StoreId::new(), &cancel).await.unwrap();
        assert_eq!(stored.byte_length, 45);

        // Both lengths still span five chunks, so only the byte count differs.
        let short = AssetRef {
            byte_length: 42,
            ..stored.clone()
        };
        match transport.download(&short, &cancel).await {
            Err(TransportError::LengthMismatch {
                declared, actual, ..
            }) => {
                assert_eq!(declared, 42);
                assert_eq!(actual, 45);
            }
            other => panic!("expected LengthMismatch, got {other:?}"),
        }

        let long = AssetRef {
            byte_length: 48,
            ..stored
        };
        match transport.download(&long, &cancel).await {
            Err(TransportError::LengthMismatch {
                declared, actual, ..
            }) => {
                assert_eq!(declared, 48);
                assert_eq!(actual, 45);
            }
            other => panic!("expected LengthMismatch, got {other:?}"),
        }
    }
}
