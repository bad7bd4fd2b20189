use crate::service::{AssetService, InitUpload, ServiceError};
use khetworld_common::{AssetRef, BlobId, Khet, KhetId, StoreId};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};

/// One recorded call against [`MemoryAssetService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCall {
    InitUpload { id: KhetId },
    StoreChunk { blob: BlobId, index: u64, len: usize },
    Finalize { id: KhetId, blob: BlobId, chunk_count: u64 },
    AbortUpload { id: KhetId },
    GetChunk { blob: BlobId, index: u64 },
    DeleteBlob { blob: BlobId },
}

#[derive(Debug, Default)]
struct Blob {
    chunks: BTreeMap<u64, Vec<u8>>,
    content_hash: String,
    finalized: bool,
}

impl Blob {
    fn byte_length(&self) -> u64 {
        self.chunks.values().map(|c| c.len() as u64).sum()
    }
}

#[derive(Debug, Default)]
struct State {
    blobs: HashMap<BlobId, Blob>,
    by_hash: HashMap<String, BlobId>,
    pending: HashMap<KhetId, (Khet, BlobId)>,
    khets: BTreeMap<KhetId, Khet>,
    next_blob: u64,
    calls: Vec<ServiceCall>,
    fail_store_chunk_at: Option<u64>,
    withheld: HashSet<(BlobId, u64)>,
    reject_finalize: Option<String>,
}

/// In-process asset service: content-hash dedup, call recording and fault
/// injection. Stands in for the remote store in tests and the CLI demos.
#[derive(Debug, Default)]
pub struct MemoryAssetService {
    state: RefCell<State>,
}

impl MemoryAssetService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Blobs held, finalized or not.
    pub fn blob_count(&self) -> usize {
        self.state.borrow().blobs.len()
    }

    /// Metadata of every khet bound to a blob, with its asset ref filled in.
    pub fn finalized_khets(&self) -> Vec<Khet> {
        self.state.borrow().khets.values().cloned().collect()
    }

    /// Drop a finalized khet's metadata, as an owner-side delete would.
    pub fn forget_khet(&self, id: &KhetId) -> bool {
        self.state.borrow_mut().khets.remove(id).is_some()
    }

    /// Make `store_chunk` fail for this chunk index.
    pub fn fail_store_chunk_at(&self, index: u64) {
        self.state.borrow_mut().fail_store_chunk_at = Some(index);
    }

    /// Make `get_chunk` report this chunk as absent.
    pub fn withhold_chunk(&self, blob: &BlobId, index: u64) {
        self.state.borrow_mut().withheld.insert((blob.clone(), index));
    }

    pub fn restore_chunk(&self, blob: &BlobId, index: u64) {
        self.state.borrow_mut().withheld.remove(&(blob.clone(), index));
    }

    /// Make every `finalize` fail with this reason.
    pub fn reject_finalize(&self, reason: &str) {
        self.state.borrow_mut().reject_finalize = Some(reason.to_string());
    }
}

impl AssetService for MemoryAssetService {
    async fn init_upload(
        &self,
        metadata: &Khet,
        _store_id: StoreId,
    ) -> Result<InitUpload, ServiceError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(ServiceCall::InitUpload {
            id: metadata.id.clone(),
        });

        if let Some(blob) = state.by_hash.get(&metadata.content_hash).cloned() {
            state
                .pending
                .insert(metadata.id.clone(), (metadata.clone(), blob.clone()));
            return Ok(InitUpload::Existing(blob));
        }

        state.next_blob += 1;
        let blob = BlobId::new(format!("blob-{:06}", state.next_blob));
        state.blobs.insert(
            blob.clone(),
            Blob {
                content_hash: metadata.content_hash.clone(),
                ..Blob::default()
            },
        );
        state
            .pending
            .insert(metadata.id.clone(), (metadata.clone(), blob.clone()));
        Ok(InitUpload::New(blob))
    }

    async fn store_chunk(
        &self,
        blob: &BlobId,
        index: u64,
        bytes: &[u8],
    ) -> Result<(), ServiceError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(ServiceCall::StoreChunk {
            blob: blob.clone(),
            index,
            len: bytes.len(),
        });
        if state.fail_store_chunk_at == Some(index) {
            return Err(ServiceError::Call(format!("injected failure at chunk {index}")));
        }
        let entry = state
            .blobs
            .get_mut(blob)
            .ok_or_else(|| ServiceError::NotFound(blob.to_string()))?;
        entry.chunks.insert(index, bytes.to_vec());
        Ok(())
    }

    async fn finalize(
        &self,
        id: &KhetId,
        store_id: StoreId,
        blob: &BlobId,
        chunk_count: u64,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(ServiceCall::Finalize {
            id: id.clone(),
            blob: blob.clone(),
            chunk_count,
        });
        if let Some(reason) = state.reject_finalize.clone() {
            return Err(ServiceError::Rejected(reason));
        }

        let (metadata, pending_blob) = state
            .pending
            .remove(id)
            .ok_or_else(|| ServiceError::NotFound(format!("no pending upload for {id}")))?;
        if &pending_blob != blob {
            return Err(ServiceError::Rejected(format!(
                "upload for {id} was opened on {pending_blob}, not {blob}"
            )));
        }

        let entry = state
            .blobs
            .get_mut(blob)
            .ok_or_else(|| ServiceError::NotFound(blob.to_string()))?;
        if !entry.finalized {
            let complete = (0..chunk_count).all(|i| entry.chunks.contains_key(&i))
                && entry.chunks.len() as u64 == chunk_count;
            if !complete {
                return Err(ServiceError::Rejected(format!(
                    "expected {chunk_count} chunks, have {}",
                    entry.chunks.len()
                )));
            }
            entry.finalized = true;
        }
        let byte_length = entry.byte_length();
        let content_hash = entry.content_hash.clone();
        state.by_hash.insert(content_hash, blob.clone());

        let mut khet = metadata;
        khet.asset_ref = Some(AssetRef {
            store_id,
            blob_id: blob.clone(),
            byte_length,
        });
        state.khets.insert(id.clone(), khet);
        Ok(())
    }

    async fn abort_upload(&self, id: &KhetId) -> Result<(), ServiceError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(ServiceCall::AbortUpload { id: id.clone() });
        state.pending.remove(id);
        Ok(())
    }

    async fn get_chunk(&self, blob: &BlobId, index: u64) -> Result<Option<Vec<u8>>, ServiceError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(ServiceCall::GetChunk {
            blob: blob.clone(),
            index,
        });
        if state.withheld.contains(&(blob.clone(), index)) {
            return Ok(None);
        }
        Ok(state
            .blobs
            .get(blob)
            .and_then(|b| b.chunks.get(&index))
            .cloned())
    }

    async fn delete_blob(&self, blob: &BlobId) -> Result<(), ServiceError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(ServiceCall::DeleteBlob { blob: blob.clone() });
        if let Some(removed) = state.blobs.remove(blob) {
            if state.by_hash.get(&removed.content_hash) == Some(blob) {
                state.by_hash.remove(&removed.content_hash);
            }
        }
        Ok(())
    }
}
