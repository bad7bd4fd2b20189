use crate::registry::{EntityRegistry, RegistryError, SourceMode};
use khetworld_cache::ContentCache;
use khetworld_common::{AssetRef, Khet, KhetId, StoreId, content_hash};
use khetworld_transport::{
    AssetService, ChunkedTransport, MemoryAssetService, ServiceError, TransportError,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Remote listing of khet metadata (asset bytes never included).
#[allow(async_fn_in_trait)]
pub trait KhetDirectory {
    async fn list_khets(&self) -> Result<Vec<Khet>, ServiceError>;
}

impl<D: KhetDirectory> KhetDirectory for &D {
    async fn list_khets(&self) -> Result<Vec<Khet>, ServiceError> {
        (**self).list_khets().await
    }
}

impl KhetDirectory for MemoryAssetService {
    async fn list_khets(&self) -> Result<Vec<Khet>, ServiceError> {
        Ok(self.finalized_khets())
    }
}

/// Outcome of a sync pass, per khet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Assets fetched through the transport (and written to the cache).
    pub downloaded: Vec<KhetId>,
    /// Assets served from the content cache.
    pub from_cache: Vec<KhetId>,
    /// Khets kept metadata-only because their asset could not be resolved.
    pub unresolved: Vec<KhetId>,
}

impl SyncReport {
    pub fn resolved(&self) -> usize {
        self.downloaded.len() + self.from_cache.len()
    }
}

/// Fills a [`SourceMode::Remote`] registry from the remote directory,
/// resolving each asset cache-first and transport-second.
#[derive(Debug)]
pub struct RemoteSource<D, S, C> {
    directory: D,
    transport: ChunkedTransport<S>,
    cache: C,
}

impl<D, S, C> RemoteSource<D, S, C>
where
    D: KhetDirectory,
    S: AssetService,
    C: ContentCache,
{
    pub fn new(directory: D, transport: ChunkedTransport<S>, cache: C) -> Self {
        Self {
            directory,
            transport,
            cache,
        }
    }

    pub fn transport(&self) -> &ChunkedTransport<S> {
        &self.transport
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Fetch the authoritative list and replace the registry with it.
    ///
    /// One khet's asset failure leaves that khet metadata-only and never
    /// aborts the batch. Cancellation leaves the registry untouched.
    pub async fn sync(
        &self,
        registry: &mut EntityRegistry,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, RegistryError> {
        ensure_remote(registry)?;
        async {
            let listed = self
                .directory
                .list_khets()
                .await
                .map_err(RegistryError::Directory)?;
            tracing::debug!(count = listed.len(), "khet metadata fetched");

            let mut report = SyncReport::default();
            let mut resolved = Vec::with_capacity(listed.len());
            for meta in listed {
                if cancel.is_cancelled() {
                    return Err(RegistryError::Cancelled);
                }
                resolved.push(self.resolve(meta, cancel, &mut report).await?);
            }

            registry.replace_all(SourceMode::Remote, resolved)?;
            tracing::info!(
                resolved = report.resolved(),
                unresolved = report.unresolved.len(),
                "remote sync complete"
            );
            Ok(report)
        }
        .instrument(tracing::info_span!("remote_sync"))
        .await
    }

    /// Retry asset resolution for khets that are still metadata-only.
    pub async fn resolve_pending(
        &self,
        registry: &mut EntityRegistry,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, RegistryError> {
        ensure_remote(registry)?;
        let mut report = SyncReport::default();
        for id in registry.unresolved_ids() {
            if cancel.is_cancelled() {
                return Err(RegistryError::Cancelled);
            }
            let Some(meta) = registry.get(&id).cloned() else {
                continue;
            };
            let khet = self.resolve(meta, cancel, &mut report).await?;
            if khet.has_resident_asset() {
                registry.insert(khet)?;
            }
        }
        Ok(report)
    }

    /// Cache, register and upload a khet authored on this client.
    ///
    /// The local copy stays cached and registered whether or not the upload
    /// succeeds; on success the registry entry and the cache record gain the
    /// durable asset ref.
    pub async fn publish(
        &self,
        registry: &mut EntityRegistry,
        khet: Khet,
        store_id: StoreId,
        cancel: &CancellationToken,
    ) -> Result<AssetRef, RegistryError> {
        ensure_remote(registry)?;
        let id = khet.id.clone();
        registry.insert(khet.clone())?;
        if !self.cache.put(&khet) {
            tracing::warn!(%id, "local copy not cached before upload");
        }

        let asset_ref = self.transport.upload(&khet, store_id, cancel).await?;

        let mut published = khet;
        published.asset_ref = Some(asset_ref.clone());
        self.cache.put(&published);
        registry.insert(published)?;
        tracing::info!(%id, blob = %asset_ref.blob_id, "khet published");
        Ok(asset_ref)
    }

    async fn resolve(
        &self,
        mut meta: Khet,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<Khet, RegistryError> {
        if meta.has_resident_asset() {
            return Ok(meta);
        }

        if let Some(cached) = self.cache.get(&meta.id) {
            let fresh = meta.content_hash.is_empty() || cached.content_hash == meta.content_hash;
            if let (true, Some(bytes)) = (fresh, cached.asset_bytes) {
                meta.set_asset(bytes);
                report.from_cache.push(meta.id.clone());
                return Ok(meta);
            }
            tracing::debug!(id = %meta.id, "cached asset is stale, refetching");
        }

        let Some(asset_ref) = meta.asset_ref.clone() else {
            tracing::warn!(id = %meta.id, "khet has no asset ref, keeping metadata only");
            report.unresolved.push(meta.id.clone());
            return Ok(meta);
        };

        match self.transport.download(&asset_ref, cancel).await {
            Ok(bytes) => {
                if !meta.content_hash.is_empty() && content_hash(&bytes) != meta.content_hash {
                    tracing::warn!(id = %meta.id, "downloaded asset does not match content hash");
                    report.unresolved.push(meta.id.clone());
                    return Ok(meta);
                }
                meta.set_asset(bytes);
                if !self.cache.put(&meta) {
                    tracing::warn!(id = %meta.id, "resolved asset not cached");
                }
                report.downloaded.push(meta.id.clone());
                Ok(meta)
            }
            Err(TransportError::Cancelled) => Err(RegistryError::Cancelled),
            Err(e) => {
                tracing::warn!(id = %meta.id, error = %e, "asset download failed, keeping metadata only");
                report.unresolved.push(meta.id.clone());
                Ok(meta)
            }
        }
    }
}

fn ensure_remote(registry: &EntityRegistry) -> Result<(), RegistryError> {
    if registry.mode() != SourceMode::Remote {
        return Err(RegistryError::ModeConflict {
            mode: registry.mode(),
            writer: SourceMode::Remote,
        });
    }
    Ok(())
}
