use crate::loader::{BodyHandle, KhetLoader, LoadedKhet, LoaderError, MeshHandle};
use khetworld_common::KhetId;
use khetworld_registry::EntityRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Load/unload instructions produced by [`reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_load: BTreeSet<KhetId>,
    pub to_unload: BTreeSet<KhetId>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_load.is_empty() && self.to_unload.is_empty()
    }
}

/// Diff the desired set against what is instantiated.
///
/// `to_load = desired \ instantiated`, `to_unload = instantiated \ desired`.
pub fn reconcile(desired: &BTreeSet<KhetId>, instantiated: &BTreeSet<KhetId>) -> ReconcilePlan {
    ReconcilePlan {
        to_load: desired.difference(instantiated).cloned().collect(),
        to_unload: instantiated.difference(desired).cloned().collect(),
    }
}

/// Lifecycle of one khet inside the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KhetState {
    Absent,
    Loading,
    Instantiated,
    Unloading,
}

/// A khet paired with its live mesh and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstantiatedKhet {
    pub id: KhetId,
    pub mesh: MeshHandle,
    pub body: Option<BodyHandle>,
    pub is_avatar: bool,
}

/// Record of a lifecycle change. Drained by the caller; `LoadFailed` is what
/// the UI surfaces as a non-blocking notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorldEvent {
    Loaded {
        id: KhetId,
    },
    Unloaded {
        id: KhetId,
    },
    LoadFailed {
        id: KhetId,
        reason: String,
    },
    AvatarChanged {
        previous: Option<KhetId>,
        current: Option<KhetId>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("khet {0} is not in the registry")]
    NotFound(KhetId),
    #[error("khet {0} has no resident asset")]
    AssetNotResident(KhetId),
    #[error("loading khet {id} failed: {source}")]
    Load {
        id: KhetId,
        #[source]
        source: LoaderError,
    },
    #[error("khet {0} is not an avatar")]
    NotAnAvatar(KhetId),
}

/// Outcome of one [`WorldReconciler::apply`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub plan: ReconcilePlan,
    pub loaded: Vec<KhetId>,
    pub unloaded: Vec<KhetId>,
    pub failed: Vec<(KhetId, String)>,
}

/// Per-pass statistics for instrumentation.
#[derive(Debug, Clone, Default)]
pub struct ReconcileStats {
    pub loaded_this_pass: usize,
    pub unloaded_this_pass: usize,
    pub failed_this_pass: usize,
    pub total_instantiated: usize,
    pub elapsed: Duration,
}

/// Owns the instantiated set and drives the loader to match the registry.
pub struct WorldReconciler<L> {
    loader: L,
    instantiated: BTreeMap<KhetId, InstantiatedKhet>,
    states: BTreeMap<KhetId, KhetState>,
    avatar: Option<KhetId>,
    event_log: Vec<WorldEvent>,
    stats: ReconcileStats,
}

impl<L: KhetLoader> WorldReconciler<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            instantiated: BTreeMap::new(),
            states: BTreeMap::new(),
            avatar: None,
            event_log: Vec::new(),
            stats: ReconcileStats::default(),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn state(&self, id: &KhetId) -> KhetState {
        self.states.get(id).copied().unwrap_or(KhetState::Absent)
    }

    pub fn get(&self, id: &KhetId) -> Option<&InstantiatedKhet> {
        self.instantiated.get(id)
    }

    /// Every instantiated id, the avatar included.
    pub fn instantiated_ids(&self) -> BTreeSet<KhetId> {
        self.instantiated.keys().cloned().collect()
    }

    pub fn avatar(&self) -> Option<&InstantiatedKhet> {
        self.avatar.as_ref().and_then(|id| self.instantiated.get(id))
    }

    pub fn stats(&self) -> &ReconcileStats {
        &self.stats
    }

    pub fn events(&self) -> &[WorldEvent] {
        &self.event_log
    }

    pub fn drain_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.event_log)
    }

    /// Instantiate one khet. Returns the existing instantiation, without
    /// calling the loader, if it is already live.
    pub async fn load_one(
        &mut self,
        registry: &EntityRegistry,
        id: &KhetId,
    ) -> Result<InstantiatedKhet, WorldError> {
        if let Some(existing) = self.instantiated.get(id) {
            return Ok(existing.clone());
        }
        let khet = registry
            .get(id)
            .ok_or_else(|| WorldError::NotFound(id.clone()))?;
        if !khet.has_resident_asset() {
            self.fail(id, "asset not resident");
            return Err(WorldError::AssetNotResident(id.clone()));
        }

        self.states.insert(id.clone(), KhetState::Loading);
        let loaded = match self.loader.load(khet).await {
            Ok(loaded) => loaded,
            Err(source) => {
                self.states.remove(id);
                self.fail(id, &source.to_string());
                return Err(WorldError::Load {
                    id: id.clone(),
                    source,
                });
            }
        };

        let instance = InstantiatedKhet {
            id: id.clone(),
            mesh: loaded.mesh,
            body: loaded.body,
            is_avatar: khet.is_avatar(),
        };
        self.instantiated.insert(id.clone(), instance.clone());
        self.states.insert(id.clone(), KhetState::Instantiated);
        self.event_log.push(WorldEvent::Loaded { id: id.clone() });
        tracing::debug!(%id, mesh = instance.mesh.0, "khet instantiated");
        Ok(instance)
    }

    /// Destroy one instantiation. Returns false if it was not live.
    pub async fn unload_one(&mut self, id: &KhetId) -> bool {
        let Some(instance) = self.instantiated.remove(id) else {
            return false;
        };
        self.states.insert(id.clone(), KhetState::Unloading);
        self.loader
            .unload(
                id,
                LoadedKhet {
                    mesh: instance.mesh,
                    body: instance.body,
                },
            )
            .await;
        self.states.remove(id);
        if self.avatar.as_ref() == Some(id) {
            self.avatar = None;
        }
        self.event_log.push(WorldEvent::Unloaded { id: id.clone() });
        tracing::debug!(%id, "khet unloaded");
        true
    }

    /// Switch the local avatar to `id`.
    ///
    /// The previous avatar is unloaded first. If `id` turns out not to be an
    /// avatar, its fresh instantiation is discarded and the previous avatar
    /// stays unloaded.
    pub async fn set_avatar(
        &mut self,
        registry: &EntityRegistry,
        id: &KhetId,
    ) -> Result<InstantiatedKhet, WorldError> {
        if self.avatar.as_ref() == Some(id) {
            if let Some(current) = self.instantiated.get(id) {
                return Ok(current.clone());
            }
        }
        if registry.get(id).is_none() {
            return Err(WorldError::NotFound(id.clone()));
        }

        let previous = self.avatar.take();
        if let Some(prev) = &previous {
            self.unload_one(prev).await;
        }

        let was_live = self.instantiated.contains_key(id);
        let instance = match self.load_one(registry, id).await {
            Ok(instance) => instance,
            Err(e) => {
                self.avatar_changed(previous, None);
                return Err(e);
            }
        };

        if !instance.is_avatar {
            tracing::warn!(%id, "requested avatar is not an avatar, discarding");
            if !was_live {
                self.unload_one(id).await;
            }
            self.avatar_changed(previous, None);
            return Err(WorldError::NotAnAvatar(id.clone()));
        }

        self.avatar = Some(id.clone());
        self.avatar_changed(previous, Some(id.clone()));
        tracing::info!(%id, "avatar set");
        Ok(instance)
    }

    /// Bring the instantiated non-avatar set in line with the registry:
    /// all loads first, then all unloads. An avatar that has left the
    /// registry is unloaded too. Per-khet failures are logged and reported,
    /// never propagated.
    pub async fn apply(&mut self, registry: &EntityRegistry) -> ApplyReport {
        async {
            let started = Instant::now();
            let desired = registry.instantiable_ids();
            let current: BTreeSet<KhetId> = self
                .instantiated
                .values()
                .filter(|k| !k.is_avatar)
                .map(|k| k.id.clone())
                .collect();
            let plan = reconcile(&desired, &current);

            let mut report = ApplyReport::default();
            for id in &plan.to_load {
                match self.load_one(registry, id).await {
                    Ok(_) => report.loaded.push(id.clone()),
                    Err(e) => {
                        tracing::warn!(%id, error = %e, "khet load failed");
                        report.failed.push((id.clone(), e.to_string()));
                    }
                }
            }
            for id in &plan.to_unload {
                if self.unload_one(id).await {
                    report.unloaded.push(id.clone());
                }
            }
            if let Some(avatar) = self.avatar.clone() {
                if registry.get(&avatar).is_none() && self.unload_one(&avatar).await {
                    tracing::info!(id = %avatar, "avatar left the registry, unloaded");
                    self.avatar_changed(Some(avatar.clone()), None);
                    report.unloaded.push(avatar);
                }
            }

            self.stats = ReconcileStats {
                loaded_this_pass: report.loaded.len(),
                unloaded_this_pass: report.unloaded.len(),
                failed_this_pass: report.failed.len(),
                total_instantiated: self.instantiated.len(),
                elapsed: started.elapsed(),
            };
            tracing::trace!(
                loaded = report.loaded.len(),
                unloaded = report.unloaded.len(),
                failed = report.failed.len(),
                total = self.instantiated.len(),
                "reconcile pass complete"
            );
            report.plan = plan;
            report
        }
        .instrument(tracing::info_span!("world_apply"))
        .await
    }

    fn fail(&mut self, id: &KhetId, reason: &str) {
        self.event_log.push(WorldEvent::LoadFailed {
            id: id.clone(),
            reason: reason.to_string(),
        });
    }

    fn avatar_changed(&mut self, previous: Option<KhetId>, current: Option<KhetId>) {
        if previous != current {
            self.event_log
                .push(WorldEvent::AvatarChanged { previous, current });
        }
    }
}
