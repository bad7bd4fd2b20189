use khetworld_common::{Khet, KhetError, KhetId, KhetType, content_hash};
use khetworld_transport::{ServiceError, TransportError};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Where the registry's contents come from. Fixed for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceMode {
    /// Synchronized from the remote khet directory and asset service.
    Remote,
    /// Mirrored from a host over the peer replication channel.
    PeerReplica,
    /// Authored and held on this client only.
    LocalOnly,
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceMode::Remote => "remote",
            SourceMode::PeerReplica => "peer-replica",
            SourceMode::LocalOnly => "local-only",
        })
    }
}

/// Result of [`EntityRegistry::load_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    Ready(BTreeSet<KhetId>),
    /// The source has not delivered anything yet. Callers retry later rather
    /// than block.
    NotReady,
}

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{writer} source cannot write a {mode} registry")]
    ModeConflict {
        mode: SourceMode,
        writer: SourceMode,
    },
    #[error("invalid khet: {0}")]
    Invalid(#[from] KhetError),
    #[error("khet {0} not found")]
    NotFound(KhetId),
    #[error("asset for {id} does not match its content hash")]
    HashMismatch { id: KhetId },
    #[error("khet directory unavailable: {0}")]
    Directory(ServiceError),
    #[error("asset transfer failed: {0}")]
    Transport(#[from] TransportError),
    #[error("sync cancelled")]
    Cancelled,
}

/// In-memory map of every known khet.
///
/// Pure data: filling it from a remote service or a peer is the job of
/// [`crate::RemoteSource`] and the peer channel.
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    mode: SourceMode,
    khets: BTreeMap<KhetId, Khet>,
    ready: bool,
    generation: u64,
}

impl EntityRegistry {
    pub fn new(mode: SourceMode) -> Self {
        Self {
            mode,
            khets: BTreeMap::new(),
            ready: mode == SourceMode::LocalOnly,
            generation: 0,
        }
    }

    pub fn mode(&self) -> SourceMode {
        self.mode
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Bumped on every wholesale replace.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.khets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.khets.is_empty()
    }

    /// Current khet set, or `NotReady` if the source has not delivered yet.
    pub fn load_all(&self) -> LoadStatus {
        if self.ready {
            LoadStatus::Ready(self.khets.keys().cloned().collect())
        } else {
            LoadStatus::NotReady
        }
    }

    pub fn get(&self, id: &KhetId) -> Option<&Khet> {
        self.khets.get(id)
    }

    pub fn get_by_type(&self, predicate: impl Fn(KhetType) -> bool) -> Vec<&Khet> {
        self.khets
            .values()
            .filter(|k| predicate(k.khet_type))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Khet> {
        self.khets.values()
    }

    pub fn ids(&self) -> BTreeSet<KhetId> {
        self.khets.keys().cloned().collect()
    }

    /// Non-avatar khets whose asset is resident: the reconciler's desired set.
    pub fn instantiable_ids(&self) -> BTreeSet<KhetId> {
        self.khets
            .values()
            .filter(|k| !k.is_avatar() && k.has_resident_asset())
            .map(|k| k.id.clone())
            .collect()
    }

    /// Avatars that can be instantiated right now.
    pub fn avatar_candidates(&self) -> Vec<&Khet> {
        self.khets
            .values()
            .filter(|k| k.is_avatar() && k.has_resident_asset())
            .collect()
    }

    /// Khets still waiting for their asset.
    pub fn unresolved_ids(&self) -> BTreeSet<KhetId> {
        self.khets
            .values()
            .filter(|k| !k.has_resident_asset())
            .map(|k| k.id.clone())
            .collect()
    }

    /// Insert or overwrite one khet. Returns the previous record, if any.
    pub fn insert(&mut self, khet: Khet) -> Result<Option<Khet>, RegistryError> {
        khet.validate()?;
        khet.verify_content_hash()?;
        Ok(self.khets.insert(khet.id.clone(), khet))
    }

    /// Owner-driven removal.
    pub fn remove(&mut self, id: &KhetId) -> Option<Khet> {
        self.khets.remove(id)
    }

    /// Make a downloaded asset resident on a metadata-only khet.
    ///
    /// The bytes must match the recorded content hash when one is recorded.
    pub fn attach_asset(&mut self, id: &KhetId, bytes: Vec<u8>) -> Result<(), RegistryError> {
        let khet = self
            .khets
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        if !khet.content_hash.is_empty() && content_hash(&bytes) != khet.content_hash {
            return Err(RegistryError::HashMismatch { id: id.clone() });
        }
        khet.set_asset(bytes);
        Ok(())
    }

    /// Replace the whole contents with a fresh authoritative set.
    ///
    /// Only the writer matching the registry's mode may do this. Invalid khets
    /// are skipped with a warning; the rest are stored. Returns the number
    /// stored.
    pub fn replace_all(
        &mut self,
        writer: SourceMode,
        khets: impl IntoIterator<Item = Khet>,
    ) -> Result<usize, RegistryError> {
        if writer != self.mode {
            return Err(RegistryError::ModeConflict {
                mode: self.mode,
                writer,
            });
        }

        let mut next = BTreeMap::new();
        for khet in khets {
            if let Err(e) = khet.validate().and_then(|()| khet.verify_content_hash()) {
                tracing::warn!(id = %khet.id, error = %e, "dropping invalid khet");
                continue;
            }
            next.insert(khet.id.clone(), khet);
        }

        let stored = next.len();
        self.khets = next;
        self.ready = true;
        self.generation += 1;
        tracing::debug!(mode = %self.mode, stored, generation = self.generation, "registry replaced");
        Ok(stored)
    }

    /// Forget every khet. Replica and remote registries become not-ready again.
    pub fn clear(&mut self) {
        self.khets.clear();
        self.ready = self.mode == SourceMode::LocalOnly;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use khetworld_common::InteractionPoint;

    fn scene(id: &str) -> Khet {
        Khet::new(id, KhetType::SceneObject).with_asset(id.as_bytes().to_vec())
    }

    #[test]
    fn replica_not_ready_until_first_delivery() {
        let mut registry = EntityRegistry::new(SourceMode::PeerReplica);
        assert_eq!(registry.load_all(), LoadStatus::NotReady);

        registry
            .replace_all(SourceMode::PeerReplica, vec![scene("a")])
            .unwrap();
        match registry.load_all() {
            LoadStatus::Ready(ids) => assert!(ids.contains(&KhetId::new("a"))),
            LoadStatus::NotReady => panic!("expected ready"),
        }
    }

    #[test]
    fn local_only_is_ready_when_empty() {
        let registry = EntityRegistry::new(SourceMode::LocalOnly);
        assert_eq!(registry.load_all(), LoadStatus::Ready(BTreeSet::new()));
    }

    #[test]
    fn mismatched_writer_is_rejected() {
        let mut registry = EntityRegistry::new(SourceMode::Remote);
        let result = registry.replace_all(SourceMode::PeerReplica, vec![scene("a")]);
        assert!(matches!(result, Err(RegistryError::ModeConflict { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn replace_is_wholesale() {
        let mut registry = EntityRegistry::new(SourceMode::PeerReplica);
        registry
            .replace_all(SourceMode::PeerReplica, vec![scene("a"), scene("b")])
            .unwrap();
        registry
            .replace_all(SourceMode::PeerReplica, vec![scene("c")])
            .unwrap();
        assert_eq!(registry.ids(), BTreeSet::from([KhetId::new("c")]));
        assert_eq!(registry.generation(), 2);
    }

    #[test]
    fn invalid_khets_are_skipped() {
        let mut registry = EntityRegistry::new(SourceMode::PeerReplica);
        let mut bad_avatar = Khet::new("av", KhetType::Avatar);
        bad_avatar.interaction_points.push(InteractionPoint {
            local_position: khetworld_common::Pose::default().position,
            action_kind: "sit".into(),
            action_content: String::new(),
        });
        let stored = registry
            .replace_all(SourceMode::PeerReplica, vec![bad_avatar, scene("ok")])
            .unwrap();
        assert_eq!(stored, 1);
        assert!(registry.get(&KhetId::new("av")).is_none());
    }

    #[test]
    fn instantiable_excludes_avatars_and_metadata_only() {
        let mut registry = EntityRegistry::new(SourceMode::LocalOnly);
        registry.insert(scene("a")).unwrap();
        registry
            .insert(Khet::new("pending", KhetType::SceneObject))
            .unwrap();
        registry
            .insert(Khet::new("me", KhetType::Avatar).with_asset(vec![1]))
            .unwrap();
        registry
            .insert(Khet::new("ghost", KhetType::Avatar))
            .unwrap();

        assert_eq!(
            registry.instantiable_ids(),
            BTreeSet::from([KhetId::new("a")])
        );
        let avatars: Vec<&str> = registry
            .avatar_candidates()
            .iter()
            .map(|k| k.id.as_str())
            .collect();
        assert_eq!(avatars, vec!["me"]);
        assert_eq!(registry.unresolved_ids().len(), 2);
    }

    #[test]
    fn get_by_type_filters() {
        let mut registry = EntityRegistry::new(SourceMode::LocalOnly);
        registry.insert(scene("a")).unwrap();
        registry
            .insert(Khet::new("m", KhetType::MobileObject))
            .unwrap();
        let mobiles = registry.get_by_type(|t| t == KhetType::MobileObject);
        assert_eq!(mobiles.len(), 1);
        assert_eq!(mobiles[0].id.as_str(), "m");
    }

    #[test]
    fn attach_asset_checks_hash() {
        let mut registry = EntityRegistry::new(SourceMode::LocalOnly);
        let mut meta = scene("a").metadata();
        meta.content_hash = content_hash(b"right");
        registry.insert(meta).unwrap();

        let id = KhetId::new("a");
        assert!(matches!(
            registry.attach_asset(&id, b"wrong".to_vec()),
            Err(RegistryError::HashMismatch { .. })
        ));
        registry.attach_asset(&id, b"right".to_vec()).unwrap();
        assert!(registry.get(&id).unwrap().has_resident_asset());
    }

    #[test]
    fn clear_resets_readiness() {
        let mut registry = EntityRegistry::new(SourceMode::PeerReplica);
        registry
            .replace_all(SourceMode::PeerReplica, vec![scene("a")])
            .unwrap();
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.load_all(), LoadStatus::NotReady);
    }
}
