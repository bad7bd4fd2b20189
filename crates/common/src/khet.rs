use crate::hash::content_hash;
use crate::types::{AssetRef, KhetId};
use glam::DVec3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of placeable object a khet represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KhetType {
    SceneObject,
    InteractiveObject,
    MobileObject,
    Entity,
    Avatar,
}

impl KhetType {
    pub fn is_avatar(self) -> bool {
        matches!(self, KhetType::Avatar)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KhetType::SceneObject => "SceneObject",
            KhetType::InteractiveObject => "InteractiveObject",
            KhetType::MobileObject => "MobileObject",
            KhetType::Entity => "Entity",
            KhetType::Avatar => "Avatar",
        }
    }
}

impl fmt::Display for KhetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action anchor attached to an interactive khet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionPoint {
    pub local_position: DVec3,
    pub action_kind: String,
    pub action_content: String,
}

/// Errors from khet validation.
#[derive(Debug, thiserror::Error)]
pub enum KhetError {
    #[error("khet id must not be empty")]
    EmptyId,
    #[error("avatar {0} must not carry interaction points")]
    AvatarInteractionPoints(KhetId),
    #[error("content hash mismatch for {id}: recorded {recorded}, computed {computed}")]
    HashMismatch {
        id: KhetId,
        recorded: String,
        computed: String,
    },
}

/// A placeable world object: metadata plus an optional resident asset.
///
/// Serialized field names follow the camelCase metadata shape shared with the
/// remote service and the local cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Khet {
    pub id: KhetId,
    #[serde(rename = "type")]
    pub khet_type: KhetType,
    pub position: DVec3,
    pub scale: DVec3,
    pub original_size: DVec3,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_ref: Option<AssetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub animation_clip_names: Vec<String>,
    #[serde(default, rename = "textures", with = "texture_pairs")]
    pub texture_assets: BTreeMap<String, Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_behavior_code: Option<String>,
    #[serde(default)]
    pub interaction_points: Vec<InteractionPoint>,
    #[serde(default)]
    pub content_hash: String,
}

impl Khet {
    /// Metadata-only khet at the origin with unit scale.
    pub fn new(id: impl Into<KhetId>, khet_type: KhetType) -> Self {
        Self {
            id: id.into(),
            khet_type,
            position: DVec3::ZERO,
            scale: DVec3::ONE,
            original_size: DVec3::ONE,
            asset_ref: None,
            asset_bytes: None,
            animation_clip_names: Vec::new(),
            texture_assets: BTreeMap::new(),
            custom_behavior_code: None,
            interaction_points: Vec::new(),
            content_hash: String::new(),
        }
    }

    /// A khet authored on this client: fresh id, resident asset, no asset ref yet.
    pub fn author(khet_type: KhetType, asset: Vec<u8>) -> Self {
        Self::new(KhetId::generate(), khet_type).with_asset(asset)
    }

    pub fn with_asset(mut self, asset: Vec<u8>) -> Self {
        self.set_asset(asset);
        self
    }

    pub fn with_position(mut self, position: DVec3) -> Self {
        self.position = position;
        self
    }

    /// Make `asset` resident and record its content hash.
    pub fn set_asset(&mut self, asset: Vec<u8>) {
        self.content_hash = content_hash(&asset);
        self.asset_bytes = Some(asset);
    }

    pub fn has_resident_asset(&self) -> bool {
        self.asset_bytes.is_some()
    }

    pub fn is_avatar(&self) -> bool {
        self.khet_type.is_avatar()
    }

    /// Copy of this khet with the resident asset stripped.
    pub fn metadata(&self) -> Khet {
        Khet {
            asset_bytes: None,
            ..self.clone()
        }
    }

    /// Check that resident bytes still hash to the recorded content hash.
    ///
    /// A khet without resident bytes has nothing to check.
    pub fn verify_content_hash(&self) -> Result<(), KhetError> {
        let Some(bytes) = &self.asset_bytes else {
            return Ok(());
        };
        let computed = content_hash(bytes);
        if computed != self.content_hash {
            return Err(KhetError::HashMismatch {
                id: self.id.clone(),
                recorded: self.content_hash.clone(),
                computed,
            });
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), KhetError> {
        if self.id.as_str().is_empty() {
            return Err(KhetError::EmptyId);
        }
        if self.is_avatar() && !self.interaction_points.is_empty() {
            return Err(KhetError::AvatarInteractionPoints(self.id.clone()));
        }
        Ok(())
    }
}

/// Textures travel as `[[name, bytes], ...]`; order carries no meaning.
mod texture_pairs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(&String, &Vec<u8>)> = map.iter().collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let pairs = Vec::<(String, Vec<u8>)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}
