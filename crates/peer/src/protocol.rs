use glam::{DQuat, DVec3};
use khetworld_common::{
    AssetRef, BlobId, ClientConfig, InteractionPoint, Khet, KhetId, KhetType, StoreId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Session settings the host announces in `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub world_name: String,
    pub position_interval_ms: u64,
}

impl SessionConfig {
    pub fn position_interval(&self) -> Duration {
        Duration::from_millis(self.position_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for SessionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            world_name: config.world_name.clone(),
            position_interval_ms: config.pose_interval_ms,
        }
    }
}

/// One frame on the peer link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    Init {
        config: SessionConfig,
    },
    RequestKhetlist {},
    Khetlist {
        khets: BTreeMap<KhetId, WireKhet>,
    },
    Avatar {
        id: KhetId,
    },
    Position {
        seq: u64,
        position: DVec3,
        quaternion: DQuat,
    },
    /// Reserved; receivers log and ignore it.
    Code {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
    Exit {},
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Init { .. } => "init",
            PeerMessage::RequestKhetlist {} => "request-khetlist",
            PeerMessage::Khetlist { .. } => "khetlist",
            PeerMessage::Avatar { .. } => "avatar",
            PeerMessage::Position { .. } => "position",
            PeerMessage::Code { .. } => "code",
            PeerMessage::Exit {} => "exit",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

/// Asset reference in peer form: the store id as text, the length as a
/// decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAssetRef {
    pub store_id: String,
    pub blob_id: BlobId,
    pub byte_length: String,
}

/// A khet in peer form. Bytes travel as a plain byte sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireKhet {
    pub id: KhetId,
    #[serde(rename = "type")]
    pub khet_type: KhetType,
    pub position: DVec3,
    pub scale: DVec3,
    pub original_size: DVec3,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_ref: Option<WireAssetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub animation_clip_names: Vec<String>,
    #[serde(default)]
    pub textures: Vec<(String, Vec<u8>)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_behavior_code: Option<String>,
    #[serde(default)]
    pub interaction_points: Vec<InteractionPoint>,
    #[serde(default)]
    pub content_hash: String,
}

/// A wire khet whose text fields do not parse back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("khet {id}: bad store id {value:?}")]
    StoreId { id: KhetId, value: String },
    #[error("khet {id}: bad byte length {value:?}")]
    ByteLength { id: KhetId, value: String },
}

impl From<&Khet> for WireKhet {
    fn from(khet: &Khet) -> Self {
        Self {
            id: khet.id.clone(),
            khet_type: khet.khet_type,
            position: khet.position,
            scale: khet.scale,
            original_size: khet.original_size,
            asset_ref: khet.asset_ref.as_ref().map(|r| WireAssetRef {
                store_id: r.store_id.to_text(),
                blob_id: r.blob_id.clone(),
                byte_length: r.byte_length.to_string(),
            }),
            asset_bytes: khet.asset_bytes.clone(),
            animation_clip_names: khet.animation_clip_names.clone(),
            textures: khet
                .texture_assets
                .iter()
                .map(|(name, bytes)| (name.clone(), bytes.clone()))
                .collect(),
            custom_behavior_code: khet.custom_behavior_code.clone(),
            interaction_points: khet.interaction_points.clone(),
            content_hash: khet.content_hash.clone(),
        }
    }
}

impl TryFrom<WireKhet> for Khet {
    type Error = WireError;

    fn try_from(wire: WireKhet) -> Result<Self, Self::Error> {
        let asset_ref = match wire.asset_ref {
            Some(r) => {
                let store_id = r.store_id.parse::<StoreId>().map_err(|_| WireError::StoreId {
                    id: wire.id.clone(),
                    value: r.store_id.clone(),
                })?;
                let byte_length = r.byte_length.parse::<u64>().map_err(|_| WireError::ByteLength {
                    id: wire.id.clone(),
                    value: r.byte_length.clone(),
                })?;
                Some(AssetRef {
                    store_id,
                    blob_id: r.blob_id,
                    byte_length,
                })
            }
            None => None,
        };

        Ok(Khet {
            id: wire.id,
            khet_type: wire.khet_type,
            position: wire.position,
            scale: wire.scale,
            original_size: wire.original_size,
            asset_ref,
            asset_bytes: wire.asset_bytes,
            animation_clip_names: wire.animation_clip_names,
            texture_assets: wire.textures.into_iter().collect(),
            custom_behavior_code: wire.custom_behavior_code,
            interaction_points: wire.interaction_points,
            content_hash: wire.content_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn published() -> Khet {
        let mut khet = Khet::new("a", KhetType::SceneObject).with_asset(vec![0, 1, 255]);
        khet.asset_ref = Some(AssetRef {
            store_id: StoreId::new(),
            blob_id: BlobId::new("blob-000001"),
            byte_length: 3,
        });
        khet.texture_assets.insert("albedo".into(), vec![9, 9]);
        khet
    }

    #[test]
    fn frames_are_tagged_kebab_case() {
        let frame = PeerMessage::RequestKhetlist {}.encode().unwrap();
        assert_eq!(frame, r#"{"type":"request-khetlist"}"#);
        let exit: serde_json::Value =
            serde_json::from_str(&PeerMessage::Exit {}.encode().unwrap()).unwrap();
        assert_eq!(exit, json!({"type": "exit"}));
    }

    #[test]
    fn wire_khet_uses_text_for_large_fields() {
        let khet = published();
        let value = serde_json::to_value(WireKhet::from(&khet)).unwrap();
        let asset_ref = &value["assetRef"];
        assert_eq!(asset_ref["byteLength"], json!("3"));
        assert_eq!(
            asset_ref["storeId"],
            json!(khet.asset_ref.as_ref().unwrap().store_id.to_text())
        );
        assert_eq!(value["assetBytes"], json!([0, 1, 255]));
        assert_eq!(value["type"], json!("SceneObject"));
    }

    #[test]
    fn wire_khet_restores_native_types() {
        let khet = published();
        let frame = PeerMessage::Khetlist {
            khets: BTreeMap::from([(khet.id.clone(), WireKhet::from(&khet))]),
        }
        .encode()
        .unwrap();

        let PeerMessage::Khetlist { khets } = PeerMessage::decode(&frame).unwrap() else {
            panic!("expected khetlist");
        };
        let restored = Khet::try_from(khets[&khet.id].clone()).unwrap();
        assert_eq!(restored, khet);
        restored.verify_content_hash().unwrap();
    }

    #[test]
    fn bad_byte_length_is_rejected() {
        let mut wire = WireKhet::from(&published());
        if let Some(r) = wire.asset_ref.as_mut() {
            r.byte_length = "three".into();
        }
        assert!(matches!(
            Khet::try_from(wire),
            Err(WireError::ByteLength { .. })
        ));
    }

    #[test]
    fn unknown_type_does_not_decode() {
        assert!(PeerMessage::decode(r#"{"type":"teleport"}"#).is_err());
        assert!(PeerMessage::decode("not json").is_err());
    }

    #[test]
    fn code_body_is_optional() {
        let msg = PeerMessage::decode(r#"{"type":"code","body":{"expr":"spin()"}}"#).unwrap();
        assert_eq!(msg.kind(), "code");
        let bare = PeerMessage::decode(r#"{"type":"code"}"#).unwrap();
        assert_eq!(bare, PeerMessage::Code { body: None });
    }
}
