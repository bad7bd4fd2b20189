use khetworld_common::{Khet, KhetId, KhetType};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeSet;

/// Opaque handle to a mesh owned by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshHandle(pub u64);

/// Opaque handle to a rigid body owned by the physics side of the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BodyHandle(pub u64);

/// What the loader produced for one khet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedKhet {
    pub mesh: MeshHandle,
    pub body: Option<BodyHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoaderError {
    #[error("asset could not be decoded: {0}")]
    Decode(String),
    #[error("physics body could not be created: {0}")]
    Body(String),
}

/// Builds and destroys the mesh and physics body for a khet.
///
/// The reconciler only sees handles; mesh construction and the physics
/// solver live behind this seam.
#[allow(async_fn_in_trait)]
pub trait KhetLoader {
    /// Build a mesh (and a body, where the type has one) from resident bytes.
    /// On error nothing may be left behind.
    async fn load(&self, khet: &Khet) -> Result<LoadedKhet, LoaderError>;

    /// Destroy what [`KhetLoader::load`] built.
    async fn unload(&self, id: &KhetId, loaded: LoadedKhet);
}

impl<L: KhetLoader> KhetLoader for &L {
    async fn load(&self, khet: &Khet) -> Result<LoadedKhet, LoaderError> {
        (**self).load(khet).await
    }

    async fn unload(&self, id: &KhetId, loaded: LoadedKhet) {
        (**self).unload(id, loaded).await
    }
}

#[derive(Debug, Default)]
struct Recorded {
    next_handle: u64,
    loads: Vec<KhetId>,
    unloads: Vec<KhetId>,
    live: BTreeSet<KhetId>,
    failing: BTreeSet<KhetId>,
}

/// Deterministic in-process loader: hands out sequential handles, records
/// every call, and can be told to fail for given ids.
///
/// Plain `Entity` khets get no body; every other type gets one.
#[derive(Debug, Default)]
pub struct RecordingLoader {
    state: RefCell<Recorded>,
}

impl RecordingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids passed to `load`, in call order (failed calls included).
    pub fn loads(&self) -> Vec<KhetId> {
        self.state.borrow().loads.clone()
    }

    pub fn load_count(&self) -> usize {
        self.state.borrow().loads.len()
    }

    pub fn unloads(&self) -> Vec<KhetId> {
        self.state.borrow().unloads.clone()
    }

    /// Ids currently holding loader resources.
    pub fn live(&self) -> BTreeSet<KhetId> {
        self.state.borrow().live.clone()
    }

    pub fn fail_on(&self, id: impl Into<KhetId>) {
        self.state.borrow_mut().failing.insert(id.into());
    }

    pub fn clear_failures(&self) {
        self.state.borrow_mut().failing.clear();
    }
}

impl KhetLoader for RecordingLoader {
    async fn load(&self, khet: &Khet) -> Result<LoadedKhet, LoaderError> {
        let mut state = self.state.borrow_mut();
        state.loads.push(khet.id.clone());
        if state.failing.contains(&khet.id) {
            return Err(LoaderError::Decode(format!("injected failure for {}", khet.id)));
        }

        state.next_handle += 1;
        let mesh = MeshHandle(state.next_handle);
        let body = (khet.khet_type != KhetType::Entity).then(|| BodyHandle(state.next_handle));
        state.live.insert(khet.id.clone());
        Ok(LoadedKhet { mesh, body })
    }

    async fn unload(&self, id: &KhetId, _loaded: LoadedKhet) {
        let mut state = self.state.borrow_mut();
        state.unloads.push(id.clone());
        state.live.remove(id);
    }
}
