//! World reconciler: keeps the set of instantiated meshes and physics bodies
//! in line with the entity registry.
//!
//! # Invariants
//! - `to_load` and `to_unload` of a plan are disjoint.
//! - A khet is instantiated at most once; repeat loads reuse the live one.
//! - A failed load leaves no mesh, body or state behind.
//! - The local avatar is never touched by `apply`.

mod loader;
mod reconciler;

pub use loader::{BodyHandle, KhetLoader, LoadedKhet, LoaderError, MeshHandle, RecordingLoader};
pub use reconciler::{
    ApplyReport, InstantiatedKhet, KhetState, ReconcilePlan, ReconcileStats, WorldError,
    WorldEvent, WorldReconciler, reconcile,
};
