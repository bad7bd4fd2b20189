//! Entity registry: the in-memory set of known khets, and the remote sync
//! service that fills it.
//!
//! # Invariants
//! - The source mode is fixed per registry; only the matching writer may
//!   replace its contents.
//! - A khet whose asset cannot be resolved stays metadata-only and is never
//!   offered for instantiation.

mod registry;
mod remote;

pub use registry::{EntityRegistry, LoadStatus, RegistryError, SourceMode};
pub use remote::{KhetDirectory, RemoteSource, SyncReport};
