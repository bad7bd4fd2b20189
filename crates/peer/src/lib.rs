//! Peer replication channel: a one-to-one link over which a joiner mirrors
//! the host's khet set and both sides stream avatar poses.
//!
//! # Invariants
//! - At most one live session per channel; a second inbound link is refused.
//! - A joiner's registry is only ever replaced wholesale from a `khetlist`.
//! - Poses are applied in sequence order; older ones are dropped.
//! - A bad frame is dropped, never fatal to the session.

mod channel;
mod link;
mod protocol;

pub use channel::{ConnectionState, PeerChannel, PeerError, PeerEvent, PeerSession, Role};
pub use link::{LinkClosed, MemoryLink, PeerLink};
pub use protocol::{PeerMessage, SessionConfig, WireAssetRef, WireError, WireKhet};
