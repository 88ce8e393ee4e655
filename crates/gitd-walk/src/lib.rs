//! Flag-carrying commit walks over a local object store.
//!
//! One [`RevWalk`] serves one request: its flag arena grows while the
//! request runs and is discarded with it. Each walked object carries a
//! packed word of flag bits; the low five bits belong to the negotiation
//! layer, the top bits to the walk itself, and the rest are handed out by
//! [`RevWalk::allocate_flag`] up to a hard cap of 32.

mod depth;
mod reach;
mod walk;

pub use depth::DepthEntry;
pub use reach::bitmap_reachable;
pub use walk::{CommitMeta, Parsed, RevWalk};

use gitd_hash::ObjectId;

/// Errors from walk operations.
#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("object not found: {0}")]
    MissingObject(ObjectId),

    #[error("not a commit: {0}")]
    NotACommit(ObjectId),

    #[error("all 32 walk flags are in use")]
    FlagsExhausted,

    #[error("walk internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Store(#[from] gitd_store::StoreError),

    #[error(transparent)]
    Object(#[from] gitd_object::ObjectError),
}

/// One allocated flag bit on walked objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkFlag(pub(crate) u32);

impl WalkFlag {
    pub fn bit(&self) -> u32 {
        self.0
    }
}

/// Flags reserved for the negotiation layer, always available.
pub mod flags {
    use super::WalkFlag;

    /// Object id was advertised to the peer.
    pub const ADVERTISED: WalkFlag = WalkFlag(1 << 0);
    /// Peer asked for this object.
    pub const WANT: WalkFlag = WalkFlag(1 << 1);
    /// Peer claims to have this object.
    pub const PEER_HAS: WalkFlag = WalkFlag(1 << 2);
    /// Confirmed part of the common base.
    pub const COMMON: WalkFlag = WalkFlag(1 << 3);
    /// Want proven reachable from the common base.
    pub const SATISFIED: WalkFlag = WalkFlag(1 << 4);
}

/// Walk-internal bits, at the top of the word.
pub(crate) const SEEN: u32 = 1 << 31;
pub(crate) const UNINTERESTING: u32 = 1 << 30;
pub(crate) const QUEUED: u32 = 1 << 29;
/// First bit handed out by `allocate_flag`.
pub(crate) const FIRST_FREE_BIT: u32 = 5;
/// One past the last allocatable bit.
pub(crate) const LAST_FREE_BIT: u32 = 29;
