//! Pack codec, streaming indexer, index files, and pack writing.
//!
//! This crate owns both halves of the transport pipeline's on-disk story:
//! ingesting a pack stream into a validated `pack-*.pack` / `.idx` pair, and
//! producing a pack on an output stream from a chosen object set.

pub mod bitmap;
pub mod delta;
pub mod entry;
pub mod index;
pub mod indexer;
pub mod inflate;
pub mod pack;
pub mod verify;
pub mod writer;

use gitd_hash::ObjectId;
use gitd_object::ObjectType;

/// Errors that can occur during pack operations.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("truncated pack input: {0}")]
    TruncatedInput(String),

    #[error("invalid pack data: {0}")]
    InvalidFormat(String),

    #[error("unsupported pack version: {0}")]
    UnsupportedVersion(u32),

    #[error("pack checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        expected: ObjectId,
        actual: ObjectId,
    },

    #[error("crc mismatch for entry at offset {offset}: recorded {recorded:#010x}, re-read {actual:#010x}")]
    CrcMismatch {
        offset: u64,
        recorded: u32,
        actual: u32,
    },

    #[error("invalid delta at offset {offset}: {reason}")]
    InvalidDelta { offset: u64, reason: String },

    #[error("delta chain too deep (>{max_depth} levels) at offset {offset}")]
    DeltaChainTooDeep { offset: u64, max_depth: usize },

    #[error("delta base not found: {0}")]
    MissingBase(ObjectId),

    #[error("object collision for {0}: existing object has same id but different content")]
    ObjectCollision(ObjectId),

    #[error("invalid pack index: {0}")]
    InvalidIndex(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] gitd_store::StoreError),

    #[error(transparent)]
    Object(#[from] gitd_object::ObjectError),

    #[error(transparent)]
    Hash(#[from] gitd_hash::HashError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Type of a packed object entry as read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackEntryType {
    Commit,
    Tree,
    Blob,
    Tag,
    /// Delta whose base lies earlier in the same pack.
    OfsDelta { base_offset: u64 },
    /// Delta referencing its base by id.
    RefDelta { base_oid: ObjectId },
}

impl PackEntryType {
    /// Convert a non-delta pack entry type to an ObjectType.
    pub fn to_object_type(self) -> Option<ObjectType> {
        match self {
            Self::Commit => Some(ObjectType::Commit),
            Self::Tree => Some(ObjectType::Tree),
            Self::Blob => Some(ObjectType::Blob),
            Self::Tag => Some(ObjectType::Tag),
            Self::OfsDelta { .. } | Self::RefDelta { .. } => None,
        }
    }

    /// Type number as used in pack entry headers.
    pub fn type_number(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
            Self::OfsDelta { .. } => 6,
            Self::RefDelta { .. } => 7,
        }
    }

    /// Pack type number for a resolved object type.
    pub fn number_for(kind: ObjectType) -> u8 {
        match kind {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
            ObjectType::Tag => 4,
        }
    }
}

/// A validated object record, as stored in the pack index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedObjectInfo {
    pub oid: ObjectId,
    pub offset: u64,
    pub crc32: u32,
    pub kind: ObjectType,
    pub size: u64,
}

/// A fully resolved object read from a packfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedObject {
    pub kind: ObjectType,
    pub data: Vec<u8>,
}

/// Pack format constants.
pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32 = 2;
pub const PACK_HEADER_SIZE: usize = 12;

/// Pack index constants. V1 has no signature; its first four bytes are the
/// start of the fanout table.
pub const IDX_SIGNATURE: [u8; 4] = [0xff, 0x74, 0x4f, 0x63]; // "\377tOc"
pub const IDX_VERSION: u32 = 2;

/// Maximum delta chain depth before we bail out.
pub const MAX_DELTA_CHAIN_DEPTH: usize = 512;

/// Compute the fingerprint a finished pack is installed under:
/// the SHA-1 over all object ids in index (name) order.
pub fn pack_fingerprint(sorted_oids: &[ObjectId]) -> Result<ObjectId, PackError> {
    let mut hasher = gitd_hash::Hasher::new();
    for oid in sorted_oids {
        hasher.update(oid.as_bytes());
    }
    Ok(hasher.finalize()?)
}
