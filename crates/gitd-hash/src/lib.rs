//! Object identity for the gitd pipeline.
//!
//! Provides the 20-byte SHA-1 `ObjectId`, hex encoding/decoding, and a
//! streaming hasher with collision detection.

pub mod hasher;
pub mod hex;
mod oid;

pub use hasher::Hasher;
pub use oid::ObjectId;

/// Length of a raw object id in bytes.
pub const OID_RAW_LEN: usize = 20;

/// Length of an object id in hex characters.
pub const OID_HEX_LEN: usize = 40;

/// Errors produced by identity and hashing operations.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("invalid hash length: expected {expected} bytes, got {actual}")]
    InvalidHashLength { expected: usize, actual: usize },

    #[error("invalid hex length: expected {expected} characters, got {actual}")]
    InvalidHexLength { expected: usize, actual: usize },

    #[error("invalid hex character {character:?} at position {position}")]
    InvalidHex { position: usize, character: char },

    #[error("SHA-1 collision attack detected")]
    Sha1Collision,
}
