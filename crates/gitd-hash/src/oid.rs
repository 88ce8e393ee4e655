use std::fmt;
use std::str::FromStr;

use crate::hex::{hex_decode, hex_to_string};
use crate::{HashError, OID_HEX_LEN, OID_RAW_LEN};

/// A git object identifier: the 20-byte SHA-1 of an object's content.
///
/// Equality and ordering are bytewise, which is also the sort order of pack
/// index entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OID_RAW_LEN]);

impl ObjectId {
    /// The null object id (all zeros).
    pub const NULL: Self = Self([0u8; OID_RAW_LEN]);

    /// Create an ObjectId from exactly 20 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HashError> {
        if bytes.len() != OID_RAW_LEN {
            return Err(HashError::InvalidHashLength {
                expected: OID_RAW_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; OID_RAW_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Create an ObjectId from a 40-character hex string.
    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        if hex.len() != OID_HEX_LEN {
            return Err(HashError::InvalidHexLength {
                expected: OID_HEX_LEN,
                actual: hex.len(),
            });
        }
        let mut bytes = [0u8; OID_RAW_LEN];
        hex_decode(hex, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Get the raw bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; OID_RAW_LEN] {
        &self.0
    }

    /// Check if this is the null (all-zeros) id.
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Get the hex string representation (lowercase).
    pub fn to_hex(&self) -> String {
        hex_to_string(&self.0)
    }

    /// Get the first byte of the hash (for fan-out table indexing).
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }
}

impl From<[u8; OID_RAW_LEN]> for ObjectId {
    fn from(bytes: [u8; OID_RAW_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let hex = "95d09f2b10159347eece71399a7e2e907ea3df4f";
        let oid = ObjectId::from_hex(hex).unwrap();
        assert_eq!(oid.to_hex(), hex);
        assert_eq!(oid.to_string(), hex);
    }

    #[test]
    fn bytes_roundtrip() {
        let bytes: Vec<u8> = (0..20).collect();
        let oid = ObjectId::from_bytes(&bytes).unwrap();
        assert_eq!(oid.as_bytes().as_slice(), bytes.as_slice());
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(ObjectId::from_bytes(&[0u8; 19]).is_err());
        assert!(ObjectId::from_bytes(&[0u8; 21]).is_err());
        assert!(ObjectId::from_hex("abcd").is_err());
    }

    #[test]
    fn null_is_null() {
        assert!(ObjectId::NULL.is_null());
        let nonzero = ObjectId::from_hex("0000000000000000000000000000000000000001").unwrap();
        assert!(!nonzero.is_null());
    }

    #[test]
    fn ordering_is_bytewise() {
        let a = ObjectId::from_hex("0000000000000000000000000000000000000001").unwrap();
        let b = ObjectId::from_hex("00000000000000000000000000000000000000ff").unwrap();
        let c = ObjectId::from_hex("0100000000000000000000000000000000000000").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn first_byte_for_fanout() {
        let oid = ObjectId::from_hex("ab00000000000000000000000000000000000000").unwrap();
        assert_eq!(oid.first_byte(), 0xab);
    }
}
