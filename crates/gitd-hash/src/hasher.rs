//! Streaming SHA-1 with collision detection.

use digest::Digest;

use crate::{HashError, ObjectId};

/// Streaming hash computation over object or pack bytes.
///
/// Data is fed incrementally with [`update`](Hasher::update) or through the
/// [`std::io::Write`] implementation. The digest buffer inside is mutable
/// until [`finalize`](Hasher::finalize) freezes it into an [`ObjectId`].
/// Cloning snapshots the running state, which lets a pack consumer check a
/// mid-stream footer while continuing to hash.
#[derive(Clone)]
pub struct Hasher {
    inner: Box<sha1_checked::Sha1>,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            inner: Box::new(sha1_checked::Sha1::new()),
        }
    }

    /// Feed data into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize and return the ObjectId.
    ///
    /// Returns an error if SHA-1 collision detection fires.
    pub fn finalize(self) -> Result<ObjectId, HashError> {
        let result = self.inner.try_finalize();
        if result.has_collision() {
            return Err(HashError::Sha1Collision);
        }
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(result.hash().as_slice());
        Ok(ObjectId::from(bytes))
    }

    /// Convenience: hash data in one call.
    pub fn digest(data: &[u8]) -> Result<ObjectId, HashError> {
        let mut h = Self::new();
        h.update(data);
        h.finalize()
    }

    /// Hash a git object: `"{type} {len}\0{content}"`.
    pub fn hash_object(type_name: &[u8], data: &[u8]) -> Result<ObjectId, HashError> {
        let mut h = Self::new();
        h.update(type_name);
        h.update(format!(" {}\0", data.len()).as_bytes());
        h.update(data);
        h.finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
