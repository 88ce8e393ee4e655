//! Pack checksum verification and whole-pack iteration.

use gitd_hash::{Hasher, ObjectId, OID_RAW_LEN};

use crate::pack::PackFile;
use crate::{PackError, PackedObject};

impl PackFile {
    /// Verify the pack's trailing checksum: SHA-1 over every byte that
    /// precedes the footer must equal the footer.
    pub fn verify_checksum(&self) -> Result<(), PackError> {
        let data = self.data();
        if data.len() < OID_RAW_LEN {
            return Err(PackError::InvalidFormat("pack too small for footer".into()));
        }

        let content = &data[..data.len() - OID_RAW_LEN];
        let stored = ObjectId::from_bytes(&data[data.len() - OID_RAW_LEN..])
            .map_err(PackError::Hash)?;

        let mut hasher = Hasher::new();
        hasher.update(content);
        let computed = hasher.finalize()?;

        if computed != stored {
            return Err(PackError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }
        Ok(())
    }

    /// Iterate over all objects, resolved, in index (name) order.
    pub fn iter(&self) -> PackIter<'_> {
        PackIter {
            pack: self,
            index_pos: 0,
        }
    }
}

/// Iterator over all objects in a pack file.
pub struct PackIter<'a> {
    pack: &'a PackFile,
    index_pos: u32,
}

impl Iterator for PackIter<'_> {
    type Item = Result<(ObjectId, PackedObject), PackError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index_pos >= self.pack.num_objects() {
            return None;
        }

        let oid = self.pack.index().oid_at_index(self.index_pos);
        let offset = self.pack.index().offset_at_index(self.index_pos);
        self.index_pos += 1;

        Some(self.pack.read_at_offset(offset).map(|obj| (oid, obj)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.pack.num_objects() - self.index_pos) as usize;
        (remaining, Some(remaining))
    }
}
