//! Pack index reading and writing, generations v1 and v2.
//!
//! Both generations map sorted object ids to pack offsets through a 256-way
//! fan-out table. V2 adds per-entry CRC32 values and 64-bit offsets:
//!
//! ```text
//! v2: \xfftOc | version=2 | fanout[256] | oids | crc32s | offsets32 | offsets64 | trailer
//! v1: fanout[256] | (offset32, oid)* | trailer
//! trailer: 20-byte pack checksum | 20-byte index checksum
//! ```

use std::path::{Path, PathBuf};

use gitd_hash::{Hasher, ObjectId, OID_RAW_LEN};
use memmap2::Mmap;

use crate::{PackError, PackedObjectInfo, IDX_SIGNATURE, IDX_VERSION};

/// Pack index providing OID → offset mapping.
pub struct PackIndex {
    data: Mmap,
    version: u32,
    num_objects: u32,
    /// Byte offset where sorted OIDs start (v2) or where entry records
    /// start (v1).
    table_offset: usize,
    /// v2 only: byte offsets of the CRC32, 32-bit offset, and 64-bit offset
    /// tables.
    crc_offset: usize,
    offset32_offset: usize,
    offset64_offset: usize,
    idx_path: PathBuf,
}

/// Size of one v1 entry record: 4-byte offset + oid.
const V1_RECORD: usize = 4 + OID_RAW_LEN;

impl PackIndex {
    /// Open a pack index file, accepting either generation.
    pub fn open(idx_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let idx_path = idx_path.as_ref().to_path_buf();
        let file = std::fs::File::open(&idx_path)?;
        let data = unsafe { Mmap::map(&file)? };

        // Minimum size either way: fanout(1024) + trailer(40).
        if data.len() < 1024 + 2 * OID_RAW_LEN {
            return Err(PackError::InvalidIndex("file too small".into()));
        }

        let (version, fanout_offset) = if data[0..4] == IDX_SIGNATURE {
            let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            if version != IDX_VERSION {
                return Err(PackError::InvalidIndex(format!(
                    "unsupported version {version}, expected {IDX_VERSION}"
                )));
            }
            (version, 8usize)
        } else {
            (1u32, 0usize)
        };

        let last_fanout_pos = fanout_offset + 255 * 4;
        if data.len() < last_fanout_pos + 4 {
            return Err(PackError::InvalidIndex("truncated fanout".into()));
        }
        let num_objects = u32::from_be_bytes([
            data[last_fanout_pos],
            data[last_fanout_pos + 1],
            data[last_fanout_pos + 2],
            data[last_fanout_pos + 3],
        ]);

        let n = num_objects as usize;
        let table_offset = fanout_offset + 1024;

        let (crc_offset, offset32_offset, offset64_offset, min_size) = match version {
            1 => {
                let min = table_offset + n * V1_RECORD + 2 * OID_RAW_LEN;
                (0, 0, 0, min)
            }
            _ => {
                let crc = table_offset + n * OID_RAW_LEN;
                let off32 = crc + n * 4;
                let off64 = off32 + n * 4;
                // offset64 table length is variable; trailer comes after it.
                (crc, off32, off64, off64 + 2 * OID_RAW_LEN)
            }
        };

        if data.len() < min_size {
            return Err(PackError::InvalidIndex(format!(
                "file too small: {} < {min_size}",
                data.len()
            )));
        }

        Ok(Self {
            data,
            version,
            num_objects,
            table_offset,
            crc_offset,
            offset32_offset,
            offset64_offset,
            idx_path,
        })
    }

    /// Look up an OID, returning the offset in the pack file.
    ///
    /// Binary search within the fan-out bucket: O(log N).
    pub fn lookup(&self, oid: &ObjectId) -> Option<u64> {
        let (lo, hi) = self.fanout_range(oid.first_byte());
        let target = oid.as_bytes().as_slice();

        let mut low = lo;
        let mut high = hi;
        while low < high {
            let mid = low + (high - low) / 2;
            match self.oid_bytes_at(mid).cmp(target) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => {
                    return Some(self.offset_at_index(mid as u32));
                }
            }
        }
        None
    }

    /// Look up by raw OID prefix, returning all matches as (OID, offset).
    pub fn lookup_prefix(&self, prefix: &[u8]) -> Vec<(ObjectId, u64)> {
        if prefix.is_empty() {
            return Vec::new();
        }

        let (lo, hi) = self.fanout_range(prefix[0]);
        let mut results = Vec::new();
        for i in lo..hi {
            let oid_bytes = self.oid_bytes_at(i);
            if oid_bytes[..prefix.len().min(OID_RAW_LEN)] == *prefix {
                if let Ok(oid) = ObjectId::from_bytes(oid_bytes) {
                    results.push((oid, self.offset_at_index(i as u32)));
                }
            }
        }
        results
    }

    /// Get the OID at the given name-order position.
    pub fn oid_at_index(&self, index: u32) -> ObjectId {
        ObjectId::from_bytes(self.oid_bytes_at(index as usize)).expect("valid OID in index")
    }

    /// Get the pack file offset at the given name-order position.
    pub fn offset_at_index(&self, index: u32) -> u64 {
        if self.version == 1 {
            let pos = self.table_offset + index as usize * V1_RECORD;
            return u32::from_be_bytes([
                self.data[pos],
                self.data[pos + 1],
                self.data[pos + 2],
                self.data[pos + 3],
            ]) as u64;
        }

        let pos = self.offset32_offset + index as usize * 4;
        let val = u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]);

        if val & 0x8000_0000 != 0 {
            // High bit set: lower 31 bits index into the 64-bit table.
            let idx64 = (val & 0x7FFF_FFFF) as usize;
            let pos64 = self.offset64_offset + idx64 * 8;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&self.data[pos64..pos64 + 8]);
            u64::from_be_bytes(bytes)
        } else {
            val as u64
        }
    }

    /// Get the CRC32 at the given name-order position. V1 stores none.
    pub fn crc32_at_index(&self, index: u32) -> Option<u32> {
        if self.version == 1 {
            return None;
        }
        let pos = self.crc_offset + index as usize * 4;
        Some(u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]))
    }

    /// Total number of objects in this index.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Index generation (1 or 2).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Path to the .idx file.
    pub fn path(&self) -> &Path {
        &self.idx_path
    }

    /// Pack checksum stored in the index trailer.
    pub fn pack_checksum(&self) -> ObjectId {
        let start = self.data.len() - 2 * OID_RAW_LEN;
        ObjectId::from_bytes(&self.data[start..start + OID_RAW_LEN])
            .expect("valid checksum in index trailer")
    }

    /// The trailing hash of the index file itself.
    pub fn index_checksum(&self) -> ObjectId {
        let start = self.data.len() - OID_RAW_LEN;
        ObjectId::from_bytes(&self.data[start..]).expect("valid checksum in index trailer")
    }

    /// Verify the index's own trailing checksum.
    pub fn verify_checksum(&self) -> Result<(), PackError> {
        let content = &self.data[..self.data.len() - OID_RAW_LEN];
        let mut hasher = Hasher::new();
        hasher.update(content);
        let computed = hasher.finalize()?;
        let stored = self.index_checksum();
        if computed != stored {
            return Err(PackError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }
        Ok(())
    }

    /// Iterate over all (OID, offset) pairs in name order.
    pub fn iter(&self) -> PackIndexIter<'_> {
        PackIndexIter {
            index: self,
            pos: 0,
        }
    }

    fn fanout_entry(&self, index: u8) -> u32 {
        let fanout_offset = if self.version == 1 { 0 } else { 8 };
        let pos = fanout_offset + index as usize * 4;
        u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ])
    }

    fn fanout_range(&self, first_byte: u8) -> (usize, usize) {
        let end = self.fanout_entry(first_byte) as usize;
        let start = if first_byte == 0 {
            0
        } else {
            self.fanout_entry(first_byte - 1) as usize
        };
        (start, end)
    }

    fn oid_bytes_at(&self, index: usize) -> &[u8] {
        let start = if self.version == 1 {
            self.table_offset + index * V1_RECORD + 4
        } else {
            self.table_offset + index * OID_RAW_LEN
        };
        &self.data[start..start + OID_RAW_LEN]
    }
}

/// Iterator over (OID, offset) pairs in a pack index.
pub struct PackIndexIter<'a> {
    index: &'a PackIndex,
    pos: u32,
}

impl Iterator for PackIndexIter<'_> {
    type Item = (ObjectId, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.index.num_objects {
            return None;
        }
        let oid = self.index.oid_at_index(self.pos);
        let offset = self.index.offset_at_index(self.pos);
        self.pos += 1;
        Some((oid, offset))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.index.num_objects - self.pos) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PackIndexIter<'_> {}

/// Build the fan-out table from sorted entries.
fn fanout_table(entries: &[PackedObjectInfo]) -> [u32; 256] {
    let mut fanout = [0u32; 256];
    for info in entries {
        fanout[info.oid.first_byte() as usize] += 1;
    }
    for i in 1..256 {
        fanout[i] += fanout[i - 1];
    }
    fanout
}

/// Serialize a v2 index for `entries`, which must be sorted by OID.
pub fn write_index_v2(
    entries: &[PackedObjectInfo],
    pack_checksum: &ObjectId,
) -> Result<Vec<u8>, PackError> {
    debug_assert!(entries.windows(2).all(|w| w[0].oid < w[1].oid));

    let mut buf = Vec::new();

    buf.extend_from_slice(&IDX_SIGNATURE);
    buf.extend_from_slice(&IDX_VERSION.to_be_bytes());

    for count in fanout_table(entries) {
        buf.extend_from_slice(&count.to_be_bytes());
    }

    for info in entries {
        buf.extend_from_slice(info.oid.as_bytes());
    }

    for info in entries {
        buf.extend_from_slice(&info.crc32.to_be_bytes());
    }

    let mut large_offsets: Vec<u64> = Vec::new();
    for info in entries {
        if info.offset >= 0x8000_0000 {
            let idx = large_offsets.len() as u32;
            buf.extend_from_slice(&(0x8000_0000u32 | idx).to_be_bytes());
            large_offsets.push(info.offset);
        } else {
            buf.extend_from_slice(&(info.offset as u32).to_be_bytes());
        }
    }
    for offset in &large_offsets {
        buf.extend_from_slice(&offset.to_be_bytes());
    }

    buf.extend_from_slice(pack_checksum.as_bytes());

    let mut hasher = Hasher::new();
    hasher.update(&buf);
    let idx_checksum = hasher.finalize()?;
    buf.extend_from_slice(idx_checksum.as_bytes());

    Ok(buf)
}

/// Serialize a v1 index for `entries`, which must be sorted by OID.
///
/// V1 stores no CRCs and cannot represent offsets past 31 bits; such packs
/// must use v2.
pub fn write_index_v1(
    entries: &[PackedObjectInfo],
    pack_checksum: &ObjectId,
) -> Result<Vec<u8>, PackError> {
    debug_assert!(entries.windows(2).all(|w| w[0].oid < w[1].oid));

    let mut buf = Vec::new();

    for count in fanout_table(entries) {
        buf.extend_from_slice(&count.to_be_bytes());
    }

    for info in entries {
        if info.offset >= 0x8000_0000 {
            return Err(PackError::InvalidIndex(format!(
                "offset {} of {} does not fit index v1",
                info.offset, info.oid
            )));
        }
        buf.extend_from_slice(&(info.offset as u32).to_be_bytes());
        buf.extend_from_slice(info.oid.as_bytes());
    }

    buf.extend_from_slice(pack_checksum.as_bytes());

    let mut hasher = Hasher::new();
    hasher.update(&buf);
    let idx_checksum = hasher.finalize()?;
    buf.extend_from_slice(idx_checksum.as_bytes());

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitd_object::ObjectType;
    use std::io::Write;

    fn make_oid(first_byte: u8, suffix: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = first_byte;
        bytes[19] = suffix;
        ObjectId::from(bytes)
    }

    fn make_entries(raw: &[(ObjectId, u64, u32)]) -> Vec<PackedObjectInfo> {
        let mut entries: Vec<PackedObjectInfo> = raw
            .iter()
            .map(|&(oid, offset, crc32)| PackedObjectInfo {
                oid,
                offset,
                crc32,
                kind: ObjectType::Blob,
                size: 0,
            })
            .collect();
        entries.sort_by(|a, b| a.oid.cmp(&b.oid));
        entries
    }

    fn write_index(dir: &Path, data: &[u8]) -> PathBuf {
        let path = dir.join("test.idx");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn v2_open_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let entries = make_entries(&[
            (make_oid(0x00, 0x01), 100, 0x111),
            (make_oid(0x00, 0x02), 200, 0x222),
            (make_oid(0x0a, 0x01), 300, 0x333),
            (make_oid(0xff, 0x01), 400, 0x444),
        ]);
        let data = write_index_v2(&entries, &ObjectId::NULL).unwrap();
        let path = write_index(dir.path(), &data);

        let idx = PackIndex::open(&path).unwrap();
        assert_eq!(idx.version(), 2);
        assert_eq!(idx.num_objects(), 4);
        idx.verify_checksum().unwrap();

        for info in &entries {
            assert_eq!(idx.lookup(&info.oid), Some(info.offset));
        }
        assert_eq!(idx.lookup(&make_oid(0x0a, 0x02)), None);
    }

    #[test]
    fn v2_crc_values() {
        let dir = tempfile::tempdir().unwrap();
        let entries = make_entries(&[
            (make_oid(0x10, 0x01), 100, 0xAAAA_BBBB),
            (make_oid(0x20, 0x01), 200, 0xCCCC_DDDD),
        ]);
        let data = write_index_v2(&entries, &ObjectId::NULL).unwrap();
        let idx = PackIndex::open(write_index(dir.path(), &data)).unwrap();
        assert_eq!(idx.crc32_at_index(0), Some(0xAAAA_BBBB));
        assert_eq!(idx.crc32_at_index(1), Some(0xCCCC_DDDD));
    }

    #[test]
    fn v2_64bit_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let large: u64 = 5 * 1024 * 1024 * 1024;
        let entries = make_entries(&[
            (make_oid(0x42, 0x01), large, 0),
            (make_oid(0x43, 0x01), 12, 0),
        ]);
        let data = write_index_v2(&entries, &ObjectId::NULL).unwrap();
        let idx = PackIndex::open(write_index(dir.path(), &data)).unwrap();

        assert_eq!(idx.lookup(&make_oid(0x42, 0x01)), Some(large));
        assert_eq!(idx.lookup(&make_oid(0x43, 0x01)), Some(12));
    }

    #[test]
    fn v1_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let entries = make_entries(&[
            (make_oid(0x01, 0x01), 12, 0),
            (make_oid(0x80, 0x01), 240, 0),
        ]);
        let data = write_index_v1(&entries, &ObjectId::NULL).unwrap();
        let idx = PackIndex::open(write_index(dir.path(), &data)).unwrap();

        assert_eq!(idx.version(), 1);
        assert_eq!(idx.num_objects(), 2);
        idx.verify_checksum().unwrap();
        assert_eq!(idx.lookup(&make_oid(0x01, 0x01)), Some(12));
        assert_eq!(idx.lookup(&make_oid(0x80, 0x01)), Some(240));
        assert_eq!(idx.crc32_at_index(0), None);
    }

    #[test]
    fn v1_rejects_wide_offsets() {
        let entries = make_entries(&[(make_oid(0x01, 0x01), 0x8000_0000, 0)]);
        assert!(matches!(
            write_index_v1(&entries, &ObjectId::NULL),
            Err(PackError::InvalidIndex(_))
        ));
    }

    #[test]
    fn iteration_is_name_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let entries = make_entries(&[
            (make_oid(0xff, 0x01), 100, 0),
            (make_oid(0x00, 0x01), 200, 0),
            (make_oid(0x55, 0x01), 300, 0),
        ]);
        let data = write_index_v2(&entries, &ObjectId::NULL).unwrap();
        let idx = PackIndex::open(write_index(dir.path(), &data)).unwrap();

        let oids: Vec<ObjectId> = idx.iter().map(|(oid, _)| oid).collect();
        assert!(oids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(oids.len(), 3);
    }

    #[test]
    fn prefix_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let entries = make_entries(&[
            (make_oid(0xab, 0x01), 100, 0),
            (make_oid(0xab, 0x02), 200, 0),
            (make_oid(0xac, 0x01), 300, 0),
        ]);
        let data = write_index_v2(&entries, &ObjectId::NULL).unwrap();
        let idx = PackIndex::open(write_index(dir.path(), &data)).unwrap();

        assert_eq!(idx.lookup_prefix(&[0xab]).len(), 2);
        assert_eq!(idx.lookup_prefix(&[0xac]).len(), 1);
        assert_eq!(idx.lookup_prefix(&[0xad]).len(), 0);
    }

    #[test]
    fn empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let data = write_index_v2(&[], &ObjectId::NULL).unwrap();
        let idx = PackIndex::open(write_index(dir.path(), &data)).unwrap();
        assert_eq!(idx.num_objects(), 0);
        assert_eq!(idx.lookup(&make_oid(0, 0)), None);
        assert_eq!(idx.iter().count(), 0);
    }

    #[test]
    fn corrupted_index_checksum_detected() {
        let dir = tempfile::tempdir().unwrap();
        let entries = make_entries(&[(make_oid(0x01, 0x01), 12, 0)]);
        let mut data = write_index_v2(&entries, &ObjectId::NULL).unwrap();
        let flip = data.len() / 2;
        data[flip] ^= 0xff;
        let idx = PackIndex::open(write_index(dir.path(), &data)).unwrap();
        assert!(idx.verify_checksum().is_err());
    }
}
