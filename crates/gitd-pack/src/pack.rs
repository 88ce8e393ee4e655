//! Random-access reading of installed `.pack` files.
//!
//! A `PackFile` memory-maps the pack and its index. Delta chains are
//! resolved iteratively, and raw entry spans are exposed so the pack writer
//! can reuse on-disk compressed bytes verbatim.

use std::path::{Path, PathBuf};

use gitd_hash::ObjectId;
use gitd_object::ObjectType;
use memmap2::Mmap;

use crate::entry::{parse_entry_header, PackEntry};
use crate::index::PackIndex;
use crate::inflate::{inflate_slice, InflatePool};
use crate::{
    PackEntryType, PackError, PackedObject, MAX_DELTA_CHAIN_DEPTH, PACK_HEADER_SIZE,
    PACK_SIGNATURE,
};

/// A memory-mapped packfile with its index.
pub struct PackFile {
    data: Mmap,
    index: PackIndex,
    pack_path: PathBuf,
    num_objects: u32,
    inflaters: InflatePool,
}

/// The raw byte span of one entry, for verbatim reuse.
pub struct RawEntry<'a> {
    pub header: PackEntry,
    /// Entire entry as stored: header bytes, base reference, zlib stream.
    pub bytes: &'a [u8],
}

impl PackFile {
    /// Open a pack file and its associated `.idx`.
    pub fn open(pack_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let pack_path = pack_path.as_ref().to_path_buf();
        let idx_path = pack_path.with_extension("idx");

        let file = std::fs::File::open(&pack_path)?;
        let data = unsafe { Mmap::map(&file)? };

        if data.len() < PACK_HEADER_SIZE {
            return Err(PackError::InvalidFormat("pack file too small".into()));
        }
        if &data[0..4] != PACK_SIGNATURE {
            return Err(PackError::InvalidFormat("bad PACK signature".into()));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if !(2..=3).contains(&version) {
            return Err(PackError::UnsupportedVersion(version));
        }
        let num_objects = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let index = PackIndex::open(&idx_path)?;
        if index.num_objects() != num_objects {
            return Err(PackError::InvalidFormat(format!(
                "pack has {} objects but index has {}",
                num_objects,
                index.num_objects()
            )));
        }

        Ok(Self {
            data,
            index,
            pack_path,
            num_objects,
            inflaters: InflatePool::new(),
        })
    }

    /// Read an object by OID. `None` if the OID is not in this pack.
    pub fn read_object(&self, oid: &ObjectId) -> Result<Option<PackedObject>, PackError> {
        match self.index.lookup(oid) {
            Some(offset) => self.read_at_offset(offset).map(Some),
            None => Ok(None),
        }
    }

    /// Read an object at a known offset, resolving delta chains iteratively.
    pub fn read_at_offset(&self, offset: u64) -> Result<PackedObject, PackError> {
        self.read_at_offset_with_resolver(offset, |_| None)
    }

    /// Read an object by OID with an external resolver for REF_DELTA bases
    /// that live outside this pack (thin-pack consumers).
    pub fn read_object_with_resolver(
        &self,
        oid: &ObjectId,
        resolver: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    ) -> Result<Option<PackedObject>, PackError> {
        match self.index.lookup(oid) {
            Some(offset) => self.read_at_offset_with_resolver(offset, resolver).map(Some),
            None => Ok(None),
        }
    }

    fn read_at_offset_with_resolver(
        &self,
        offset: u64,
        resolver: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    ) -> Result<PackedObject, PackError> {
        // Walk down the chain collecting delta payloads, innermost first.
        let mut chain: Vec<Vec<u8>> = Vec::new();
        let mut current_offset = offset;

        for _ in 0..MAX_DELTA_CHAIN_DEPTH {
            let (entry, payload) = self.entry_payload(current_offset)?;

            match entry.entry_type {
                PackEntryType::Commit
                | PackEntryType::Tree
                | PackEntryType::Blob
                | PackEntryType::Tag => {
                    let kind = entry.entry_type.to_object_type().expect("non-delta type");
                    let data = apply_chain(payload, &chain)?;
                    return Ok(PackedObject { kind, data });
                }
                PackEntryType::OfsDelta { base_offset } => {
                    chain.push(payload);
                    current_offset = base_offset;
                }
                PackEntryType::RefDelta { base_oid } => {
                    chain.push(payload);
                    if let Some(base_offset) = self.index.lookup(&base_oid) {
                        current_offset = base_offset;
                    } else if let Some((kind, base_data)) = resolver(&base_oid) {
                        let data = apply_chain(base_data, &chain)?;
                        return Ok(PackedObject { kind, data });
                    } else {
                        return Err(PackError::MissingBase(base_oid));
                    }
                }
            }
        }

        Err(PackError::DeltaChainTooDeep {
            offset,
            max_depth: MAX_DELTA_CHAIN_DEPTH,
        })
    }

    /// The raw stored span of the entry at `offset`, including its header.
    ///
    /// Used by the pack writer to copy a compressed representation without
    /// recompressing.
    pub fn raw_entry(&self, offset: u64) -> Result<RawEntry<'_>, PackError> {
        let (entry, zlib_len) = self.entry_compressed_len(offset)?;
        let start = offset as usize;
        let end = entry.data_offset as usize + zlib_len;
        Ok(RawEntry {
            header: entry,
            bytes: &self.data[start..end],
        })
    }

    /// Parse the entry at `offset` and inflate its payload.
    fn entry_payload(&self, offset: u64) -> Result<(PackEntry, Vec<u8>), PackError> {
        let entry = parse_entry_header(&self.data[offset as usize..], offset)?;
        let compressed = &self.data[entry.data_offset as usize..];
        let mut z = self.inflaters.lease();
        let (payload, _) = inflate_slice(&mut z, compressed, entry.inflated_size as usize, offset)?;
        Ok((entry, payload))
    }

    /// Parse the entry at `offset` and measure its compressed length without
    /// retaining the payload.
    fn entry_compressed_len(&self, offset: u64) -> Result<(PackEntry, usize), PackError> {
        let entry = parse_entry_header(&self.data[offset as usize..], offset)?;
        let compressed = &self.data[entry.data_offset as usize..];
        let mut z = self.inflaters.lease();
        let (_, consumed) =
            inflate_slice(&mut z, compressed, entry.inflated_size as usize, offset)?;
        Ok((entry, consumed))
    }

    /// Check if this pack contains the given OID.
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.index.lookup(oid).is_some()
    }

    /// Number of objects in this pack.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// The pack index.
    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    /// Path to the .pack file.
    pub fn path(&self) -> &Path {
        &self.pack_path
    }

    /// Raw memory-mapped pack bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Apply collected deltas (innermost first) on top of a base buffer.
fn apply_chain(base: Vec<u8>, chain: &[Vec<u8>]) -> Result<Vec<u8>, PackError> {
    let mut data = base;
    for delta in chain.iter().rev() {
        data = crate::delta::apply_delta(&data, delta)?;
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::compute_delta;
    use crate::entry::{encode_entry_header, encode_ofs_distance};
    use crate::index::write_index_v2;
    use crate::inflate::deflate;
    use crate::{PackedObjectInfo, PACK_VERSION};
    use gitd_hash::Hasher;

    /// Assemble a pack + index on disk from (type, content, delta-base) specs.
    /// `base` of `Some(i)` makes entry an OFS delta against entry `i`.
    fn build_pack(
        dir: &Path,
        objects: &[(ObjectType, &[u8], Option<usize>)],
    ) -> (PathBuf, Vec<ObjectId>) {
        let pack_path = dir.join("test.pack");
        let idx_path = dir.join("test.idx");

        let mut pack = Vec::new();
        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&(objects.len() as u32).to_be_bytes());

        let mut offsets: Vec<u64> = Vec::new();
        let mut entries: Vec<PackedObjectInfo> = Vec::new();
        let mut oids: Vec<ObjectId> = Vec::new();

        for (kind, content, base) in objects {
            let offset = pack.len() as u64;
            offsets.push(offset);
            let oid = Hasher::hash_object(kind.as_bytes(), content).unwrap();
            oids.push(oid);

            let mut entry_bytes = Vec::new();
            match base {
                None => {
                    entry_bytes
                        .extend_from_slice(&encode_entry_header(
                            PackEntryType::number_for(*kind),
                            content.len() as u64,
                        ));
                    entry_bytes.extend_from_slice(&deflate(content).unwrap());
                }
                Some(base_idx) => {
                    let (_, base_content, _) = objects[*base_idx];
                    let delta = compute_delta(base_content, content);
                    entry_bytes.extend_from_slice(&encode_entry_header(6, delta.len() as u64));
                    entry_bytes
                        .extend_from_slice(&encode_ofs_distance(offset - offsets[*base_idx]));
                    entry_bytes.extend_from_slice(&deflate(&delta).unwrap());
                }
            }

            let mut crc = crc32fast::Hasher::new();
            crc.update(&entry_bytes);

            entries.push(PackedObjectInfo {
                oid,
                offset,
                crc32: crc.finalize(),
                kind: *kind,
                size: content.len() as u64,
            });
            pack.extend_from_slice(&entry_bytes);
        }

        let checksum = {
            let mut h = Hasher::new();
            h.update(&pack);
            h.finalize().unwrap()
        };
        pack.extend_from_slice(checksum.as_bytes());
        std::fs::write(&pack_path, &pack).unwrap();

        entries.sort_by(|a, b| a.oid.cmp(&b.oid));
        let idx = write_index_v2(&entries, &checksum).unwrap();
        std::fs::write(&idx_path, &idx).unwrap();

        (pack_path, oids)
    }

    #[test]
    fn read_single_blob() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"Hello, packfile world!";
        let (pack_path, oids) = build_pack(dir.path(), &[(ObjectType::Blob, content, None)]);

        let pack = PackFile::open(&pack_path).unwrap();
        assert_eq!(pack.num_objects(), 1);

        let obj = pack.read_object(&oids[0]).unwrap().unwrap();
        assert_eq!(obj.kind, ObjectType::Blob);
        assert_eq!(obj.data, content);
    }

    #[test]
    fn read_multiple_objects() {
        let dir = tempfile::tempdir().unwrap();
        let objects: Vec<(ObjectType, &[u8], Option<usize>)> = vec![
            (ObjectType::Blob, b"blob content", None),
            (ObjectType::Blob, b"another blob", None),
            (ObjectType::Tag, b"fake tag payload", None),
        ];
        let (pack_path, oids) = build_pack(dir.path(), &objects);

        let pack = PackFile::open(&pack_path).unwrap();
        assert_eq!(pack.num_objects(), 3);

        for (i, (kind, content, _)) in objects.iter().enumerate() {
            let obj = pack.read_object(&oids[i]).unwrap().unwrap();
            assert_eq!(obj.kind, *kind);
            assert_eq!(obj.data, *content);
        }
    }

    #[test]
    fn contains_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (pack_path, oids) = build_pack(dir.path(), &[(ObjectType::Blob, b"test", None)]);

        let pack = PackFile::open(&pack_path).unwrap();
        assert!(pack.contains(&oids[0]));

        let missing = ObjectId::from_hex("0000000000000000000000000000000000000001").unwrap();
        assert!(!pack.contains(&missing));
        assert_eq!(pack.read_object(&missing).unwrap(), None);
    }

    #[test]
    fn read_ofs_delta_chain() {
        let dir = tempfile::tempdir().unwrap();
        let base = b"Hello, this is the base object content for delta testing!";
        let mid = b"Hello, this is the changed object content for delta testing!";
        let tip = b"Hello, this is the changed object content for chain testing!!";
        let objects: Vec<(ObjectType, &[u8], Option<usize>)> = vec![
            (ObjectType::Blob, base, None),
            (ObjectType::Blob, mid, Some(0)),
            (ObjectType::Blob, tip, Some(1)),
        ];
        let (pack_path, oids) = build_pack(dir.path(), &objects);

        let pack = PackFile::open(&pack_path).unwrap();
        assert_eq!(pack.read_object(&oids[1]).unwrap().unwrap().data, mid);
        assert_eq!(pack.read_object(&oids[2]).unwrap().unwrap().data, tip);
    }

    #[test]
    fn raw_entry_span_is_copyable() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"reusable compressed representation";
        let (pack_path, oids) = build_pack(dir.path(), &[(ObjectType::Blob, content, None)]);

        let pack = PackFile::open(&pack_path).unwrap();
        let offset = pack.index().lookup(&oids[0]).unwrap();
        let raw = pack.raw_entry(offset).unwrap();

        assert_eq!(raw.header.entry_type, PackEntryType::Blob);
        // Parsing the copied span back yields the same object.
        let entry = parse_entry_header(raw.bytes, 0).unwrap();
        assert_eq!(entry.inflated_size as usize, content.len());
    }

    #[test]
    fn bad_signature_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.pack");
        std::fs::write(&path, b"JUNKxxxxyyyyzzzz").unwrap();
        assert!(matches!(
            PackFile::open(&path),
            Err(PackError::InvalidFormat(_))
        ));
    }
}
