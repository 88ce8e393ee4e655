//! Streaming pack emission.
//!
//! `PackStreamWriter` writes a pack straight to an output stream: header,
//! one record per selected object, then the trailing SHA-1. The object count
//! is fixed up front (the stream may be a socket, so the header can never be
//! rewritten) and nothing is buffered beyond the entry being written.
//!
//! Object payloads are recompressed by default; a caller holding an
//! installed pack can pass a whole entry's raw span through untouched.

use std::collections::HashMap;
use std::io::Write;

use gitd_hash::{Hasher, ObjectId};
use gitd_object::ObjectType;

use crate::entry::{encode_entry_header, encode_ofs_distance, parse_entry_header};
use crate::inflate::deflate;
use crate::{PackEntryType, PackError, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION};

/// Result of a completed pack emission.
#[derive(Debug)]
pub struct WriteOutcome {
    pub num_objects: u32,
    pub bytes_written: u64,
    pub checksum: ObjectId,
}

/// Incremental pack writer over any output stream.
pub struct PackStreamWriter<W> {
    out: W,
    hasher: Hasher,
    position: u64,
    planned: u32,
    written: u32,
    /// Offsets of objects already emitted, for OFS-delta references.
    offsets: HashMap<ObjectId, u64>,
}

impl<W: Write> PackStreamWriter<W> {
    /// Start a pack of exactly `object_count` records.
    pub fn new(out: W, object_count: u32) -> Result<Self, PackError> {
        let mut writer = Self {
            out,
            hasher: Hasher::new(),
            position: 0,
            planned: object_count,
            written: 0,
            offsets: HashMap::new(),
        };

        let mut header = [0u8; PACK_HEADER_SIZE];
        header[0..4].copy_from_slice(PACK_SIGNATURE);
        header[4..8].copy_from_slice(&PACK_VERSION.to_be_bytes());
        header[8..12].copy_from_slice(&object_count.to_be_bytes());
        writer.emit(&header)?;
        Ok(writer)
    }

    /// Append a whole object, compressing its content.
    pub fn write_object(
        &mut self,
        oid: ObjectId,
        kind: ObjectType,
        data: &[u8],
    ) -> Result<(), PackError> {
        let offset = self.begin_entry(oid)?;
        let header = encode_entry_header(PackEntryType::number_for(kind), data.len() as u64);
        self.emit(&header)?;
        self.emit(&deflate(data)?)?;
        self.offsets.insert(oid, offset);
        Ok(())
    }

    /// Append a whole entry verbatim from an installed pack.
    ///
    /// `raw` must be the complete stored span (header plus zlib stream) of a
    /// non-delta entry; delta entries cannot move packs unchanged because
    /// their base references are position- or presence-dependent.
    pub fn write_raw_entry(&mut self, oid: ObjectId, raw: &[u8]) -> Result<(), PackError> {
        let parsed = parse_entry_header(raw, 0)?;
        if parsed.entry_type.to_object_type().is_none() {
            return Err(PackError::InvalidFormat(
                "raw reuse is only valid for whole entries".into(),
            ));
        }
        let offset = self.begin_entry(oid)?;
        self.emit(raw)?;
        self.offsets.insert(oid, offset);
        Ok(())
    }

    /// Append a REF-delta record. With thin packs the base may be absent
    /// from this stream entirely.
    pub fn write_ref_delta(
        &mut self,
        oid: ObjectId,
        base_oid: ObjectId,
        delta: &[u8],
    ) -> Result<(), PackError> {
        let offset = self.begin_entry(oid)?;
        let header = encode_entry_header(7, delta.len() as u64);
        self.emit(&header)?;
        self.emit(base_oid.as_bytes())?;
        self.emit(&deflate(delta)?)?;
        self.offsets.insert(oid, offset);
        Ok(())
    }

    /// Append an OFS-delta record against an already-written base.
    pub fn write_ofs_delta(
        &mut self,
        oid: ObjectId,
        base_oid: &ObjectId,
        delta: &[u8],
    ) -> Result<(), PackError> {
        let base_offset = *self
            .offsets
            .get(base_oid)
            .ok_or(PackError::MissingBase(*base_oid))?;
        let offset = self.begin_entry(oid)?;
        let header = encode_entry_header(6, delta.len() as u64);
        self.emit(&header)?;
        self.emit(&encode_ofs_distance(offset - base_offset))?;
        self.emit(&deflate(delta)?)?;
        self.offsets.insert(oid, offset);
        Ok(())
    }

    /// Has this object already been written into the stream?
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.offsets.contains_key(oid)
    }

    /// Current byte position in the stream.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Write the trailing SHA-1 and flush.
    pub fn finish(mut self) -> Result<WriteOutcome, PackError> {
        if self.written != self.planned {
            return Err(PackError::InvalidFormat(format!(
                "planned {} objects but wrote {}",
                self.planned, self.written
            )));
        }

        let checksum = self.hasher.clone().finalize()?;
        self.out.write_all(checksum.as_bytes())?;
        self.out.flush()?;

        Ok(WriteOutcome {
            num_objects: self.written,
            bytes_written: self.position + checksum.as_bytes().len() as u64,
            checksum,
        })
    }

    fn begin_entry(&mut self, oid: ObjectId) -> Result<u64, PackError> {
        if self.written == self.planned {
            return Err(PackError::InvalidFormat(format!(
                "pack already holds the planned {} objects",
                self.planned
            )));
        }
        if self.offsets.contains_key(&oid) {
            return Err(PackError::InvalidFormat(format!(
                "object {oid} written twice"
            )));
        }
        self.written += 1;
        Ok(self.position)
    }

    fn emit(&mut self, data: &[u8]) -> Result<(), PackError> {
        self.out.write_all(data)?;
        self.hasher.update(data);
        self.position += data.len() as u64;
        Ok(())
    }
}
