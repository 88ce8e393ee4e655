//! Streaming pack indexer.
//!
//! Consumes a pack byte stream until its footer, spooling identical bytes to
//! a temporary `.pack` file while validating everything the format promises:
//! the trailing SHA-1, a CRC32 per entry, and the id of every object,
//! including those that arrive as deltas. On success the temp pack and a
//! sorted index are installed atomically as `pack-<fingerprint>.{pack,idx}`.
//!
//! Two passes:
//!
//! 1. **Stream.** Whole objects are inflated to the heap, hashed, and
//!    checked against the local store for collisions. Deltas are inflated
//!    and discarded, then parked in chains keyed by base offset or base id.
//! 2. **Resolve.** For every known base, children are re-read from the temp
//!    file in ascending offset order (their CRCs must re-verify), the delta
//!    is applied, and the result is hashed and recorded. Ref chains whose
//!    base is absent from the pack are completed from the local store when
//!    thin packs are allowed: the base is appended as a synthetic whole
//!    object, and the header count and footer are rewritten.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use flate2::{FlushDecompress, Status};
use gitd_hash::{Hasher, ObjectId, OID_RAW_LEN};
use gitd_object::ObjectType;
use gitd_store::{ObjectStore, Repository, StoreError};
use gitd_utils::cancel::CancelToken;
use gitd_utils::progress::Progress;
use gitd_utils::tempfile::TempFile;

use crate::inflate::{deflate, InflatePool};
use crate::{
    entry::encode_entry_header, pack_fingerprint, PackError, PackedObjectInfo,
    MAX_DELTA_CHAIN_DEPTH, PACK_HEADER_SIZE, PACK_SIGNATURE,
};

const BUFFER_SIZE: usize = 8192;

/// Indexer configuration.
#[derive(Debug, Clone, Default)]
pub struct IndexerOptions {
    /// Permit thin packs: REF-delta bases absent from the pack are fetched
    /// from the local store and appended as whole objects.
    pub allow_thin: bool,
}

/// Result of a successful indexing run.
#[derive(Debug)]
pub struct IndexOutcome {
    /// Top-level records in the final pack, including appended thin bases.
    pub object_count: u32,
    /// The pack's trailing SHA-1 (rewritten if bases were appended).
    pub pack_checksum: ObjectId,
    /// SHA-1 over all object ids in index order; names the installed files.
    pub fingerprint: Option<ObjectId>,
    pub pack_path: Option<PathBuf>,
    pub index_path: Option<PathBuf>,
    /// Thin bases appended during completion.
    pub bases_appended: u32,
}

/// Streaming pack indexer bound to a local object store.
pub struct PackIndexer<'a, R> {
    store: &'a ObjectStore<R>,
    options: IndexerOptions,
    cancel: CancelToken,
    inflaters: InflatePool,
}

impl<'a, R: Repository> PackIndexer<'a, R> {
    pub fn new(store: &'a ObjectStore<R>) -> Self {
        Self::with_options(store, IndexerOptions::default())
    }

    pub fn with_options(store: &'a ObjectStore<R>, options: IndexerOptions) -> Self {
        Self {
            store,
            options,
            cancel: CancelToken::new(),
            inflaters: InflatePool::new(),
        }
    }

    /// Install a cancellation token polled between objects.
    pub fn set_cancel(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    /// Consume a pack stream and produce an installed pack + index.
    ///
    /// Temporary files are removed on any failure, including cancellation.
    pub fn index(
        &self,
        input: impl Read,
        progress: &mut Progress,
    ) -> Result<IndexOutcome, PackError> {
        let pack_dir = self.store.objects_dir().join("pack");
        let run = IndexRun {
            input,
            store: self.store,
            options: self.options.clone(),
            cancel: self.cancel.clone(),
            inflaters: &self.inflaters,
            buf: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            b_pos: 0,
            b_avail: 0,
            src: Source::Input,
            spool: TempFile::with_prefix_in("tmp_pack_", &pack_dir)
                .map_err(|e| PackError::Io(std::io::Error::other(e.to_string())))?,
            spooled: 0,
            file_next: 0,
            pack_hasher: Hasher::new(),
            crc: None,
            chains: DeltaChains::default(),
            whole_objects: Vec::new(),
            entries: Vec::new(),
            original_len: 0,
            stored_footer: ObjectId::NULL,
            pack_dir,
        };
        // Temp files clean themselves up when the run is dropped on error.
        run.run(progress)
    }
}

/// Where the shared buffer refills from: the live input stream, or the
/// spooled temp file during resolution.
enum Source {
    Input,
    File,
}

#[derive(Debug, Clone, Copy)]
struct DeltaNode {
    offset: u64,
    crc32: u32,
    next: Option<u32>,
}

/// Arena of parked deltas, chained per base by index pointers.
#[derive(Default)]
struct DeltaChains {
    nodes: Vec<DeltaNode>,
    by_offset: HashMap<u64, u32>,
    by_id: HashMap<ObjectId, u32>,
    /// Ref-delta base ids in first-seen order, for deterministic thin
    /// completion.
    id_order: Vec<ObjectId>,
    parked: u64,
}

impl DeltaChains {
    fn park_ofs(&mut self, base_offset: u64, offset: u64, crc32: u32) {
        let next = self.by_offset.get(&base_offset).copied();
        let idx = self.push(offset, crc32, next);
        self.by_offset.insert(base_offset, idx);
    }

    fn park_ref(&mut self, base_id: ObjectId, offset: u64, crc32: u32) {
        let next = self.by_id.get(&base_id).copied();
        if next.is_none() {
            self.id_order.push(base_id);
        }
        let idx = self.push(offset, crc32, next);
        self.by_id.insert(base_id, idx);
    }

    fn push(&mut self, offset: u64, crc32: u32, next: Option<u32>) -> u32 {
        let idx = self.nodes.len() as u32;
        self.nodes.push(DeltaNode {
            offset,
            crc32,
            next,
        });
        self.parked += 1;
        idx
    }

    /// Detach all children of a base, merged by ascending pack offset.
    ///
    /// Chains are stored newest-first; each is reversed once here to restore
    /// arrival order before the merge.
    fn take_children(&mut self, base_offset: u64, base_id: &ObjectId) -> Vec<DeltaNode> {
        let head_by_pos = self.by_offset.remove(&base_offset);
        let head_by_id = self.by_id.remove(base_id);
        let by_pos = self.detach(head_by_pos);
        let by_id = self.detach(head_by_id);
        merge_by_offset(by_pos, by_id)
    }

    fn detach(&self, head: Option<u32>) -> Vec<DeltaNode> {
        let mut out = Vec::new();
        let mut cursor = head;
        while let Some(idx) = cursor {
            let node = self.nodes[idx as usize];
            cursor = node.next;
            out.push(node);
        }
        out.reverse();
        out
    }

    fn unresolved_ref_bases(&self) -> Vec<ObjectId> {
        self.id_order
            .iter()
            .filter(|id| self.by_id.contains_key(id))
            .copied()
            .collect()
    }
}

fn merge_by_offset(a: Vec<DeltaNode>, b: Vec<DeltaNode>) -> Vec<DeltaNode> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut ia, mut ib) = (0, 0);
    while ia < a.len() && ib < b.len() {
        if a[ia].offset <= b[ib].offset {
            out.push(a[ia]);
            ia += 1;
        } else {
            out.push(b[ib]);
            ib += 1;
        }
    }
    out.extend_from_slice(&a[ia..]);
    out.extend_from_slice(&b[ib..]);
    out
}

/// A parsed entry header, mode-independent.
enum EntryHead {
    Whole { kind: ObjectType, size: u64 },
    Ofs { base_offset: u64, size: u64 },
    Ref { base_id: ObjectId, size: u64 },
}

struct IndexRun<'a, R, I> {
    input: I,
    store: &'a ObjectStore<R>,
    options: IndexerOptions,
    cancel: CancelToken,
    inflaters: &'a InflatePool,

    buf: Box<[u8]>,
    b_pos: usize,
    b_avail: usize,
    src: Source,

    /// Temp `.pack` receiving every consumed input byte.
    spool: TempFile,
    /// Bytes flushed to the spool (and the pack hasher) so far.
    spooled: u64,
    /// FILE mode: file offset of the next byte to load into the buffer.
    file_next: u64,

    pack_hasher: Hasher,
    /// Per-entry CRC; active between `begin_crc` and `take_crc`.
    crc: Option<crc32fast::Hasher>,

    chains: DeltaChains,
    /// Whole objects from pass one, in pack order.
    whole_objects: Vec<PackedObjectInfo>,
    /// Every validated record.
    entries: Vec<PackedObjectInfo>,

    /// Byte length of the original pack as received (footer included).
    original_len: u64,
    /// Footer read off the wire.
    stored_footer: ObjectId,

    pack_dir: PathBuf,
}

impl<R: Repository, I: Read> IndexRun<'_, R, I> {
    fn run(mut self, progress: &mut Progress) -> Result<IndexOutcome, PackError> {
        let object_count = self.read_pack_header()?;

        progress.restart("Receiving objects", Some(object_count as u64));
        for _ in 0..object_count {
            self.check_cancel()?;
            self.read_one_object()?;
            progress.tick();
        }
        self.read_pack_footer()?;
        progress.complete();

        if object_count == 0 {
            return Ok(IndexOutcome {
                object_count: 0,
                pack_checksum: self.stored_footer,
                fingerprint: None,
                pack_path: None,
                index_path: None,
                bases_appended: 0,
            });
        }

        // Pass two reads back from the spooled file.
        self.spool.flush()?;
        self.src = Source::File;

        progress.restart("Resolving deltas", Some(self.chains.parked));
        let roots = self.whole_objects.clone();
        for root in roots {
            self.check_cancel()?;
            self.resolve_children_of(&root, progress)?;
        }

        let mut bases_appended = 0u32;
        let mut pack_checksum = self.stored_footer;
        if !self.chains.by_id.is_empty() {
            if !self.options.allow_thin {
                let missing = self.chains.unresolved_ref_bases()[0];
                return Err(PackError::MissingBase(missing));
            }
            bases_appended = self.complete_thin_pack(progress)?;
            if bases_appended > 0 {
                pack_checksum = self.fix_header_footer()?;
            }
        }
        progress.complete();

        // An OFS chain still parked means some delta named an offset that
        // never started an entry.
        if let Some(&bad_offset) = self.chains.by_offset.keys().next() {
            return Err(PackError::InvalidDelta {
                offset: bad_offset,
                reason: "delta base offset does not start an entry".into(),
            });
        }

        self.install(pack_checksum, bases_appended)
    }

    // --- pass one ---

    fn read_pack_header(&mut self) -> Result<u32, PackError> {
        self.fill(PACK_HEADER_SIZE)?;
        let header = &self.buf[self.b_pos..self.b_pos + PACK_HEADER_SIZE];
        if &header[0..4] != PACK_SIGNATURE {
            return Err(PackError::InvalidFormat("bad PACK signature".into()));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if !(2..=3).contains(&version) {
            return Err(PackError::UnsupportedVersion(version));
        }
        let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        self.consume(PACK_HEADER_SIZE);
        Ok(count)
    }

    fn read_one_object(&mut self) -> Result<(), PackError> {
        let offset = self.offset();
        self.begin_crc();
        let head = self.read_entry_head(offset)?;

        match head {
            EntryHead::Whole { kind, size } => {
                let data = self
                    .inflate_entry(size, true, offset)?
                    .expect("retained payload");
                let crc32 = self.take_crc();

                let oid = Hasher::hash_object(kind.as_bytes(), &data)?;
                self.check_collision(&oid, kind, &data)?;

                let info = PackedObjectInfo {
                    oid,
                    offset,
                    crc32,
                    kind,
                    size,
                };
                self.whole_objects.push(info);
                self.entries.push(info);
            }
            EntryHead::Ofs { base_offset, size } => {
                if base_offset < PACK_HEADER_SIZE as u64 {
                    return Err(PackError::InvalidDelta {
                        offset,
                        reason: "ofs base inside pack header".into(),
                    });
                }
                self.inflate_entry(size, false, offset)?;
                let crc32 = self.take_crc();
                self.chains.park_ofs(base_offset, offset, crc32);
            }
            EntryHead::Ref { base_id, size } => {
                self.inflate_entry(size, false, offset)?;
                let crc32 = self.take_crc();
                self.chains.park_ref(base_id, offset, crc32);
            }
        }
        Ok(())
    }

    fn read_pack_footer(&mut self) -> Result<(), PackError> {
        // Everything consumed so far is exactly the hashed span.
        self.sync()?;
        let computed = self.pack_hasher.clone().finalize()?;

        self.fill(OID_RAW_LEN)?;
        let stored = ObjectId::from_bytes(&self.buf[self.b_pos..self.b_pos + OID_RAW_LEN])
            .map_err(PackError::Hash)?;
        self.consume(OID_RAW_LEN);
        self.sync()?;

        if computed != stored {
            return Err(PackError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }
        self.stored_footer = stored;
        self.original_len = self.spooled;
        Ok(())
    }

    // --- pass two ---

    fn resolve_children_of(
        &mut self,
        base: &PackedObjectInfo,
        progress: &mut Progress,
    ) -> Result<(), PackError> {
        let children = self.chains.take_children(base.offset, &base.oid);
        if children.is_empty() {
            return Ok(());
        }
        let base_data = self.reload_whole_object(base)?;
        self.resolve_children(base.kind, &base_data, children, 0, progress)
    }

    fn resolve_children(
        &mut self,
        kind: ObjectType,
        base_data: &[u8],
        children: Vec<DeltaNode>,
        depth: usize,
        progress: &mut Progress,
    ) -> Result<(), PackError> {
        if depth >= MAX_DELTA_CHAIN_DEPTH {
            return Err(PackError::DeltaChainTooDeep {
                offset: children.first().map(|c| c.offset).unwrap_or(0),
                max_depth: MAX_DELTA_CHAIN_DEPTH,
            });
        }

        for child in children {
            self.check_cancel()?;
            let (info, data) = self.resolve_one(&child, kind, base_data)?;
            progress.tick();

            let grandchildren = self.chains.take_children(info.offset, &info.oid);
            if !grandchildren.is_empty() {
                self.resolve_children(kind, &data, grandchildren, depth + 1, progress)?;
            }
        }
        Ok(())
    }

    /// Re-read one parked delta from the spooled file, verify its CRC, and
    /// apply it to `base_data`.
    fn resolve_one(
        &mut self,
        node: &DeltaNode,
        kind: ObjectType,
        base_data: &[u8],
    ) -> Result<(PackedObjectInfo, Vec<u8>), PackError> {
        self.seek_file(node.offset);
        self.begin_crc();
        let head = self.read_entry_head(node.offset)?;
        let size = match head {
            EntryHead::Ofs { size, .. } | EntryHead::Ref { size, .. } => size,
            EntryHead::Whole { .. } => {
                return Err(PackError::InvalidFormat(format!(
                    "entry at offset {} changed kind between passes",
                    node.offset
                )));
            }
        };

        let delta = self
            .inflate_entry(size, true, node.offset)?
            .expect("retained payload");
        let actual_crc = self.take_crc();
        if actual_crc != node.crc32 {
            return Err(PackError::CrcMismatch {
                offset: node.offset,
                recorded: node.crc32,
                actual: actual_crc,
            });
        }

        let data = crate::delta::apply_delta(base_data, &delta)?;
        let oid = Hasher::hash_object(kind.as_bytes(), &data)?;
        self.check_collision(&oid, kind, &data)?;

        let info = PackedObjectInfo {
            oid,
            offset: node.offset,
            crc32: node.crc32,
            kind,
            size: data.len() as u64,
        };
        self.entries.push(info);
        Ok((info, data))
    }

    /// Load a pass-one whole object's content back from the spooled file.
    fn reload_whole_object(&mut self, info: &PackedObjectInfo) -> Result<Vec<u8>, PackError> {
        self.seek_file(info.offset);
        let head = self.read_entry_head(info.offset)?;
        match head {
            EntryHead::Whole { size, .. } => Ok(self
                .inflate_entry(size, true, info.offset)?
                .expect("retained payload")),
            _ => Err(PackError::InvalidFormat(format!(
                "entry at offset {} changed kind between passes",
                info.offset
            ))),
        }
    }

    // --- thin-pack completion ---

    /// Append locally-present ref-delta bases as whole objects, resolving
    /// their chains as they land. Returns how many bases were appended.
    fn complete_thin_pack(&mut self, progress: &mut Progress) -> Result<u32, PackError> {
        // New entries land where the footer used to be; the footer is
        // rewritten afterwards.
        let mut append_pos = self.original_len - OID_RAW_LEN as u64;
        let mut appended = 0u32;

        let pending = self.chains.unresolved_ref_bases();
        for base_id in pending {
            self.check_cancel()?;
            if !self.chains.by_id.contains_key(&base_id) {
                // Resolved transitively by an earlier append.
                continue;
            }

            let fetched = {
                let mut cursor = self.store.reader_handle();
                cursor.read(&base_id)?
            };
            let Some((kind, data)) = fetched else {
                return Err(PackError::MissingBase(base_id));
            };

            let offset = append_pos;
            let mut entry_bytes =
                encode_entry_header(crate::PackEntryType::number_for(kind), data.len() as u64);
            entry_bytes.extend_from_slice(&deflate(&data)?);

            let mut crc = crc32fast::Hasher::new();
            crc.update(&entry_bytes);
            let crc32 = crc.finalize();

            let file = self.spool_file()?;
            file.seek(SeekFrom::Start(append_pos))?;
            file.write_all(&entry_bytes)?;
            append_pos += entry_bytes.len() as u64;

            let info = PackedObjectInfo {
                oid: base_id,
                offset,
                crc32,
                kind,
                size: data.len() as u64,
            };
            self.entries.push(info);
            appended += 1;

            let children = self.chains.take_children(offset, &base_id);
            if !children.is_empty() {
                self.resolve_children(kind, &data, children, 0, progress)?;
            }
        }

        // Drop any stale old-footer bytes beyond the appended region.
        let file = self.spool_file()?;
        file.set_len(append_pos)?;
        Ok(appended)
    }

    /// Patch the object count and rewrite the footer after appends.
    ///
    /// The file is re-read once: one digest re-checks the original content
    /// against the received footer, the other (over the patched header and
    /// appended tail) becomes the new footer.
    fn fix_header_footer(&mut self) -> Result<ObjectId, PackError> {
        let new_count = self.entries.len() as u32;
        let orig_content_len = self.original_len - OID_RAW_LEN as u64;
        let file = self.spool.file_mut().ok_or_else(|| {
            PackError::Io(std::io::Error::other("spool file already closed"))
        })?;

        let mut orig_digest = Hasher::new();
        let mut new_digest = Hasher::new();

        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; PACK_HEADER_SIZE];
        file.read_exact(&mut header)?;
        orig_digest.update(&header);
        header[8..12].copy_from_slice(&new_count.to_be_bytes());
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        new_digest.update(&header);

        file.seek(SeekFrom::Start(PACK_HEADER_SIZE as u64))?;
        let mut remaining_orig = orig_content_len - PACK_HEADER_SIZE as u64;
        let mut chunk = [0u8; BUFFER_SIZE];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            let orig_take = (n as u64).min(remaining_orig) as usize;
            orig_digest.update(&chunk[..orig_take]);
            remaining_orig -= orig_take as u64;
            new_digest.update(&chunk[..n]);
        }

        let orig_hash = orig_digest.finalize()?;
        if orig_hash != self.stored_footer {
            return Err(PackError::ChecksumMismatch {
                expected: self.stored_footer,
                actual: orig_hash,
            });
        }

        let new_footer = new_digest.finalize()?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(new_footer.as_bytes())?;
        Ok(new_footer)
    }

    // --- commit ---

    fn install(
        mut self,
        pack_checksum: ObjectId,
        bases_appended: u32,
    ) -> Result<IndexOutcome, PackError> {
        self.entries.sort_by(|a, b| a.oid.cmp(&b.oid));
        if let Some(dup) = self.entries.windows(2).find(|w| w[0].oid == w[1].oid) {
            return Err(PackError::InvalidFormat(format!(
                "duplicate object {} in pack",
                dup[0].oid
            )));
        }

        let sorted_oids: Vec<ObjectId> = self.entries.iter().map(|e| e.oid).collect();
        let fingerprint = pack_fingerprint(&sorted_oids)?;

        let index_bytes = crate::index::write_index_v2(&self.entries, &pack_checksum)?;
        let mut index_temp = TempFile::with_prefix_in("tmp_idx_", &self.pack_dir)
            .map_err(|e| PackError::Io(std::io::Error::other(e.to_string())))?;
        index_temp.write_all(&index_bytes)?;

        let pack_path = self.pack_dir.join(format!("pack-{fingerprint}.pack"));
        let index_path = self.pack_dir.join(format!("pack-{fingerprint}.idx"));

        let object_count = self.entries.len() as u32;
        let outcome = IndexOutcome {
            object_count,
            pack_checksum,
            fingerprint: Some(fingerprint),
            pack_path: Some(pack_path.clone()),
            index_path: Some(index_path.clone()),
            bases_appended,
        };

        // A pack that already exists under its final name wins; the new copy
        // is discarded and the run still counts as success.
        if pack_path.exists() {
            return Ok(outcome);
        }

        for temp in [&mut self.spool, &mut index_temp] {
            temp.sync_all()
                .map_err(|e| PackError::Io(std::io::Error::other(e.to_string())))?;
            temp.set_readonly()
                .map_err(|e| PackError::Io(std::io::Error::other(e.to_string())))?;
        }

        self.spool
            .persist(&pack_path)
            .map_err(|e| PackError::Io(std::io::Error::other(e.to_string())))?;
        if let Err(e) = index_temp.persist(&index_path) {
            // Roll back the half-installed pack.
            let _ = std::fs::remove_file(&pack_path);
            return Err(PackError::Io(std::io::Error::other(e.to_string())));
        }

        Ok(outcome)
    }

    // --- buffer plumbing ---

    /// Offset of the next unconsumed byte.
    fn offset(&self) -> u64 {
        match self.src {
            Source::Input => self.spooled + self.b_pos as u64,
            Source::File => self.file_next - (self.b_avail - self.b_pos) as u64,
        }
    }

    /// Ensure at least `need` unconsumed bytes are buffered.
    fn fill(&mut self, need: usize) -> Result<(), PackError> {
        debug_assert!(need <= BUFFER_SIZE);
        if self.b_avail - self.b_pos >= need {
            return Ok(());
        }
        match self.src {
            Source::Input => {
                self.sync()?;
                while self.b_avail - self.b_pos < need {
                    let n = self.input.read(&mut self.buf[self.b_avail..])?;
                    if n == 0 {
                        return Err(PackError::TruncatedInput(format!(
                            "at offset {}",
                            self.offset()
                        )));
                    }
                    self.b_avail += n;
                }
            }
            Source::File => {
                if self.b_pos > 0 {
                    self.buf.copy_within(self.b_pos..self.b_avail, 0);
                    self.b_avail -= self.b_pos;
                    self.b_pos = 0;
                }
                let file_next = self.file_next;
                self.spool_file()?.seek(SeekFrom::Start(file_next))?;
                while self.b_avail < need {
                    let n = self
                        .spool
                        .file_mut()
                        .ok_or_else(|| {
                            PackError::Io(std::io::Error::other("spool file already closed"))
                        })?
                        .read(&mut self.buf[self.b_avail..])?;
                    if n == 0 {
                        return Err(PackError::TruncatedInput(format!(
                            "at offset {} of spooled pack",
                            self.offset()
                        )));
                    }
                    self.b_avail += n;
                    self.file_next += n as u64;
                }
            }
        }
        Ok(())
    }

    /// Mark `n` buffered bytes consumed, feeding the active CRC.
    fn consume(&mut self, n: usize) {
        if let Some(crc) = &mut self.crc {
            crc.update(&self.buf[self.b_pos..self.b_pos + n]);
        }
        self.b_pos += n;
    }

    /// INPUT mode: flush the consumed prefix to the pack hasher and spool,
    /// then compact the buffer. Every input byte passes through here exactly
    /// once.
    fn sync(&mut self) -> Result<(), PackError> {
        debug_assert!(matches!(self.src, Source::Input));
        if self.b_pos == 0 {
            return Ok(());
        }
        self.pack_hasher.update(&self.buf[..self.b_pos]);
        self.spool.write_all(&self.buf[..self.b_pos])?;
        self.spooled += self.b_pos as u64;
        self.buf.copy_within(self.b_pos..self.b_avail, 0);
        self.b_avail -= self.b_pos;
        self.b_pos = 0;
        Ok(())
    }

    fn seek_file(&mut self, offset: u64) {
        debug_assert!(matches!(self.src, Source::File));
        self.b_pos = 0;
        self.b_avail = 0;
        self.file_next = offset;
    }

    fn read_byte(&mut self) -> Result<u8, PackError> {
        self.fill(1)?;
        let b = self.buf[self.b_pos];
        self.consume(1);
        Ok(b)
    }

    fn begin_crc(&mut self) {
        self.crc = Some(crc32fast::Hasher::new());
    }

    fn take_crc(&mut self) -> u32 {
        self.crc.take().map(|h| h.finalize()).unwrap_or(0)
    }

    fn spool_file(&mut self) -> Result<&mut std::fs::File, PackError> {
        self.spool
            .file_mut()
            .ok_or_else(|| PackError::Io(std::io::Error::other("spool file already closed")))
    }

    fn check_cancel(&self) -> Result<(), PackError> {
        if self.cancel.is_cancelled() {
            return Err(PackError::Cancelled);
        }
        Ok(())
    }

    fn check_collision(
        &self,
        oid: &ObjectId,
        kind: ObjectType,
        data: &[u8],
    ) -> Result<(), PackError> {
        match self.store.check_collision(oid, kind, data) {
            Ok(()) => Ok(()),
            Err(StoreError::Collision(oid)) => Err(PackError::ObjectCollision(oid)),
            Err(other) => Err(PackError::Store(other)),
        }
    }

    // --- entry parsing over the buffer ---

    fn read_entry_head(&mut self, entry_offset: u64) -> Result<EntryHead, PackError> {
        let c = self.read_byte()?;
        let type_code = (c >> 4) & 0x07;
        let mut size = (c & 0x0f) as u64;
        let mut shift = 4u32;
        let mut byte = c;
        while byte & 0x80 != 0 {
            byte = self.read_byte()?;
            let group = (byte & 0x7f) as u64;
            if shift >= 64 || (shift > 57 && group >> (64 - shift) != 0) {
                return Err(PackError::InvalidFormat(format!(
                    "entry size too wide at offset {entry_offset}"
                )));
            }
            size |= group << shift;
            shift += 7;
        }

        match type_code {
            1 => Ok(EntryHead::Whole {
                kind: ObjectType::Commit,
                size,
            }),
            2 => Ok(EntryHead::Whole {
                kind: ObjectType::Tree,
                size,
            }),
            3 => Ok(EntryHead::Whole {
                kind: ObjectType::Blob,
                size,
            }),
            4 => Ok(EntryHead::Whole {
                kind: ObjectType::Tag,
                size,
            }),
            6 => {
                let mut c = self.read_byte()?;
                let mut distance = (c & 0x7f) as u64;
                while c & 0x80 != 0 {
                    if distance > (u64::MAX >> 7) - 1 {
                        return Err(PackError::InvalidDelta {
                            offset: entry_offset,
                            reason: "ofs distance overflow".into(),
                        });
                    }
                    distance += 1;
                    c = self.read_byte()?;
                    distance = (distance << 7) + (c & 0x7f) as u64;
                }
                if distance > entry_offset {
                    return Err(PackError::InvalidDelta {
                        offset: entry_offset,
                        reason: "ofs base points before pack start".into(),
                    });
                }
                Ok(EntryHead::Ofs {
                    base_offset: entry_offset - distance,
                    size,
                })
            }
            7 => {
                self.fill(OID_RAW_LEN)?;
                let base_id =
                    ObjectId::from_bytes(&self.buf[self.b_pos..self.b_pos + OID_RAW_LEN])
                        .map_err(PackError::Hash)?;
                self.consume(OID_RAW_LEN);
                Ok(EntryHead::Ref { base_id, size })
            }
            other => Err(PackError::InvalidFormat(format!(
                "unknown object type code {other} at offset {entry_offset}"
            ))),
        }
    }

    /// Inflate one zlib stream at the buffer cursor. Returns the payload
    /// when `retain` is set; otherwise output is counted and dropped.
    fn inflate_entry(
        &mut self,
        expected_size: u64,
        retain: bool,
        entry_offset: u64,
    ) -> Result<Option<Vec<u8>>, PackError> {
        let pool = self.inflaters;
        let mut z = pool.lease();
        let mut out: Vec<u8> = if retain {
            Vec::with_capacity(expected_size.min(1 << 20) as usize)
        } else {
            Vec::new()
        };
        let mut scratch = [0u8; BUFFER_SIZE];

        loop {
            if self.b_avail == self.b_pos {
                self.fill(1)?;
            }
            let input = &self.buf[self.b_pos..self.b_avail];
            let before_in = z.total_in();
            let before_out = z.total_out();
            let status = z
                .decompress(input, &mut scratch, FlushDecompress::None)
                .map_err(|e| PackError::InvalidDelta {
                    offset: entry_offset,
                    reason: format!("zlib error: {e}"),
                })?;
            let consumed = (z.total_in() - before_in) as usize;
            let produced = (z.total_out() - before_out) as usize;
            self.consume(consumed);
            if retain {
                out.extend_from_slice(&scratch[..produced]);
            }

            if z.total_out() > expected_size {
                return Err(PackError::InvalidDelta {
                    offset: entry_offset,
                    reason: format!(
                        "wrong decompressed length: declared {expected_size}, got more"
                    ),
                });
            }

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    // No progress with buffered input still available means
                    // the stream can never finish. An empty buffer refills
                    // (or reports EOF) at the top of the loop.
                    if consumed == 0 && produced == 0 && self.b_avail != self.b_pos {
                        return Err(PackError::InvalidDelta {
                            offset: entry_offset,
                            reason: "zlib stream stalled".into(),
                        });
                    }
                }
            }
        }

        if z.total_out() != expected_size {
            return Err(PackError::InvalidDelta {
                offset: entry_offset,
                reason: format!(
                    "wrong decompressed length: declared {expected_size}, got {}",
                    z.total_out()
                ),
            });
        }

        Ok(if retain { Some(out) } else { None })
    }
}
