//! Bitmap index consumption for fast reachability.
//!
//! Bitmap files store pre-computed reachability bitmaps for selected
//! commits; bit N covers the object at index position N of the pack. The
//! walker uses them as an exact shortcut when one is present. This module
//! only reads the format, it never writes one.
//!
//! File layout:
//! ```text
//! Header: "BITM" (4) | version (2) | flags (2) | num_entries (4) | pack checksum (20)
//! Commit entries: [commit_pos (4) | xor_offset (1) | flags (1) | 4 × EWAH bitmap]*
//! ```

use std::path::{Path, PathBuf};

use gitd_hash::OID_RAW_LEN;
use memmap2::Mmap;

use crate::PackError;

/// Bitmap index header signature.
const BITMAP_SIGNATURE: &[u8; 4] = b"BITM";

/// A read-only bitmap index.
pub struct BitmapIndex {
    data: Mmap,
    num_entries: u32,
    /// Offset where bitmap entries start.
    entries_offset: usize,
    bitmap_path: PathBuf,
    /// Pack index positions of commits that carry bitmaps.
    commit_positions: Vec<u32>,
}

impl BitmapIndex {
    /// Open a `.bitmap` file alongside a pack.
    pub fn open(bitmap_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let bitmap_path = bitmap_path.as_ref().to_path_buf();
        let file = std::fs::File::open(&bitmap_path)?;
        let data = unsafe { Mmap::map(&file)? };

        let min_size = 4 + 2 + 2 + 4 + OID_RAW_LEN;
        if data.len() < min_size {
            return Err(PackError::InvalidIndex("bitmap file too small".into()));
        }
        if &data[0..4] != BITMAP_SIGNATURE {
            return Err(PackError::InvalidIndex("bad bitmap signature".into()));
        }

        let version = u16::from_be_bytes([data[4], data[5]]);
        if version != 1 {
            return Err(PackError::InvalidIndex(format!(
                "unsupported bitmap version {version}"
            )));
        }

        let _flags = u16::from_be_bytes([data[6], data[7]]);
        let num_entries = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let entries_offset = 12 + OID_RAW_LEN;

        // Pre-scan entry positions so lookups don't rewalk the file.
        let mut commit_positions = Vec::with_capacity(num_entries as usize);
        let mut pos = entries_offset;
        for _ in 0..num_entries {
            if pos + 6 > data.len() {
                return Err(PackError::InvalidIndex("truncated bitmap entry".into()));
            }
            commit_positions.push(u32::from_be_bytes([
                data[pos],
                data[pos + 1],
                data[pos + 2],
                data[pos + 3],
            ]));
            pos += 6; // commit_pos + xor_offset + flags

            // commits, trees, blobs, tags
            for _ in 0..4 {
                pos = skip_ewah_bitmap(&data, pos)?;
            }
        }

        Ok(Self {
            data,
            num_entries,
            entries_offset,
            bitmap_path,
            commit_positions,
        })
    }

    /// Does a bitmap exist for the commit at this pack index position?
    pub fn has_bitmap_for_position(&self, index_position: u32) -> bool {
        self.commit_positions.contains(&index_position)
    }

    /// Number of commit entries carrying bitmaps.
    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    /// Path to the bitmap file.
    pub fn path(&self) -> &Path {
        &self.bitmap_path
    }

    /// Pack index positions reachable from the commit at `index_position`,
    /// or `None` if that commit has no bitmap.
    pub fn reachable_positions(&self, index_position: u32) -> Result<Option<Vec<u32>>, PackError> {
        let entry_idx = match self
            .commit_positions
            .iter()
            .position(|&p| p == index_position)
        {
            Some(idx) => idx,
            None => return Ok(None),
        };

        let mut pos = self.entries_offset;
        for _ in 0..entry_idx {
            pos += 6;
            for _ in 0..4 {
                pos = skip_ewah_bitmap(&self.data, pos)?;
            }
        }
        pos += 6;

        let mut result = Vec::new();
        for _ in 0..4 {
            let (bits, new_pos) = decode_ewah_bitmap(&self.data, pos)?;
            result.extend(bits);
            pos = new_pos;
        }

        result.sort_unstable();
        result.dedup();
        Ok(Some(result))
    }
}

/// Skip an EWAH bitmap, returning the position after it.
fn skip_ewah_bitmap(data: &[u8], pos: usize) -> Result<usize, PackError> {
    if pos + 8 > data.len() {
        return Err(PackError::InvalidIndex("truncated EWAH header".into()));
    }
    let word_count = u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
        as usize;
    Ok(pos + 8 + word_count * 8)
}

/// Decode an EWAH compressed bitmap into set bit positions.
///
/// Run-length word layout: bit 0 = fill bit, bits 1-32 = fill run length in
/// words, bits 33-63 = following literal word count.
fn decode_ewah_bitmap(data: &[u8], pos: usize) -> Result<(Vec<u32>, usize), PackError> {
    if pos + 8 > data.len() {
        return Err(PackError::InvalidIndex("truncated EWAH header".into()));
    }

    let bit_count = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
    let word_count = u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
        as usize;

    let mut bits = Vec::new();
    let mut bit_pos: u32 = 0;
    let mut wpos = pos + 8;
    let mut words_remaining = word_count;

    while words_remaining > 0 {
        if wpos + 8 > data.len() {
            return Err(PackError::InvalidIndex("truncated EWAH data".into()));
        }
        let mut rlw_bytes = [0u8; 8];
        rlw_bytes.copy_from_slice(&data[wpos..wpos + 8]);
        let rlw = u64::from_be_bytes(rlw_bytes);
        wpos += 8;
        words_remaining -= 1;

        let fill_bit = (rlw & 1) != 0;
        let run_length = ((rlw >> 1) & 0xFFFF_FFFF) as u32;
        let literal_count = (rlw >> 33) as u32;

        if fill_bit {
            for _ in 0..run_length * 64 {
                if bit_pos < bit_count {
                    bits.push(bit_pos);
                }
                bit_pos += 1;
            }
        } else {
            bit_pos += run_length * 64;
        }

        for _ in 0..literal_count {
            if wpos + 8 > data.len() || words_remaining == 0 {
                return Err(PackError::InvalidIndex("truncated EWAH literal".into()));
            }
            let mut word_bytes = [0u8; 8];
            word_bytes.copy_from_slice(&data[wpos..wpos + 8]);
            let word = u64::from_be_bytes(word_bytes);
            wpos += 8;
            words_remaining -= 1;

            for bit in 0..64 {
                if word & (1u64 << bit) != 0 && bit_pos < bit_count {
                    bits.push(bit_pos);
                }
                bit_pos += 1;
            }
        }
    }

    Ok((bits, wpos))
}
