//! Compute deltas between objects.
//!
//! A simplified version of git's diff-delta: index fixed-size blocks of the
//! source, scan the target for matching blocks, extend matches greedily.
//! Matching regions become copy instructions, the rest become inserts.
//! The pack writer uses this when it recompresses instead of reusing an
//! on-disk representation.

use std::collections::HashMap;

use super::{encode_copy, encode_insert, write_varint};

/// Block size for match seeding.
const BLOCK_SIZE: usize = 16;

/// Compute a delta that transforms `source` into `target`.
///
/// The result can be applied with [`apply_delta`](super::apply_delta).
pub fn compute_delta(source: &[u8], target: &[u8]) -> Vec<u8> {
    let mut delta = Vec::new();

    delta.extend_from_slice(&write_varint(source.len() as u64));
    delta.extend_from_slice(&write_varint(target.len() as u64));

    if target.is_empty() {
        return delta;
    }

    let index = build_block_index(source);

    let mut tpos = 0;
    let mut pending_insert: Vec<u8> = Vec::new();

    while tpos < target.len() {
        let remaining = target.len() - tpos;

        if remaining >= BLOCK_SIZE {
            let block = &target[tpos..tpos + BLOCK_SIZE];
            if let Some(&src_offset) = index.get(block) {
                let match_len = extend_match(source, src_offset, target, tpos);

                flush_insert(&mut delta, &mut pending_insert);
                emit_copy(&mut delta, src_offset, match_len);
                tpos += match_len;
                continue;
            }
        }

        pending_insert.push(target[tpos]);
        tpos += 1;

        if pending_insert.len() == 127 {
            flush_insert(&mut delta, &mut pending_insert);
        }
    }

    flush_insert(&mut delta, &mut pending_insert);

    delta
}

fn build_block_index(source: &[u8]) -> HashMap<&[u8], usize> {
    let mut index = HashMap::new();
    if source.len() < BLOCK_SIZE {
        return index;
    }
    for offset in (0..=source.len() - BLOCK_SIZE).step_by(BLOCK_SIZE) {
        let block = &source[offset..offset + BLOCK_SIZE];
        // First occurrence wins
        index.entry(block).or_insert(offset);
    }
    index
}

fn extend_match(source: &[u8], src_off: usize, target: &[u8], tgt_off: usize) -> usize {
    let max_len = std::cmp::min(source.len() - src_off, target.len() - tgt_off);
    let mut len = BLOCK_SIZE;
    while len < max_len && source[src_off + len] == target[tgt_off + len] {
        len += 1;
    }
    len
}

fn flush_insert(delta: &mut Vec<u8>, pending: &mut Vec<u8>) {
    while !pending.is_empty() {
        let chunk_len = std::cmp::min(pending.len(), 127);
        let chunk: Vec<u8> = pending.drain(..chunk_len).collect();
        delta.extend_from_slice(&encode_insert(&chunk));
    }
}

fn emit_copy(delta: &mut Vec<u8>, offset: usize, mut size: usize) {
    let mut off = offset;
    while size > 0 {
        let chunk = std::cmp::min(size, 0x00ff_ffff); // max 24-bit copy size
        delta.extend_from_slice(&encode_copy(off as u64, chunk));
        off += chunk;
        size -= chunk;
    }
}
