//! Bitmap-accelerated reachability against synthetic pack metadata.

use gitd_hash::ObjectId;
use gitd_object::ObjectType;
use gitd_pack::bitmap::BitmapIndex;
use gitd_pack::index::{write_index_v2, PackIndex};
use gitd_pack::PackedObjectInfo;
use gitd_walk::bitmap_reachable;

fn oid(n: u8) -> ObjectId {
    let mut bytes = [0u8; 20];
    bytes[0] = n; // spread across fanout buckets
    bytes[19] = n;
    ObjectId::from(bytes)
}

/// Index entries for ids 1..=4 at offsets 100, 200, 300, 400.
fn build_index(dir: &std::path::Path) -> PackIndex {
    let mut entries: Vec<PackedObjectInfo> = (1u8..=4)
        .map(|n| PackedObjectInfo {
            oid: oid(n),
            offset: n as u64 * 100,
            crc32: 0,
            kind: ObjectType::Blob,
            size: 0,
        })
        .collect();
    entries.sort_by(|a, b| a.oid.cmp(&b.oid));
    let bytes = write_index_v2(&entries, &ObjectId::NULL).unwrap();
    let path = dir.join("pack-test.idx");
    std::fs::write(&path, bytes).unwrap();
    PackIndex::open(&path).unwrap()
}

/// A bitmap file whose single entry covers the commit at index position
/// `commit_pos` with one literal word of reachable positions.
fn build_bitmap(dir: &std::path::Path, commit_pos: u32, word: u64) -> BitmapIndex {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"BITM");
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.extend_from_slice(&[0u8; 20]);

    buf.extend_from_slice(&commit_pos.to_be_bytes());
    buf.push(0); // xor_offset
    buf.push(0); // flags

    // One literal-word EWAH bitmap for commits, then three empty ones.
    buf.extend_from_slice(&64u32.to_be_bytes());
    buf.extend_from_slice(&2u32.to_be_bytes());
    buf.extend_from_slice(&(1u64 << 33).to_be_bytes());
    buf.extend_from_slice(&word.to_be_bytes());
    for _ in 0..3 {
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&0u64.to_be_bytes());
    }

    let path = dir.join("pack-test.bitmap");
    std::fs::write(&path, buf).unwrap();
    BitmapIndex::open(&path).unwrap()
}

#[test]
fn bitmap_answers_exact_reachability() {
    let dir = tempfile::tempdir().unwrap();
    let index = build_index(dir.path());

    // The commit sits at some name-order position; find it and flag the
    // first three positions reachable.
    let commit = oid(2);
    let commit_offset = index.lookup(&commit).unwrap();
    let commit_pos = (0..index.num_objects())
        .find(|&i| index.offset_at_index(i) == commit_offset)
        .unwrap();
    let bitmap = build_bitmap(dir.path(), commit_pos, 0b0111);

    let reachable = bitmap_reachable(&bitmap, &index, &commit)
        .unwrap()
        .expect("bitmap present for commit");
    assert_eq!(reachable.len(), 3);
    for i in 0..3 {
        assert!(reachable.contains(&index.oid_at_index(i)));
    }
    assert!(!reachable.contains(&index.oid_at_index(3)));
}

#[test]
fn missing_bitmap_falls_back_to_none() {
    let dir = tempfile::tempdir().unwrap();
    let index = build_index(dir.path());
    let bitmap = build_bitmap(dir.path(), 0, 0b1);

    // A commit with no bitmap entry yields None (graph walk fallback).
    let other = oid(3);
    let other_offset = index.lookup(&other).unwrap();
    let other_pos = (0..index.num_objects())
        .find(|&i| index.offset_at_index(i) == other_offset)
        .unwrap();
    if other_pos != 0 {
        assert!(bitmap_reachable(&bitmap, &index, &other).unwrap().is_none());
    }

    // An id absent from the index also yields None.
    let ghost = oid(9);
    assert!(bitmap_reachable(&bitmap, &index, &ghost).unwrap().is_none());
}
