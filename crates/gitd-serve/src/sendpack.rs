//! Object selection and pack emission for SEND_PACK.
//!
//! Selection walks the commit graph from the wants with the common base
//! marked uninteresting, then enumerates trees and blobs in canonical order
//! (commits by time, then trees in name order, then blobs). Emission streams
//! the pack through [`PackStreamWriter`], reusing installed on-disk
//! representations where one exists and recompressing otherwise.

use std::collections::HashSet;
use std::io::Write;

use gitd_hash::ObjectId;
use gitd_object::{ObjectType, Tree};
use gitd_pack::pack::PackFile;
use gitd_pack::writer::{PackStreamWriter, WriteOutcome};
use gitd_store::{ObjectStore, RefRecord, Repository};
use gitd_walk::{Parsed, RevWalk, WalkError};

use crate::request::BlobFilter;
use crate::ServeError;

/// One object chosen for the pack, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedObject {
    pub oid: ObjectId,
    pub kind: ObjectType,
}

/// Selection inputs beyond wants and common.
#[derive(Debug, Default)]
pub struct PlanOptions {
    pub filter: Option<BlobFilter>,
    pub include_tag: bool,
    /// Commits whose parents must not be walked (the shallow cut).
    pub shallow_cut: HashSet<ObjectId>,
}

/// Choose the objects a fetch response must carry.
pub fn plan_pack<R: Repository>(
    store: &ObjectStore<R>,
    wants: &[ObjectId],
    common: &[ObjectId],
    refs: &[RefRecord],
    options: &PlanOptions,
) -> Result<Vec<PlannedObject>, ServeError> {
    let mut walk = RevWalk::new(store);
    walk.set_parent_cut(options.shallow_cut.clone());

    // Wants that peel to non-commits (tag/tree/blob ids let through by the
    // policy) are included directly.
    let mut direct: Vec<PlannedObject> = Vec::new();
    let mut direct_seen: HashSet<ObjectId> = HashSet::new();
    for want in wants {
        let mut current = *want;
        loop {
            match walk.parse_any(&current)? {
                Parsed::Commit(_) => {
                    walk.mark_start(&current)?;
                    break;
                }
                Parsed::Tag { target, .. } => {
                    if direct_seen.insert(current) {
                        direct.push(PlannedObject {
                            oid: current,
                            kind: ObjectType::Tag,
                        });
                    }
                    current = target;
                }
                Parsed::Tree => {
                    if direct_seen.insert(current) {
                        direct.push(PlannedObject {
                            oid: current,
                            kind: ObjectType::Tree,
                        });
                    }
                    break;
                }
                Parsed::Blob => {
                    if direct_seen.insert(current) {
                        direct.push(PlannedObject {
                            oid: current,
                            kind: ObjectType::Blob,
                        });
                    }
                    break;
                }
            }
        }
    }

    for base in common {
        match walk.peel(base) {
            Ok((ObjectType::Commit, peeled)) => walk.mark_uninteresting(&peeled)?,
            // Peer claims we do not need to honor: skip silently.
            Ok(_) | Err(WalkError::MissingObject(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let commits = walk.drain()?;

    // Objects on the common side: the edge commits' trees, transitively.
    // Anything in there is already at the peer.
    let mut excluded: HashSet<ObjectId> = HashSet::new();
    for base in common {
        if let Ok((ObjectType::Commit, peeled)) = walk.peel(base) {
            if let Ok(meta) = walk.parse_commit(&peeled) {
                collect_tree(store, &meta.tree, &mut excluded)?;
            }
        }
    }

    // Enumerate trees and blobs of the selected commits, canonical order.
    let mut trees: Vec<ObjectId> = Vec::new();
    let mut blobs: Vec<ObjectId> = Vec::new();
    let mut seen: HashSet<ObjectId> = HashSet::new();
    for (commit, _) in &commits {
        let meta = walk.parse_commit(commit)?;
        enumerate_tree(store, &meta.tree, &excluded, &mut seen, &mut trees, &mut blobs)?;
    }

    // Blob filters drop payloads, never commits or trees.
    if let Some(filter) = options.filter {
        let mut admitted = Vec::with_capacity(blobs.len());
        for blob in blobs {
            let size = match store.open(&blob)? {
                Some(reader) => reader.size,
                None => return Err(WalkError::MissingObject(blob).into()),
            };
            if filter.admits(size) {
                admitted.push(blob);
            }
        }
        blobs = admitted;
    }

    let mut plan: Vec<PlannedObject> = Vec::new();
    let mut packed: HashSet<ObjectId> = HashSet::new();
    for (oid, _) in &commits {
        plan.push(PlannedObject {
            oid: *oid,
            kind: ObjectType::Commit,
        });
        packed.insert(*oid);
    }
    for oid in trees {
        plan.push(PlannedObject {
            oid,
            kind: ObjectType::Tree,
        });
        packed.insert(oid);
    }
    for oid in blobs {
        plan.push(PlannedObject {
            oid,
            kind: ObjectType::Blob,
        });
        packed.insert(oid);
    }
    for obj in direct {
        if packed.insert(obj.oid) {
            plan.push(obj);
        }
    }

    // include-tag: a ref tag whose peeled target made it into the pack
    // rides along.
    if options.include_tag {
        for record in refs {
            if packed.contains(&record.target) {
                continue;
            }
            let peeled = match record.peeled {
                Some(peeled) => peeled,
                None => match walk.parse_any(&record.target) {
                    Ok(Parsed::Tag { .. }) => walk.peel(&record.target)?.1,
                    _ => continue,
                },
            };
            if !packed.contains(&peeled) {
                continue;
            }
            if let Ok(Parsed::Tag { .. }) = walk.parse_any(&record.target) {
                if packed.insert(record.target) {
                    plan.push(PlannedObject {
                        oid: record.target,
                        kind: ObjectType::Tag,
                    });
                }
            }
        }
    }

    Ok(plan)
}

/// Collect a tree and everything beneath it into `set`.
fn collect_tree<R: Repository>(
    store: &ObjectStore<R>,
    tree_oid: &ObjectId,
    set: &mut HashSet<ObjectId>,
) -> Result<(), ServeError> {
    if !set.insert(*tree_oid) {
        return Ok(());
    }
    let Some(reader) = store.open(tree_oid)? else {
        return Ok(());
    };
    if reader.kind != ObjectType::Tree {
        return Ok(());
    }
    let tree = Tree::parse(&reader.read_to_vec()?)?;
    for entry in tree.entries {
        if entry.mode.is_tree() {
            collect_tree(store, &entry.oid, set)?;
        } else if !entry.mode.is_gitlink() {
            set.insert(entry.oid);
        }
    }
    Ok(())
}

/// Walk a commit's tree, appending unvisited trees and blobs in discovery
/// order. Tree entries are already in git name order.
fn enumerate_tree<R: Repository>(
    store: &ObjectStore<R>,
    tree_oid: &ObjectId,
    excluded: &HashSet<ObjectId>,
    seen: &mut HashSet<ObjectId>,
    trees: &mut Vec<ObjectId>,
    blobs: &mut Vec<ObjectId>,
) -> Result<(), ServeError> {
    if excluded.contains(tree_oid) || !seen.insert(*tree_oid) {
        return Ok(());
    }
    let Some(reader) = store.open(tree_oid)? else {
        return Err(WalkError::MissingObject(*tree_oid).into());
    };
    let tree = Tree::parse(&reader.read_to_vec()?)?;
    trees.push(*tree_oid);

    for entry in tree.entries {
        if entry.mode.is_tree() {
            enumerate_tree(store, &entry.oid, excluded, seen, trees, blobs)?;
        } else if entry.mode.is_gitlink() {
            // Commits in other repositories never enter the pack.
        } else if !excluded.contains(&entry.oid) && seen.insert(entry.oid) {
            blobs.push(entry.oid);
        }
    }
    Ok(())
}

/// Open every installed pack under `objects_dir/pack` for raw-entry reuse.
/// Unopenable packs are skipped; reuse is an optimization, not a must.
pub fn discover_reuse_packs<R: Repository>(store: &ObjectStore<R>) -> Vec<PackFile> {
    let pack_dir = store.objects_dir().join("pack");
    let Ok(entries) = std::fs::read_dir(&pack_dir) else {
        return Vec::new();
    };
    let mut packs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "pack").unwrap_or(false) {
            if let Ok(pack) = PackFile::open(&path) {
                packs.push(pack);
            }
        }
    }
    packs
}

/// Stream the planned objects as a pack, preferring verbatim reuse.
///
/// `tick` runs once per written object so the caller can surface progress
/// (side-band channel 2 during a fetch).
pub fn write_pack<R: Repository, W: Write>(
    store: &ObjectStore<R>,
    plan: &[PlannedObject],
    reuse: &[PackFile],
    out: W,
    mut tick: impl FnMut(u32),
) -> Result<WriteOutcome, ServeError> {
    let mut writer = PackStreamWriter::new(out, plan.len() as u32)?;

    for (done, obj) in plan.iter().enumerate() {
        if let Some(raw) = find_reusable(reuse, &obj.oid) {
            writer.write_raw_entry(obj.oid, &raw)?;
        } else {
            let Some(reader) = store.open(&obj.oid)? else {
                return Err(WalkError::MissingObject(obj.oid).into());
            };
            if reader.kind != obj.kind {
                return Err(ServeError::Protocol(format!(
                    "object {} is a {}, planned as {}",
                    obj.oid, reader.kind, obj.kind
                )));
            }
            let data = reader.read_to_vec()?;
            writer.write_object(obj.oid, obj.kind, &data)?;
        }
        tick(done as u32 + 1);
    }

    Ok(writer.finish()?)
}

/// A whole (non-delta) stored representation of `oid`, if any installed
/// pack has one.
fn find_reusable(reuse: &[PackFile], oid: &ObjectId) -> Option<Vec<u8>> {
    for pack in reuse {
        if let Some(offset) = pack.index().lookup(oid) {
            if let Ok(raw) = pack.raw_entry(offset) {
                if raw.header.entry_type.to_object_type().is_some() {
                    return Some(raw.bytes.to_vec());
                }
            }
        }
    }
    None
}
