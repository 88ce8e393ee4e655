//! Core revision walk.

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap, HashSet};

use gitd_hash::ObjectId;
use gitd_object::{Commit, ObjectType, Tag};
use gitd_store::{ObjectStore, Repository};

use crate::{WalkError, WalkFlag, FIRST_FREE_BIT, LAST_FREE_BIT, QUEUED, SEEN, UNINTERESTING};

/// Parsed commit metadata retained by the walk arena.
#[derive(Debug, Clone)]
pub struct CommitMeta {
    pub parents: Vec<ObjectId>,
    pub tree: ObjectId,
    pub commit_time: i64,
}

/// Outcome of `parse_any`: the object's resolved type, plus commit metadata
/// or a tag target where applicable.
#[derive(Debug, Clone)]
pub enum Parsed {
    Commit(CommitMeta),
    Tag { target: ObjectId, target_type: ObjectType },
    Tree,
    Blob,
}

impl Parsed {
    pub fn kind(&self) -> ObjectType {
        match self {
            Parsed::Commit(_) => ObjectType::Commit,
            Parsed::Tag { .. } => ObjectType::Tag,
            Parsed::Tree => ObjectType::Tree,
            Parsed::Blob => ObjectType::Blob,
        }
    }
}

struct ObjEntry {
    flags: u32,
    parsed: Option<Parsed>,
}

struct QueueEntry {
    oid: ObjectId,
    commit_time: i64,
    insertion_ctr: u64,
}

/// Flag-carrying commit walk, youngest-first by committer time.
pub struct RevWalk<'a, R> {
    store: &'a ObjectStore<R>,
    objects: HashMap<ObjectId, ObjEntry>,
    queue: BinaryHeap<QueueEntry>,
    /// Flags copied from a commit onto its parents as the walk advances.
    carry_mask: u32,
    /// Commits whose parents the walk must not enter (the shallow cut).
    parent_cut: HashSet<ObjectId>,
    next_free_bit: u32,
    insertion_ctr: u64,
}

impl<'a, R: Repository> RevWalk<'a, R> {
    pub fn new(store: &'a ObjectStore<R>) -> Self {
        Self {
            store,
            objects: HashMap::new(),
            queue: BinaryHeap::new(),
            carry_mask: UNINTERESTING,
            parent_cut: HashSet::new(),
            next_free_bit: FIRST_FREE_BIT,
            insertion_ctr: 0,
        }
    }

    /// Install a shallow cut: the walk treats these commits as parentless.
    pub fn set_parent_cut(&mut self, cut: HashSet<ObjectId>) {
        self.parent_cut = cut;
    }

    /// The object store this walk reads from.
    pub fn store(&self) -> &'a ObjectStore<R> {
        self.store
    }

    /// Allocate a walk-private flag bit. Fails once all 32 bits are spoken
    /// for; the cap is part of the contract, not a suggestion.
    pub fn allocate_flag(&mut self) -> Result<WalkFlag, WalkError> {
        if self.next_free_bit >= LAST_FREE_BIT {
            return Err(WalkError::FlagsExhausted);
        }
        let flag = WalkFlag(1 << self.next_free_bit);
        self.next_free_bit += 1;
        Ok(flag)
    }

    /// Register a flag to carry from commits to their parents during the
    /// walk (`PEER_HAS` is the usual customer).
    pub fn carry(&mut self, flag: WalkFlag) {
        self.carry_mask |= flag.0;
    }

    // --- flag arena ---

    pub fn set_flag(&mut self, oid: &ObjectId, flag: WalkFlag) {
        self.entry(oid).flags |= flag.0;
    }

    pub fn clear_flag(&mut self, oid: &ObjectId, flag: WalkFlag) {
        self.entry(oid).flags &= !flag.0;
    }

    pub fn has_flag(&self, oid: &ObjectId, flag: WalkFlag) -> bool {
        self.objects
            .get(oid)
            .map(|e| e.flags & flag.0 != 0)
            .unwrap_or(false)
    }

    /// Set `flag` on a commit and all its ancestors.
    ///
    /// Stops descending where the flag is already present, so repeated
    /// marking stays linear overall.
    pub fn mark_with_ancestors(&mut self, oid: &ObjectId, flag: WalkFlag) -> Result<(), WalkError> {
        let mut stack = vec![*oid];
        while let Some(current) = stack.pop() {
            if self.has_flag(&current, flag) {
                continue;
            }
            self.set_flag(&current, flag);
            if let Ok(Parsed::Commit(meta)) = self.parse_any(&current) {
                for parent in meta.parents {
                    stack.push(parent);
                }
            }
        }
        Ok(())
    }

    /// Drop every flag except `retain` from all walked objects and clear
    /// pending traversal state. Parsed metadata is kept.
    pub fn reset_retain(&mut self, retain: &[WalkFlag]) {
        let mut mask = 0u32;
        for flag in retain {
            mask |= flag.0;
        }
        for entry in self.objects.values_mut() {
            entry.flags &= mask;
        }
        self.queue.clear();
    }

    // --- parsing ---

    /// Look up or lazily parse an object into its typed form.
    pub fn parse_any(&mut self, oid: &ObjectId) -> Result<Parsed, WalkError> {
        if let Some(entry) = self.objects.get(oid) {
            if let Some(parsed) = &entry.parsed {
                return Ok(parsed.clone());
            }
        }

        let Some(reader) = self.store.open(oid)? else {
            return Err(WalkError::MissingObject(*oid));
        };
        let kind = reader.kind;
        let parsed = match kind {
            ObjectType::Commit => {
                let bytes = reader.read_to_vec()?;
                let commit = Commit::parse(&bytes)?;
                Parsed::Commit(CommitMeta {
                    parents: commit.parents.clone(),
                    tree: commit.tree,
                    commit_time: commit.commit_time(),
                })
            }
            ObjectType::Tag => {
                let bytes = reader.read_to_vec()?;
                let tag = Tag::parse(&bytes)?;
                Parsed::Tag {
                    target: tag.target,
                    target_type: tag.target_type,
                }
            }
            ObjectType::Tree => Parsed::Tree,
            ObjectType::Blob => Parsed::Blob,
        };

        self.entry(oid).parsed = Some(parsed.clone());
        Ok(parsed)
    }

    /// Parse an object that must be a commit.
    pub fn parse_commit(&mut self, oid: &ObjectId) -> Result<CommitMeta, WalkError> {
        match self.parse_any(oid)? {
            Parsed::Commit(meta) => Ok(meta),
            _ => Err(WalkError::NotACommit(*oid)),
        }
    }

    /// Dereference tags until a non-tag object is reached.
    pub fn peel(&mut self, oid: &ObjectId) -> Result<(ObjectType, ObjectId), WalkError> {
        let mut current = *oid;
        // Tag chains are short; 32 hops means a cycle.
        for _ in 0..32 {
            match self.parse_any(&current)? {
                Parsed::Tag { target, .. } => current = target,
                other => return Ok((other.kind(), current)),
            }
        }
        Err(WalkError::Internal(format!("tag cycle at {oid}")))
    }

    // --- traversal ---

    /// Add a starting commit.
    pub fn mark_start(&mut self, oid: &ObjectId) -> Result<(), WalkError> {
        let meta = self.parse_commit(oid)?;
        let entry = self.entry(oid);
        if entry.flags & QUEUED != 0 {
            return Ok(());
        }
        entry.flags |= QUEUED | SEEN;
        self.push_queue(*oid, meta.commit_time);
        Ok(())
    }

    /// Exclude a commit and everything reachable from it.
    ///
    /// The commit still enters the queue so the boundary propagates during
    /// traversal; it is never yielded.
    pub fn mark_uninteresting(&mut self, oid: &ObjectId) -> Result<(), WalkError> {
        let meta = self.parse_commit(oid)?;
        let entry = self.entry(oid);
        entry.flags |= UNINTERESTING;
        if entry.flags & QUEUED == 0 {
            entry.flags |= QUEUED | SEEN;
            self.push_queue(*oid, meta.commit_time);
        }
        Ok(())
    }

    /// Pop the next interesting commit, youngest first.
    ///
    /// Uninteresting commits propagate their state to their parents and are
    /// skipped; carry flags spread parent-ward as the walk advances.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<(ObjectId, i64)>, WalkError> {
        while let Some(entry) = self.queue.pop() {
            let oid = entry.oid;
            let flags = self.entry(&oid).flags;
            let meta = self.parse_commit(&oid)?;

            // Spread carried flags (uninteresting included) to parents and
            // enqueue them.
            let carried = flags & self.carry_mask;
            let parents: &[ObjectId] = if self.parent_cut.contains(&oid) {
                &[]
            } else {
                &meta.parents
            };
            for parent in parents {
                let parent_meta = match self.parse_any(parent) {
                    Ok(Parsed::Commit(meta)) => meta,
                    // A missing or shallow-cut parent ends that line.
                    Err(WalkError::MissingObject(_)) => continue,
                    Ok(_) => return Err(WalkError::NotACommit(*parent)),
                    Err(e) => return Err(e),
                };
                let pentry = self.entry(parent);
                pentry.flags |= carried;
                if pentry.flags & SEEN == 0 {
                    pentry.flags |= SEEN | QUEUED;
                    self.push_queue(*parent, parent_meta.commit_time);
                }
            }

            if flags & UNINTERESTING != 0 {
                continue;
            }
            return Ok(Some((oid, meta.commit_time)));
        }
        Ok(None)
    }

    /// Walk to exhaustion, returning interesting commits youngest-first.
    pub fn drain(&mut self) -> Result<Vec<(ObjectId, i64)>, WalkError> {
        let mut out = Vec::new();
        while let Some(item) = self.next()? {
            out.push(item);
        }
        Ok(out)
    }

    pub(crate) fn entry(&mut self, oid: &ObjectId) -> &mut ObjEntry {
        match self.objects.entry(*oid) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => v.insert(ObjEntry {
                flags: 0,
                parsed: None,
            }),
        }
    }

    fn push_queue(&mut self, oid: ObjectId, commit_time: i64) {
        let ctr = self.insertion_ctr;
        self.insertion_ctr += 1;
        self.queue.push(QueueEntry {
            oid,
            commit_time,
            insertion_ctr: ctr,
        });
    }
}

// BinaryHeap is a max-heap: newest commit date first, ties broken by
// insertion order (earlier insertion pops first).
impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.oid == other.oid
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.commit_time
            .cmp(&other.commit_time)
            .then_with(|| other.insertion_ctr.cmp(&self.insertion_ctr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags;
    use gitd_object::commit::format_commit;
    use gitd_object::tag::format_tag;
    use gitd_object::Tree;
    use gitd_store::MemoryRepository;

    /// Build a linear history c0 <- c1 <- ... <- c{n-1}, one second apart.
    fn linear_history(n: usize) -> (ObjectStore<MemoryRepository>, Vec<ObjectId>) {
        let mut repo = MemoryRepository::new(std::env::temp_dir());
        let tree = repo.insert(ObjectType::Tree, &Tree::default().serialize());

        let mut commits = Vec::new();
        let mut parent: Option<ObjectId> = None;
        for i in 0..n {
            let parents: Vec<ObjectId> = parent.into_iter().collect();
            let raw = format_commit(
                &tree,
                &parents,
                "W <w@example.com>",
                1_700_000_000 + i as i64,
                &format!("commit {i}\n"),
            );
            let oid = repo.insert(ObjectType::Commit, &raw);
            commits.push(oid);
            parent = Some(oid);
        }
        (ObjectStore::new(repo), commits)
    }

    #[test]
    fn walk_yields_youngest_first() {
        let (store, commits) = linear_history(4);
        let mut walk = RevWalk::new(&store);
        walk.mark_start(commits.last().unwrap()).unwrap();

        let order: Vec<ObjectId> = walk.drain().unwrap().into_iter().map(|(o, _)| o).collect();
        let mut expected = commits.clone();
        expected.reverse();
        assert_eq!(order, expected);
    }

    #[test]
    fn uninteresting_stops_the_walk() {
        let (store, commits) = linear_history(5);
        let mut walk = RevWalk::new(&store);
        walk.mark_start(&commits[4]).unwrap();
        walk.mark_uninteresting(&commits[1]).unwrap();

        let order: Vec<ObjectId> = walk.drain().unwrap().into_iter().map(|(o, _)| o).collect();
        assert_eq!(order, vec![commits[4], commits[3], commits[2]]);
    }

    #[test]
    fn carried_flags_reach_ancestors() {
        let (store, commits) = linear_history(4);
        let mut walk = RevWalk::new(&store);
        walk.carry(flags::PEER_HAS);
        walk.set_flag(&commits[2], flags::PEER_HAS);
        walk.mark_start(&commits[3]).unwrap();
        walk.mark_start(&commits[2]).unwrap();

        walk.drain().unwrap();
        assert!(walk.has_flag(&commits[1], flags::PEER_HAS));
        assert!(walk.has_flag(&commits[0], flags::PEER_HAS));
        assert!(!walk.has_flag(&commits[3], flags::PEER_HAS));
    }

    #[test]
    fn mark_with_ancestors_is_eager() {
        let (store, commits) = linear_history(3);
        let mut walk = RevWalk::new(&store);
        walk.mark_with_ancestors(&commits[2], flags::PEER_HAS).unwrap();
        for oid in &commits {
            assert!(walk.has_flag(oid, flags::PEER_HAS));
        }
    }

    #[test]
    fn reset_retain_keeps_selected_flags() {
        let (store, commits) = linear_history(2);
        let mut walk = RevWalk::new(&store);
        walk.set_flag(&commits[0], flags::WANT);
        walk.set_flag(&commits[0], flags::COMMON);

        walk.reset_retain(&[flags::WANT]);
        assert!(walk.has_flag(&commits[0], flags::WANT));
        assert!(!walk.has_flag(&commits[0], flags::COMMON));
    }

    #[test]
    fn flag_allocation_caps_at_word_width() {
        let (store, _) = linear_history(1);
        let mut walk = RevWalk::new(&store);
        let mut allocated = 0;
        while walk.allocate_flag().is_ok() {
            allocated += 1;
            assert!(allocated <= 32, "allocator must stop at the cap");
        }
        // 5 reserved + internals leave 24 free bits.
        assert_eq!(allocated, 24);
        assert!(matches!(
            walk.allocate_flag(),
            Err(WalkError::FlagsExhausted)
        ));
    }

    #[test]
    fn peel_dereferences_tag_chains() {
        let mut repo = MemoryRepository::new(std::env::temp_dir());
        let tree = repo.insert(ObjectType::Tree, &Tree::default().serialize());
        let commit = repo.insert(
            ObjectType::Commit,
            &format_commit(&tree, &[], "T <t@e>", 1_700_000_000, "tip\n"),
        );
        let tag1 = repo.insert(
            ObjectType::Tag,
            &format_tag(&commit, ObjectType::Commit, "v1", "T <t@e>", 1_700_000_001, "m\n"),
        );
        let tag2 = repo.insert(
            ObjectType::Tag,
            &format_tag(&tag1, ObjectType::Tag, "meta", "T <t@e>", 1_700_000_002, "m\n"),
        );
        let store = ObjectStore::new(repo);

        let mut walk = RevWalk::new(&store);
        let (kind, peeled) = walk.peel(&tag2).unwrap();
        assert_eq!(kind, ObjectType::Commit);
        assert_eq!(peeled, commit);
    }

    #[test]
    fn missing_object_reported() {
        let (store, _) = linear_history(1);
        let mut walk = RevWalk::new(&store);
        let ghost = ObjectId::from_hex("00000000000000000000000000000000000000ee").unwrap();
        assert!(matches!(
            walk.parse_any(&ghost),
            Err(WalkError::MissingObject(_))
        ));
    }

    #[test]
    fn non_commit_start_rejected() {
        let mut repo = MemoryRepository::new(std::env::temp_dir());
        let blob = repo.insert(ObjectType::Blob, b"not a commit");
        let store = ObjectStore::new(repo);
        let mut walk = RevWalk::new(&store);
        assert!(matches!(
            walk.mark_start(&blob),
            Err(WalkError::NotACommit(_))
        ));
    }
}
