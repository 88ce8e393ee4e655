//! Reachability answers for the negotiation layer.

use std::collections::HashSet;

use gitd_hash::ObjectId;
use gitd_pack::bitmap::BitmapIndex;
use gitd_pack::index::PackIndex;
use gitd_store::Repository;

use crate::walk::{Parsed, RevWalk};
use crate::{WalkError, WalkFlag};

impl<R: Repository> RevWalk<'_, R> {
    /// Does a path exist from `from` to any commit carrying `flag`?
    ///
    /// `min_time` is a committer-time lower bound: lines older than the
    /// oldest flagged commit cannot lead to one, so they are pruned.
    pub fn can_reach_flagged(
        &mut self,
        from: &ObjectId,
        flag: WalkFlag,
        min_time: i64,
    ) -> Result<bool, WalkError> {
        let (_, start) = self.peel(from)?;
        let mut stack = vec![start];
        let mut visited: HashSet<ObjectId> = HashSet::new();

        while let Some(oid) = stack.pop() {
            if !visited.insert(oid) {
                continue;
            }
            if self.has_flag(&oid, flag) {
                return Ok(true);
            }
            let meta = match self.parse_any(&oid) {
                Ok(Parsed::Commit(meta)) => meta,
                Ok(_) => continue,
                Err(WalkError::MissingObject(_)) => continue,
                Err(e) => return Err(e),
            };
            if meta.commit_time < min_time {
                continue;
            }
            stack.extend(meta.parents);
        }
        Ok(false)
    }

    /// The negotiation give-up test: every want must have an ancestor
    /// carrying `flag` (the peer-has set).
    pub fn all_reach_flagged(
        &mut self,
        wants: &[ObjectId],
        flag: WalkFlag,
        min_time: i64,
    ) -> Result<bool, WalkError> {
        for want in wants {
            if !self.can_reach_flagged(want, flag, min_time)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Exact reachability from a bitmap-carrying commit: the set of object ids
/// covered by its bitmap, or `None` when the commit has no bitmap.
///
/// Bitmaps are consumed, never built; absence simply falls back to the
/// graph walk.
pub fn bitmap_reachable(
    bitmap: &BitmapIndex,
    index: &PackIndex,
    commit: &ObjectId,
) -> Result<Option<HashSet<ObjectId>>, WalkError> {
    let Some(offset) = index.lookup(commit) else {
        return Ok(None);
    };
    // Bitmap entries key on index position; find the commit's.
    let position = (0..index.num_objects())
        .find(|&i| index.offset_at_index(i) == offset)
        .ok_or_else(|| WalkError::Internal("offset not in index".into()))?;

    let Some(positions) = bitmap
        .reachable_positions(position)
        .map_err(|e| WalkError::Internal(e.to_string()))?
    else {
        return Ok(None);
    };

    let mut out = HashSet::with_capacity(positions.len());
    for pos in positions {
        if pos >= index.num_objects() {
            return Err(WalkError::Internal(format!(
                "bitmap bit {pos} outside index"
            )));
        }
        out.insert(index.oid_at_index(pos));
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags;
    use gitd_object::commit::format_commit;
    use gitd_object::{ObjectType, Tree};
    use gitd_store::{MemoryRepository, ObjectStore};

    /// Two branches sharing a root:
    /// root <- a1 <- a2 (branch A), root <- b1 (branch B)
    fn forked_history() -> (ObjectStore<MemoryRepository>, [ObjectId; 4]) {
        let mut repo = MemoryRepository::new(std::env::temp_dir());
        let tree = repo.insert(ObjectType::Tree, &Tree::default().serialize());

        let commit = |repo: &mut MemoryRepository, parents: &[ObjectId], t: i64, msg: &str| {
            repo.insert(
                ObjectType::Commit,
                &format_commit(&tree, parents, "F <f@e>", t, msg),
            )
        };

        let root = commit(&mut repo, &[], 1_700_000_000, "root\n");
        let a1 = commit(&mut repo, &[root], 1_700_000_010, "a1\n");
        let a2 = commit(&mut repo, &[a1], 1_700_000_020, "a2\n");
        let b1 = commit(&mut repo, &[root], 1_700_000_015, "b1\n");

        (ObjectStore::new(repo), [root, a1, a2, b1])
    }

    #[test]
    fn reaches_flagged_ancestor() {
        let (store, [root, _a1, a2, _b1]) = forked_history();
        let mut walk = RevWalk::new(&store);
        walk.set_flag(&root, flags::PEER_HAS);

        assert!(walk
            .can_reach_flagged(&a2, flags::PEER_HAS, i64::MIN)
            .unwrap());
    }

    #[test]
    fn unrelated_flag_is_not_reachable() {
        let (store, [_root, _a1, a2, b1]) = forked_history();
        let mut walk = RevWalk::new(&store);
        // Flag only a sibling branch tip.
        walk.set_flag(&b1, flags::PEER_HAS);

        assert!(!walk
            .can_reach_flagged(&a2, flags::PEER_HAS, i64::MIN)
            .unwrap());
    }

    #[test]
    fn time_bound_prunes_old_lines() {
        let (store, [root, _a1, a2, _b1]) = forked_history();
        let mut walk = RevWalk::new(&store);
        walk.set_flag(&root, flags::PEER_HAS);

        // With a bound newer than root's commit time, the flagged ancestor
        // is behind the prune line. The starting commit itself is still
        // inspected.
        assert!(!walk
            .can_reach_flagged(&a2, flags::PEER_HAS, 1_700_000_018)
            .unwrap());
    }

    #[test]
    fn all_wants_must_reach() {
        let (store, [root, _a1, a2, b1]) = forked_history();
        let mut walk = RevWalk::new(&store);
        walk.set_flag(&root, flags::PEER_HAS);

        assert!(walk
            .all_reach_flagged(&[a2, b1], flags::PEER_HAS, i64::MIN)
            .unwrap());

        let mut walk = RevWalk::new(&store);
        walk.set_flag(&b1, flags::PEER_HAS);
        assert!(!walk
            .all_reach_flagged(&[a2, b1], flags::PEER_HAS, i64::MIN)
            .unwrap());
    }
}
