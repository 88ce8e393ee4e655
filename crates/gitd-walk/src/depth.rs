//! Depth-limited walks for shallow fetches.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use gitd_hash::ObjectId;
use gitd_store::Repository;

use crate::walk::RevWalk;
use crate::WalkError;

/// One commit visited by a depth walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthEntry {
    pub oid: ObjectId,
    /// Distance from the nearest root (roots are at depth 1, matching the
    /// wire `deepen <n>` counting).
    pub depth: u32,
    /// True when the commit sits on the cut: included, but its parents are
    /// not.
    pub boundary: bool,
}

impl<R: Repository> RevWalk<'_, R> {
    /// Breadth-first walk from `roots`, not descending past `max_depth`
    /// generations. Yields each commit once at its minimum depth, roots
    /// first.
    ///
    /// Commits at exactly `max_depth` are flagged as boundary; a shallow
    /// client records those as its new shallow set.
    pub fn depth_walk(
        &mut self,
        roots: &[ObjectId],
        max_depth: u32,
    ) -> Result<Vec<DepthEntry>, WalkError> {
        if max_depth == 0 {
            return Err(WalkError::Internal("depth walk needs a positive depth".into()));
        }

        let mut best: HashMap<ObjectId, u32> = HashMap::new();
        let mut queue: VecDeque<(ObjectId, u32)> = VecDeque::new();

        for root in roots {
            // Depth roots may be annotated tags; walk from the commit.
            let (_, peeled) = self.peel(root)?;
            if let Entry::Vacant(v) = best.entry(peeled) {
                v.insert(1);
                queue.push_back((peeled, 1));
            }
        }

        let mut out = Vec::new();
        while let Some((oid, depth)) = queue.pop_front() {
            let meta = self.parse_commit(&oid)?;

            let at_cut = depth >= max_depth;
            if !at_cut {
                for parent in &meta.parents {
                    match self.parse_commit(parent) {
                        Ok(_) => {
                            if best.get(parent).map(|&d| depth + 1 < d).unwrap_or(true) {
                                best.insert(*parent, depth + 1);
                                queue.push_back((*parent, depth + 1));
                            }
                        }
                        // A locally-absent parent (our own shallow cut)
                        // simply ends the line.
                        Err(WalkError::MissingObject(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }

            out.push(DepthEntry {
                oid,
                depth,
                boundary: at_cut && !meta.parents.is_empty(),
            });
        }

        Ok(out)
    }
}
