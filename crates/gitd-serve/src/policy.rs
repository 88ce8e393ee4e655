//! Want validation policies.
//!
//! The policy decides which object ids a client may name in `want` lines.
//! Ref filtering and advertisement hooks live with the embedder; the policy
//! only sees the advertised set, the full tip set, and the object graph.

use std::collections::HashSet;

use gitd_hash::ObjectId;
use gitd_store::Repository;
use gitd_walk::{Parsed, RevWalk, WalkError};

use crate::ServeError;

/// Which wants are acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WantPolicy {
    /// Only ids in the advertised set.
    #[default]
    Advertised,
    /// Advertised ids, plus anything reachable from an advertised commit.
    ReachableCommit,
    /// Advertised ids, plus the tip of any ref, hidden ones included.
    Tip,
    /// Union of `ReachableCommit` and `Tip`.
    ReachableCommitTip,
    /// No restriction.
    Any,
}

/// The sets a policy decision is made against.
#[derive(Debug, Default)]
pub struct PolicyContext {
    /// Ids advertised to this client (ref targets and peeled targets).
    pub advertised: HashSet<ObjectId>,
    /// Every ref tip, including refs hidden from the advertisement.
    pub tips: HashSet<ObjectId>,
}

impl WantPolicy {
    /// Does this policy let clients want unadvertised tips?
    pub fn allows_tip_sha1(&self) -> bool {
        matches!(
            self,
            WantPolicy::Tip | WantPolicy::ReachableCommitTip | WantPolicy::Any
        )
    }

    /// Does this policy let clients want unadvertised reachable objects?
    pub fn allows_reachable_sha1(&self) -> bool {
        matches!(
            self,
            WantPolicy::ReachableCommit | WantPolicy::ReachableCommitTip | WantPolicy::Any
        )
    }

    /// Validate one `want`. A violation is fatal for the RPC.
    pub fn validate<R: Repository>(
        &self,
        want: &ObjectId,
        ctx: &PolicyContext,
        walk: &mut RevWalk<'_, R>,
    ) -> Result<(), ServeError> {
        if ctx.advertised.contains(want) {
            return Ok(());
        }
        let ok = match self {
            WantPolicy::Advertised => false,
            WantPolicy::Tip => ctx.tips.contains(want),
            WantPolicy::ReachableCommit => reachable_from_advertised(want, ctx, walk)?,
            WantPolicy::ReachableCommitTip => {
                ctx.tips.contains(want) || reachable_from_advertised(want, ctx, walk)?
            }
            WantPolicy::Any => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ServeError::PolicyDenied(*want))
        }
    }
}

/// Is `target` reachable from any advertised commit (commits, their trees
/// and blobs included)?
fn reachable_from_advertised<R: Repository>(
    target: &ObjectId,
    ctx: &PolicyContext,
    walk: &mut RevWalk<'_, R>,
) -> Result<bool, ServeError> {
    let mut stack: Vec<ObjectId> = Vec::new();
    for start in &ctx.advertised {
        // Unparseable advertised entries are skipped, not fatal.
        if let Ok((_, peeled)) = walk.peel(start) {
            stack.push(peeled);
        }
    }

    let mut visited: HashSet<ObjectId> = HashSet::new();
    while let Some(oid) = stack.pop() {
        if !visited.insert(oid) {
            continue;
        }
        if oid == *target {
            return Ok(true);
        }
        match walk.parse_any(&oid) {
            Ok(Parsed::Commit(meta)) => {
                stack.push(meta.tree);
                stack.extend(meta.parents);
            }
            Ok(Parsed::Tag { target: t, .. }) => stack.push(t),
            Ok(Parsed::Tree) => {
                if let Some(reader) = walk_store_open(walk, &oid)? {
                    let tree = gitd_object::Tree::parse(&reader)?;
                    for entry in tree.entries {
                        if !entry.mode.is_gitlink() {
                            stack.push(entry.oid);
                        }
                    }
                }
            }
            Ok(Parsed::Blob) => {}
            Err(WalkError::MissingObject(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(false)
}

fn walk_store_open<R: Repository>(
    walk: &RevWalk<'_, R>,
    oid: &ObjectId,
) -> Result<Option<Vec<u8>>, ServeError> {
    match walk.store().open(oid)? {
        Some(reader) => Ok(Some(reader.read_to_vec()?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitd_object::commit::format_commit;
    use gitd_object::{ObjectType, Tree};
    use gitd_store::{MemoryRepository, ObjectStore};

    struct Fixture {
        store: ObjectStore<MemoryRepository>,
        advertised_tip: ObjectId,
        hidden_tip: ObjectId,
        interior: ObjectId,
        blob: ObjectId,
        stranger: ObjectId,
    }

    /// advertised: tip of a 2-commit line; hidden: separate root commit;
    /// stranger: object in no ref's history.
    fn fixture() -> Fixture {
        let mut repo = MemoryRepository::new(std::env::temp_dir());
        let blob = repo.insert(ObjectType::Blob, b"tracked content");
        let tree = repo.insert(
            ObjectType::Tree,
            &Tree {
                entries: vec![gitd_object::TreeEntry {
                    mode: gitd_object::FileMode::Regular,
                    name: "file".into(),
                    oid: blob,
                }],
            }
            .serialize(),
        );
        let interior = repo.insert(
            ObjectType::Commit,
            &format_commit(&tree, &[], "P <p@e>", 1_700_000_000, "base\n"),
        );
        let advertised_tip = repo.insert(
            ObjectType::Commit,
            &format_commit(&tree, &[interior], "P <p@e>", 1_700_000_010, "tip\n"),
        );
        let empty_tree = repo.insert(ObjectType::Tree, &Tree::default().serialize());
        let hidden_tip = repo.insert(
            ObjectType::Commit,
            &format_commit(&empty_tree, &[], "P <p@e>", 1_700_000_020, "hidden\n"),
        );
        let stranger = repo.insert(ObjectType::Blob, b"unreferenced");

        repo.insert_ref("refs/heads/main", advertised_tip);

        Fixture {
            store: ObjectStore::new(repo),
            advertised_tip,
            hidden_tip,
            interior,
            blob,
            stranger,
        }
    }

    fn ctx(f: &Fixture) -> PolicyContext {
        PolicyContext {
            advertised: [f.advertised_tip].into_iter().collect(),
            tips: [f.advertised_tip, f.hidden_tip].into_iter().collect(),
        }
    }

    #[test]
    fn advertised_policy() {
        let f = fixture();
        let ctx = ctx(&f);
        let mut walk = RevWalk::new(&f.store);
        let policy = WantPolicy::Advertised;

        policy.validate(&f.advertised_tip, &ctx, &mut walk).unwrap();
        assert!(matches!(
            policy.validate(&f.interior, &ctx, &mut walk),
            Err(ServeError::PolicyDenied(_))
        ));
        assert!(policy.validate(&f.hidden_tip, &ctx, &mut walk).is_err());
    }

    #[test]
    fn tip_policy() {
        let f = fixture();
        let ctx = ctx(&f);
        let mut walk = RevWalk::new(&f.store);
        let policy = WantPolicy::Tip;

        policy.validate(&f.hidden_tip, &ctx, &mut walk).unwrap();
        assert!(policy.validate(&f.interior, &ctx, &mut walk).is_err());
    }

    #[test]
    fn reachable_commit_policy() {
        let f = fixture();
        let ctx = ctx(&f);
        let mut walk = RevWalk::new(&f.store);
        let policy = WantPolicy::ReachableCommit;

        policy.validate(&f.interior, &ctx, &mut walk).unwrap();
        policy.validate(&f.blob, &ctx, &mut walk).unwrap();
        assert!(policy.validate(&f.hidden_tip, &ctx, &mut walk).is_err());
        assert!(policy.validate(&f.stranger, &ctx, &mut walk).is_err());
    }

    #[test]
    fn union_policy() {
        let f = fixture();
        let ctx = ctx(&f);
        let mut walk = RevWalk::new(&f.store);
        let policy = WantPolicy::ReachableCommitTip;

        policy.validate(&f.interior, &ctx, &mut walk).unwrap();
        policy.validate(&f.hidden_tip, &ctx, &mut walk).unwrap();
        assert!(policy.validate(&f.stranger, &ctx, &mut walk).is_err());
    }

    #[test]
    fn any_policy() {
        let f = fixture();
        let ctx = ctx(&f);
        let mut walk = RevWalk::new(&f.store);
        WantPolicy::Any
            .validate(&f.stranger, &ctx, &mut walk)
            .unwrap();
    }
}
