use bstr::{BStr, BString};
use gitd_hash::ObjectId;

use crate::{Ident, ObjectError};

/// A parsed commit object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// OID of the root tree.
    pub tree: ObjectId,
    /// Parent commit OIDs (empty for root commit).
    pub parents: Vec<ObjectId>,
    /// Author identity and timestamp.
    pub author: Ident,
    /// Committer identity and timestamp.
    pub committer: Ident,
    /// Commit message (everything after the blank line separator).
    pub message: BString,
}

impl Commit {
    /// Parse commit content from raw bytes (no loose-object header).
    ///
    /// Headers the transport pipeline does not interpret (gpgsig, encoding,
    /// mergetag, ...) are skipped, including their continuation lines.
    pub fn parse(content: &[u8]) -> Result<Self, ObjectError> {
        let mut tree: Option<ObjectId> = None;
        let mut parents = Vec::new();
        let mut author: Option<Ident> = None;
        let mut committer: Option<Ident> = None;

        let data = content;
        let mut pos = 0;

        loop {
            if pos >= data.len() {
                break;
            }

            // A blank line separates headers from message.
            if data[pos] == b'\n' {
                pos += 1;
                break;
            }

            let line_end = data[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| p + pos)
                .unwrap_or(data.len());
            let line = &data[pos..line_end];
            pos = line_end + 1;

            // Continuation line of a multi-line header we skipped.
            if line.first() == Some(&b' ') {
                continue;
            }

            if let Some(space_pos) = line.iter().position(|&b| b == b' ') {
                let key = &line[..space_pos];
                let value = &line[space_pos + 1..];

                match key {
                    b"tree" => {
                        let hex = std::str::from_utf8(value)
                            .map_err(|_| ObjectError::InvalidHeader("non-UTF8 tree OID".into()))?;
                        tree = Some(ObjectId::from_hex(hex)?);
                    }
                    b"parent" => {
                        let hex = std::str::from_utf8(value).map_err(|_| {
                            ObjectError::InvalidHeader("non-UTF8 parent OID".into())
                        })?;
                        parents.push(ObjectId::from_hex(hex)?);
                    }
                    b"author" => {
                        author = Some(Ident::parse(BStr::new(value))?);
                    }
                    b"committer" => {
                        committer = Some(Ident::parse(BStr::new(value))?);
                    }
                    _ => {}
                }
            }
        }

        let message = BString::from(&data[pos.min(data.len())..]);

        Ok(Self {
            tree: tree.ok_or(ObjectError::MissingCommitField { field: "tree" })?,
            parents,
            author: author.ok_or(ObjectError::MissingCommitField { field: "author" })?,
            committer: committer.ok_or(ObjectError::MissingCommitField { field: "committer" })?,
            message,
        })
    }

    /// The committer timestamp, the walk's primary ordering key.
    pub fn commit_time(&self) -> i64 {
        self.committer.timestamp
    }
}

/// Render commit content in canonical format. Used by test fixtures and the
/// in-memory repository to build valid commit graphs.
pub fn format_commit(
    tree: &ObjectId,
    parents: &[ObjectId],
    who: &str,
    timestamp: i64,
    message: &str,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("tree {}\n", tree).as_bytes());
    for p in parents {
        out.extend_from_slice(format!("parent {}\n", p).as_bytes());
    }
    out.extend_from_slice(format!("author {} {} +0000\n", who, timestamp).as_bytes());
    out.extend_from_slice(format!("committer {} {} +0000\n", who, timestamp).as_bytes());
    out.push(b'\n');
    out.extend_from_slice(message.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE_HEX: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";
    const PARENT_HEX: &str = "95d09f2b10159347eece71399a7e2e907ea3df4f";

    #[test]
    fn parse_root_commit() {
        let tree = ObjectId::from_hex(TREE_HEX).unwrap();
        let raw = format_commit(&tree, &[], "T <t@example.com>", 1700000000, "initial\n");
        let commit = Commit::parse(&raw).unwrap();
        assert_eq!(commit.tree, tree);
        assert!(commit.parents.is_empty());
        assert_eq!(commit.commit_time(), 1700000000);
        assert_eq!(commit.message, "initial\n");
    }

    #[test]
    fn parse_merge_commit() {
        let tree = ObjectId::from_hex(TREE_HEX).unwrap();
        let p1 = ObjectId::from_hex(PARENT_HEX).unwrap();
        let p2 = ObjectId::from_hex("0000000000000000000000000000000000000001").unwrap();
        let raw = format_commit(&tree, &[p1, p2], "M <m@example.com>", 1700000100, "merge\n");
        let commit = Commit::parse(&raw).unwrap();
        assert_eq!(commit.parents, vec![p1, p2]);
    }

    #[test]
    fn skips_gpgsig_continuation_lines() {
        let raw = format!(
            "tree {TREE_HEX}\n\
             parent {PARENT_HEX}\n\
             author A <a@b> 1700000000 +0000\n\
             committer A <a@b> 1700000001 +0000\n\
             gpgsig -----BEGIN PGP SIGNATURE-----\n\
              iQEzBAABCAAdFiEE\n\
              -----END PGP SIGNATURE-----\n\
             \n\
             signed\n"
        );
        let commit = Commit::parse(raw.as_bytes()).unwrap();
        assert_eq!(commit.commit_time(), 1700000001);
        assert_eq!(commit.message, "signed\n");
    }

    #[test]
    fn missing_tree_rejected() {
        let raw = b"author A <a@b> 1 +0000\ncommitter A <a@b> 1 +0000\n\nmsg\n";
        assert!(matches!(
            Commit::parse(raw),
            Err(ObjectError::MissingCommitField { field: "tree" })
        ));
    }

    #[test]
    fn missing_committer_rejected() {
        let raw = format!("tree {TREE_HEX}\nauthor A <a@b> 1 +0000\n\nmsg\n");
        assert!(matches!(
            Commit::parse(raw.as_bytes()),
            Err(ObjectError::MissingCommitField { field: "committer" })
        ));
    }
}
