use bstr::BString;
use gitd_hash::{ObjectId, OID_RAW_LEN};

use crate::ObjectError;

/// File mode for tree entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileMode {
    /// Regular file (100644)
    Regular,
    /// Executable file (100755)
    Executable,
    /// Symbolic link (120000)
    Symlink,
    /// Git submodule link (160000)
    Gitlink,
    /// Subdirectory (040000)
    Tree,
    /// Unrecognized mode bits, preserved as read.
    Unknown(u32),
}

impl FileMode {
    /// Parse from octal ASCII bytes (e.g., `b"100644"`).
    pub fn from_bytes(s: &[u8]) -> Result<Self, ObjectError> {
        let raw = parse_octal(s).ok_or_else(|| {
            ObjectError::InvalidHeader(format!(
                "invalid file mode {:?}",
                String::from_utf8_lossy(s)
            ))
        })?;
        Ok(Self::from_raw(raw))
    }

    /// Create from the raw numeric value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0o100644 => Self::Regular,
            0o100755 => Self::Executable,
            0o120000 => Self::Symlink,
            0o160000 => Self::Gitlink,
            0o040000 => Self::Tree,
            other => Self::Unknown(other),
        }
    }

    /// Get the raw numeric value.
    pub fn raw(&self) -> u32 {
        match self {
            Self::Regular => 0o100644,
            Self::Executable => 0o100755,
            Self::Symlink => 0o120000,
            Self::Gitlink => 0o160000,
            Self::Tree => 0o40000,
            Self::Unknown(v) => *v,
        }
    }

    /// Is this a tree (directory) entry?
    pub fn is_tree(&self) -> bool {
        matches!(self, Self::Tree)
    }

    /// Is this a blob (file or symlink) entry?
    pub fn is_blob(&self) -> bool {
        matches!(self, Self::Regular | Self::Executable | Self::Symlink)
    }

    /// Is this a gitlink (submodule)? Gitlinks name commits in other
    /// repositories and are never enumerated into a pack.
    pub fn is_gitlink(&self) -> bool {
        matches!(self, Self::Gitlink)
    }
}

fn parse_octal(s: &[u8]) -> Option<u32> {
    if s.is_empty() {
        return None;
    }
    let mut val: u32 = 0;
    for &b in s {
        if !(b'0'..=b'7').contains(&b) {
            return None;
        }
        val = val.checked_mul(8)?.checked_add(u32::from(b - b'0'))?;
    }
    Some(val)
}

/// A single entry in a git tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub name: BString,
    pub oid: ObjectId,
}

/// A parsed tree object: entries in git's canonical name order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// Parse tree content from raw bytes (no loose-object header).
    ///
    /// Wire format per entry: `<octal mode> <name>\0<20 raw oid bytes>`.
    pub fn parse(content: &[u8]) -> Result<Self, ObjectError> {
        let mut entries = Vec::new();
        let mut pos = 0;

        while pos < content.len() {
            let entry_start = pos;

            let space = content[pos..]
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| ObjectError::InvalidTreeEntry {
                    offset: entry_start,
                    reason: "no space after mode".into(),
                })?
                + pos;
            let mode = FileMode::from_bytes(&content[pos..space])?;
            pos = space + 1;

            let nul = content[pos..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| ObjectError::InvalidTreeEntry {
                    offset: entry_start,
                    reason: "no NUL after name".into(),
                })?
                + pos;
            if nul == pos {
                return Err(ObjectError::InvalidTreeEntry {
                    offset: entry_start,
                    reason: "empty name".into(),
                });
            }
            let name = BString::from(&content[pos..nul]);
            pos = nul + 1;

            if pos + OID_RAW_LEN > content.len() {
                return Err(ObjectError::InvalidTreeEntry {
                    offset: entry_start,
                    reason: "truncated oid".into(),
                });
            }
            let oid = ObjectId::from_bytes(&content[pos..pos + OID_RAW_LEN])?;
            pos += OID_RAW_LEN;

            entries.push(TreeEntry { mode, name, oid });
        }

        Ok(Self { entries })
    }

    /// Render tree content in canonical format, for fixtures and tests.
    /// Entries must already be in git name order.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            out.extend_from_slice(format!("{:o} ", entry.mode.raw()).as_bytes());
            out.extend_from_slice(&entry.name);
            out.push(0);
            out.extend_from_slice(entry.oid.as_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        ObjectId::from(bytes)
    }

    #[test]
    fn parse_serialize_roundtrip() {
        let tree = Tree {
            entries: vec![
                TreeEntry {
                    mode: FileMode::Regular,
                    name: BString::from("README"),
                    oid: oid(1),
                },
                TreeEntry {
                    mode: FileMode::Tree,
                    name: BString::from("src"),
                    oid: oid(2),
                },
            ],
        };
        let raw = tree.serialize();
        let parsed = Tree::parse(&raw).unwrap();
        assert_eq!(parsed, tree);
    }

    #[test]
    fn empty_tree_parses() {
        let tree = Tree::parse(b"").unwrap();
        assert!(tree.entries.is_empty());
    }

    #[test]
    fn non_utf8_name_preserved() {
        let tree = Tree {
            entries: vec![TreeEntry {
                mode: FileMode::Regular,
                name: BString::from(&[0xff, 0xfe, b'!'][..]),
                oid: oid(3),
            }],
        };
        let parsed = Tree::parse(&tree.serialize()).unwrap();
        assert_eq!(parsed.entries[0].name, tree.entries[0].name);
    }

    #[test]
    fn truncated_oid_rejected() {
        let mut raw = Tree {
            entries: vec![TreeEntry {
                mode: FileMode::Regular,
                name: BString::from("f"),
                oid: oid(4),
            }],
        }
        .serialize();
        raw.truncate(raw.len() - 1);
        assert!(matches!(
            Tree::parse(&raw),
            Err(ObjectError::InvalidTreeEntry { .. })
        ));
    }

    #[test]
    fn mode_classification() {
        assert!(FileMode::Regular.is_blob());
        assert!(FileMode::Symlink.is_blob());
        assert!(FileMode::Tree.is_tree());
        assert!(FileMode::Gitlink.is_gitlink());
        assert!(!FileMode::Gitlink.is_blob());
    }
}
