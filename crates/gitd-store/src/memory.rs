//! In-memory repository, for embedders and tests.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use bstr::BString;
use gitd_hash::{Hasher, ObjectId};
use gitd_object::ObjectType;

use crate::{ObjectReader, RefRecord, Repository, StoreError};

/// A [`Repository`] backed by an object map and an explicit ref list.
///
/// The objects directory is real (installed packs land there); only object
/// and ref storage is in memory.
pub struct MemoryRepository {
    objects: HashMap<ObjectId, (ObjectType, Vec<u8>)>,
    refs: Vec<RefRecord>,
    objects_dir: PathBuf,
}

impl MemoryRepository {
    pub fn new(objects_dir: impl Into<PathBuf>) -> Self {
        Self {
            objects: HashMap::new(),
            refs: Vec::new(),
            objects_dir: objects_dir.into(),
        }
    }

    /// Store an object, returning its computed id.
    pub fn insert(&mut self, kind: ObjectType, content: &[u8]) -> ObjectId {
        let oid = Hasher::hash_object(kind.as_bytes(), content).expect("object hash");
        self.objects.insert(oid, (kind, content.to_vec()));
        oid
    }

    /// Store an object under a caller-supplied id, bypassing hashing.
    /// Only tests exercising collision handling should need this.
    pub fn insert_with_id(&mut self, oid: ObjectId, kind: ObjectType, content: &[u8]) {
        self.objects.insert(oid, (kind, content.to_vec()));
    }

    /// Add a ref to the advertisement list.
    pub fn insert_ref(&mut self, name: impl Into<BString>, target: ObjectId) {
        self.refs.push(RefRecord {
            name: name.into(),
            target,
            peeled: None,
        });
    }

    /// Add a ref whose target is an annotated tag, with its peeled object.
    pub fn insert_peeled_ref(
        &mut self,
        name: impl Into<BString>,
        target: ObjectId,
        peeled: ObjectId,
    ) {
        self.refs.push(RefRecord {
            name: name.into(),
            target,
            peeled: Some(peeled),
        });
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Repository for MemoryRepository {
    fn object_exists(&self, oid: &ObjectId) -> bool {
        self.objects.contains_key(oid)
    }

    fn open_object(&self, oid: &ObjectId) -> Result<Option<ObjectReader>, StoreError> {
        Ok(self.objects.get(oid).map(|(kind, data)| {
            ObjectReader::new(
                *kind,
                data.len() as u64,
                Box::new(Cursor::new(data.clone())),
            )
        }))
    }

    fn ref_database(&self) -> Result<Vec<RefRecord>, StoreError> {
        Ok(self.refs.clone())
    }

    fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_computes_git_compatible_id() {
        let mut repo = MemoryRepository::new(std::env::temp_dir());
        let oid = repo.insert(ObjectType::Blob, b"hello world\n");
        assert_eq!(oid.to_hex(), "3b18e512dba79e4c8300dd08aeb37f8e728b8dad");
        assert!(repo.object_exists(&oid));
    }

    #[test]
    fn refs_are_advertised_in_insertion_order() {
        let mut repo = MemoryRepository::new(std::env::temp_dir());
        let a = repo.insert(ObjectType::Blob, b"a");
        let b = repo.insert(ObjectType::Blob, b"b");
        repo.insert_ref("refs/heads/main", a);
        repo.insert_peeled_ref("refs/tags/v1", b, a);

        let refs = repo.ref_database().unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "refs/heads/main");
        assert_eq!(refs[0].peeled, None);
        assert_eq!(refs[1].peeled, Some(a));
    }
}
