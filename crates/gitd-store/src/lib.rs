//! Read-only object access for the transport pipeline.
//!
//! The pipeline never talks to repository storage directly. It goes through
//! the [`ObjectStore`] gateway, which sits on top of a caller-provided
//! [`Repository`] facade and adds a bounded byte cache, scoped read cursors,
//! and the collision check the indexer relies on.

mod memory;

pub use memory::MemoryRepository;

use std::io::Read;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bstr::BString;
use gitd_hash::ObjectId;
use gitd_object::ObjectType;
use lru::LruCache;

/// Errors from gateway reads.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object collision for {0}: local object has same id but different content")]
    Collision(ObjectId),

    #[error("corrupt local object {oid}: {reason}")]
    Corrupt { oid: ObjectId, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One advertised ref: name, target, and the peeled target for annotated tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    pub name: BString,
    pub target: ObjectId,
    pub peeled: Option<ObjectId>,
}

/// An open object: its resolved type, inflated size, and a blocking reader
/// over the content bytes.
pub struct ObjectReader {
    pub kind: ObjectType,
    pub size: u64,
    inner: Box<dyn Read + Send>,
}

impl ObjectReader {
    pub fn new(kind: ObjectType, size: u64, inner: Box<dyn Read + Send>) -> Self {
        Self { kind, size, inner }
    }

    /// Read the full content into a buffer.
    pub fn read_to_vec(mut self) -> Result<Vec<u8>, StoreError> {
        let mut buf = Vec::with_capacity(self.size.min(1 << 20) as usize);
        self.inner.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

/// The repository facade the pipeline is handed by its embedder.
///
/// Ref storage, directory layout, and config live behind this trait; only
/// object lookup, the ref list, and the objects directory (where finished
/// packs are installed) are visible to the pipeline.
pub trait Repository {
    /// Does the local store contain this object?
    fn object_exists(&self, oid: &ObjectId) -> bool;

    /// Open an object for reading. `None` if absent.
    fn open_object(&self, oid: &ObjectId) -> Result<Option<ObjectReader>, StoreError>;

    /// The refs this repository exposes, advertisement-ready.
    fn ref_database(&self) -> Result<Vec<RefRecord>, StoreError>;

    /// Directory that receives installed `pack-*.pack` / `.idx` files.
    fn objects_dir(&self) -> &Path;
}

/// Default capacity of the gateway byte cache (number of objects).
const DEFAULT_CACHE_OBJECTS: usize = 256;

/// Read-through gateway over a [`Repository`].
///
/// Safe for concurrent readers; the only interior mutability is the byte
/// cache and cursor accounting.
pub struct ObjectStore<R> {
    repo: R,
    cache: Mutex<LruCache<ObjectId, (ObjectType, Vec<u8>)>>,
    /// Total bytes handed out through scoped cursors.
    cursor_bytes: AtomicU64,
}

impl<R: Repository> ObjectStore<R> {
    pub fn new(repo: R) -> Self {
        Self::with_cache_capacity(repo, DEFAULT_CACHE_OBJECTS)
    }

    pub fn with_cache_capacity(repo: R, objects: usize) -> Self {
        let cap = NonZeroUsize::new(objects.max(1)).expect("nonzero cache capacity");
        Self {
            repo,
            cache: Mutex::new(LruCache::new(cap)),
            cursor_bytes: AtomicU64::new(0),
        }
    }

    /// The underlying repository facade.
    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Directory that receives installed pack files.
    pub fn objects_dir(&self) -> &Path {
        self.repo.objects_dir()
    }

    /// Does the local store contain this object?
    pub fn has(&self, oid: &ObjectId) -> bool {
        self.repo.object_exists(oid)
    }

    /// Open an object for streaming. `None` if absent.
    pub fn open(&self, oid: &ObjectId) -> Result<Option<ObjectReader>, StoreError> {
        self.repo.open_object(oid)
    }

    /// Fetch the full bytes of an object no larger than `max`, through the
    /// bounded cache. Returns `None` if the object is absent or oversized.
    pub fn cached_bytes(
        &self,
        oid: &ObjectId,
        max: u64,
    ) -> Result<Option<(ObjectType, Vec<u8>)>, StoreError> {
        if let Some(hit) = self.cache.lock().unwrap().get(oid) {
            if hit.1.len() as u64 <= max {
                return Ok(Some(hit.clone()));
            }
            return Ok(None);
        }

        let Some(reader) = self.repo.open_object(oid)? else {
            return Ok(None);
        };
        if reader.size > max {
            return Ok(None);
        }
        let kind = reader.kind;
        let bytes = reader.read_to_vec()?;
        self.cache
            .lock()
            .unwrap()
            .put(*oid, (kind, bytes.clone()));
        Ok(Some((kind, bytes)))
    }

    /// Borrow a scoped cursor that aggregates multiple reads. The cursor is
    /// released on drop.
    pub fn reader_handle(&self) -> StoreCursor<'_, R> {
        StoreCursor {
            store: self,
            bytes_read: 0,
            objects_read: 0,
        }
    }

    /// Collision check for a candidate object arriving in a pack.
    ///
    /// If an object with the same id exists locally, its type and content
    /// must both match the candidate; any difference is a collision. An
    /// absent local object passes.
    pub fn check_collision(
        &self,
        oid: &ObjectId,
        kind: ObjectType,
        content: &[u8],
    ) -> Result<(), StoreError> {
        let Some(mut reader) = self.repo.open_object(oid)? else {
            return Ok(());
        };
        if reader.kind != kind || reader.size != content.len() as u64 {
            return Err(StoreError::Collision(*oid));
        }

        // Compare in chunks so a large local object is never fully buffered.
        let mut local = [0u8; 8192];
        let mut off = 0usize;
        loop {
            let n = reader.read(&mut local)?;
            if n == 0 {
                break;
            }
            if off + n > content.len() || local[..n] != content[off..off + n] {
                return Err(StoreError::Collision(*oid));
            }
            off += n;
        }
        if off != content.len() {
            return Err(StoreError::Collision(*oid));
        }
        Ok(())
    }
}

/// A scoped read cursor. Aggregates read accounting for one logical task
/// (for example one delta-resolution phase) and releases it on drop.
pub struct StoreCursor<'a, R> {
    store: &'a ObjectStore<R>,
    bytes_read: u64,
    objects_read: u64,
}

impl<R: Repository> StoreCursor<'_, R> {
    /// Read an object's type and full content.
    pub fn read(&mut self, oid: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, StoreError> {
        let Some(reader) = self.store.open(oid)? else {
            return Ok(None);
        };
        let kind = reader.kind;
        let bytes = reader.read_to_vec()?;
        self.bytes_read += bytes.len() as u64;
        self.objects_read += 1;
        Ok(Some((kind, bytes)))
    }

    /// Bytes read through this cursor so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Objects read through this cursor so far.
    pub fn objects_read(&self) -> u64 {
        self.objects_read
    }
}

impl<R> Drop for StoreCursor<'_, R> {
    fn drop(&mut self) {
        self.store
            .cursor_bytes
            .fetch_add(self.bytes_read, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(objects: &[(ObjectType, &[u8])]) -> (ObjectStore<MemoryRepository>, Vec<ObjectId>) {
        let dir = std::env::temp_dir();
        let mut repo = MemoryRepository::new(dir);
        let oids = objects
            .iter()
            .map(|(kind, data)| repo.insert(*kind, data))
            .collect();
        (ObjectStore::new(repo), oids)
    }

    #[test]
    fn has_and_open() {
        let (store, oids) = store_with(&[(ObjectType::Blob, b"content")]);
        assert!(store.has(&oids[0]));

        let reader = store.open(&oids[0]).unwrap().unwrap();
        assert_eq!(reader.kind, ObjectType::Blob);
        assert_eq!(reader.size, 7);
        assert_eq!(reader.read_to_vec().unwrap(), b"content");

        let missing = ObjectId::from_hex("0000000000000000000000000000000000000042").unwrap();
        assert!(!store.has(&missing));
        assert!(store.open(&missing).unwrap().is_none());
    }

    #[test]
    fn cached_bytes_respects_bound() {
        let (store, oids) = store_with(&[(ObjectType::Blob, b"0123456789")]);
        assert!(store.cached_bytes(&oids[0], 4).unwrap().is_none());

        let (kind, bytes) = store.cached_bytes(&oids[0], 100).unwrap().unwrap();
        assert_eq!(kind, ObjectType::Blob);
        assert_eq!(bytes, b"0123456789");

        // Second read hits the cache.
        let (_, again) = store.cached_bytes(&oids[0], 100).unwrap().unwrap();
        assert_eq!(again, bytes);
    }

    #[test]
    fn collision_passes_on_identical() {
        let (store, oids) = store_with(&[(ObjectType::Blob, b"same bytes")]);
        store
            .check_collision(&oids[0], ObjectType::Blob, b"same bytes")
            .unwrap();
    }

    #[test]
    fn collision_on_different_bytes() {
        let (store, oids) = store_with(&[(ObjectType::Blob, b"local bytes")]);
        let err = store
            .check_collision(&oids[0], ObjectType::Blob, b"other bytes")
            .unwrap_err();
        assert!(matches!(err, StoreError::Collision(oid) if oid == oids[0]));
    }

    #[test]
    fn collision_on_different_type() {
        let (store, oids) = store_with(&[(ObjectType::Blob, b"payload")]);
        let err = store
            .check_collision(&oids[0], ObjectType::Tree, b"payload")
            .unwrap_err();
        assert!(matches!(err, StoreError::Collision(_)));
    }

    #[test]
    fn absent_object_is_not_a_collision() {
        let (store, _) = store_with(&[]);
        let oid = ObjectId::from_hex("00000000000000000000000000000000000000aa").unwrap();
        store
            .check_collision(&oid, ObjectType::Blob, b"anything")
            .unwrap();
    }

    #[test]
    fn cursor_aggregates_reads() {
        let (store, oids) = store_with(&[
            (ObjectType::Blob, b"12345"),
            (ObjectType::Blob, b"6789"),
        ]);
        {
            let mut cursor = store.reader_handle();
            cursor.read(&oids[0]).unwrap().unwrap();
            cursor.read(&oids[1]).unwrap().unwrap();
            assert_eq!(cursor.bytes_read(), 9);
            assert_eq!(cursor.objects_read(), 2);
        }
        assert_eq!(store.cursor_bytes.load(Ordering::Relaxed), 9);
    }
}
