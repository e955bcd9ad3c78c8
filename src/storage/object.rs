//! Object stores for file shard and tree bytes.
//!
//! The driver never interprets stored bytes beyond the file trees it writes
//! itself. Everything goes through [`ObjectStore`], which only knows how to
//! put bytes, get them back by reference, and wipe the store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{ErrorCode, Repository};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::ObjectRef;

/// A content-addressed, append-only byte store.
///
/// References are stable: putting the same bytes twice yields the same
/// reference. Concurrent reads need no coordination by the caller.
pub trait ObjectStore: Send + Sync {
    /// store bytes, returning their reference
    fn put(&self, bytes: &[u8]) -> StorageResult<ObjectRef>;

    /// read the bytes behind a reference
    fn get(&self, object: &ObjectRef) -> StorageResult<Vec<u8>>;

    /// check whether a reference resolves
    fn contains(&self, object: &ObjectRef) -> StorageResult<bool>;

    /// size in bytes of a stored object
    fn size(&self, object: &ObjectRef) -> StorageResult<u64> {
        Ok(self.get(object)?.len() as u64)
    }

    /// drop every stored object
    fn clear(&self) -> StorageResult<()>;
}

/// Object store backed by a bare git object database on disk.
///
/// Every object is a git blob, so the repository can be inspected with
/// ordinary git tooling (`git cat-file -p <ref>`).
pub struct GitObjectStore {
    repo: Mutex<Repository>,
    path: PathBuf,
}

impl GitObjectStore {
    /// Open an existing object database.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo =
            Repository::open_bare(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;

        Ok(Self {
            repo: Mutex::new(repo),
            path: path.to_path_buf(),
        })
    }

    /// Initialize a new, empty object database.
    pub fn init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::init_bare(path)?;
        debug!(path = %path.display(), "initialized git object store");

        Ok(Self {
            repo: Mutex::new(repo),
            path: path.to_path_buf(),
        })
    }

    /// Open or initialize an object database.
    pub fn open_or_init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.join("objects").exists() {
            Self::open(path)
        } else {
            Self::init(path)
        }
    }

    /// Get the object database path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ObjectStore for GitObjectStore {
    fn put(&self, bytes: &[u8]) -> StorageResult<ObjectRef> {
        let repo = self.repo.lock();
        let oid = repo.blob(bytes)?;
        Ok(ObjectRef::new(oid))
    }

    fn get(&self, object: &ObjectRef) -> StorageResult<Vec<u8>> {
        let repo = self.repo.lock();
        let blob = repo
            .find_blob(object.raw())
            .map_err(|e| lookup_error(object, e))?;
        Ok(blob.content().to_vec())
    }

    fn contains(&self, object: &ObjectRef) -> StorageResult<bool> {
        let repo = self.repo.lock();
        let odb = repo.odb()?;
        Ok(odb.exists(object.raw()))
    }

    fn size(&self, object: &ObjectRef) -> StorageResult<u64> {
        let repo = self.repo.lock();
        let (size, _) = repo
            .odb()?
            .read_header(object.raw())
            .map_err(|e| lookup_error(object, e))?;
        Ok(size as u64)
    }

    fn clear(&self) -> StorageResult<()> {
        let mut repo = self.repo.lock();
        std::fs::remove_dir_all(&self.path)?;
        *repo = Repository::init_bare(&self.path)?;
        debug!(path = %self.path.display(), "cleared git object store");
        Ok(())
    }
}

/// only a missing object is `ObjectNotFound`; io and corruption stay git errors
fn lookup_error(object: &ObjectRef, err: git2::Error) -> StorageError {
    if err.code() == ErrorCode::NotFound {
        StorageError::ObjectNotFound(*object)
    } else {
        StorageError::Git(err)
    }
}

/// Object store that keeps everything in memory.
///
/// Uses the same content addressing as [`GitObjectStore`], so references are
/// interchangeable between the two.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectRef, Arc<[u8]>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// number of distinct objects held
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, bytes: &[u8]) -> StorageResult<ObjectRef> {
        let object = ObjectRef::for_content(bytes)?;
        self.objects
            .write()
            .entry(object)
            .or_insert_with(|| Arc::from(bytes));
        Ok(object)
    }

    fn get(&self, object: &ObjectRef) -> StorageResult<Vec<u8>> {
        self.objects
            .read()
            .get(object)
            .map(|bytes| bytes.to_vec())
            .ok_or(StorageError::ObjectNotFound(*object))
    }

    fn contains(&self, object: &ObjectRef) -> StorageResult<bool> {
        Ok(self.objects.read().contains_key(object))
    }

    fn size(&self, object: &ObjectRef) -> StorageResult<u64> {
        self.objects
            .read()
            .get(object)
            .map(|bytes| bytes.len() as u64)
            .ok_or(StorageError::ObjectNotFound(*object))
    }

    fn clear(&self) -> StorageResult<()> {
        self.objects.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_git() -> (TempDir, GitObjectStore) {
        let dir = TempDir::new().unwrap();
        let store = GitObjectStore::init(dir.path().join("objects.git")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_git_put_get() {
        let (_dir, store) = setup_git();
        let r = store.put(b"hello").unwrap();
        assert_eq!(store.get(&r).unwrap(), b"hello");
        assert_eq!(store.size(&r).unwrap(), 5);
        assert!(store.contains(&r).unwrap());
    }

    #[test]
    fn test_git_missing_object() {
        let (_dir, store) = setup_git();
        let r = ObjectRef::for_content(b"never stored").unwrap();
        assert!(!store.contains(&r).unwrap());
        assert!(matches!(store.get(&r), Err(StorageError::ObjectNotFound(_))));
        assert!(matches!(store.size(&r), Err(StorageError::ObjectNotFound(_))));
    }

    #[test]
    fn test_git_corrupt_object_is_not_missing() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("objects.git");
        let store = GitObjectStore::init(&root).unwrap();
        let r = store.put(b"soon to be garbage").unwrap();

        let hex = r.to_string();
        let loose = root.join("objects").join(&hex[..2]).join(&hex[2..]);
        let mut perms = std::fs::metadata(&loose).unwrap().permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        std::fs::set_permissions(&loose, perms).unwrap();
        std::fs::write(&loose, b"not a zlib stream").unwrap();

        let err = store.size(&r).unwrap_err();
        assert!(matches!(err, StorageError::Git(_)), "{err:?}");
        assert!(!store.get(&r).unwrap_err().is_not_found());
    }

    #[test]
    fn test_git_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("objects.git");
        let r = {
            let store = GitObjectStore::open_or_init(&path).unwrap();
            store.put(b"persisted").unwrap()
        };
        let store = GitObjectStore::open_or_init(&path).unwrap();
        assert_eq!(store.get(&r).unwrap(), b"persisted");
    }

    #[test]
    fn test_git_open_missing_fails() {
        let dir = TempDir::new().unwrap();
        let result = GitObjectStore::open(dir.path().join("nope"));
        assert!(matches!(result, Err(StorageError::NotInitialized(_))));
    }

    #[test]
    fn test_git_clear() {
        let (_dir, store) = setup_git();
        let r = store.put(b"bye").unwrap();
        store.clear().unwrap();
        assert!(!store.contains(&r).unwrap());
        // still usable afterwards
        let r2 = store.put(b"again").unwrap();
        assert_eq!(store.get(&r2).unwrap(), b"again");
    }

    #[test]
    fn test_memory_and_git_agree_on_refs() {
        let (_dir, git) = setup_git();
        let mem = MemoryObjectStore::new();
        assert_eq!(git.put(b"same bytes").unwrap(), mem.put(b"same bytes").unwrap());
    }

    #[test]
    fn test_memory_dedup_and_clear() {
        let mem = MemoryObjectStore::new();
        let a = mem.put(b"abc").unwrap();
        let b = mem.put(b"abc").unwrap();
        assert_eq!(a, b);
        assert_eq!(mem.len(), 1);
        mem.clear().unwrap();
        assert!(mem.is_empty());
        assert!(mem.get(&a).unwrap_err().is_not_found());
    }
}
