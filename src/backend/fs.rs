//! Local directory used as a bucket.
//!
//! Keys map to paths below the base directory. Objects are written to a
//! temp file in the destination directory and renamed into place, so a
//! reader sees either the old object or the new one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use tempfile::NamedTempFile;
use tracing::debug;

use super::{check_declared, Condition, ObjectBackend, ObjectBody, ObjectMeta, VersionToken};
use crate::error::{BackendError, BackendErrorKind, BackendResult};

/// Filesystem-backed bucket.
pub struct FsBackend {
    base_path: PathBuf,
}

impl FsBackend {
    /// Create a backend storing objects below `base_path`.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        FsBackend {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// The directory acting as the bucket.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the path where the object with the given key is stored.
    pub fn object_path(&self, key: &str) -> BackendResult<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid || key.ends_with(".lock") {
            return Err(BackendError::new(
                BackendErrorKind::Other,
                format!("invalid key: {:?}", key),
            ));
        }
        Ok(self.base_path.join(relative))
    }

    /// Current version of the object at `path`, if any.
    fn current(&self, path: &Path) -> BackendResult<Option<ObjectMeta>> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta_of(&meta)?)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl ObjectBackend for FsBackend {
    fn get(&self, key: &str) -> BackendResult<ObjectBody> {
        let path = self.object_path(key)?;
        let file = open_file(&path, key)?;
        let meta = meta_of(&file.metadata()?)?;
        Ok(ObjectBody {
            meta,
            reader: Box::new(file),
        })
    }

    fn head(&self, key: &str) -> BackendResult<ObjectMeta> {
        let path = self.object_path(key)?;
        self.current(&path)?
            .ok_or_else(|| BackendError::not_found(key))
    }

    fn put(
        &self,
        key: &str,
        body: &mut dyn Read,
        len: u64,
        condition: &Condition,
    ) -> BackendResult<VersionToken> {
        let path = self.object_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| BackendError::new(BackendErrorKind::Other, format!("invalid key: {:?}", key)))?;

        // Create parent directories
        fs::create_dir_all(parent)?;

        let _lock = match condition {
            Condition::None => None,
            _ => Some(LockFile::acquire(&path, key)?),
        };
        if !matches!(condition, Condition::None) {
            let current = self.current(&path)?;
            condition.check(key, current.as_ref().map(|meta| &meta.version))?;
        }

        // Write to temp file first (atomic)
        let mut temp = NamedTempFile::new_in(parent)?;
        let written = io::copy(&mut body.take(len.saturating_add(1)), temp.as_file_mut())?;
        check_declared(key, written, len)?;
        temp.as_file_mut().sync_all()?;

        // Rename to final path
        let file = temp
            .persist(&path)
            .map_err(|e| BackendError::from(e.error))?;
        let meta = meta_of(&file.metadata()?)?;
        debug!(key, len, "fs put");
        Ok(meta.version)
    }

    fn delete(&self, key: &str, condition: &Condition) -> BackendResult<()> {
        let path = self.object_path(key)?;
        let _lock = match condition {
            Condition::None => None,
            _ => Some(LockFile::acquire(&path, key)?),
        };

        let current = self.current(&path)?.ok_or_else(|| BackendError::not_found(key))?;
        condition.check(key, Some(&current.version))?;

        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(key, "fs delete");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackendError::not_found(key)),
            Err(e) => Err(e.into()),
        }
    }
}

fn open_file(path: &Path, key: &str) -> BackendResult<File> {
    match File::open(path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackendError::not_found(key)),
        Err(e) => Err(e.into()),
    }
}

/// Version token of a file: length, modification time and (on Unix) inode.
///
/// Every write lands through a fresh temp file, so a rewrite changes the
/// inode even when length and mtime collide.
fn meta_of(meta: &fs::Metadata) -> BackendResult<ObjectMeta> {
    let modified = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    #[cfg(unix)]
    let inode = {
        use std::os::unix::fs::MetadataExt;
        meta.ino()
    };
    #[cfg(not(unix))]
    let inode = 0u64;

    Ok(ObjectMeta {
        size: meta.len(),
        version: VersionToken::new(format!("{:x}-{:x}-{:x}", meta.len(), modified, inode)),
    })
}

/// Exclusive `<key>.lock` file serializing conditional writers, the way git
/// guards its own refs.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(target: &Path, key: &str) -> BackendResult<Self> {
        let mut name = target.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                // Holder's pid, for whoever has to clean up a stale lock.
                let _ = writeln!(file, "{}", std::process::id());
                Ok(LockFile { path })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(BackendError::new(
                BackendErrorKind::PreconditionFailed,
                format!("{} is locked by another writer", key),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(backend: &FsBackend, key: &str, data: &[u8], cond: &Condition) -> BackendResult<VersionToken> {
        backend.put(key, &mut &data[..], data.len() as u64, cond)
    }

    #[test]
    fn test_object_path() {
        let backend = FsBackend::new("/tmp/bucket");
        let path = backend.object_path("lfs/objects/4d/7a/4d7a2146").unwrap();
        assert!(path.ends_with("lfs/objects/4d/7a/4d7a2146"));

        assert!(backend.object_path("../escape").is_err());
        assert!(backend.object_path("/absolute").is_err());
        assert!(backend.object_path("refs/heads/main.lock").is_err());
        assert!(backend.object_path("").is_err());
    }

    #[test]
    fn test_put_get() {
        let td = TempDir::new().unwrap();
        let backend = FsBackend::new(td.path());

        let version = put(&backend, "objects/ab/cd/abcd", b"Hello, World!", &Condition::None).unwrap();

        let mut body = backend.get("objects/ab/cd/abcd").unwrap();
        assert_eq!(body.meta.size, 13);
        assert_eq!(body.meta.version, version);

        let mut content = Vec::new();
        body.reader.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"Hello, World!");
    }

    #[test]
    fn test_missing() {
        let td = TempDir::new().unwrap();
        let backend = FsBackend::new(td.path());
        assert!(backend.get("objects/ab/cd/abcd").unwrap_err().is_not_found());
        assert!(backend.head("objects/ab/cd/abcd").unwrap_err().is_not_found());
    }

    #[test]
    fn test_short_body_leaves_nothing() {
        let td = TempDir::new().unwrap();
        let backend = FsBackend::new(td.path());

        assert!(backend
            .put("objects/ab/cd/abcd", &mut &b"abc"[..], 10, &Condition::None)
            .is_err());
        assert!(backend.head("objects/ab/cd/abcd").unwrap_err().is_not_found());

        // No temp files left behind either.
        let leftovers = fs::read_dir(td.path().join("objects/ab/cd")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_conditional_put() {
        let td = TempDir::new().unwrap();
        let backend = FsBackend::new(td.path());

        let v1 = put(&backend, "refs/heads/main", b"one", &Condition::IfAbsent).unwrap();
        let err = put(&backend, "refs/heads/main", b"two", &Condition::IfAbsent).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::PreconditionFailed);

        let v2 = put(&backend, "refs/heads/main", b"two", &Condition::IfMatch(v1.clone())).unwrap();
        assert_ne!(v1, v2);

        let err = put(&backend, "refs/heads/main", b"three", &Condition::IfMatch(v1)).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::PreconditionFailed);
        assert_eq!(backend.head("refs/heads/main").unwrap().version, v2);
    }

    #[test]
    fn test_held_lock_rejects_conditional_write() {
        let td = TempDir::new().unwrap();
        let backend = FsBackend::new(td.path());
        let v1 = put(&backend, "refs/heads/main", b"one", &Condition::None).unwrap();

        fs::write(td.path().join("refs/heads/main.lock"), b"1").unwrap();
        let err = put(&backend, "refs/heads/main", b"two", &Condition::IfMatch(v1)).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::PreconditionFailed);
    }

    #[test]
    fn test_delete() {
        let td = TempDir::new().unwrap();
        let backend = FsBackend::new(td.path());
        let v1 = put(&backend, "refs/tags/v1", b"one", &Condition::None).unwrap();

        let err = backend
            .delete("refs/tags/v1", &Condition::IfMatch(VersionToken::new("stale")))
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::PreconditionFailed);

        backend.delete("refs/tags/v1", &Condition::IfMatch(v1)).unwrap();
        assert!(backend.head("refs/tags/v1").unwrap_err().is_not_found());
        // Lock released.
        assert!(!td.path().join("refs/tags/v1.lock").exists());
    }
}
