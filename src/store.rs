//! Content-addressed payload storage on top of a backend.
//!
//! The same store serves git objects, retained packs and LFS blobs; only the
//! [`KeyLayout`] differs.

use std::io::{self, Read};
use std::sync::Arc;

use tracing::debug;

use crate::backend::{Condition, ObjectBackend};
use crate::{Error, KeyLayout, Oid, Result};

/// A stored payload being streamed back.
///
/// The reader fails with `UnexpectedEof` if the backend delivers fewer bytes
/// than it announced, and with `InvalidData` if it delivers more.
pub struct ObjectReader {
    oid: Oid,
    size: u64,
    reader: SizedReader<Box<dyn Read + Send>>,
}

impl ObjectReader {
    /// Id of the payload.
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Size announced by the backend.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the whole payload into memory.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut content = Vec::with_capacity(self.size.min(64 * 1024 * 1024) as usize);
        match self.reader.read_to_end(&mut content) {
            Ok(_) => Ok(content),
            Err(e) if matches!(e.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData) => {
                Err(Error::SizeMismatch {
                    oid: self.oid.to_string(),
                    expected: self.size,
                    actual: self.reader.seen,
                })
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("oid", &self.oid)
            .field("size", &self.size)
            .finish()
    }
}

/// Get/put/verify of payloads addressed by object id.
///
/// This type is cheaply cloneable; clones share the backend.
#[derive(Clone)]
pub struct ContentStore {
    backend: Arc<dyn ObjectBackend>,
    layout: KeyLayout,
}

impl ContentStore {
    /// Create a store writing through `backend` with the given key layout.
    pub fn new(backend: Arc<dyn ObjectBackend>, layout: KeyLayout) -> Self {
        ContentStore { backend, layout }
    }

    /// The key layout in use.
    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Open a payload for reading.
    ///
    /// With `expected_size`, a stored object of any other length is reported
    /// as [`Error::SizeMismatch`] before any byte is returned.
    pub fn get(&self, oid: &Oid, expected_size: Option<u64>) -> Result<ObjectReader> {
        let key = self.layout.to_key(oid);
        debug!(%oid, key = %key, "get object");

        let body = self
            .backend
            .get(&key)
            .map_err(|e| Error::from_backend(e, oid.as_str()))?;

        if let Some(expected) = expected_size {
            if body.meta.size != expected {
                return Err(Error::SizeMismatch {
                    oid: oid.to_string(),
                    expected,
                    actual: body.meta.size,
                });
            }
        }

        Ok(ObjectReader {
            oid: oid.clone(),
            size: body.meta.size,
            reader: SizedReader::new(body.reader, body.meta.size),
        })
    }

    /// Read a whole payload.
    pub fn get_bytes(&self, oid: &Oid, expected_size: Option<u64>) -> Result<Vec<u8>> {
        self.get(oid, expected_size)?.into_bytes()
    }

    /// Stream exactly `size` bytes from `body` into the store.
    ///
    /// A body of any other length fails with [`Error::SizeMismatch`]; the
    /// backend never exposes a partial object.
    pub fn put(&self, oid: &Oid, size: u64, body: &mut dyn Read) -> Result<()> {
        let key = self.layout.to_key(oid);
        debug!(%oid, key = %key, size, "put object");

        let mut counted = SizedReader::unchecked(body);
        let result = self.backend.put(&key, &mut counted, size, &Condition::None);
        // A backend that failed before draining the body reports its own error.
        let short = counted.ended && counted.seen < size;
        if counted.seen > size || (result.is_err() && short) {
            return Err(Error::SizeMismatch {
                oid: oid.to_string(),
                expected: size,
                actual: counted.seen,
            });
        }
        result.map_err(|e| Error::from_backend(e, oid.as_str()))?;
        Ok(())
    }

    /// Store an in-memory payload.
    pub fn put_bytes(&self, oid: &Oid, content: &[u8]) -> Result<()> {
        self.put(oid, content.len() as u64, &mut &content[..])
    }

    /// Size of the stored payload, `None` if absent.
    ///
    /// Only absence maps to `None`; denied access and other failures are
    /// errors.
    pub fn stat(&self, oid: &Oid) -> Result<Option<u64>> {
        let key = self.layout.to_key(oid);
        match self.backend.head(&key) {
            Ok(meta) => Ok(Some(meta.size)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(Error::Backend(e)),
        }
    }

    /// Whether an object exists with exactly `expected_size` bytes.
    ///
    /// `false` both when absent and when present with another size.
    pub fn exists(&self, oid: &Oid, expected_size: u64) -> Result<bool> {
        Ok(self.stat(oid)? == Some(expected_size))
    }

    /// Whether an object exists at all.
    pub fn contains(&self, oid: &Oid) -> Result<bool> {
        Ok(self.stat(oid)?.is_some())
    }
}

/// Reader that counts bytes and, when checked, enforces an exact length.
struct SizedReader<R> {
    inner: R,
    expected: Option<u64>,
    seen: u64,
    /// The inner reader reported end of stream.
    ended: bool,
}

impl<R: Read> SizedReader<R> {
    fn new(inner: R, expected: u64) -> Self {
        SizedReader {
            inner,
            expected: Some(expected),
            seen: 0,
            ended: false,
        }
    }

    fn unchecked(inner: R) -> Self {
        SizedReader {
            inner,
            expected: None,
            seen: 0,
            ended: false,
        }
    }
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.seen += n as u64;
        if n == 0 && !buf.is_empty() {
            self.ended = true;
        }

        if let Some(expected) = self.expected {
            if self.seen > expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("stream exceeded announced size of {} bytes", expected),
                ));
            }
            if n == 0 && !buf.is_empty() && self.seen < expected {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {} of {} bytes", self.seen, expected),
                ));
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn store() -> (Arc<MemoryBackend>, ContentStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = ContentStore::new(backend.clone(), KeyLayout::git_objects("repo"));
        (backend, store)
    }

    #[test]
    fn test_put_get() {
        let (backend, store) = store();
        let content = b"Hello, World!";
        let oid = Oid::from_content(content);

        store.put_bytes(&oid, content).unwrap();
        assert!(backend.contains_key(&store.layout().to_key(&oid)));

        let reader = store.get(&oid, Some(13)).unwrap();
        assert_eq!(reader.size(), 13);
        assert_eq!(reader.into_bytes().unwrap(), content);
    }

    #[test]
    fn test_size_mismatch_on_get() {
        let (_, store) = store();
        let oid = Oid::from_content(b"twelve bytes");
        store.put_bytes(&oid, b"twelve bytes").unwrap();

        let err = store.get(&oid, Some(10)).unwrap_err();
        assert!(matches!(
            err,
            Error::SizeMismatch { expected: 10, actual: 12, .. }
        ));
    }

    #[test]
    fn test_short_body_on_put() {
        let (backend, store) = store();
        let oid = Oid::from_hex("deadbeef").unwrap();

        let err = store.put(&oid, 10, &mut &b"abc"[..]).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 10, actual: 3, .. }));
        assert!(backend.is_empty());
    }

    #[test]
    fn test_long_body_on_put() {
        let (backend, store) = store();
        let oid = Oid::from_hex("deadbeef").unwrap();

        let err = store.put(&oid, 2, &mut &b"abc"[..]).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 2, .. }));
        assert!(backend.is_empty());
    }

    #[test]
    fn test_zero_length_declared_for_nonempty_body() {
        let (backend, store) = store();
        let oid = Oid::from_hex("deadbeef").unwrap();

        let err = store.put(&oid, 0, &mut &b"abc"[..]).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 0, .. }));
        assert!(backend.is_empty());
    }

    #[test]
    fn test_exists_and_contains() {
        let (_, store) = store();
        let oid = Oid::from_content(b"abc");
        assert!(!store.exists(&oid, 3).unwrap());
        assert!(!store.contains(&oid).unwrap());

        store.put_bytes(&oid, b"abc").unwrap();
        assert!(store.exists(&oid, 3).unwrap());
        assert!(!store.exists(&oid, 4).unwrap());
        assert!(store.contains(&oid).unwrap());
    }

    #[test]
    fn test_truncated_stream_detected() {
        let mut reader = SizedReader::new(&b"abc"[..], 5);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_overlong_stream_detected() {
        let mut reader = SizedReader::new(&b"abcdef"[..], 5);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
