//! Storage backend capability.
//!
//! A backend is a flat key/value object store: whole-object get, put and
//! delete, a metadata-only head, and conditional writes keyed by an opaque
//! version token. There is no listing and no multi-key transaction; every
//! coordination between writers goes through [`Condition`].

mod fs;
mod http;
mod memory;

pub use fs::FsBackend;
pub use http::HttpBackend;
pub use memory::MemoryBackend;

use std::fmt;
use std::io::Read;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BackendError, BackendErrorKind, BackendResult};

/// Opaque version of a stored object (an ETag on HTTP backends).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionToken(String);

impl VersionToken {
    /// Wrap a backend-provided token.
    pub fn new(token: impl Into<String>) -> Self {
        VersionToken(token.into())
    }

    /// Token derived from the stored bytes.
    pub fn of_content(content: &[u8]) -> Self {
        VersionToken(hex::encode(Sha256::digest(content)))
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata returned by `head`, and alongside every `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Stored length in bytes.
    pub size: u64,
    /// Current version of the object.
    pub version: VersionToken,
}

/// Precondition attached to a write or delete.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Condition {
    /// Apply unconditionally.
    #[default]
    None,
    /// Only if no object exists at the key.
    IfAbsent,
    /// Only if the stored object still carries this version.
    IfMatch(VersionToken),
}

impl Condition {
    /// Check the precondition against what is currently stored.
    ///
    /// `IfMatch` against a missing key reports `NotFound` so callers can tell
    /// a vanished object from a replaced one.
    pub fn check(&self, key: &str, current: Option<&VersionToken>) -> BackendResult<()> {
        match (self, current) {
            (Condition::None, _) => Ok(()),
            (Condition::IfAbsent, None) => Ok(()),
            (Condition::IfAbsent, Some(_)) => Err(BackendError::precondition_failed(key)),
            (Condition::IfMatch(_), None) => Err(BackendError::not_found(key)),
            (Condition::IfMatch(expected), Some(actual)) if expected == actual => Ok(()),
            (Condition::IfMatch(_), Some(_)) => Err(BackendError::precondition_failed(key)),
        }
    }
}

/// A stored object being read.
pub struct ObjectBody {
    /// Size and version as reported by the backend.
    pub meta: ObjectMeta,
    /// The payload.
    pub reader: Box<dyn Read + Send>,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody").field("meta", &self.meta).finish()
    }
}

/// Trait for object storage backends.
///
/// Implementations include in-memory, local directory and HTTP storage.
pub trait ObjectBackend: Send + Sync {
    /// Read a whole object.
    fn get(&self, key: &str) -> BackendResult<ObjectBody>;

    /// Read an object's metadata without its payload.
    fn head(&self, key: &str) -> BackendResult<ObjectMeta>;

    /// Store exactly `len` bytes from `body` at `key`.
    ///
    /// A body that ends early or runs past `len` is rejected. The object must
    /// never be visible half written.
    fn put(
        &self,
        key: &str,
        body: &mut dyn Read,
        len: u64,
        condition: &Condition,
    ) -> BackendResult<VersionToken>;

    /// Remove an object.
    fn delete(&self, key: &str, condition: &Condition) -> BackendResult<()>;
}

// Implement ObjectBackend for Arc<T> where T: ObjectBackend
impl<T: ObjectBackend + ?Sized> ObjectBackend for Arc<T> {
    fn get(&self, key: &str) -> BackendResult<ObjectBody> {
        (**self).get(key)
    }

    fn head(&self, key: &str) -> BackendResult<ObjectMeta> {
        (**self).head(key)
    }

    fn put(
        &self,
        key: &str,
        body: &mut dyn Read,
        len: u64,
        condition: &Condition,
    ) -> BackendResult<VersionToken> {
        (**self).put(key, body, len, condition)
    }

    fn delete(&self, key: &str, condition: &Condition) -> BackendResult<()> {
        (**self).delete(key, condition)
    }
}

/// Read a body that must be exactly `len` bytes long.
pub(crate) fn read_declared(key: &str, body: &mut dyn Read, len: u64) -> BackendResult<Vec<u8>> {
    let mut data = Vec::with_capacity(len.min(16 * 1024 * 1024) as usize);
    body.take(len.saturating_add(1)).read_to_end(&mut data)?;
    check_declared(key, data.len() as u64, len)?;
    Ok(data)
}

/// Reject a body whose length differs from the declared one.
pub(crate) fn check_declared(key: &str, actual: u64, declared: u64) -> BackendResult<()> {
    if actual == declared {
        return Ok(());
    }
    Err(BackendError::new(
        BackendErrorKind::Other,
        format!(
            "{}: body length {}{} does not match declared length {}",
            key,
            actual,
            if actual > declared { "+" } else { "" },
            declared
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_check() {
        let v1 = VersionToken::new("v1");
        let v2 = VersionToken::new("v2");

        assert!(Condition::None.check("k", None).is_ok());
        assert!(Condition::IfAbsent.check("k", None).is_ok());
        assert_eq!(
            Condition::IfAbsent.check("k", Some(&v1)).unwrap_err().kind,
            BackendErrorKind::PreconditionFailed
        );
        assert!(Condition::IfMatch(v1.clone()).check("k", Some(&v1)).is_ok());
        assert_eq!(
            Condition::IfMatch(v1.clone()).check("k", Some(&v2)).unwrap_err().kind,
            BackendErrorKind::PreconditionFailed
        );
        assert!(Condition::IfMatch(v1).check("k", None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_read_declared() {
        let data = b"0123456789";
        assert_eq!(read_declared("k", &mut &data[..], 10).unwrap(), data);
        assert!(read_declared("k", &mut &data[..], 11).is_err());
        assert!(read_declared("k", &mut &data[..], 9).is_err());
    }

    #[test]
    fn test_version_of_content() {
        assert_eq!(VersionToken::of_content(b"a"), VersionToken::of_content(b"a"));
        assert_ne!(VersionToken::of_content(b"a"), VersionToken::of_content(b"b"));
    }
}
