//! In-memory backend, for tests and single-process use.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{read_declared, Condition, ObjectBackend, ObjectBody, ObjectMeta, VersionToken};
use crate::error::{BackendError, BackendResult};

struct StoredObject {
    data: Arc<Vec<u8>>,
    version: VersionToken,
}

/// A bucket held in process memory.
///
/// Versions are content hashes, so rewriting identical bytes keeps the
/// token. Callers that need every write to be distinguishable must vary the
/// payload (refs carry a version counter for that reason).
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryBackend {
    /// Create an empty bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether a key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }
}

impl ObjectBackend for MemoryBackend {
    fn get(&self, key: &str) -> BackendResult<ObjectBody> {
        let objects = self.objects.read();
        let stored = objects.get(key).ok_or_else(|| BackendError::not_found(key))?;
        let meta = ObjectMeta {
            size: stored.data.len() as u64,
            version: stored.version.clone(),
        };
        let reader: Box<dyn Read + Send> = Box::new(Cursor::new(SharedBytes(stored.data.clone())));
        Ok(ObjectBody { meta, reader })
    }

    fn head(&self, key: &str) -> BackendResult<ObjectMeta> {
        self.objects
            .read()
            .get(key)
            .map(|stored| ObjectMeta {
                size: stored.data.len() as u64,
                version: stored.version.clone(),
            })
            .ok_or_else(|| BackendError::not_found(key))
    }

    fn put(
        &self,
        key: &str,
        body: &mut dyn Read,
        len: u64,
        condition: &Condition,
    ) -> BackendResult<VersionToken> {
        // Drain the body before taking the lock.
        let data = read_declared(key, body, len)?;
        let version = VersionToken::of_content(&data);

        let mut objects = self.objects.write();
        condition.check(key, objects.get(key).map(|stored| &stored.version))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data: Arc::new(data),
                version: version.clone(),
            },
        );
        debug!(key, len, "memory put");
        Ok(version)
    }

    fn delete(&self, key: &str, condition: &Condition) -> BackendResult<()> {
        let mut objects = self.objects.write();
        let current = objects
            .get(key)
            .map(|stored| &stored.version)
            .ok_or_else(|| BackendError::not_found(key))?;
        condition.check(key, Some(current))?;
        objects.remove(key);
        debug!(key, "memory delete");
        Ok(())
    }
}

/// Cheap clone of stored bytes for readers that outlive the lock.
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
