//! Storage key layout.
//!
//! Objects are spread over two levels of two-character directories taken
//! from the front of their id, the same layout git-lfs uses locally:
//! `<prefix>/<oid[0:2]>/<oid[2:4]>/<oid>`. The layout is a persisted
//! convention; changing it orphans every repository already written.

use crate::{Oid, Result};

/// Namespace of git objects (and retained packs), below the repository root.
pub const GIT_OBJECTS_DIR: &str = "objects";

/// Namespace of LFS blobs. Shared by every repository in the bucket.
pub const LFS_OBJECTS_PREFIX: &str = "lfs/objects";

/// Maps object ids to partitioned storage keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    /// Layout rooted at an arbitrary key prefix.
    pub fn new(prefix: &str) -> Self {
        KeyLayout {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Git objects of the repository stored under `root`.
    pub fn git_objects(root: &str) -> Self {
        KeyLayout::new(&join_key(root, GIT_OBJECTS_DIR))
    }

    /// LFS blobs.
    pub fn lfs() -> Self {
        KeyLayout::new(LFS_OBJECTS_PREFIX)
    }

    /// The prefix every key of this layout starts with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Storage key of an object.
    pub fn to_key(&self, oid: &Oid) -> String {
        let (first, second) = oid.partition();
        let partitioned = format!("{}/{}/{}", first, second, oid);
        join_key(&self.prefix, &partitioned)
    }

    /// Storage key of a raw hex id, validating it first.
    pub fn key_for_hex(&self, hex: &str) -> Result<String> {
        Ok(self.to_key(&Oid::from_hex(hex)?))
    }
}

/// Join key segments with `/`, skipping empty ones.
pub(crate) fn join_key(prefix: &str, rest: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let rest = rest.trim_start_matches('/');
    if prefix.is_empty() {
        rest.to_string()
    } else {
        format!("{}/{}", prefix, rest)
    }
}
