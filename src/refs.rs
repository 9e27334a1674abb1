//! Named refs stored as small objects, updated by compare-and-swap.
//!
//! Each ref lives at `<root>/<refname>` as a JSON body `{"oid", "version"}`.
//! The `version` counter changes on every write, so the backend's version
//! token never repeats for the same key even when the target oid does.
//!
//! The backend cannot list keys, so the set of ref names is kept in an index
//! object at `<root>/refs.index`. A name is added before its ref is created
//! and removed after the ref is deleted, but only while the ref object is
//! still absent; readers skip names whose ref object is gone. Every create
//! rewrites the index once more after its ref lands, so a delete racing it
//! loses its index swap and re-checks. Every live ref is therefore always
//! named in the index.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{Condition, ObjectBackend, VersionToken};
use crate::error::{BackendError, BackendErrorKind};
use crate::layout::join_key;
use crate::{Error, Oid, Result};

/// Key (below the root) of the ref-name index.
pub const INDEX_KEY: &str = "refs.index";

/// Key (below the root) of the remote HEAD.
pub const HEAD_KEY: &str = "HEAD";

/// Directory (below the root) holding protection markers.
pub const PROTECTED_DIR: &str = "protected";

const INDEX_RETRIES: usize = 16;

/// Validate a ref name according to git rules.
///
/// Only fully qualified names under `refs/` are accepted.
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRefName("empty ref name".into()));
    }

    if !name.starts_with("refs/") {
        return Err(Error::InvalidRefName(format!("{}: must start with refs/", name)));
    }

    if name.ends_with('/') {
        return Err(Error::InvalidRefName(format!("{}: cannot end with /", name)));
    }

    if name.contains("//") {
        return Err(Error::InvalidRefName(format!("{}: cannot contain //", name)));
    }

    if name.contains("..") {
        return Err(Error::InvalidRefName(format!("{}: cannot contain ..", name)));
    }

    for c in name.chars() {
        if c.is_control()
            || c == ' '
            || c == '~'
            || c == '^'
            || c == ':'
            || c == '?'
            || c == '*'
            || c == '['
            || c == '\\'
        {
            return Err(Error::InvalidRefName(format!("{}: invalid character {:?}", name, c)));
        }
    }

    if name.split('/').any(|component| component.starts_with('.')) {
        return Err(Error::InvalidRefName(format!("{}: component cannot start with .", name)));
    }

    if name.ends_with(".lock") {
        return Err(Error::InvalidRefName(format!("{}: cannot end with .lock", name)));
    }

    if name.contains("@{") {
        return Err(Error::InvalidRefName(format!("{}: cannot contain @{{", name)));
    }

    if name.ends_with('.') {
        return Err(Error::InvalidRefName(format!("{}: cannot end with .", name)));
    }

    Ok(())
}

/// A ref as currently stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    /// Fully qualified name, e.g. `refs/heads/main`.
    pub name: String,
    /// Target object.
    pub oid: Oid,
    /// Token to hand back to [`RefStore::compare_and_swap`] or [`RefStore::delete`].
    pub version: VersionToken,
}

#[derive(Debug, Serialize, Deserialize)]
struct RefBody {
    oid: Oid,
    version: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RefIndex {
    refs: BTreeSet<String>,
    /// Bumped on every write so the stored bytes never repeat.
    #[serde(default)]
    generation: u64,
}

/// List, read and compare-and-swap of refs below one repository root.
///
/// This type is cheaply cloneable; clones share the backend.
#[derive(Clone)]
pub struct RefStore {
    backend: Arc<dyn ObjectBackend>,
    root: String,
}

impl RefStore {
    /// Create a ref store for the repository at `root`.
    pub fn new(backend: Arc<dyn ObjectBackend>, root: &str) -> Self {
        RefStore {
            backend,
            root: root.trim_matches('/').to_string(),
        }
    }

    /// Repository root inside the bucket.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Storage key of a ref.
    pub fn ref_key(&self, name: &str) -> String {
        join_key(&self.root, name)
    }

    /// All refs under `prefix` (or all refs), sorted by name.
    ///
    /// Refs are read one at a time as the iterator advances.
    pub fn list(&self, prefix: Option<&str>) -> Result<RefIter> {
        let (index, _) = self.load_index()?;
        let names: Vec<String> = index
            .refs
            .into_iter()
            .filter(|name| prefix.map_or(true, |p| name.starts_with(p)))
            .collect();
        debug!(root = %self.root, count = names.len(), "list refs");
        Ok(RefIter {
            store: self.clone(),
            names: names.into_iter(),
        })
    }

    /// Read a ref, failing with [`Error::NotFound`] if it does not exist.
    pub fn read(&self, name: &str) -> Result<RefRecord> {
        self.try_read(name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Read a ref, `None` if it does not exist.
    pub fn try_read(&self, name: &str) -> Result<Option<RefRecord>> {
        validate_ref_name(name)?;
        Ok(self.read_body(name)?.map(|(body, version)| RefRecord {
            name: name.to_string(),
            oid: body.oid,
            version,
        }))
    }

    /// Point `name` at `new_oid` if its stored version is still `expected`.
    ///
    /// `expected = None` creates the ref and fails with [`Error::Conflict`]
    /// if it already exists. A missing ref with `Some(expected)` is
    /// [`Error::NotFound`]. Returns the version token of the new value.
    pub fn compare_and_swap(
        &self,
        name: &str,
        expected: Option<&VersionToken>,
        new_oid: &Oid,
    ) -> Result<VersionToken> {
        validate_ref_name(name)?;
        let key = self.ref_key(name);

        let (condition, generation) = match expected {
            None => {
                self.update_index(|refs| refs.insert(name.to_string()))?;
                (Condition::IfAbsent, fresh_generation())
            }
            Some(expected) => {
                let (current, version) = self
                    .read_body(name)?
                    .ok_or_else(|| Error::NotFound(name.to_string()))?;
                if &version != expected {
                    debug!(name, "stale version token");
                    return Err(Error::Conflict(name.to_string()));
                }
                (Condition::IfMatch(expected.clone()), current.version.wrapping_add(1))
            }
        };

        let body = serde_json::to_vec(&RefBody {
            oid: new_oid.clone(),
            version: generation,
        })?;
        debug!(name, oid = %new_oid, "compare-and-swap ref");

        let version = match self
            .backend
            .put(&key, &mut &body[..], body.len() as u64, &condition)
        {
            Ok(version) => version,
            Err(err) if err.kind == BackendErrorKind::Timeout => {
                self.resolve_swap_timeout(name, expected, new_oid, err)?
            }
            Err(err) => return Err(Error::from_backend(err, name)),
        };

        if expected.is_none() {
            let refresh = self.update_index(|refs| {
                refs.insert(name.to_string());
                true
            });
            if let Err(e) = refresh {
                warn!(name, error = %e, "ref created but index not refreshed");
            }
        }
        Ok(version)
    }

    /// Delete `name` if its stored version is still `expected`.
    pub fn delete(&self, name: &str, expected: &VersionToken) -> Result<()> {
        validate_ref_name(name)?;
        let key = self.ref_key(name);
        debug!(name, "delete ref");

        match self.backend.delete(&key, &Condition::IfMatch(expected.clone())) {
            Ok(()) => {}
            Err(err) if err.kind == BackendErrorKind::Timeout => {
                match self.read_body(name)? {
                    None => {}
                    Some((_, version)) if &version == expected => return Err(Error::Backend(err)),
                    Some(_) => return Err(Error::Conflict(name.to_string())),
                }
            }
            Err(err) => return Err(Error::from_backend(err, name)),
        }

        // A name left behind is harmless, readers skip absent refs.
        let removal = self.update_index(|refs| {
            refs.contains(name) && matches!(self.read_body(name), Ok(None)) && refs.remove(name)
        });
        if let Err(e) = removal {
            warn!(name, error = %e, "ref deleted but index not updated");
        }
        Ok(())
    }

    /// Target ref name of the remote HEAD, if set.
    pub fn head(&self) -> Result<Option<String>> {
        let key = join_key(&self.root, HEAD_KEY);
        match self.backend.get(&key) {
            Ok(mut body) => {
                let mut target = String::new();
                body.reader.read_to_string(&mut target)?;
                Ok(Some(target.trim().to_string()))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(Error::Backend(e)),
        }
    }

    /// Point the remote HEAD at `target`.
    pub fn set_head(&self, target: &str) -> Result<()> {
        validate_ref_name(target)?;
        self.write_head(target, &Condition::None)
            .map_err(Error::Backend)?;
        Ok(())
    }

    /// Point the remote HEAD at `target` unless a HEAD already exists.
    ///
    /// Returns whether HEAD was written.
    pub fn init_head(&self, target: &str) -> Result<bool> {
        validate_ref_name(target)?;
        match self.write_head(target, &Condition::IfAbsent) {
            Ok(()) => {
                debug!(target, "initialised remote HEAD");
                Ok(true)
            }
            Err(e) if e.kind == BackendErrorKind::PreconditionFailed => Ok(false),
            Err(e) => Err(Error::Backend(e)),
        }
    }

    fn write_head(&self, target: &str, condition: &Condition) -> std::result::Result<(), BackendError> {
        let key = join_key(&self.root, HEAD_KEY);
        self.backend
            .put(&key, &mut target.as_bytes(), target.len() as u64, condition)?;
        Ok(())
    }

    /// Mark a ref as protected against forced updates.
    pub fn protect(&self, name: &str) -> Result<()> {
        validate_ref_name(name)?;
        self.backend
            .put(&self.protected_key(name), &mut &b""[..], 0, &Condition::None)
            .map_err(Error::Backend)?;
        Ok(())
    }

    /// Remove a protection marker. Unprotected refs are left alone.
    pub fn unprotect(&self, name: &str) -> Result<()> {
        validate_ref_name(name)?;
        match self.backend.delete(&self.protected_key(name), &Condition::None) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Error::Backend(e)),
        }
    }

    /// Whether forced updates of `name` are refused.
    pub fn is_protected(&self, name: &str) -> Result<bool> {
        validate_ref_name(name)?;
        match self.backend.head(&self.protected_key(name)) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(Error::Backend(e)),
        }
    }

    fn protected_key(&self, name: &str) -> String {
        join_key(&join_key(&self.root, PROTECTED_DIR), name)
    }

    fn read_body(&self, name: &str) -> Result<Option<(RefBody, VersionToken)>> {
        let mut object = match self.backend.get(&self.ref_key(name)) {
            Ok(object) => object,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(Error::Backend(e)),
        };

        let mut raw = Vec::new();
        object.reader.read_to_end(&mut raw)?;
        let body: RefBody = serde_json::from_slice(&raw)
            .map_err(|e| Error::CorruptRemote(format!("ref {} is unreadable: {}", name, e)))?;
        Ok(Some((body, object.meta.version)))
    }

    /// The write timed out and may or may not have landed; look again.
    fn resolve_swap_timeout(
        &self,
        name: &str,
        expected: Option<&VersionToken>,
        new_oid: &Oid,
        err: BackendError,
    ) -> Result<VersionToken> {
        warn!(name, "compare-and-swap timed out, re-reading ref");
        match (self.read_body(name)?, expected) {
            (None, None) => Err(Error::Backend(err)),
            (None, Some(_)) => Err(Error::NotFound(name.to_string())),
            (Some((_, version)), Some(expected)) if &version == expected => Err(Error::Backend(err)),
            (Some((body, version)), _) if &body.oid == new_oid => Ok(version),
            (Some(_), _) => Err(Error::Conflict(name.to_string())),
        }
    }

    fn load_index(&self) -> Result<(RefIndex, Option<VersionToken>)> {
        let key = join_key(&self.root, INDEX_KEY);
        let mut object = match self.backend.get(&key) {
            Ok(object) => object,
            Err(e) if e.is_not_found() => return Ok((RefIndex::default(), None)),
            Err(e) => return Err(Error::Backend(e)),
        };

        let mut raw = Vec::new();
        object.reader.read_to_end(&mut raw)?;
        let index = serde_json::from_slice(&raw)
            .map_err(|e| Error::CorruptRemote(format!("ref index is unreadable: {}", e)))?;
        Ok((index, Some(object.meta.version)))
    }

    /// Apply `change` to the index under compare-and-swap, retrying on
    /// contention. `change` returns whether the index must be written.
    fn update_index<F>(&self, change: F) -> Result<()>
    where
        F: Fn(&mut BTreeSet<String>) -> bool,
    {
        let key = join_key(&self.root, INDEX_KEY);

        for attempt in 0..INDEX_RETRIES {
            let (mut index, version) = self.load_index()?;
            if !change(&mut index.refs) {
                return Ok(());
            }
            index.generation = index.generation.wrapping_add(1);

            let body = serde_json::to_vec(&index)?;
            let condition = match version {
                Some(version) => Condition::IfMatch(version),
                None => Condition::IfAbsent,
            };
            match self
                .backend
                .put(&key, &mut &body[..], body.len() as u64, &condition)
            {
                Ok(_) => return Ok(()),
                Err(e) if matches!(e.kind, BackendErrorKind::PreconditionFailed | BackendErrorKind::NotFound) => {
                    debug!(attempt, "ref index changed underneath us, retrying");
                }
                Err(e) => return Err(Error::Backend(e)),
            }
        }

        Err(Error::Conflict(key))
    }
}

/// Lazily reads the refs named by the index.
pub struct RefIter {
    store: RefStore,
    names: std::vec::IntoIter<String>,
}

impl Iterator for RefIter {
    type Item = Result<RefRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let name = self.names.next()?;
            match self.store.try_read(&name) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Starting counter for a newly created ref.
///
/// Taken from the clock so that a deleted and recreated ref does not
/// reproduce an earlier body.
fn fresh_generation() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(1)
}
