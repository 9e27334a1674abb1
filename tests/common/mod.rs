//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;

use git_remote_bucket::{
    BackendError, BackendErrorKind, BackendResult, Condition, Error, MemoryBackend, ObjectBackend,
    ObjectBody, ObjectGraph, ObjectMeta, Oid, PackedObject, Result, VersionToken,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Object graph over explicit parent links. Packs are JSON.
#[derive(Default)]
pub struct FakeGraph {
    parents: RwLock<HashMap<Oid, Vec<Oid>>>,
}

#[derive(Serialize, Deserialize)]
struct PackEntry {
    oid: String,
    data: Vec<u8>,
}

impl FakeGraph {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeGraph::default())
    }

    /// Register an object with its parents and return it ready for packing.
    pub fn commit(&self, content: &str, parents: &[&PackedObject]) -> PackedObject {
        let data = content.as_bytes().to_vec();
        let oid = Oid::from_content(&data);
        self.parents
            .write()
            .insert(oid.clone(), parents.iter().map(|p| p.oid.clone()).collect());
        PackedObject::new(oid, data)
    }

    fn reachable(&self, from: &[Oid]) -> HashSet<Oid> {
        let parents = self.parents.read();
        let mut seen = HashSet::new();
        let mut stack: Vec<Oid> = from.to_vec();
        while let Some(oid) = stack.pop() {
            if seen.insert(oid.clone()) {
                if let Some(ps) = parents.get(&oid) {
                    stack.extend(ps.iter().cloned());
                }
            }
        }
        seen
    }

    fn visit(&self, oid: &Oid, exclude: &HashSet<Oid>, seen: &mut HashSet<Oid>, out: &mut Vec<Oid>) {
        if exclude.contains(oid) || !seen.insert(oid.clone()) {
            return;
        }
        let parents = self.parents.read().get(oid).cloned().unwrap_or_default();
        for parent in &parents {
            self.visit(parent, exclude, seen, out);
        }
        out.push(oid.clone());
    }
}

impl ObjectGraph for FakeGraph {
    fn compute_closure(&self, want: &[Oid], have: &[Oid]) -> Result<Vec<Oid>> {
        let exclude = self.reachable(have);
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for oid in want {
            self.visit(oid, &exclude, &mut seen, &mut out);
        }
        Ok(out)
    }

    fn build_pack(&self, objects: &[PackedObject]) -> Result<Vec<u8>> {
        let entries: Vec<PackEntry> = objects
            .iter()
            .map(|o| PackEntry {
                oid: o.oid.to_string(),
                data: o.data.clone(),
            })
            .collect();
        Ok(serde_json::to_vec(&entries)?)
    }

    fn unpack_objects(&self, pack: &[u8]) -> Result<Vec<PackedObject>> {
        let entries: Vec<PackEntry> =
            serde_json::from_slice(pack).map_err(|e| Error::Graph(e.to_string()))?;
        entries
            .into_iter()
            .map(|e| Ok(PackedObject::new(Oid::from_hex(&e.oid)?, e.data)))
            .collect()
    }
}

/// Build a pack the way a client would.
pub fn pack(graph: &FakeGraph, objects: &[&PackedObject]) -> Vec<u8> {
    let owned: Vec<PackedObject> = objects.iter().map(|o| (*o).clone()).collect();
    graph.build_pack(&owned).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Head,
    Put,
    Delete,
}

struct Fault {
    op: Op,
    key_part: String,
    kind: BackendErrorKind,
    /// Perform the call, then report the failure anyway.
    after_commit: bool,
}

/// Memory backend with injectable failures, matched by key substring.
#[derive(Default)]
pub struct FaultyBackend {
    inner: MemoryBackend,
    faults: Mutex<Vec<Fault>>,
}

impl FaultyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(FaultyBackend::default())
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Fail matching calls without performing them.
    pub fn fail(&self, op: Op, key_part: &str, kind: BackendErrorKind) {
        self.faults.lock().push(Fault {
            op,
            key_part: key_part.to_string(),
            kind,
            after_commit: false,
        });
    }

    /// Perform matching calls, then report a failure.
    pub fn fail_after_commit(&self, op: Op, key_part: &str, kind: BackendErrorKind) {
        self.faults.lock().push(Fault {
            op,
            key_part: key_part.to_string(),
            kind,
            after_commit: true,
        });
    }

    pub fn clear(&self) {
        self.faults.lock().clear();
    }

    fn fault(&self, op: Op, key: &str) -> Option<(BackendErrorKind, bool)> {
        self.faults
            .lock()
            .iter()
            .find(|f| f.op == op && key.contains(&f.key_part))
            .map(|f| (f.kind, f.after_commit))
    }

    fn injected(kind: BackendErrorKind, key: &str) -> BackendError {
        BackendError::new(kind, format!("injected failure on {}", key))
    }
}

impl ObjectBackend for FaultyBackend {
    fn get(&self, key: &str) -> BackendResult<ObjectBody> {
        match self.fault(Op::Get, key) {
            Some((kind, _)) => Err(Self::injected(kind, key)),
            None => self.inner.get(key),
        }
    }

    fn head(&self, key: &str) -> BackendResult<ObjectMeta> {
        match self.fault(Op::Head, key) {
            Some((kind, _)) => Err(Self::injected(kind, key)),
            None => self.inner.head(key),
        }
    }

    fn put(
        &self,
        key: &str,
        body: &mut dyn Read,
        len: u64,
        condition: &Condition,
    ) -> BackendResult<VersionToken> {
        match self.fault(Op::Put, key) {
            Some((kind, true)) => {
                self.inner.put(key, body, len, condition)?;
                Err(Self::injected(kind, key))
            }
            Some((kind, false)) => Err(Self::injected(kind, key)),
            None => self.inner.put(key, body, len, condition),
        }
    }

    fn delete(&self, key: &str, condition: &Condition) -> BackendResult<()> {
        match self.fault(Op::Delete, key) {
            Some((kind, true)) => {
                self.inner.delete(key, condition)?;
                Err(Self::injected(kind, key))
            }
            Some((kind, false)) => Err(Self::injected(kind, key)),
            None => self.inner.delete(key, condition),
        }
    }
}
