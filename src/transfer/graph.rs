//! Git object-graph capability.
//!
//! Walking commits, building packs and splitting them apart is the job of a
//! git library; the transfer layer only needs the three operations below and
//! otherwise treats objects and packs as opaque bytes.

use std::sync::Arc;

use crate::{Oid, Result};

/// One object carried in a pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedObject {
    pub oid: Oid,
    pub data: Vec<u8>,
}

impl PackedObject {
    pub fn new(oid: Oid, data: Vec<u8>) -> Self {
        PackedObject { oid, data }
    }

    /// Payload length in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Operations on the git object graph consumed by fetch and push.
pub trait ObjectGraph: Send + Sync {
    /// Objects reachable from `want` but not from `have`, in the order they
    /// should be sent.
    fn compute_closure(&self, want: &[Oid], have: &[Oid]) -> Result<Vec<Oid>>;

    /// Bundle objects into a pack stream.
    fn build_pack(&self, objects: &[PackedObject]) -> Result<Vec<u8>>;

    /// Split a pack stream into its objects.
    fn unpack_objects(&self, pack: &[u8]) -> Result<Vec<PackedObject>>;
}

impl<T: ObjectGraph + ?Sized> ObjectGraph for Arc<T> {
    fn compute_closure(&self, want: &[Oid], have: &[Oid]) -> Result<Vec<Oid>> {
        (**self).compute_closure(want, have)
    }

    fn build_pack(&self, objects: &[PackedObject]) -> Result<Vec<u8>> {
        (**self).build_pack(objects)
    }

    fn unpack_objects(&self, pack: &[u8]) -> Result<Vec<PackedObject>> {
        (**self).unpack_objects(pack)
    }
}
