//! # git-remote-bucket
//!
//! A git remote and Git LFS content store living in a flat object-storage
//! bucket.
//!
//! This crate provides:
//! - A partitioned key layout shared by git objects and LFS blobs
//! - A content store with declared-length writes and size-checked reads
//! - Refs stored as small objects, updated by compare-and-swap
//! - Fetch and push with per-ref status reporting and an all-or-nothing mode
//! - An LFS endpoint with batch evaluation
//! - Memory, local directory and HTTP (S3-style) backends
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use git_remote_bucket::{FsBackend, LfsEndpoint, Oid};
//!
//! let backend = Arc::new(FsBackend::new("/srv/bucket"));
//! let lfs = LfsEndpoint::new(backend);
//!
//! let content = b"Hello, this is a large file";
//! let oid = Oid::from_content(content);
//! lfs.upload(&oid, content.len() as u64, &mut &content[..]).unwrap();
//!
//! assert!(lfs.verify(&oid, content.len() as u64).unwrap());
//! let downloaded = lfs.get_bytes(&oid, content.len() as u64).unwrap();
//! assert_eq!(downloaded, content);
//! ```

mod backend;
mod config;
mod error;
mod layout;
mod lfs;
mod oid;
mod refs;
mod store;
mod transfer;

pub use backend::{
    Condition, FsBackend, HttpBackend, MemoryBackend, ObjectBackend, ObjectBody, ObjectMeta,
    VersionToken,
};
pub use config::{Config, HttpConfig, PackStorage, TransferConfig};
pub use error::{BackendError, BackendErrorKind, BackendResult, Error, Result};
pub use layout::{KeyLayout, GIT_OBJECTS_DIR, LFS_OBJECTS_PREFIX};
pub use lfs::{
    Action, BatchError, BatchObject, BatchRequest, BatchRequestObject, BatchResponse, LfsEndpoint,
    Operation, RefInfo, UploadOutcome,
};
pub use oid::{Oid, MIN_OID_LEN};
pub use refs::{validate_ref_name, RefIter, RefRecord, RefStore};
pub use store::{ContentStore, ObjectReader};
pub use transfer::{
    Advertisement, CancellationToken, FetchOutcome, FetchRequest, ObjectGraph, PackTransfer,
    PackedObject, PushReport, PushRequest, RefStatus, RefUpdate, TransferState,
};
