//! Git LFS content endpoint.
//!
//! Protocol-level get/put/verify of LFS blobs over a [`ContentStore`] using
//! the root-less `lfs/objects/aa/bb/<oid>` layout, plus evaluation of LFS
//! Batch API requests. No HTTP is spoken here; a front end translates these
//! calls to and from the wire.
//!
//! Absence and storage failure are kept apart everywhere: a missing object
//! is [`Error::NotFound`], a storage failure is [`Error::Remote`]. Clients
//! retry the latter and give up on the former. Nothing here retries.
//!
//! See: https://github.com/git-lfs/git-lfs/blob/main/docs/api/batch.md

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::ObjectBackend;
use crate::error::BackendErrorKind;
use crate::store::ObjectReader;
use crate::{ContentStore, Error, KeyLayout, Oid, Result};

/// Operation type for batch requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Download objects from the server.
    Download,
    /// Upload objects to the server.
    Upload,
}

/// A batch request from an LFS client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// The operation to perform.
    pub operation: Operation,
    /// The transfer adapters the client supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfers: Option<Vec<String>>,
    /// Reference information (branch, etc).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<RefInfo>,
    /// The objects to operate on.
    pub objects: Vec<BatchRequestObject>,
}

/// Reference information for a batch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefInfo {
    /// The reference name (e.g., "refs/heads/main").
    pub name: String,
}

/// An object in a batch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequestObject {
    /// The SHA256 OID of the object.
    pub oid: String,
    /// The size of the object in bytes.
    pub size: u64,
}

/// The endpoint's answer to a batch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// The transfer adapter to use.
    #[serde(default = "default_transfer")]
    pub transfer: String,
    /// One entry per requested object, in request order.
    pub objects: Vec<BatchObject>,
}

fn default_transfer() -> String {
    "basic".to_string()
}

/// An object in a batch response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchObject {
    pub oid: String,
    pub size: u64,
    /// Actions the client should take. An upload entry without actions means
    /// the object is already stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<HashMap<String, Action>>,
    /// Why this object cannot be served.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchError>,
}

/// Where the client should send or fetch the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Storage key of the object; the front end turns it into a URL.
    pub href: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, String>,
}

/// Error information for a batch object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchError {
    /// HTTP status code.
    pub code: u16,
    pub message: String,
}

impl BatchRequest {
    /// Create a new batch request for downloading objects.
    pub fn download(objects: Vec<BatchRequestObject>) -> Self {
        BatchRequest {
            operation: Operation::Download,
            transfers: Some(vec!["basic".to_string()]),
            r#ref: None,
            objects,
        }
    }

    /// Create a new batch request for uploading objects.
    pub fn upload(objects: Vec<BatchRequestObject>) -> Self {
        BatchRequest {
            operation: Operation::Upload,
            transfers: Some(vec!["basic".to_string()]),
            r#ref: None,
            objects,
        }
    }

    /// Set the reference for this request.
    pub fn with_ref(mut self, name: &str) -> Self {
        self.r#ref = Some(RefInfo {
            name: name.to_string(),
        });
        self
    }
}

impl BatchRequestObject {
    /// Create a new batch request object.
    pub fn new(oid: &str, size: u64) -> Self {
        BatchRequestObject {
            oid: oid.to_string(),
            size,
        }
    }
}

impl BatchObject {
    /// Get the download action if available.
    pub fn download_action(&self) -> Option<&Action> {
        self.actions.as_ref()?.get("download")
    }

    /// Get the upload action if available.
    pub fn upload_action(&self) -> Option<&Action> {
        self.actions.as_ref()?.get("upload")
    }

    /// Check if this object has an error.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

impl BatchError {
    /// LFS batch code for a failed object.
    fn from_error(err: &Error) -> Self {
        let code = match err {
            Error::NotFound(_) => 404,
            Error::SizeMismatch { .. } | Error::InvalidIdentifier(_) => 422,
            Error::Remote(e) | Error::Backend(e) => match e.kind {
                BackendErrorKind::AccessDenied => 403,
                BackendErrorKind::Throttled => 429,
                _ => 500,
            },
            _ => 500,
        };
        BatchError {
            code,
            message: err.to_string(),
        }
    }
}

/// Result of an idempotent upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Stored,
    /// An object with this id and size was already present; nothing written.
    AlreadyPresent,
}

/// LFS blob storage.
#[derive(Clone)]
pub struct LfsEndpoint {
    store: ContentStore,
}

impl LfsEndpoint {
    /// Create an endpoint storing blobs under `lfs/objects/` in `backend`.
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        LfsEndpoint {
            store: ContentStore::new(backend, KeyLayout::lfs()),
        }
    }

    /// The underlying content store.
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Open a blob that must be exactly `size` bytes.
    pub fn get(&self, oid: &Oid, size: u64) -> Result<ObjectReader> {
        debug!(%oid, size, "lfs get");
        self.store.get(oid, Some(size)).map_err(remote)
    }

    /// Read a whole blob.
    pub fn get_bytes(&self, oid: &Oid, size: u64) -> Result<Vec<u8>> {
        self.get(oid, size)?.into_bytes().map_err(remote)
    }

    /// Stream a blob into `out`, reporting `(bytes_so_far, bytes_since_last)`
    /// after every chunk. Returns the number of bytes written.
    pub fn get_with_progress<W, F>(&self, oid: &Oid, size: u64, out: &mut W, progress: F) -> Result<u64>
    where
        W: Write + ?Sized,
        F: FnMut(u64, u64),
    {
        let mut reader = ProgressReader::new(self.get(oid, size)?, progress);
        match io::copy(&mut reader, out) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData) => {
                Err(Error::SizeMismatch {
                    oid: oid.to_string(),
                    expected: size,
                    actual: reader.total,
                })
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Store a blob of exactly `size` bytes.
    pub fn put(&self, oid: &Oid, size: u64, body: &mut dyn Read) -> Result<()> {
        debug!(%oid, size, "lfs put");
        self.store.put(oid, size, body).map_err(remote)
    }

    /// Store a blob, reporting progress as the body is consumed.
    pub fn put_with_progress<F>(&self, oid: &Oid, size: u64, body: &mut dyn Read, progress: F) -> Result<()>
    where
        F: FnMut(u64, u64),
    {
        let mut reader = ProgressReader::new(body, progress);
        self.put(oid, size, &mut reader)
    }

    /// Store a blob unless it is already present with the same size.
    pub fn upload(&self, oid: &Oid, size: u64, body: &mut dyn Read) -> Result<UploadOutcome> {
        if self.verify(oid, size)? {
            debug!(%oid, size, "lfs object already present");
            return Ok(UploadOutcome::AlreadyPresent);
        }
        self.put(oid, size, body)?;
        info!(%oid, size, "lfs object stored");
        Ok(UploadOutcome::Stored)
    }

    /// Whether the blob exists with exactly `size` bytes.
    ///
    /// `false` for a missing blob and for one of another size; storage
    /// failures (including denied access) are errors, never `false`.
    pub fn verify(&self, oid: &Oid, size: u64) -> Result<bool> {
        self.store.exists(oid, size).map_err(remote)
    }

    /// Answer a batch request; every object is judged on its own and a
    /// failure is recorded on that object only.
    pub fn batch(&self, request: &BatchRequest) -> BatchResponse {
        let objects: Vec<BatchObject> = request
            .objects
            .par_iter()
            .map(|object| self.batch_object(request.operation, object))
            .collect();

        let failed = objects.iter().filter(|o| o.has_error()).count();
        info!(
            operation = ?request.operation,
            objects = objects.len(),
            failed,
            "lfs batch"
        );
        BatchResponse {
            transfer: default_transfer(),
            objects,
        }
    }

    fn batch_object(&self, operation: Operation, object: &BatchRequestObject) -> BatchObject {
        let mut entry = BatchObject {
            oid: object.oid.clone(),
            size: object.size,
            actions: None,
            error: None,
        };

        let result = Oid::from_hex(&object.oid).and_then(|oid| {
            let present = self.verify(&oid, object.size)?;
            match (operation, present) {
                (Operation::Download, true) => Ok(Some(("download", oid))),
                (Operation::Download, false) => match self.store.stat(&oid).map_err(remote)? {
                    Some(actual) => Err(Error::SizeMismatch {
                        oid: oid.to_string(),
                        expected: object.size,
                        actual,
                    }),
                    None => Err(Error::NotFound(oid.to_string())),
                },
                (Operation::Upload, true) => Ok(None),
                (Operation::Upload, false) => Ok(Some(("upload", oid))),
            }
        });

        match result {
            Ok(Some((action, oid))) => {
                let href = self.store.layout().to_key(&oid);
                entry.actions = Some(HashMap::from([(
                    action.to_string(),
                    Action {
                        href,
                        header: HashMap::new(),
                    },
                )]));
            }
            Ok(None) => {}
            Err(e) => {
                debug!(oid = %object.oid, error = %e, "lfs batch object failed");
                entry.error = Some(BatchError::from_error(&e));
            }
        }
        entry
    }
}

/// Backend failures are reported as remote errors at this layer.
fn remote(err: Error) -> Error {
    match err {
        Error::Backend(e) => Error::Remote(e),
        other => other,
    }
}

/// Reader that reports `(bytes_so_far, bytes_since_last)` after each read.
struct ProgressReader<R, F> {
    inner: R,
    progress: F,
    total: u64,
}

impl<R: Read, F: FnMut(u64, u64)> ProgressReader<R, F> {
    fn new(inner: R, progress: F) -> Self {
        ProgressReader {
            inner,
            progress,
            total: 0,
        }
    }
}

impl<R: Read, F: FnMut(u64, u64)> Read for ProgressReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.total += n as u64;
            (self.progress)(self.total, n as u64);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_request_roundtrip_names() {
        let request = BatchRequest::upload(vec![BatchRequestObject::new("abc123", 1024)])
            .with_ref("refs/heads/main");

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"operation\":\"upload\""));
        assert!(json.contains("\"ref\":{\"name\":\"refs/heads/main\"}"));
        assert!(json.contains("\"size\":1024"));
    }

    #[test]
    fn test_batch_request_deserialize() {
        let json = r#"{
            "operation": "download",
            "objects": [{"oid": "abc123", "size": 10}]
        }"#;
        let request: BatchRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.operation, Operation::Download);
        assert!(request.transfers.is_none());
        assert_eq!(request.objects[0].size, 10);
    }

    #[test]
    fn test_batch_response_with_error_serializes() {
        let response = BatchResponse {
            transfer: default_transfer(),
            objects: vec![BatchObject {
                oid: "abc123".into(),
                size: 1024,
                actions: None,
                error: Some(BatchError {
                    code: 404,
                    message: "Object not found".into(),
                }),
            }],
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"code\":404"));
        assert!(!json.contains("actions"));
    }

    #[test]
    fn test_batch_codes() {
        use crate::error::BackendError;

        let code = |e: Error| BatchError::from_error(&e).code;
        assert_eq!(code(Error::NotFound("x".into())), 404);
        assert_eq!(
            code(Error::SizeMismatch { oid: "x".into(), expected: 1, actual: 2 }),
            422
        );
        assert_eq!(
            code(Error::Remote(BackendError::new(BackendErrorKind::AccessDenied, "x"))),
            403
        );
        assert_eq!(
            code(Error::Remote(BackendError::new(BackendErrorKind::Throttled, "x"))),
            429
        );
        assert_eq!(
            code(Error::Remote(BackendError::new(BackendErrorKind::Other, "x"))),
            500
        );
    }

    #[test]
    fn test_progress_reader() {
        let mut events = Vec::new();
        {
            let mut reader = ProgressReader::new(&b"abcdef"[..], |so_far, since| events.push((so_far, since)));
            let mut buf = [0u8; 4];
            reader.read(&mut buf).unwrap();
            reader.read(&mut buf).unwrap();
            reader.read(&mut buf).unwrap();
        }
        assert_eq!(events, vec![(4, 4), (6, 2)]);
    }
}
