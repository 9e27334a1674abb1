//! Error types for git-remote-bucket operations.

use std::fmt;

use thiserror::Error;

/// Result type for git-remote-bucket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type returned by storage backends.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Failure categories a storage backend can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    /// No object exists at the key.
    NotFound,
    /// Credentials were rejected or lack permission.
    AccessDenied,
    /// The backend asked us to slow down.
    Throttled,
    /// A conditional write or delete did not match the stored version.
    PreconditionFailed,
    /// The call did not complete within its deadline.
    Timeout,
    /// Anything else (transport failures, malformed responses, ...).
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendErrorKind::NotFound => "not found",
            BackendErrorKind::AccessDenied => "access denied",
            BackendErrorKind::Throttled => "throttled",
            BackendErrorKind::PreconditionFailed => "precondition failed",
            BackendErrorKind::Timeout => "timed out",
            BackendErrorKind::Other => "backend failure",
        };
        f.write_str(name)
    }
}

/// An error reported by a storage backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct BackendError {
    /// What went wrong.
    pub kind: BackendErrorKind,
    /// Human readable detail, usually naming the key.
    pub message: String,
}

impl BackendError {
    /// Create a backend error.
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        BackendError {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a missing key.
    pub fn not_found(key: &str) -> Self {
        BackendError::new(BackendErrorKind::NotFound, key)
    }

    /// Shorthand for a lost conditional write.
    pub fn precondition_failed(key: &str) -> Self {
        BackendError::new(BackendErrorKind::PreconditionFailed, key)
    }

    /// Whether the object simply does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind == BackendErrorKind::NotFound
    }

    /// Whether the call may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::Throttled | BackendErrorKind::Timeout | BackendErrorKind::Other
        )
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::NotFound => BackendErrorKind::NotFound,
            ErrorKind::PermissionDenied => BackendErrorKind::AccessDenied,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => BackendErrorKind::Timeout,
            _ => BackendErrorKind::Other,
        };
        BackendError::new(kind, err.to_string())
    }
}

impl From<ureq::Error> for BackendError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, response) => {
                let kind = match code {
                    404 => BackendErrorKind::NotFound,
                    401 | 403 => BackendErrorKind::AccessDenied,
                    409 | 412 => BackendErrorKind::PreconditionFailed,
                    429 | 503 => BackendErrorKind::Throttled,
                    408 | 504 => BackendErrorKind::Timeout,
                    _ => BackendErrorKind::Other,
                };
                let url = response.get_url().to_string();
                let body = response.into_string().unwrap_or_default();
                let message = if body.trim().is_empty() {
                    format!("HTTP {} for {}", code, url)
                } else {
                    format!("HTTP {} for {}: {}", code, url, body.trim())
                };
                BackendError::new(kind, message)
            }
            ureq::Error::Transport(transport) => {
                let timed_out = std::error::Error::source(&transport)
                    .and_then(|source| source.downcast_ref::<std::io::Error>())
                    .map(|io| {
                        matches!(
                            io.kind(),
                            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                        )
                    })
                    .unwrap_or(false);
                let kind = if timed_out {
                    BackendErrorKind::Timeout
                } else {
                    BackendErrorKind::Other
                };
                BackendError::new(kind, transport.to_string())
            }
        }
    }
}

/// Errors that can occur while serving a repository from a bucket.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed object id.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Ref name rejected by git's naming rules.
    #[error("invalid ref name: {0}")]
    InvalidRefName(String),

    /// Object or ref absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency lost against another writer.
    #[error("version conflict on {0}")]
    Conflict(String),

    /// Declared and actual payload sizes disagree.
    #[error("size mismatch for {oid}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        oid: String,
        expected: u64,
        actual: u64,
    },

    /// A ref points at an object the store cannot produce.
    #[error("remote repository is corrupt: {0}")]
    CorruptRemote(String),

    /// Transient or permission failure from the storage backend.
    #[error("storage backend error: {0}")]
    Backend(#[source] BackendError),

    /// Backend failure as reported by the LFS endpoint.
    #[error("remote error: {0}")]
    Remote(#[source] BackendError),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Undoing an all-or-nothing push left a ref in an unknown state.
    #[error("rollback of {refname} failed: {reason}")]
    RollbackFailed { refname: String, reason: String },

    /// The object-graph capability failed.
    #[error("object graph error: {0}")]
    Graph(String),

    /// Configuration could not be used.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Lift a backend failure into the taxonomy, naming what was being accessed.
    ///
    /// Absence and lost preconditions get their own variants; everything else
    /// stays a `Backend` error.
    pub(crate) fn from_backend(err: BackendError, subject: &str) -> Self {
        match err.kind {
            BackendErrorKind::NotFound => Error::NotFound(subject.to_string()),
            BackendErrorKind::PreconditionFailed => Error::Conflict(subject.to_string()),
            _ => Error::Backend(err),
        }
    }

    /// Process exit code for a remote helper reporting this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotFound(_) => 2,
            Error::Conflict(_) => 3,
            Error::SizeMismatch { .. } => 4,
            Error::CorruptRemote(_) => 5,
            Error::Backend(_) => 6,
            Error::Remote(_) => 7,
            Error::RollbackFailed { .. } => 8,
            Error::Graph(_) => 9,
            Error::InvalidIdentifier(_) => 10,
            Error::InvalidRefName(_) => 11,
            Error::Config(_) | Error::Toml(_) | Error::UrlParse(_) => 12,
            Error::Cancelled => 130,
            Error::Io(_) | Error::Json(_) => 1,
        }
    }

    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Backend(err) | Error::Remote(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_backend_lifts_absence_and_conflict() {
        let err = Error::from_backend(BackendError::not_found("k"), "refs/heads/main");
        assert!(matches!(err, Error::NotFound(ref s) if s == "refs/heads/main"));

        let err = Error::from_backend(BackendError::precondition_failed("k"), "refs/heads/main");
        assert!(matches!(err, Error::Conflict(_)));

        let err = Error::from_backend(
            BackendError::new(BackendErrorKind::AccessDenied, "k"),
            "refs/heads/main",
        );
        assert!(matches!(err, Error::Backend(ref e) if e.kind == BackendErrorKind::AccessDenied));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Backend(BackendError::new(BackendErrorKind::Timeout, "x")).is_retryable());
        assert!(!Error::Backend(BackendError::new(BackendErrorKind::AccessDenied, "x")).is_retryable());
        assert!(!Error::CorruptRemote("x".into()).is_retryable());
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = vec![
            Error::NotFound(String::new()),
            Error::Conflict(String::new()),
            Error::SizeMismatch { oid: String::new(), expected: 1, actual: 2 },
            Error::CorruptRemote(String::new()),
            Error::Backend(BackendError::not_found("")),
            Error::Remote(BackendError::not_found("")),
            Error::RollbackFailed { refname: String::new(), reason: String::new() },
            Error::Graph(String::new()),
            Error::InvalidIdentifier(String::new()),
            Error::InvalidRefName(String::new()),
            Error::Cancelled,
        ];
        let codes: std::collections::HashSet<_> = errors.iter().map(|e| e.exit_code()).collect();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_io_error_kinds() {
        let err: BackendError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());

        let err: BackendError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err.kind, BackendErrorKind::Timeout);
    }
}
