//! HTTP object-store backend (S3-style REST: GET/HEAD/PUT/DELETE on keys).

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use super::{Condition, ObjectBackend, ObjectBody, ObjectMeta, VersionToken};
use crate::config::HttpConfig;
use crate::error::{BackendError, BackendErrorKind, BackendResult};
use crate::Result;

/// Default per-call deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("git-remote-bucket/", env!("CARGO_PKG_VERSION"));

/// Backend talking to an HTTP object store.
///
/// This type is cheaply cloneable - multiple clones share the same underlying
/// HTTP agent and configuration.
#[derive(Clone)]
pub struct HttpBackend {
    inner: Arc<HttpBackendInner>,
}

/// Authentication method for storage requests.
#[derive(Clone)]
enum Auth {
    /// Bearer token
    Bearer(String),
    /// Basic auth (username, password)
    Basic(String, String),
}

struct HttpBackendInner {
    /// Bucket URL; keys are joined onto it.
    base_url: Url,
    /// Optional authentication.
    auth: Option<Auth>,
    /// HTTP agent for making requests.
    agent: ureq::Agent,
    /// Deadline applied to every call.
    timeout: Duration,
}

impl HttpBackend {
    /// Create a backend for a bucket URL (e.g. `https://s3.example.com/my-bucket`).
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = normalize_base(Url::parse(base_url.trim())?);
        Ok(HttpBackend::with_url(base_url))
    }

    /// Create a backend from an already parsed URL.
    pub fn with_url(base_url: Url) -> Self {
        HttpBackend {
            inner: Arc::new(HttpBackendInner {
                base_url: normalize_base(base_url),
                auth: None,
                agent: build_agent(DEFAULT_TIMEOUT),
                timeout: DEFAULT_TIMEOUT,
            }),
        }
    }

    /// Create a backend from the `[http]` configuration section.
    pub fn from_config(config: &HttpConfig) -> Result<Self> {
        let mut backend =
            HttpBackend::new(&config.endpoint)?.with_timeout(Duration::from_secs(config.timeout_secs));
        if let Some(token) = &config.token {
            backend = backend.with_token(token);
        } else if let (Some(username), Some(password)) = (&config.username, &config.password) {
            backend = backend.with_auth(username, password);
        }
        Ok(backend)
    }

    /// Set the per-call deadline.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        HttpBackend {
            inner: Arc::new(HttpBackendInner {
                base_url: self.inner.base_url.clone(),
                auth: self.inner.auth.clone(),
                agent: build_agent(timeout),
                timeout,
            }),
        }
    }

    /// Set basic authentication credentials.
    pub fn with_auth(self, username: &str, password: &str) -> Self {
        self.with_credentials(Auth::Basic(username.to_string(), password.to_string()))
    }

    /// Set authentication from a bearer token.
    pub fn with_token(self, token: &str) -> Self {
        self.with_credentials(Auth::Bearer(token.to_string()))
    }

    fn with_credentials(self, auth: Auth) -> Self {
        HttpBackend {
            inner: Arc::new(HttpBackendInner {
                base_url: self.inner.base_url.clone(),
                auth: Some(auth),
                agent: self.inner.agent.clone(),
                timeout: self.inner.timeout,
            }),
        }
    }

    /// Get the bucket URL.
    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Get the per-call deadline.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    fn url_for(&self, key: &str) -> BackendResult<Url> {
        self.inner
            .base_url
            .join(key.trim_start_matches('/'))
            .map_err(|e| BackendError::new(BackendErrorKind::Other, format!("invalid key {:?}: {}", key, e)))
    }

    fn request(&self, method: &str, url: &Url, condition: &Condition) -> ureq::Request {
        let mut req = self.inner.agent.request_url(method, url);

        if let Some(auth) = &self.inner.auth {
            req = match auth {
                Auth::Bearer(token) => req.set("Authorization", &format!("Bearer {}", token)),
                Auth::Basic(username, password) => {
                    let credentials = format!("{}:{}", username, password);
                    let encoded = base64::Engine::encode(
                        &base64::engine::general_purpose::STANDARD,
                        credentials.as_bytes(),
                    );
                    req.set("Authorization", &format!("Basic {}", encoded))
                }
            };
        }

        match condition {
            Condition::None => req,
            Condition::IfAbsent => req.set("If-None-Match", "*"),
            Condition::IfMatch(version) => req.set("If-Match", &quote_etag(version.as_str())),
        }
    }
}

impl ObjectBackend for HttpBackend {
    fn get(&self, key: &str) -> BackendResult<ObjectBody> {
        let url = self.url_for(key)?;
        debug!(key, "http get");
        let response = self.request("GET", &url, &Condition::None).call()?;
        let meta = meta_from(&response, key)?;
        Ok(ObjectBody {
            meta,
            reader: response.into_reader(),
        })
    }

    fn head(&self, key: &str) -> BackendResult<ObjectMeta> {
        let url = self.url_for(key)?;
        debug!(key, "http head");
        let response = self.request("HEAD", &url, &Condition::None).call()?;
        meta_from(&response, key)
    }

    fn put(
        &self,
        key: &str,
        body: &mut dyn Read,
        len: u64,
        condition: &Condition,
    ) -> BackendResult<VersionToken> {
        let url = self.url_for(key)?;
        debug!(key, len, "http put");

        let mut exact = ExactReader::new(body, len);
        if len == 0 {
            // An empty request body may never be read by the agent.
            exact.check_end()?;
        }
        let response = self
            .request("PUT", &url, condition)
            .set("Content-Type", "application/octet-stream")
            .set("Content-Length", &len.to_string())
            .send(&mut exact)?;

        match response.header("ETag") {
            Some(etag) => Ok(VersionToken::new(unquote_etag(etag))),
            None => {
                warn!(key, "PUT response carried no ETag, asking with HEAD");
                Ok(self.head(key)?.version)
            }
        }
    }

    fn delete(&self, key: &str, condition: &Condition) -> BackendResult<()> {
        let url = self.url_for(key)?;
        debug!(key, "http delete");
        self.request("DELETE", &url, condition).call()?;
        Ok(())
    }
}

/// Yields exactly `len` bytes or fails before the last chunk leaves, so a
/// body of the wrong length never completes a request.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
    /// The body is known to end at the declared length.
    verified: bool,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, len: u64) -> Self {
        ExactReader {
            inner,
            remaining: len,
            verified: false,
        }
    }

    fn check_end(&mut self) -> io::Result<()> {
        if self.verified {
            return Ok(());
        }
        let mut extra = [0u8; 1];
        if self.inner.read(&mut extra)? > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "body longer than declared length",
            ));
        }
        self.verified = true;
        Ok(())
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            self.check_end()?;
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "body shorter than declared length",
            ));
        }
        self.remaining -= n as u64;

        if self.remaining == 0 {
            self.check_end()?;
        }
        Ok(n)
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Trailing slash needed for correct URL joining.
fn normalize_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn meta_from(response: &ureq::Response, key: &str) -> BackendResult<ObjectMeta> {
    let size = response
        .header("Content-Length")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Other,
                format!("{}: response without a usable Content-Length", key),
            )
        })?;
    let version = response
        .header("ETag")
        .map(unquote_etag)
        .ok_or_else(|| BackendError::new(BackendErrorKind::Other, format!("{}: response without an ETag", key)))?;

    Ok(ObjectMeta {
        size,
        version: VersionToken::new(version),
    })
}

fn unquote_etag(etag: &str) -> String {
    let etag = etag.trim();
    let etag = etag.strip_prefix("W/").unwrap_or(etag);
    etag.trim_matches('"').to_string()
}

fn quote_etag(etag: &str) -> String {
    format!("\"{}\"", etag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let backend = HttpBackend::new("https://s3.example.com/bucket").unwrap();
        assert_eq!(backend.base_url().as_str(), "https://s3.example.com/bucket/");
    }

    #[test]
    fn test_url_for_key() {
        let backend = HttpBackend::new("https://s3.example.com/bucket/").unwrap();
        let url = backend.url_for("repo/refs/heads/main").unwrap();
        assert_eq!(url.as_str(), "https://s3.example.com/bucket/repo/refs/heads/main");
    }

    #[test]
    fn test_etag_quoting() {
        assert_eq!(unquote_etag("\"abc\""), "abc");
        assert_eq!(unquote_etag("W/\"abc\""), "abc");
        assert_eq!(unquote_etag("abc"), "abc");
        assert_eq!(quote_etag("abc"), "\"abc\"");
    }

    #[test]
    fn test_backend_clone_shares_inner() {
        let backend = HttpBackend::new("https://s3.example.com/bucket").unwrap();
        let clone = backend.clone();
        assert!(Arc::ptr_eq(&backend.inner, &clone.inner));
    }

    #[test]
    fn test_with_token_keeps_timeout() {
        let backend = HttpBackend::new("https://s3.example.com/bucket")
            .unwrap()
            .with_timeout(Duration::from_secs(5))
            .with_token("secret");
        assert_eq!(backend.timeout(), Duration::from_secs(5));
        assert!(backend.inner.auth.is_some());
    }

    #[test]
    fn test_exact_reader() {
        let mut out = Vec::new();
        ExactReader::new(&b"abcd"[..], 4).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcd");

        let err = ExactReader::new(&b"abc"[..], 4).read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        // The last chunk is withheld when the body runs long.
        let mut out = Vec::new();
        let err = ExactReader::new(&b"abcde"[..], 4).read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(out.len() < 4);

        // Nothing may leave when zero bytes were declared.
        let mut out = Vec::new();
        let err = ExactReader::new(&b"x"[..], 0).read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(out.is_empty());

        let mut out = Vec::new();
        ExactReader::new(&b""[..], 0).read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_invalid_url() {
        assert!(HttpBackend::new("not a url").is_err());
    }
}
