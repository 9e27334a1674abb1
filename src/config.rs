//! Configuration for a bucket-backed remote.
//!
//! ```toml
//! [transfer]
//! root = "repos/demo"
//! workers = 8
//! pack_storage = "explode"
//! atomic = false
//!
//! [http]
//! endpoint = "https://s3.example.com/my-bucket"
//! token = "..."
//! timeout_secs = 30
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level config structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub http: Option<HttpConfig>,
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Config::from_toml_str(&text)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        self.transfer.validate()?;
        if let Some(http) = &self.http {
            http.validate()?;
        }
        Ok(())
    }
}

/// What happens to an incoming pack once its objects are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackStorage {
    /// Store every object loosely and drop the pack (default).
    #[default]
    Explode,
    /// Also keep the raw pack under the digest of its bytes.
    Retain,
}

/// Transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Key prefix of the repository inside the bucket.
    #[serde(default)]
    pub root: String,
    /// Size of the worker pool used for object and ref fan-out.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub pack_storage: PackStorage,
    /// Default all-or-nothing mode for pushes.
    #[serde(default)]
    pub atomic: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            root: String::new(),
            workers: default_workers(),
            pack_storage: PackStorage::default(),
            atomic: false,
        }
    }
}

impl TransferConfig {
    /// Settings for a repository rooted at `root`, other values defaulted.
    pub fn for_root(root: &str) -> Self {
        Self {
            root: root.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("transfer.workers must be at least 1".into()));
        }
        if self.root.split('/').any(|segment| segment == "..") {
            return Err(Error::Config(format!("transfer.root {:?} escapes the bucket", self.root)));
        }
        if self.root.trim_matches('/').split('/').next() == Some("lfs") {
            return Err(Error::Config(format!(
                "transfer.root {:?} overlaps the LFS namespace",
                self.root
            )));
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    8
}

/// HTTP object-store endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Bucket URL, e.g. `https://s3.example.com/my-bucket`.
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Per-call deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl HttpConfig {
    fn validate(&self) -> Result<()> {
        url::Url::parse(&self.endpoint)?;
        if self.timeout_secs == 0 {
            return Err(Error::Config("http.timeout_secs must be at least 1".into()));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::Config(
                "http.username and http.password must be set together".into(),
            ));
        }
        Ok(())
    }
}

fn default_timeout_secs() -> u64 {
    30
}
