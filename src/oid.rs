//! Object IDs - hex digests naming git objects, packs and LFS blobs.

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Shortest id the key layout can partition (two 2-character segments).
pub const MIN_OID_LEN: usize = 4;

/// Object ID - a lowercase hex digest of the content it names.
///
/// Git object ids (40 hex chars for SHA-1, 64 for SHA-256) and LFS ids
/// (64 hex chars, SHA-256) share this type; the store treats the payload
/// behind an id as opaque bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid {
    hex: String,
}

impl Oid {
    /// Parse an OID from a hex string.
    ///
    /// Upper-case digits are accepted and normalized to lower case.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() < MIN_OID_LEN {
            return Err(Error::InvalidIdentifier(format!(
                "expected at least {} hex chars, got {}",
                MIN_OID_LEN,
                hex.len()
            )));
        }
        if let Some(bad) = hex.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(Error::InvalidIdentifier(format!(
                "invalid character {:?} in {:?}",
                bad, hex
            )));
        }

        Ok(Oid {
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Create an OID from raw digest bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Oid::from_hex(&hex::encode(bytes))
    }

    /// Compute the SHA256 OID of content.
    pub fn from_content(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Oid {
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// Compute the SHA256 OID of a stream, returning it with the byte count.
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<(Self, u64)> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        let oid = Oid {
            hex: hex::encode(hasher.finalize()),
        };
        Ok((oid, size))
    }

    /// Get the OID as a hex string.
    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// Whether every digit is zero (git's "no object" id).
    pub fn is_zero(&self) -> bool {
        self.hex.bytes().all(|b| b == b'0')
    }

    /// The two partition segments used by the key layout.
    pub fn partition(&self) -> (&str, &str) {
        (&self.hex[0..2], &self.hex[2..4])
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.hex)
    }
}

impl std::str::FromStr for Oid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Oid::from_hex(s)
    }
}

impl TryFrom<String> for Oid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Oid::from_hex(&value)
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> Self {
        oid.hex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_from_content() {
        let content = b"Hello, World!";
        let oid = Oid::from_content(content);
        // SHA256 of "Hello, World!"
        assert_eq!(
            oid.as_str(),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_oid_from_reader_matches_content() {
        let content = vec![7u8; 200_000];
        let (oid, size) = Oid::from_reader(&content[..]).unwrap();
        assert_eq!(oid, Oid::from_content(&content));
        assert_eq!(size, 200_000);
    }

    #[test]
    fn test_oid_from_hex() {
        let hex = "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3";
        let oid = Oid::from_hex(hex).unwrap();
        assert_eq!(oid.as_str(), hex);
        assert_eq!(oid.partition(), ("a9", "4a"));
    }

    #[test]
    fn test_oid_normalizes_case() {
        let oid = Oid::from_hex("DEADBEEF").unwrap();
        assert_eq!(oid.as_str(), "deadbeef");
        assert_eq!(oid, Oid::from_hex("deadbeef").unwrap());
    }

    #[test]
    fn test_oid_invalid_hex() {
        assert!(matches!(
            Oid::from_hex("not valid hex"),
            Err(Error::InvalidIdentifier(_))
        ));
        assert!(matches!(Oid::from_hex("abc"), Err(Error::InvalidIdentifier(_)))); // Too short
        assert!(Oid::from_hex("ab/cd").is_err());
    }

    #[test]
    fn test_oid_zero() {
        assert!(Oid::from_hex(&"0".repeat(40)).unwrap().is_zero());
        assert!(!Oid::from_hex("0001").unwrap().is_zero());
    }

    #[test]
    fn test_oid_serde() {
        let oid = Oid::from_hex("deadbeef").unwrap();
        let json = serde_json::to_string(&oid).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: Oid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, oid);
        assert!(serde_json::from_str::<Oid>("\"xyz\"").is_err());
    }
}
