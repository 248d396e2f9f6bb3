//! Store paths: an opaque, printable identifier encoding a hash part and a name.

use crate::hash::Sha256Hash;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// Number of bytes of the hash truncated into a store path's hash part.
/// Real Nix uses a 160-bit (20 byte) compression of the path's fingerprint
/// hash; the exact compression function is a collaborator concern (the
/// content-addressed store path function, spec §1) — this crate takes the
/// first 20 bytes of whatever SHA-256 digest it is given, which is
/// sufficient for the uniqueness and equality properties the engine relies
/// on without claiming bit-compatibility with upstream Nix.
pub const HASH_PART_LEN: usize = 20;

/// An opaque, printable store path identifier.
///
/// Two `StorePath`s compare equal iff their string form is equal (the data
/// model invariant from spec §3). Cheap to clone: the printed form is
/// cached in a `SmolStr`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorePath {
    rendered: SmolStr,
    hash_part_len: usize,
}

impl StorePath {
    /// Build a store path from a hash-part digest and a name.
    pub fn new(hash_part: &[u8], name: &str) -> Result<Self, StorePathError> {
        validate_name(name)?;
        let truncated = &hash_part[..hash_part.len().min(HASH_PART_LEN)];
        let encoded = crate::base32::encode(truncated);
        Ok(Self { rendered: SmolStr::new(format!("{encoded}-{name}")), hash_part_len: encoded.len() })
    }

    /// Derive a store path deterministically from a fingerprint, as a
    /// stand-in for the real content-addressed store-path function (out of
    /// scope per spec §1): hash the fingerprint, truncate, encode.
    pub fn from_fingerprint(fingerprint: &str, name: &str) -> Result<Self, StorePathError> {
        let digest = Sha256Hash::of_bytes(fingerprint.as_bytes());
        Self::new(&digest.0, name)
    }

    pub fn parse(s: &str) -> Result<Self, StorePathError> {
        let (hash_part, name) =
            s.split_once('-').ok_or_else(|| StorePathError::Malformed(s.to_string()))?;
        validate_name(name)?;
        if hash_part.is_empty() || !hash_part.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(StorePathError::Malformed(s.to_string()));
        }
        Ok(Self { rendered: SmolStr::new(s), hash_part_len: hash_part.len() })
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    pub fn hash_part(&self) -> &str {
        &self.rendered[..self.hash_part_len]
    }

    pub fn name(&self) -> &str {
        &self.rendered[self.hash_part_len + 1..]
    }

    /// A path predicate: whether the textual form names a derivation
    /// (`.drv`) rather than an output.
    pub fn is_derivation(&self) -> bool {
        self.name().ends_with(".drv")
    }
}

fn validate_name(name: &str) -> Result<(), StorePathError> {
    if name.is_empty() || name.len() > 211 {
        return Err(StorePathError::InvalidName(name.to_string()));
    }
    let valid = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'+' | b'?' | b'='));
    if !valid {
        return Err(StorePathError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePath({})", self.rendered)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl TryFrom<String> for StorePath {
    type Error = StorePathError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<StorePath> for String {
    fn from(p: StorePath) -> Self {
        p.rendered.to_string()
    }
}

impl std::str::FromStr for StorePath {
    type Err = StorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StorePathError {
    #[error("malformed store path: {0:?}")]
    Malformed(String),
    #[error("invalid store path name: {0:?}")]
    InvalidName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display() {
        let p = StorePath::from_fingerprint("hello", "foo-1.0").unwrap();
        let s = p.to_string();
        let p2 = StorePath::parse(&s).unwrap();
        assert_eq!(p, p2);
        assert_eq!(p.name(), "foo-1.0");
    }

    #[test]
    fn is_derivation_checks_suffix() {
        let p = StorePath::from_fingerprint("hello", "foo-1.0.drv").unwrap();
        assert!(p.is_derivation());
        let p = StorePath::from_fingerprint("hello", "foo-1.0").unwrap();
        assert!(!p.is_derivation());
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(StorePath::from_fingerprint("hello", "").is_err());
        assert!(StorePath::from_fingerprint("hello", "has a space").is_err());
    }

    #[test]
    fn equality_is_textual() {
        let a = StorePath::new(&[0u8; 20], "foo").unwrap();
        let b = StorePath::parse(&a.to_string()).unwrap();
        assert_eq!(a, b);
    }
}
