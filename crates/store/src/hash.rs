//! Content hashing for store paths and archive verification.
//!
//! Only SHA-256 is implemented: it is the only algorithm the engine itself
//! needs (fixed-output hash verification, reference scanning, store path
//! derivation). Hashing for on-disk formats is a collaborator concern
//! (spec §1) kept out of scope.

use crate::base32;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub const SHA256_DIGEST_LEN: usize = 32;

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sha256Hash(#[serde(with = "hash_serde")] pub [u8; SHA256_DIGEST_LEN]);

impl Sha256Hash {
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn to_base32(self) -> String {
        base32::encode(&self.0)
    }

    pub fn to_base16(self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    pub fn from_base32(s: &str) -> Result<Self, ParseHashError> {
        let bytes = base32::decode(s, SHA256_DIGEST_LEN).map_err(ParseHashError::Base32)?;
        let arr: [u8; SHA256_DIGEST_LEN] =
            bytes.try_into().map_err(|_| ParseHashError::WrongLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_base32())
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_base32())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseHashError {
    #[error("invalid base32 hash: {0}")]
    Base32(base32::DecodeError),
    #[error("decoded hash has the wrong length")]
    WrongLength,
}

mod hash_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&data_encoding::HEXLOWER.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = data_encoding::HEXLOWER
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("wrong hash length"))
    }
}

/// A hasher that can be fed incrementally, used by the content verifier
/// while it streams a path's canonicalised contents (§4.F step 3).
#[derive(Default)]
pub struct StreamingHasher(Sha256);

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(self) -> Sha256Hash {
        Sha256Hash(self.0.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base32_round_trips_through_display() {
        let h = Sha256Hash::of_bytes(b"hello world");
        let s = h.to_base32();
        let h2 = Sha256Hash::from_base32(&s).unwrap();
        assert_eq!(h, h2);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut streaming = StreamingHasher::new();
        streaming.update(b"hello ");
        streaming.update(b"world");
        assert_eq!(streaming.finish(), Sha256Hash::of_bytes(b"hello world"));
    }
}
