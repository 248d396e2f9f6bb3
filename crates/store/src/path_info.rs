//! Per-path metadata recorded once a store path is valid, and the
//! lighter-weight metadata a substituter advertises before a path is
//! fetched.

use crate::hash::Sha256Hash;
use crate::store_path::StorePath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Metadata recorded for every valid store path (spec §3 `ValidPathInfo`).
///
/// The references set forms a directed graph; the closure invariant (every
/// path reachable from a valid path is itself valid) is maintained by the
/// registrar, not by this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidPathInfo {
    pub path: StorePath,
    pub archive_hash: Sha256Hash,
    pub references: BTreeSet<StorePath>,
    pub deriver: Option<StorePath>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<String>,
}

impl ValidPathInfo {
    pub fn new(path: StorePath, archive_hash: Sha256Hash, references: BTreeSet<StorePath>) -> Self {
        Self { path, archive_hash, references, deriver: None, signatures: Vec::new() }
    }

    pub fn with_deriver(mut self, deriver: StorePath) -> Self {
        self.deriver = Some(deriver);
        self
    }
}

/// Metadata a substituter advertises for a path before it is fetched
/// (spec §3 `SubstitutablePathInfo`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstitutablePathInfo {
    pub path: StorePath,
    pub references: BTreeSet<StorePath>,
    pub deriver: Option<StorePath>,
    pub download_size: u64,
    pub nar_size: u64,
}
