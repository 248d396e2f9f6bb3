//! The derivation record (spec §3) and its on-disk encoding.
//!
//! The real ATerm-based encoding Nix uses is a collaborator concern (spec
//! §1, "the derivation syntax and its on-disk encoding"); this crate picks
//! a JSON encoding, sufficient to round-trip the record this engine needs.

use crate::file_ingestion::FileIngestionMethod;
use crate::hash::Sha256Hash;
use crate::store_path::StorePath;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// An output an input derivation is expected to produce, named.
pub type OutputName = String;

/// Either an a-priori content hash (fixed-output) or nothing yet (to be
/// computed once the derivation is built).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DerivationOutput {
    /// Input-addressed: the final store path is not yet known to the caller
    /// but is deterministic given the rest of the derivation.
    InputAddressed,
    /// Fixed-output: the builder must produce content hashing to exactly
    /// this digest, under this ingestion method.
    Fixed { method: FileIngestionMethod, hash: Sha256Hash },
}

impl DerivationOutput {
    pub fn is_fixed(&self) -> bool {
        matches!(self, Self::Fixed { .. })
    }
}

/// A record describing how to build a set of outputs (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Derivation {
    /// Human-readable base name used to derive output store path names.
    pub name: String,
    /// Named outputs this derivation produces.
    pub outputs: BTreeMap<OutputName, DerivationOutput>,
    /// Store paths this derivation reads directly (not via another
    /// derivation's outputs).
    pub input_sources: BTreeSet<StorePath>,
    /// For each input derivation, the subset of its output names this
    /// derivation consumes.
    pub input_derivations: BTreeMap<StorePath, BTreeSet<OutputName>>,
    pub builder: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub platform: String,
    /// Names of environment variables that, for fixed-output derivations
    /// only, are copied in from the engine's own environment (spec §4.E).
    #[serde(default)]
    pub impure_env_vars: Vec<String>,
    /// If present, the engine must reject outputs that reference anything
    /// outside this set (spec §4.F step 4).
    #[serde(default)]
    pub allowed_references: Option<BTreeSet<StorePath>>,
}

impl Derivation {
    /// A derivation is fixed-output iff every output carries a declared
    /// hash (spec §4.E, "classify derivation as fixed-output").
    pub fn is_fixed_output(&self) -> bool {
        !self.outputs.is_empty() && self.outputs.values().all(DerivationOutput::is_fixed)
    }

    /// The deterministic store path for one of this derivation's outputs.
    ///
    /// Real Nix derives input-addressed output paths from a hash of the
    /// derivation's own fields; since the store-path function itself is a
    /// collaborator concern (spec §1), this takes the drv path and output
    /// name as a fingerprint through the same stand-in
    /// [`StorePath::from_fingerprint`] used elsewhere in this crate.
    /// Fixed-output paths are fingerprinted on the declared hash instead,
    /// so two derivations declaring the same fixed-output hash agree on
    /// the output path (matching upstream's content-addressing intent).
    pub fn output_path(&self, drv_path: &StorePath, output_name: &str) -> Option<StorePath> {
        let output = self.outputs.get(output_name)?;
        let name = format!("{}-{}", self.name, output_name);
        let fingerprint = match output {
            DerivationOutput::InputAddressed => format!("{drv_path}:{output_name}"),
            DerivationOutput::Fixed { hash, .. } => format!("fixed:{}", hash.to_base32()),
        };
        StorePath::from_fingerprint(&fingerprint, &name).ok()
    }

    /// Invariant check from spec §3: every input-derivation reference must
    /// name an output that (syntactically) exists in this record — this
    /// only validates the shape of `self`, not the referenced derivation's
    /// actual outputs (that requires loading it).
    pub fn validate_shape(&self) -> Result<(), DerivationError> {
        if self.outputs.is_empty() {
            return Err(DerivationError::NoOutputs);
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, DerivationError> {
        serde_json::to_string_pretty(self).map_err(DerivationError::Encoding)
    }

    pub fn from_json(data: &str) -> Result<Self, DerivationError> {
        let drv: Derivation = serde_json::from_str(data).map_err(DerivationError::Encoding)?;
        drv.validate_shape()?;
        Ok(drv)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DerivationError {
    #[error("derivation has no outputs")]
    NoOutputs,
    #[error("derivation encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("derivation not found: {0}")]
    NotFound(PathBuf),
}

/// Load a derivation from its `.drv` path on disk.
///
/// This is the engine's only dependency on derivation storage (spec §6):
/// called only after the `.drv` path is known valid.
pub fn derivation_from_path(path: &std::path::Path) -> Result<Derivation, DerivationError> {
    let data = std::fs::read_to_string(path)
        .map_err(|_| DerivationError::NotFound(path.to_path_buf()))?;
    Derivation::from_json(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Derivation {
        let mut outputs = BTreeMap::new();
        outputs.insert("out".to_string(), DerivationOutput::InputAddressed);
        Derivation {
            name: "hello-1.0".to_string(),
            outputs,
            input_sources: BTreeSet::new(),
            input_derivations: BTreeMap::new(),
            builder: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "true".to_string()],
            env: BTreeMap::new(),
            platform: "x86_64-linux".to_string(),
            impure_env_vars: Vec::new(),
            allowed_references: None,
        }
    }

    #[test]
    fn round_trips_through_json() {
        let drv = sample();
        let json = drv.to_json().unwrap();
        let drv2 = Derivation::from_json(&json).unwrap();
        assert_eq!(drv2.name, drv.name);
        assert_eq!(drv2.outputs.len(), 1);
    }

    #[test]
    fn fixed_output_requires_all_outputs_fixed() {
        let mut drv = sample();
        assert!(!drv.is_fixed_output());
        drv.outputs.insert(
            "out".to_string(),
            DerivationOutput::Fixed {
                method: FileIngestionMethod::Flat,
                hash: Sha256Hash::of_bytes(b"x"),
            },
        );
        assert!(drv.is_fixed_output());
    }

    #[test]
    fn rejects_empty_outputs() {
        let mut drv = sample();
        drv.outputs.clear();
        let json = serde_json::to_string(&drv).unwrap();
        assert!(Derivation::from_json(&json).is_err());
    }
}
