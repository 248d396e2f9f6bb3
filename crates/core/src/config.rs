// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine configuration: loaded from a TOML file, overridable by a
//! handful of environment variables where the original reads `NIX_*`
//! variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_max_build_jobs() -> u32 {
    1
}

fn default_max_silent_secs() -> u64 {
    3600
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_build_users_group() -> String {
    "nixbld".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/njd")
}

fn default_sandbox_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("/dev"), PathBuf::from("/dev/pts"), PathBuf::from("/proc")]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_build_jobs")]
    pub max_build_jobs: u32,

    #[serde(default = "default_max_silent_secs")]
    pub max_silent_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_build_users_group")]
    pub build_users_group: String,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_sandbox_paths")]
    pub sandbox_bind_paths: Vec<PathBuf>,

    /// Whether a failed build's outputs are inserted into the failure
    /// cache (spec §4.G). Users may disable this wholesale.
    #[serde(default = "default_true")]
    pub failure_caching_enabled: bool,

    /// The "keep going" policy (spec §4.C step 7, §7 "Propagation").
    #[serde(default)]
    pub keep_going: bool,

    #[serde(default)]
    pub use_sandbox: bool,

    /// Substituter programs to try in order (spec §4.D "pop next
    /// candidate substituter"). Each is invoked as
    /// `<program> --query <path>` to fetch `SubstitutablePathInfo`, and
    /// `<program> --substitute <path>` to fetch content (spec §6).
    #[serde(default)]
    pub substituters: Vec<PathBuf>,

    /// An external build hook program (spec §4.E, §6). `None` means every
    /// derivation goal treats the hook step as an immediate decline and
    /// builds locally.
    #[serde(default)]
    pub build_hook: Option<PathBuf>,

    /// A privileged helper used when the engine itself is unprivileged
    /// (spec §6 "Setuid helper").
    #[serde(default)]
    pub setuid_helper: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_build_jobs: default_max_build_jobs(),
            max_silent_secs: default_max_silent_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            build_users_group: default_build_users_group(),
            state_dir: default_state_dir(),
            sandbox_bind_paths: default_sandbox_paths(),
            failure_caching_enabled: true,
            keep_going: false,
            use_sandbox: false,
            substituters: Vec::new(),
            build_hook: None,
            setuid_helper: None,
        }
    }
}

impl EngineConfig {
    pub fn max_silent_time(&self) -> Duration {
        Duration::from_secs(self.max_silent_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(ConfigError::Parse)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::from_toml_str(&contents)
    }

    /// Apply the handful of `NJD_*` environment overrides, mirroring the
    /// original's reliance on `NIX_BUILD_CORES`-style variables.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("NJD_MAX_BUILD_JOBS") {
            if let Ok(n) = v.parse() {
                self.max_build_jobs = n;
            }
        }
        if let Ok(v) = std::env::var("NJD_BUILD_USERS_GROUP") {
            self.build_users_group = v;
        }
        if let Ok(v) = std::env::var("NJD_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_populated_when_toml_is_empty() {
        let cfg = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.max_build_jobs, 1);
        assert_eq!(cfg.build_users_group, "nixbld");
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg = EngineConfig::from_toml_str("max_build_jobs = 8\nuse_sandbox = true\n").unwrap();
        assert_eq!(cfg.max_build_jobs, 8);
        assert!(cfg.use_sandbox);
        assert_eq!(cfg.poll_interval_secs, 5);
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("NJD_MAX_BUILD_JOBS", "16");
        let cfg = EngineConfig::default().apply_env_overrides();
        assert_eq!(cfg.max_build_jobs, 16);
        std::env::remove_var("NJD_MAX_BUILD_JOBS");
    }
}
