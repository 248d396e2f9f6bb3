// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Substituter query side (spec §6): `<program> --query <path>` is
//! invoked to fetch a `SubstitutablePathInfo` before committing to a
//! fetch. The fetch itself (`<program> --substitute <path>`) is a
//! monitored child spawned through `njd_core::Effect::SpawnChild` so its
//! stdout/stderr feed the Worker's log multiplexer (spec §6); this module
//! only covers the quick query round-trip, which does not need that
//! multiplexing.

use crate::subprocess::{run_with_timeout, SubprocessError, SUBSTITUTER_QUERY_TIMEOUT};
use njd_store::{StorePath, SubstitutablePathInfo};
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum SubstituterError {
    #[error(transparent)]
    Subprocess(#[from] SubprocessError),
    #[error("malformed substituter response: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Query one substituter for `target`. A non-zero exit or empty stdout is
/// a miss (`Ok(None)`), not an error: spec §4.D "on miss → tryNext".
pub async fn query_info(
    program: &Path,
    target: &StorePath,
) -> Result<Option<SubstitutablePathInfo>, SubstituterError> {
    let mut cmd = Command::new(program);
    cmd.arg("--query").arg(target.as_str());
    let output = run_with_timeout(cmd, SUBSTITUTER_QUERY_TIMEOUT, "substituter-query").await?;
    if !output.status.success() || output.stdout.is_empty() {
        return Ok(None);
    }
    let info: SubstitutablePathInfo = serde_json::from_slice(&output.stdout)?;
    Ok(Some(info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_substituter_that_exits_nonzero_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("substituter.sh");
        std::fs::write(&program, "#!/bin/sh\nexit 1\n").unwrap();
        let mut perms = std::fs::metadata(&program).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&program, perms).unwrap();

        let target = StorePath::from_fingerprint("x", "foo").unwrap();
        let info = query_info(&program, &target).await.unwrap();
        assert!(info.is_none());
    }

    #[tokio::test]
    async fn a_substituter_that_prints_json_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("substituter.sh");
        let target = StorePath::from_fingerprint("x", "foo").unwrap();
        let info = SubstitutablePathInfo {
            path: target.clone(),
            references: Default::default(),
            deriver: None,
            download_size: 100,
            nar_size: 200,
        };
        let json = serde_json::to_string(&info).unwrap();
        std::fs::write(&program, format!("#!/bin/sh\ncat <<'EOF'\n{json}\nEOF\n")).unwrap();
        let mut perms = std::fs::metadata(&program).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&program, perms).unwrap();

        let got = query_info(&program, &target).await.unwrap().unwrap();
        assert_eq!(got.path, target);
        assert_eq!(got.download_size, 100);
    }
}
