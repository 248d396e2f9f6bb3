// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Setuid helper invocation (spec §6): a small privileged helper binary,
//! spawned when the engine itself is unprivileged, to perform operations
//! restricted to root — killing another uid's processes, chowning paths,
//! exec-ing a builder as the leased uid.
//!
//! The helper binary is a collaborator (spec §1, "credential-drop
//! helpers" are out of scope); this module only knows how to invoke it
//! and interpret its exit status.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

use crate::subprocess::{run_with_timeout, SubprocessError, SETUID_HELPER_TIMEOUT};

#[derive(Debug, Error)]
pub enum SetuidHelperError {
    #[error(transparent)]
    Subprocess(#[from] SubprocessError),
    #[error("setuid helper exited with status {0:?}: {1}")]
    NonZeroExit(Option<i32>, String),
}

/// The three operations the helper understands (spec §6).
pub enum HelperCommand<'a> {
    Kill { uid: u32, signal: &'a str },
    GetOwnership { path: &'a Path },
    RunBuilder { uid: u32, gid: u32, program: &'a Path, args: &'a [String] },
}

impl HelperCommand<'_> {
    fn into_args(self) -> Vec<String> {
        match self {
            HelperCommand::Kill { uid, signal } => {
                vec!["kill".to_string(), uid.to_string(), signal.to_string()]
            }
            HelperCommand::GetOwnership { path } => {
                vec!["get-ownership".to_string(), path.display().to_string()]
            }
            HelperCommand::RunBuilder { uid, gid, program, args } => {
                let mut v = vec![
                    "run-builder".to_string(),
                    uid.to_string(),
                    gid.to_string(),
                    program.display().to_string(),
                ];
                v.extend(args.iter().cloned());
                v
            }
        }
    }
}

/// Invoke `helper_path` with the two-argument convention spec §6
/// describes (command name, then its argument(s)), returning its
/// captured stdout on success.
pub async fn invoke(helper_path: &PathBuf, command: HelperCommand<'_>) -> Result<Vec<u8>, SetuidHelperError> {
    let args = command.into_args();
    let mut cmd = Command::new(helper_path);
    cmd.args(&args);
    let output = run_with_timeout(cmd, SETUID_HELPER_TIMEOUT, "setuid-helper").await?;
    if !output.status.success() {
        return Err(SetuidHelperError::NonZeroExit(
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_ownership_round_trips_through_a_stub_helper() {
        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("helper.sh");
        std::fs::write(&helper, "#!/bin/sh\necho \"0 0\"\n").unwrap();
        let mut perms = std::fs::metadata(&helper).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&helper, perms).unwrap();

        let out = invoke(&helper, HelperCommand::GetOwnership { path: Path::new("/tmp") }).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "0 0");
    }

    #[tokio::test]
    async fn a_non_zero_exit_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("helper.sh");
        std::fs::write(&helper, "#!/bin/sh\nexit 1\n").unwrap();
        let mut perms = std::fs::metadata(&helper).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&helper, perms).unwrap();

        let err = invoke(&helper, HelperCommand::Kill { uid: 30001, signal: "TERM" }).await.unwrap_err();
        assert!(matches!(err, SetuidHelperError::NonZeroExit(..)));
    }
}
