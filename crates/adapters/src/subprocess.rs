// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Timeout-bounded subprocess execution, the primitive every child-process
//! effect (substituter, build hook, setuid helper) is built on.

use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

pub const SUBSTITUTER_TIMEOUT: Duration = Duration::from_secs(3600);
pub const SUBSTITUTER_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const BUILD_HOOK_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const SETUID_HELPER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SubprocessError {
    #[error("{label}: failed to spawn: {source}")]
    Spawn { label: String, #[source] source: std::io::Error },
    #[error("{label}: timed out after {timeout:?}")]
    Timeout { label: String, timeout: Duration },
}

/// Run `cmd` to completion, killing it if it outlives `timeout`.
///
/// Mirrors the teacher's `run_with_timeout` call sites (`oj-daemon`'s
/// `executor.rs`/`job_create.rs`): callers build a `tokio::process::Command`
/// and get back the exit status plus captured stdio.
pub async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    label: &str,
) -> Result<Output, SubprocessError> {
    let child = cmd
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(SubprocessError::Spawn { label: label.to_string(), source }),
        Err(_) => Err(SubprocessError::Timeout { label: label.to_string(), timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_successful_output() {
        let cmd = Command::new("true");
        let output = run_with_timeout(cmd, Duration::from_secs(5), "true").await.unwrap();
        assert!(output.status.success());
    }

    #[tokio::test]
    async fn timeout_is_reported_distinctly_from_spawn_failure() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_with_timeout(cmd, Duration::from_millis(50), "sleep").await.unwrap_err();
        assert!(matches!(err, SubprocessError::Timeout { .. }));
    }
}
