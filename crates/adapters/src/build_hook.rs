// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build hook protocol (spec §4.E): a textual, line-based handshake with
//! an external program that may accept, postpone, or decline a
//! derivation, performing the build on the engine's behalf if it accepts.
//!
//! The hook process itself is a collaborator (spec §1, "remote-store
//! protocol beyond the build hook interface" is out of scope); this module
//! only implements the engine's side of the handshake over the hook's
//! stdin/stdout pipes.

use njd_store::StorePath;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use crate::subprocess::BUILD_HOOK_HANDSHAKE_TIMEOUT;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to spawn build hook: {0}")]
    Spawn(#[source] io::Error),
    #[error("build hook handshake timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("build hook pipe closed before a reply line")]
    ClosedPipe,
    #[error("build hook sent an unrecognised reply: {0:?}")]
    BadReply(String),
    #[error("io error talking to build hook: {0}")]
    Io(#[from] io::Error),
}

/// The hook's verdict on a derivation (spec §4.E `tryToBuild`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookVerdict {
    /// Hook will build this derivation; the engine must hand off the
    /// input/output path lists and wait for its exit status instead of
    /// forking a local builder.
    Accept,
    /// Hook is busy; caller should release any locks taken for this
    /// attempt and poll-sleep before retrying.
    Postpone,
    /// Hook will not take this derivation; caller proceeds to build it
    /// locally.
    Decline,
}

/// A running hook process plus the half of the pipe pair the engine
/// writes the accept payload to.
pub struct HookSession {
    child: Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
}

/// Spawn the hook program and read lines until one that starts with `# `
/// is seen; its payload (`decline`, `postpone`, or `accept`) is the
/// verdict (spec §4.E: "Hook writes lines prefixed `# `; the next such
/// line's payload is its reply").
pub async fn consult(program: &Path, args: &[String]) -> Result<(HookSession, HookVerdict), HookError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(HookError::Spawn)?;
    let stdin = child.stdin.take().ok_or(HookError::ClosedPipe)?;
    let mut stdout = BufReader::new(child.stdout.take().ok_or(HookError::ClosedPipe)?);

    let verdict = tokio::time::timeout(BUILD_HOOK_HANDSHAKE_TIMEOUT, read_verdict(&mut stdout))
        .await
        .map_err(|_| HookError::Timeout(BUILD_HOOK_HANDSHAKE_TIMEOUT))??;

    Ok((HookSession { child, stdin, stdout }, verdict))
}

async fn read_verdict(stdout: &mut BufReader<tokio::process::ChildStdout>) -> Result<HookVerdict, HookError> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = stdout.read_line(&mut line).await?;
        if n == 0 {
            return Err(HookError::ClosedPipe);
        }
        let Some(payload) = line.strip_prefix("# ") else { continue };
        return match payload.trim() {
            "accept" => Ok(HookVerdict::Accept),
            "postpone" => Ok(HookVerdict::Postpone),
            "decline" => Ok(HookVerdict::Decline),
            other => Err(HookError::BadReply(other.to_string())),
        };
    }
}

/// On accept, write the three temp files the hook expects (input-paths,
/// output-paths, a registration-format description of the inputs'
/// validity) and signal readiness by writing `okay\n` to its stdin
/// (spec §4.E: "writes `okay\n` to the hook").
pub async fn send_accept_payload(
    session: &mut HookSession,
    scratch_dir: &Path,
    inputs: &BTreeSet<StorePath>,
    outputs: &BTreeSet<StorePath>,
    registration: &str,
) -> Result<(), HookError> {
    let inputs_file = scratch_dir.join("inputs");
    let outputs_file = scratch_dir.join("outputs");
    let registration_file = scratch_dir.join("registration");

    write_path_list(&inputs_file, inputs).await?;
    write_path_list(&outputs_file, outputs).await?;
    tokio::fs::write(&registration_file, registration).await?;

    session.stdin.write_all(b"okay\n").await?;
    session.stdin.flush().await?;
    Ok(())
}

async fn write_path_list(path: &PathBuf, paths: &BTreeSet<StorePath>) -> Result<(), HookError> {
    let body = paths.iter().map(|p| format!("{p}\n")).collect::<String>();
    tokio::fs::write(path, body).await?;
    Ok(())
}

/// Wait for the accepted build's exit status; `REMOTE_BUILD_FAILED`
/// (status 100) marks a remote-build failure rather than a build failure,
/// which the caller must not insert into the failure cache (spec §4.G).
pub async fn wait_for_remote_build(mut session: HookSession) -> Result<Option<i32>, HookError> {
    let status = session.child.wait().await?;
    Ok(status.code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_hook_that_declines_is_read_as_decline() {
        let (mut _session, verdict) = consult(
            Path::new("/bin/sh"),
            &["-c".to_string(), "printf '# decline\\n'".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(verdict, HookVerdict::Decline);
    }

    #[tokio::test]
    async fn a_hook_that_accepts_then_exits_100_is_a_remote_failure() {
        let (session, verdict) = consult(
            Path::new("/bin/sh"),
            &["-c".to_string(), "printf '# accept\\n'; read line; exit 100".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(verdict, HookVerdict::Accept);
        let mut session = session;
        session.stdin.write_all(b"okay\n").await.unwrap();
        session.stdin.flush().await.unwrap();
        let status = wait_for_remote_build(session).await.unwrap();
        assert_eq!(status, Some(100));
        assert!(njd_core::HookExitStatus(status.unwrap()).is_remote_build_failure());
    }
}
