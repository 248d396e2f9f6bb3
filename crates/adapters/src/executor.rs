// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Effect executor: interprets [`njd_core::Effect`]s, feeding results
//! back to the Worker as [`Event`]s over a channel.
//!
//! Spawning a child starts two background tasks (stdout/stderr readers)
//! that only ever *send* `ChildOutput`/`ChildEof` events; they never touch
//! goal state directly, preserving the single-writer discipline spec §5
//! requires even though the effects themselves run concurrently.

use crate::build_hook::{self, HookVerdict};
use crate::path_lock::{PathLockError, PathLockManager};
use crate::sandbox::{self, SandboxPlan};
use crate::subprocess::SUBSTITUTER_TIMEOUT;
use crate::user_slot::{UserSlotError, UserSlotPool};
use njd_core::{ChildId, ChildKind, Effect, Event, GoalId, HookOutcome, SandboxRequest, UserSlotLease};
use njd_storage::{MetadataStore, StorageError};
use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("spawn failed: {0}")]
    Spawn(#[from] io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("user slot error: {0}")]
    UserSlot(#[from] UserSlotError),
    #[error("no such child: {0}")]
    NoSuchChild(ChildId),
    #[error("sandboxed builds require linux")]
    SandboxUnsupported,
}

type ChildHandle = Arc<AsyncMutex<tokio::process::Child>>;

type ChildTable = Arc<parking_lot::Mutex<HashMap<ChildId, ChildHandle>>>;

pub struct Executor {
    metadata: Arc<dyn MetadataStore>,
    user_slots: parking_lot::Mutex<UserSlotPool>,
    locks: parking_lot::Mutex<PathLockManager>,
    children: ChildTable,
    event_tx: mpsc::Sender<Event>,
}

impl Executor {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        user_slots: UserSlotPool,
        locks: PathLockManager,
        event_tx: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            metadata,
            user_slots: parking_lot::Mutex::new(user_slots),
            locks: parking_lot::Mutex::new(locks),
            children: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            event_tx,
        }
    }

    /// Execute one effect. Most effects resolve synchronously and return
    /// the `Event` (if any) the caller should fold into goal state right
    /// away; `SpawnChild` instead returns `None` here and delivers its
    /// `ChildOutput`/`ChildEof`/`ChildExited` events asynchronously over
    /// the channel passed to [`Executor::new`], since a child may run for
    /// a long time.
    pub async fn execute(&self, effect: Effect) -> Result<Option<Event>, ExecuteError> {
        let op = effect.name();
        let start = std::time::Instant::now();
        let result = self.execute_inner(effect).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::debug!(effect = op, elapsed_ms, "executed"),
            Err(e) => tracing::error!(effect = op, elapsed_ms, error = %e, "effect failed"),
        }
        result
    }

    async fn execute_inner(&self, effect: Effect) -> Result<Option<Event>, ExecuteError> {
        match effect {
            Effect::Emit { event } => {
                let _ = self.event_tx.send(event.clone()).await;
                Ok(Some(event))
            }
            Effect::SpawnChild { goal, kind, program, args, env, cwd, in_build_slot, sandbox } => {
                let child =
                    self.spawn_child(goal.clone(), kind, program, args, env, cwd, in_build_slot, sandbox).await?;
                Ok(Some(Event::ChildSpawned { goal, child, in_build_slot }))
            }
            Effect::KillChild { child } => {
                self.kill_child(child).await?;
                Ok(None)
            }
            Effect::AcquireLock { goal, paths, blocking } => {
                match self.locks.lock().lock(goal.clone(), &paths, blocking) {
                    Ok(()) => Ok(Some(Event::LockAcquired { goal })),
                    Err(PathLockError::HeldByAnotherGoal(_)) => {
                        Ok(Some(Event::LockOwnedByAnotherGoal { goal }))
                    }
                    Err(PathLockError::WouldBlock(_) | PathLockError::Io(_)) => {
                        Ok(Some(Event::LockContended { goal }))
                    }
                }
            }
            Effect::ReleaseLock { paths, delete_files, .. } => {
                self.locks.lock().unlock(&paths, delete_files);
                Ok(None)
            }
            Effect::AcquireUserSlot { goal } => match self.user_slots.lock().acquire() {
                Ok(lease) => Ok(Some(Event::UserSlotAcquired { goal, lease })),
                Err(UserSlotError::NoSlotAvailable) => Ok(Some(Event::UserSlotUnavailable { goal })),
                Err(e) => Err(e.into()),
            },
            Effect::ReleaseUserSlot { lease } => {
                self.user_slots.lock().release(&lease)?;
                Ok(None)
            }
            Effect::KillLeasedProcesses { lease } => {
                self.user_slots.lock().kill_leased_processes(&lease)?;
                Ok(None)
            }
            Effect::RegisterValidPaths { infos } => {
                self.metadata.register_valid_paths(infos).await?;
                Ok(None)
            }
            Effect::RegisterFailedPath { path } => {
                self.metadata.register_failed_path(&path).await?;
                Ok(None)
            }
            Effect::AddTempRoot { path } => {
                self.metadata.add_temp_root(&path).await?;
                Ok(None)
            }
            Effect::ConsultBuildHook { goal, program, args, scratch_dir, inputs, outputs, registration } => {
                self.spawn_hook_consultation(goal, program, args, scratch_dir, inputs, outputs, registration);
                Ok(None)
            }
            Effect::QuerySubstituter { goal, program, target } => {
                let info = self.query_substituter(&program, &target).await.unwrap_or(None);
                Ok(Some(Event::SubstituterQueried { goal, program: program.display().to_string(), info }))
            }
        }
    }

    /// Runs the full hook handshake — consult, accept payload, wait for
    /// the remote build — on a background task, reporting exactly one
    /// `Event::HookOutcome` back over the channel. Kept off the calling
    /// goal's turn because an accepted build may run for a long time.
    #[allow(clippy::too_many_arguments)]
    fn spawn_hook_consultation(
        &self,
        goal: GoalId,
        program: std::path::PathBuf,
        args: Vec<String>,
        scratch_dir: std::path::PathBuf,
        inputs: std::collections::BTreeSet<njd_store::StorePath>,
        outputs: std::collections::BTreeSet<njd_store::StorePath>,
        registration: String,
    ) {
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let outcome = match build_hook::consult(&program, &args).await {
                Err(e) => HookOutcome::Failed { reason: e.to_string() },
                Ok((session, HookVerdict::Decline)) => {
                    drop(session);
                    HookOutcome::Declined
                }
                Ok((session, HookVerdict::Postpone)) => {
                    drop(session);
                    HookOutcome::Postponed
                }
                Ok((mut session, HookVerdict::Accept)) => {
                    if let Err(e) = std::fs::create_dir_all(&scratch_dir) {
                        HookOutcome::Failed { reason: e.to_string() }
                    } else if let Err(e) = build_hook::send_accept_payload(
                        &mut session,
                        &scratch_dir,
                        &inputs,
                        &outputs,
                        &registration,
                    )
                    .await
                    {
                        HookOutcome::Failed { reason: e.to_string() }
                    } else {
                        match build_hook::wait_for_remote_build(session).await {
                            Ok(status) => HookOutcome::Accepted { status },
                            Err(e) => HookOutcome::Failed { reason: e.to_string() },
                        }
                    }
                }
            };
            let _ = tx.send(Event::HookOutcome { goal, outcome }).await;
        });
    }

    /// Lease a build-user identity, blocking the caller only on the
    /// advisory-lock scan (never on I/O to another process).
    pub fn acquire_user_slot(&self) -> Result<UserSlotLease, UserSlotError> {
        self.user_slots.lock().acquire()
    }

    /// Query a substituter for a path's advertised metadata (spec §4.D
    /// "tryNext"). A quick round-trip, not multiplexed through the
    /// child table the way a fetch (`SpawnChild`) is.
    pub async fn query_substituter(
        &self,
        program: &std::path::Path,
        target: &njd_store::StorePath,
    ) -> Result<Option<njd_store::SubstitutablePathInfo>, crate::substituter::SubstituterError> {
        crate::substituter::query_info(program, target).await
    }

    async fn kill_child(&self, child: ChildId) -> Result<(), ExecuteError> {
        let handle = self.children.lock().get(&child).cloned();
        let Some(handle) = handle else {
            return Err(ExecuteError::NoSuchChild(child));
        };
        let _ = handle.lock().await.start_kill();
        Ok(())
    }

    async fn spawn_child(
        &self,
        goal: GoalId,
        kind: ChildKind,
        program: std::path::PathBuf,
        args: Vec<String>,
        env: std::collections::BTreeMap<String, String>,
        cwd: std::path::PathBuf,
        in_build_slot: bool,
        sandbox: Option<SandboxRequest>,
    ) -> Result<ChildId, ExecuteError> {
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&env)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(request) = sandbox {
            self.wire_sandbox(&mut cmd, &cwd, request)?;
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        tracing::info!(goal = %goal, kind = kind.as_str(), pid, in_build_slot, "spawned child");

        let tx = self.event_tx.clone();
        if let Some(stdout) = stdout {
            spawn_reader(pid, stdout, tx.clone());
        }
        if let Some(stderr) = stderr {
            spawn_reader(pid, stderr, tx.clone());
        }

        let handle: ChildHandle = Arc::new(AsyncMutex::new(child));
        self.children.lock().insert(pid, handle.clone());

        let children_table = self.children.clone();
        tokio::spawn(async move {
            let status = handle.lock().await.wait().await.ok().and_then(|s| s.code());
            children_table.lock().remove(&pid);
            let _ = tx.send(Event::ChildExited { child: pid, status }).await;
        });

        Ok(pid)
    }

    /// Registers a `pre_exec` hook that builds the chroot and drops
    /// privileges inside the forked child, before the builder is exec'd
    /// (spec §4.E steps 1–8). The only `unsafe` in this workspace: a
    /// fork-side closure that must not allocate or touch shared state
    /// other than its own captured `plan`.
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn wire_sandbox(
        &self,
        cmd: &mut Command,
        cwd: &std::path::Path,
        request: SandboxRequest,
    ) -> Result<(), ExecuteError> {
        use std::os::unix::process::CommandExt;

        let chroot_root = cwd.to_path_buf();
        let build_dir = chroot_root.join("build");
        let plan = SandboxPlan {
            chroot_root,
            build_dir,
            bind_paths: request.bind_paths,
            store_dir: request.store_dir,
            input_closure: request.input_closure,
            lease: request.lease,
        };
        unsafe {
            cmd.pre_exec(move || {
                sandbox::unshare_mount_namespace().map_err(to_io_error)?;
                sandbox::prepare_chroot(&plan).map_err(to_io_error)?;
                sandbox::chroot_and_drop_privileges(&plan.chroot_root, &plan.build_dir, &plan.lease)
                    .map_err(to_io_error)?;
                Ok(())
            });
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn wire_sandbox(
        &self,
        _cmd: &mut Command,
        _cwd: &std::path::Path,
        _request: SandboxRequest,
    ) -> Result<(), ExecuteError> {
        Err(ExecuteError::SandboxUnsupported)
    }
}

#[cfg(target_os = "linux")]
fn to_io_error(e: crate::sandbox::SandboxError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

fn spawn_reader(pid: u32, pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static, tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let _ = tx.send(Event::ChildOutput { child: pid, bytes: line.len() }).await;
                }
                Ok(None) => {
                    let _ = tx.send(Event::ChildEof { child: pid }).await;
                    break;
                }
                Err(_) => {
                    let _ = tx.send(Event::ChildEof { child: pid }).await;
                    break;
                }
            }
        }
    });
}
