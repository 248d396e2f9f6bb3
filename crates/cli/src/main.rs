// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `njd`: drives the goal scheduler for one-shot "build" or "substitute"
//! requests against a store rooted at `--state-dir`.

mod exit_error;
mod output;

use clap::{Parser, Subcommand};
use exit_error::ExitError;
use njd_adapters::{Executor, PathLockManager, UserSlotPool};
use njd_core::{EngineConfig, SystemClock};
use njd_storage::WalMetadataStore;
use njd_store::StorePath;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "njd", version, about = "Content-addressed build/substitution scheduler")]
struct Cli {
    /// TOML config file (defaults are used when absent).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured state directory.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Realise a derivation's outputs, building or substituting as needed.
    Build { drv_path: StorePath },
    /// Realise a single store path via the configured substituters.
    Substitute { store_path: StorePath },
}

fn load_config(cli: &Cli) -> Result<EngineConfig, ExitError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .map_err(|e| ExitError::new(1, format!("failed to load {}: {e}", path.display())))?,
        None => EngineConfig::default(),
    }
    .apply_env_overrides();
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        eprintln!("njd: {e}");
        std::process::exit(e.code);
    }
}

async fn run() -> Result<(), ExitError> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    std::fs::create_dir_all(&config.state_dir)
        .map_err(|e| ExitError::new(1, format!("failed to create state dir: {e}")))?;

    let wal_path = config.state_dir.join("meta.wal");
    let metadata: Arc<dyn njd_storage::MetadataStore> = Arc::new(
        WalMetadataStore::open(&wal_path)
            .map_err(|e| ExitError::new(1, format!("failed to open metadata store: {e}")))?,
    );

    let locks = PathLockManager::new(config.state_dir.join("store"));
    // Resolving `build_users_group` against the system group database is a
    // collaborator concern (spec treats it as out of scope); without any
    // candidates, local builds without a configured build hook fail fast
    // with a clear `NoSlotAvailable` rather than silently hanging.
    let user_slots = UserSlotPool::new(&config.state_dir, Vec::new());

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(256);
    let executor = Arc::new(Executor::new(metadata.clone(), user_slots, locks, event_tx));
    let mut worker =
        njd_engine::Worker::new(executor, metadata, config, SystemClock, event_rx);

    let (kind, target, id) = match cli.command {
        Command::Build { drv_path } => {
            let id = worker.request_build(drv_path.clone());
            ("build", drv_path, id)
        }
        Command::Substitute { store_path } => {
            let id = worker.request_substitution(store_path.clone());
            ("substitute", store_path, id)
        }
    };
    output::print_goal_requested(kind, &target, &id);

    worker.run().await.map_err(|e| ExitError::new(1, e.to_string()))?;

    match worker.goal_succeeded(&id) {
        Some(true) => {
            output::print_goal_succeeded(&target);
            Ok(())
        }
        _ => {
            output::print_goal_failed(&target);
            Err(ExitError::new(1, format!("{kind} failed for {target}")))
        }
    }
}
