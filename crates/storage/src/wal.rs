// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only write-ahead log for the metadata store.
//!
//! One JSON record per line. `WalWriter::append` is the only place that
//! touches the file; replay on startup folds every record through
//! [`crate::state::MaterializedState::apply`] to rebuild the in-memory
//! index. Rotated segments are compressed with `zstd`, matching the
//! teacher's WAL/MaterializedState split.

use njd_store::{StorePath, ValidPathInfo};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One fact appended to the log. Application must be idempotent: the same
/// record may be replayed more than once (crash between append and an
/// in-memory-only side effect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum WalRecord {
    RegisterValidPaths { infos: Vec<ValidPathInfo> },
    RegisterFailedPath { path: StorePath },
    ClearFailureCache,
    AddTempRoot { path: StorePath },
}

pub struct WalWriter {
    path: PathBuf,
    file: File,
}

impl WalWriter {
    /// Open (creating if absent) the log at `path` for appending.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn append(&mut self, record: &WalRecord) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()
    }

    /// Compress the current log to `<path>.zst` and truncate it, matching
    /// the teacher's rotate-then-compress behaviour. The failure cache's
    /// "users may clear it" contract (spec §4.G) is a degenerate rotation
    /// that discards the compressed segment too.
    pub fn rotate(&mut self, keep_compressed: bool) -> io::Result<()> {
        let contents = std::fs::read(&self.path)?;
        if keep_compressed && !contents.is_empty() {
            let compressed = zstd::encode_all(contents.as_slice(), 0)?;
            let mut archive = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path.with_extension("log.zst"))?;
            archive.write_all(&compressed)?;
        }
        self.file = OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
        Ok(())
    }
}

/// Replay every record in `path` in append order. Missing file means an
/// empty log (fresh store), not an error.
pub fn replay(path: &Path) -> io::Result<Vec<WalRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: WalRecord = serde_json::from_str(&line)?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("metadata.wal");
        let mut writer = WalWriter::open(&log_path).unwrap();
        let path = StorePath::from_fingerprint("x", "foo").unwrap();
        writer.append(&WalRecord::AddTempRoot { path: path.clone() }).unwrap();
        writer.append(&WalRecord::RegisterFailedPath { path }).unwrap();

        let records = replay(&log_path).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn replay_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = replay(&dir.path().join("nope.wal")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn rotate_compresses_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("metadata.wal");
        let mut writer = WalWriter::open(&log_path).unwrap();
        let path = StorePath::from_fingerprint("x", "foo").unwrap();
        writer.append(&WalRecord::AddTempRoot { path }).unwrap();
        writer.rotate(true).unwrap();
        assert_eq!(std::fs::read(&log_path).unwrap().len(), 0);
        assert!(log_path.with_extension("log.zst").exists());
    }
}
