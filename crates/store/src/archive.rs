//! Archive serialisation: a canonical byte stream for a store path's
//! contents, used for fixed-output hashing and reference scanning.
//!
//! NAR (Nix ARchive) serialisation is a collaborator concern out of scope
//! per spec §1; this module implements a simpler canonical tree walk that
//! is deterministic, portable, and sufficient for this engine's hashing and
//! scanning needs (spec §4.F steps 1 and 3) without claiming bit
//! compatibility with NAR.

use crate::hash::StreamingHasher;
use std::fs;
use std::io;
use std::path::Path;

/// Serialise `root` (file or directory tree) into a canonical byte stream,
/// feeding each chunk to `sink` as it is produced. Returns the total byte
/// count written, which the caller may also use as the on-disk size.
pub fn serialise(root: &Path, mut sink: impl FnMut(&[u8])) -> io::Result<u64> {
    let mut written = 0u64;
    let mut emit = |bytes: &[u8]| {
        sink(bytes);
        written += bytes.len() as u64;
    };
    walk(root, &mut emit)?;
    Ok(written)
}

fn walk(path: &Path, emit: &mut impl FnMut(&[u8])) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_symlink() {
        let target = fs::read_link(path)?;
        emit(b"symlink\0");
        emit(target.to_string_lossy().as_bytes());
        emit(b"\0");
    } else if meta.is_dir() {
        emit(b"directory\0");
        let mut entries: Vec<_> = fs::read_dir(path)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            emit(entry.file_name().to_string_lossy().as_bytes());
            emit(b"\0");
            walk(&entry.path(), emit)?;
        }
        emit(b"end\0");
    } else {
        let executable = is_executable(&meta);
        emit(if executable { b"exe\0" as &[u8] } else { b"regular\0" });
        let contents = fs::read(path)?;
        emit(&contents.len().to_le_bytes());
        emit(&contents);
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

/// Hash a path's archive serialisation in one pass.
pub fn hash_path(root: &Path) -> io::Result<crate::hash::Sha256Hash> {
    let mut hasher = StreamingHasher::new();
    serialise(root, |bytes| hasher.update(bytes))?;
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hashes_are_stable_for_identical_trees() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        for dir in [&dir1, &dir2] {
            let mut f = fs::File::create(dir.path().join("a.txt")).unwrap();
            f.write_all(b"hello").unwrap();
            fs::create_dir(dir.path().join("sub")).unwrap();
            let mut f2 = fs::File::create(dir.path().join("sub/b.txt")).unwrap();
            f2.write_all(b"world").unwrap();
        }
        assert_eq!(hash_path(dir1.path()).unwrap(), hash_path(dir2.path()).unwrap());
    }

    #[test]
    fn hash_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let h1 = hash_path(dir.path()).unwrap();
        fs::write(dir.path().join("a.txt"), b"hello!").unwrap();
        let h2 = hash_path(dir.path()).unwrap();
        assert_ne!(h1, h2);
    }
}
