//! Atomic file primitives.
//!
//! [`write_atomic`] gives the whole-file contract: a reader sees either the
//! prior content or the new content, never a partial write, even across a
//! crash. [`AppendHandle`] gives the ledger its synced, optionally locked
//! append path.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::warn;

/// How the append handle serializes cross-process writers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockMode {
    /// Take an advisory exclusive lock for the handle's lifetime
    /// (best-effort; falls back with a warning where unsupported).
    #[default]
    Advisory,
    /// Single-writer assumption; no lock.
    None,
}

/// Atomically replace the file at `path` with `bytes`.
///
/// Writes to a temp file in the same directory, fsyncs the bytes, renames
/// over `path`, then fsyncs the parent directory so the rename itself is
/// durable.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    // Durability of the rename requires the directory entry to hit disk.
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// An append-only file handle with per-line durability.
///
/// The advisory lock (when enabled) is held for the handle's lifetime and
/// released on drop; within a process, callers serialize through their own
/// mutex.
#[derive(Debug)]
pub struct AppendHandle {
    file: File,
    locked: bool,
}

impl AppendHandle {
    /// Open `path` for appending, creating it (and its parent directory)
    /// if absent.
    pub fn open(path: &Path, lock_mode: LockMode) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let locked = match lock_mode {
            LockMode::None => false,
            LockMode::Advisory => match file.lock_exclusive() {
                Ok(()) => true,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "advisory lock unavailable, continuing unlocked");
                    false
                }
            },
        };

        Ok(Self { file, locked })
    }

    /// Append one line (a trailing newline is added) and fsync it.
    pub fn append_line(&mut self, line: &str) -> io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Whether the advisory lock was actually acquired.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for AppendHandle {
    fn drop(&mut self) {
        if self.locked {
            let _ = fs2::FileExt::unlock(&self.file);
        }
    }
}
