//! Advisory lock over the whole storage directory
//!
//! Operations that change the world (snapshot, restore, prune, gc) hold an
//! exclusive `flock` on `world.lock` for their whole duration; preview holds
//! a shared one. Acquisition never blocks: a held lock is reported as
//! [`StrataError::WorldLocked`] so the caller can retry later. The lock is
//! released when the guard is dropped, including when the process dies.

use crate::error::{Result, StrataError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// How the lock is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers; any number at once
    Shared,
    /// A single writer
    Exclusive,
}

/// Guard for a held world lock
#[derive(Debug)]
pub struct WorldLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl WorldLock {
    /// Take the exclusive lock or fail with `WorldLocked`
    pub fn exclusive(path: &Path) -> Result<Self> {
        Self::acquire(path, LockMode::Exclusive)
    }

    /// Take a shared lock or fail with `WorldLocked`
    pub fn shared(path: &Path) -> Result<Self> {
        Self::acquire(path, LockMode::Shared)
    }

    /// Try to take the lock in `mode` without blocking
    pub fn acquire(path: &Path, mode: LockMode) -> Result<Self> {
        let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
        // Trait calls: std's inherent file locking has a different error type
        let attempt = match mode {
            LockMode::Shared => FileExt::try_lock_shared(&file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
        };
        match attempt {
            Ok(()) => {
                trace!("Acquired {:?} world lock at {:?}", mode, path);
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                    mode,
                })
            }
            Err(e) if is_contended(&e) => {
                debug!("World lock at {:?} is held elsewhere", path);
                Err(StrataError::WorldLocked(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether some other handle holds the lock exclusively
    #[cfg(test)]
    pub(crate) fn is_held(path: &Path) -> bool {
        let Ok(file) = File::open(path) else {
            return false;
        };
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }

    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mode the lock is held in
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for WorldLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("Failed to unlock {:?}: {}", self.path, e);
        }
        trace!("Released world lock at {:?}", self.path);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
