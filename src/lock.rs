use std::fs::{File, OpenOptions};
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};

use crate::errors::{Error, Result};

/// Whole-file advisory exclusive lock; dropping the guard releases it, so
/// every exit path unlocks.
pub struct LockGuard {
    _lock: Flock<File>,
}

/// Make sure the zero-byte lock file exists.
pub fn create(path: &Path) -> Result<()> {
    OpenOptions::new().create(true).write(true).open(path)?;
    Ok(())
}

/// Block until the exclusive lock is ours.
pub fn acquire(path: &Path) -> Result<LockGuard> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    match Flock::lock(file, FlockArg::LockExclusive) {
        Ok(lock) => Ok(LockGuard { _lock: lock }),
        Err((_, errno)) => Err(Error::sys("flock", errno)),
    }
}
