//! Exclusive advisory locking of the container.
//!
//! Every mutating operation takes the lock for its whole duration; the
//! guard releases on all exit paths. Readers do not lock.

use std::fs::File;

use fs2::FileExt;

use crate::error::{Error, Result};

/// RAII guard holding an exclusive advisory lock on the container file.
pub struct LockGuard<'a> {
    file: &'a File,
}

/// Acquire an exclusive advisory lock without blocking. A container
/// already locked by another process yields `LockBusy`.
pub fn exclusive(file: &File) -> Result<LockGuard<'_>> {
    file.try_lock_exclusive().map_err(|err| {
        if err.kind() == fs2::lock_contended_error().kind() {
            Error::LockBusy
        } else {
            Error::Io(err)
        }
    })?;
    Ok(LockGuard { file })
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exclusive_lock_contention() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let first = File::open(tmp.path()).unwrap();
        let second = File::open(tmp.path()).unwrap();

        let guard = exclusive(&first).expect("first lock should succeed");
        // fs2 locks are per-file-description, so a second descriptor in
        // the same process still observes contention.
        assert!(matches!(exclusive(&second), Err(Error::LockBusy)));
        drop(guard);

        exclusive(&second).expect("lock should be free after release");
    }
}
