//! Scoped OS-level advisory file locking.
//!
//! Every lock acquisition is paired with release on every exit path,
//! including error: the lock lives as long as the [`ScopedLock`] value, and
//! `Drop` unlocks unconditionally. There is no way to hold a lock without a
//! live `ScopedLock`, and no way to forget to release one short of
//! `std::mem::forget`.

use std::fs::File;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};

use fs2::FileExt;
use log::{debug, trace};

use crate::error::BlockFileError;

/// A file handle held under an exclusive or shared advisory lock.
pub struct ScopedLock {
    file: ManuallyDrop<File>,
    exclusive: bool,
}

impl ScopedLock {
    /// Acquire an exclusive lock on `file`. Non-blocking: if another process
    /// already holds it, returns `BlockFileError::Locked` immediately.
    pub fn acquire_exclusive(file: File) -> Result<Self, BlockFileError> {
        trace!("acquiring exclusive lock");
        file.try_lock_exclusive().map_err(|_| BlockFileError::Locked)?;
        debug!("acquired exclusive lock");
        Ok(ScopedLock {
            file: ManuallyDrop::new(file),
            exclusive: true,
        })
    }

    /// Acquire a shared (read) lock on `file`.
    pub fn acquire_shared(file: File) -> Result<Self, BlockFileError> {
        trace!("acquiring shared lock");
        file.try_lock_shared().map_err(|_| BlockFileError::Locked)?;
        debug!("acquired shared lock");
        Ok(ScopedLock {
            file: ManuallyDrop::new(file),
            exclusive: false,
        })
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Release the lock and hand back the bare file handle.
    pub fn into_inner(mut self) -> File {
        let _ = FileExt::unlock(&self.file);
        // Safety: `self` is consumed and never dropped again (no double unlock).
        let file = unsafe { ManuallyDrop::take(&mut self.file) };
        std::mem::forget(self);
        file
    }
}

impl Deref for ScopedLock {
    type Target = File;
    fn deref(&self) -> &File {
        &self.file
    }
}

impl DerefMut for ScopedLock {
    fn deref_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        trace!(
            "releasing {} lock",
            if self.exclusive { "exclusive" } else { "shared" }
        );
        let _ = FileExt::unlock(&self.file);
        unsafe { ManuallyDrop::drop(&mut self.file) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn exclusive_lock_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockme");
        std::fs::write(&path, b"data").unwrap();

        let file = File::options().read(true).write(true).open(&path).unwrap();
        let lock = ScopedLock::acquire_exclusive(file).unwrap();
        assert!(lock.is_exclusive());
        let mut file = lock.into_inner();
        file.write_all(b"!").unwrap();
    }
}
