use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Name of the lock file kept at the top of a sync root.
pub const LOCK_FILE_NAME: &str = ".reposync.lock";

/// A guard that holds an exclusive lock on a sync root.
/// Lock is released when dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Lock file location for `root`.
    pub fn path_for(root: &Path) -> PathBuf {
        root.join(LOCK_FILE_NAME)
    }

    /// Try to lock `root` without blocking.
    /// Returns None if another process (or handle) already holds it.
    pub fn try_acquire(root: &Path) -> io::Result<Option<Self>> {
        let path = Self::path_for(root);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_creates_lock_file() {
        let dir = tempdir().unwrap();
        let lock = RunLock::try_acquire(dir.path()).unwrap().unwrap();
        assert!(lock.path().exists());
        assert_eq!(lock.path(), dir.path().join(LOCK_FILE_NAME));
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = tempdir().unwrap();
        let _lock = RunLock::try_acquire(dir.path()).unwrap().unwrap();
        assert!(RunLock::try_acquire(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        {
            let _lock = RunLock::try_acquire(dir.path()).unwrap().unwrap();
        }
        assert!(RunLock::try_acquire(dir.path()).unwrap().is_some());
    }

    #[test]
    fn test_other_thread_cannot_take_held_lock() {
        let dir = tempdir().unwrap();
        let root = Arc::new(dir.path().to_path_buf());
        let barrier = Arc::new(Barrier::new(2));

        let lock = RunLock::try_acquire(&root).unwrap().unwrap();

        let root_clone = Arc::clone(&root);
        let barrier_clone = Arc::clone(&barrier);
        let handle = thread::spawn(move || {
            barrier_clone.wait();
            RunLock::try_acquire(&root_clone).unwrap().is_none()
        });

        barrier.wait();
        assert!(handle.join().unwrap(), "lock should be held by main thread");
        drop(lock);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(RunLock::try_acquire(&dir.path().join("missing")).is_err());
    }
}
