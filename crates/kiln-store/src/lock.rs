use crate::StoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::debug;

/// Exclusive advisory lock on one lock file, released on drop.
///
/// Held only around short mutations (committing a staged folder, rewriting
/// a status record), never across network transfers or builds.
#[derive(Debug)]
pub struct RefLock {
    lock_file: File,
}

fn open(lock_path: &Path) -> Result<File, StoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl RefLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, StoreError> {
        let file = open(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| StoreError::LockFailed(format!("{}: {e}", lock_path.display())))?;
        debug!("locked {}", lock_path.display());
        Ok(Self { lock_file: file })
    }

    /// `None` when another holder has the lock. Garbage collection uses this
    /// to leave a reference alone rather than wait on it.
    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, StoreError> {
        let file = open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for RefLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("locks/a.lock");
        {
            let _lock = RefLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }
        assert!(RefLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("a.lock");
        let _lock = RefLock::acquire(&lock_path).unwrap();
        assert!(RefLock::try_acquire(&lock_path).unwrap().is_none());
    }

    #[test]
    fn lock_serializes_threads() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("a.lock");
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock_path = lock_path.clone();
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    let _lock = RefLock::acquire(&lock_path).unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
