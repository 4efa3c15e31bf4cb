//! Cross-process advisory locks (fs2 flock).
//!
//! One lock file per sandbox serializes operations on that sandbox's
//! snapshot/volume pair; `store.lock` serializes mutations of the shared
//! snapshot directory and registry.

use crate::error::ShadowResult;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

const STORE_LOCK: &str = "store";

/// Directory of lock files.
#[derive(Debug, Clone)]
pub struct LockDir {
    dir: PathBuf,
}

/// RAII guard that releases the lock on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl LockDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Blocking acquire of the per-sandbox lock.
    pub fn sandbox(&self, name: &str) -> ShadowResult<LockGuard> {
        self.acquire(name)
    }

    /// Blocking acquire of the store-wide mutation lock.
    pub fn store(&self) -> ShadowResult<LockGuard> {
        self.acquire(STORE_LOCK)
    }

    fn acquire(&self, name: &str) -> ShadowResult<LockGuard> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.lock", name));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.lock_exclusive()?;
        tracing::trace!(lock = ?path, "lock acquired");
        Ok(LockGuard { file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Run `threads` holders of the same lock; true if any two overlapped.
    fn holders_overlap(dir: PathBuf, threads: usize, take: fn(&LockDir) -> LockGuard) -> bool {
        let inside = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let (d, inside, overlapped, entered, barrier) = (
                    dir.clone(),
                    inside.clone(),
                    overlapped.clone(),
                    entered.clone(),
                    barrier.clone(),
                );
                std::thread::spawn(move || {
                    let locks = LockDir::new(d);
                    barrier.wait();
                    let _guard = take(&locks);
                    if inside.swap(true, Ordering::SeqCst) {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_millis(20));
                    inside.store(false, Ordering::SeqCst);
                    entered.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst) as usize, threads);
        overlapped.load(Ordering::SeqCst)
    }

    #[test]
    fn store_lock_excludes_other_holders() {
        let tmp = TempDir::new().unwrap();
        assert!(!holders_overlap(tmp.path().to_path_buf(), 4, |l| l.store().unwrap()));
    }

    #[test]
    fn sandbox_lock_excludes_other_holders() {
        let tmp = TempDir::new().unwrap();
        assert!(!holders_overlap(tmp.path().to_path_buf(), 4, |l| l.sandbox("alpha").unwrap()));
    }

    #[test]
    fn different_sandboxes_do_not_block_each_other() {
        let tmp = TempDir::new().unwrap();
        let locks = LockDir::new(tmp.path());
        let _alpha = locks.sandbox("alpha").unwrap();
        let _beta = locks.sandbox("beta").unwrap();
        let _store = locks.store().unwrap();
        assert!(tmp.path().join("alpha.lock").exists());
        assert!(tmp.path().join("store.lock").exists());
    }
}
