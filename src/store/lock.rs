//! Per-namespace advisory locking with a bounded wait.
//!
//! Locks are OS advisory locks (`flock` on Unix via `fs2`) on a lock file kept
//! outside the namespace directory, so locking an unknown project never
//! creates its directory. Separate handles conflict even inside one process,
//! which makes threads behave like independent worker processes.
//!
//! Nested acquisition of the same lock on the same thread re-enters instead of
//! waiting on itself.

use fs2::FileExt;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::errors::StoreError;

thread_local! {
    static HELD: RefCell<HashSet<PathBuf>> = RefCell::new(HashSet::new());
}

/// Guard for an acquired lock. Releasing happens on drop.
#[derive(Debug)]
pub(crate) struct NamespaceLock {
    path: PathBuf,
    /// `None` when this guard re-entered a lock already held by the thread.
    file: Option<File>,
}

impl NamespaceLock {
    pub(crate) fn acquire(
        path: &Path,
        namespace: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Self, StoreError> {
        if HELD.with(|held| held.borrow().contains(path)) {
            return Ok(Self {
                path: path.to_path_buf(),
                file: None,
            });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;

        let started = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        tracing::warn!(namespace, ?waited, "lock acquisition timed out");
                        return Err(StoreError::LockTimeout {
                            namespace: namespace.to_string(),
                            waited,
                        });
                    }
                    std::thread::sleep(poll.min(timeout - waited));
                }
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }

        HELD.with(|held| held.borrow_mut().insert(path.to_path_buf()));
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// Whether this guard holds the OS lock (as opposed to re-entering it).
    #[cfg(test)]
    fn is_outermost(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for NamespaceLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            HELD.with(|held| held.borrow_mut().remove(&self.path));
            if let Err(e) = FileExt::unlock(&file) {
                tracing::error!(path = %self.path.display(), "failed to release lock: {e}");
            }
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
