//! File-backed persistent store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/
//! ├── .locks/
//! │   └── <namespace>.lock     # advisory lock file, one per namespace
//! └── <namespace>/
//!     ├── <key>                # records written with write_atomic
//!     └── <collection>/<key>   # record collections (checkpoints, dead letters)
//! ```
//!
//! Every overwrite is write-to-temporary-then-rename: a reader sees either the
//! previous complete value or the new one. Append-only logs are only ever
//! extended; the one exception is [`Batch`] rolling back a line it appended
//! itself before its commit point.

mod lock;

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

use crate::errors::StoreError;
use lock::NamespaceLock;

const LOCK_DIR: &str = ".locks";

/// Durable key-value store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    lock_timeout: Duration,
    poll_interval: Duration,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// The root is canonicalized so that every derived path can be compared
    /// against it after symlink resolution.
    pub fn open(
        root: &Path,
        lock_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(root).map_err(|e| StoreError::io(root, e))?;
        let root = root.canonicalize().map_err(|e| StoreError::io(root, e))?;
        Ok(Self {
            root,
            lock_timeout,
            poll_interval,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Directory holding a namespace's records.
    pub fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, StoreError> {
        validate_namespace(namespace)?;
        Ok(self.root.join(namespace))
    }

    pub fn namespace_exists(&self, namespace: &str) -> Result<bool, StoreError> {
        Ok(self.namespace_dir(namespace)?.is_dir())
    }

    fn path_for(&self, namespace: &str, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.namespace_dir(namespace)?.join(key))
    }

    /// Read a record. A missing record is `Ok(None)`.
    pub fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(namespace, key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Replace a record atomically.
    pub fn write_atomic(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(namespace, key)?;
        write_atomic_with(&path, |file| file.write_all(bytes))
    }

    /// Append one line to a log record and return the log's length before
    /// the append.
    pub fn append_line(&self, namespace: &str, key: &str, line: &[u8]) -> Result<u64, StoreError> {
        let path = self.path_for(namespace, key)?;
        append_line_at(&path, line)
    }

    /// Names of the records in a collection, sorted ascending. Temporary
    /// artifacts of in-flight writes are never listed.
    pub fn list(&self, namespace: &str, collection: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.path_for(namespace, collection)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a record. Returns whether it existed.
    pub fn remove(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(namespace, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Run `f` while holding the namespace's exclusive lock.
    ///
    /// Blocks for at most the configured lock timeout; expiry surfaces as
    /// `StoreError::LockTimeout` converted into the caller's error type and
    /// `f` never runs. Nested calls on the same thread re-enter.
    pub fn with_lock<T, E, F>(&self, namespace: &str, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce() -> Result<T, E>,
    {
        validate_namespace(namespace)?;
        let lock_path = self.root.join(LOCK_DIR).join(format!("{namespace}.lock"));
        let _guard = NamespaceLock::acquire(
            &lock_path,
            namespace,
            self.lock_timeout,
            self.poll_interval,
        )?;
        f()
    }

    /// Start a multi-record mutation that is undone unless committed.
    pub fn batch(&self, namespace: &str) -> Batch<'_> {
        Batch {
            store: self,
            namespace: namespace.to_string(),
            undo: Vec::new(),
            committed: false,
        }
    }
}

enum Undo {
    Remove(PathBuf),
    Truncate(PathBuf, u64),
}

/// A group of writes inside one locked critical section.
///
/// New records and log lines are written first; the final
/// [`commit`](Batch::commit) overwrite is the single durability boundary. If
/// the commit fails, or the batch is dropped without committing, everything
/// written so far is undone in reverse order so the namespace is left exactly
/// as it was.
pub struct Batch<'a> {
    store: &'a FileStore,
    namespace: String,
    undo: Vec<Undo>,
    committed: bool,
}

impl Batch<'_> {
    /// Write a record that must not already exist.
    pub fn create(&mut self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.store.path_for(&self.namespace, key)?;
        if path.exists() {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "record already exists".to_string(),
            });
        }
        write_atomic_with(&path, |file| file.write_all(bytes))?;
        self.undo.push(Undo::Remove(path));
        Ok(())
    }

    pub fn append_line(&mut self, key: &str, line: &[u8]) -> Result<(), StoreError> {
        let path = self.store.path_for(&self.namespace, key)?;
        let existed = path.exists();
        let prior_len = append_line_at(&path, line)?;
        if existed {
            self.undo.push(Undo::Truncate(path, prior_len));
        } else {
            self.undo.push(Undo::Remove(path));
        }
        Ok(())
    }

    /// Atomically overwrite `key`; on success the batch is permanent.
    pub fn commit(mut self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let result = self.store.write_atomic(&self.namespace, key, bytes);
        if result.is_ok() {
            self.committed = true;
        }
        result
    }

    fn rollback(&mut self) {
        while let Some(step) = self.undo.pop() {
            let outcome = match &step {
                Undo::Remove(path) => match fs::remove_file(path) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
                Undo::Truncate(path, len) => OpenOptions::new()
                    .write(true)
                    .open(path)
                    .and_then(|file| file.set_len(*len).and_then(|_| file.sync_all())),
            };
            if let Err(e) = outcome {
                let path = match &step {
                    Undo::Remove(p) | Undo::Truncate(p, _) => p,
                };
                tracing::error!(path = %path.display(), "rollback step failed: {e}");
            }
        }
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.undo.is_empty() {
            tracing::warn!(namespace = %self.namespace, steps = self.undo.len(), "rolling back uncommitted batch");
            self.rollback();
        }
    }
}

/// Write through a temporary sibling and rename it over `path`.
///
/// On any failure the temporary artifact is removed and `path` is untouched.
pub(crate) fn write_atomic_with<F>(path: &Path, write: F) -> Result<(), StoreError>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let dir = path.parent().ok_or_else(|| StoreError::InvalidKey {
        key: path.display().to_string(),
        reason: "no parent directory".to_string(),
    })?;
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        write(&mut file)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    match result {
        Ok(()) => {
            sync_dir(dir);
            Ok(())
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(tmp = %tmp.display(), "failed to remove temporary file: {cleanup}");
                }
            }
            Err(StoreError::io(path, e))
        }
    }
}

fn append_line_at(path: &Path, line: &[u8]) -> Result<u64, StoreError> {
    if line.contains(&b'\n') {
        return Err(StoreError::InvalidKey {
            key: path.display().to_string(),
            reason: "log lines must not contain newlines".to_string(),
        });
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    let prior_len = file.metadata().map_err(|e| StoreError::io(path, e))?.len();

    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line);
    buf.push(b'\n');
    file.write_all(&buf)
        .and_then(|_| file.sync_data())
        .map_err(|e| StoreError::io(path, e))?;
    Ok(prior_len)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), "directory fsync failed: {e}");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn validate_namespace(namespace: &str) -> Result<(), StoreError> {
    let mut components = Path::new(namespace).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if !name.to_string_lossy().starts_with('.') => Ok(()),
        _ => Err(StoreError::InvalidKey {
            key: namespace.to_string(),
            reason: "namespace must be a single plain path component".to_string(),
        }),
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
            reason: "empty key".to_string(),
        });
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(name) if !name.to_string_lossy().starts_with('.') => {}
            _ => {
                return Err(StoreError::InvalidKey {
                    key: key.to_string(),
                    reason: "keys are relative paths of plain components".to_string(),
                });
            }
        }
    }
    Ok(())
}
