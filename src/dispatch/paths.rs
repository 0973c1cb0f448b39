//! Containment checks for paths under the project-data root.

use std::path::{Component, Path, PathBuf};

use crate::errors::{PipelineError, Result};

/// Resolves paths and refuses any that leave the root.
///
/// Resolution follows symlinks on every existing component, so a symlink
/// inside the root that points outside it is rejected. Components that do
/// not exist yet cannot be symlinks and are appended lexically; `..` is never
/// accepted.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// `root` must exist; it is canonicalized once.
    pub fn new(root: &Path) -> Result<Self> {
        let root = root.canonicalize().map_err(|_| PipelineError::PathEscape {
            path: root.to_path_buf(),
            root: root.to_path_buf(),
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path relative to the root.
    pub fn resolve(&self, relative: &Path) -> Result<PathBuf> {
        if relative.is_absolute() {
            return Err(self.escape(relative));
        }
        self.contain(&self.root.join(relative), relative)
    }

    /// Check an absolute (or working-directory relative) path.
    pub fn check(&self, path: &Path) -> Result<PathBuf> {
        self.contain(path, path)
    }

    fn contain(&self, candidate: &Path, reported: &Path) -> Result<PathBuf> {
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(self.escape(reported));
        }

        // Canonicalize the deepest existing ancestor, then re-append the rest.
        let mut existing = candidate.to_path_buf();
        let mut pending: Vec<std::ffi::OsString> = Vec::new();
        let resolved_base = loop {
            match existing.canonicalize() {
                Ok(resolved) => break resolved,
                Err(_) => {
                    let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                        return Err(self.escape(reported));
                    };
                    pending.push(name);
                    if !existing.pop() {
                        return Err(self.escape(reported));
                    }
                }
            }
        };

        let mut resolved = resolved_base;
        for name in pending.into_iter().rev() {
            resolved.push(name);
        }
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            tracing::warn!(path = %reported.display(), root = %self.root.display(), "rejected path outside project-data root");
            Err(self.escape(reported))
        }
    }

    fn escape(&self, path: &Path) -> PipelineError {
        PipelineError::PathEscape {
            path: path.to_path_buf(),
            root: self.root.clone(),
        }
    }
}
