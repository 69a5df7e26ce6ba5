//! Per-execution workspace directories.
//!
//! Every execution owns exactly one fresh directory under the workspace
//! root for its entire lifetime. Allocation failures are fatal; release is
//! best-effort and logged, since a leftover directory must never take down
//! the engine with it.
//!
//! The manager holds an advisory lock on the root directory while it is
//! alive. Only the exclusive holder may sweep orphans; engines sharing the
//! root would otherwise reap each other's live workspaces.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, RunletError};
use crate::registry::execution::ExecutionId;

pub struct WorkspaceManager {
    root: PathBuf,
    /// Exclusive advisory lock on the root directory, held for this
    /// manager's lifetime. `None` when another live engine holds the root.
    #[cfg(unix)]
    root_lock: Option<nix::fcntl::Flock<fs::File>>,
}

impl WorkspaceManager {
    /// Create the manager, ensuring the root directory exists, and try to
    /// take the root's lock.
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).map_err(|e| {
            RunletError::WorkspaceInit(format!(
                "cannot create workspace root {}: {}",
                root.display(),
                e
            ))
        })?;
        #[cfg(unix)]
        let root_lock = try_lock_root(&root);
        Ok(Self {
            root,
            #[cfg(unix)]
            root_lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether this manager holds the root exclusively. Several engines may
    /// share one root; only the exclusive holder may assume that a directory
    /// it does not recognize is an orphan.
    pub fn owns_root(&self) -> bool {
        #[cfg(unix)]
        {
            self.root_lock.is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Create a fresh, empty directory named by the execution id.
    ///
    /// Ids are unique, so an existing directory means a previous run left
    /// state behind or ids are being reused; both are configuration faults,
    /// not something to paper over.
    pub fn allocate(&self, id: &ExecutionId) -> Result<PathBuf> {
        let path = self.root.join(id.to_string());
        match fs::create_dir(&path) {
            Ok(()) => {
                debug!(execution_id = %id, path = %path.display(), "workspace allocated");
                Ok(path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RunletError::WorkspaceCollision {
                    path: path.display().to_string(),
                })
            }
            Err(e) => Err(RunletError::WorkspaceInit(format!(
                "cannot create workspace {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Recursively remove a workspace. Failure is logged, never escalated;
    /// the engine must not wedge an execution's terminal path on cleanup.
    pub fn release(&self, path: &Path) {
        if !path.starts_with(&self.root) {
            warn!(
                path = %path.display(),
                root = %self.root.display(),
                "refusing to release a path outside the workspace root"
            );
            return;
        }
        match fs::remove_dir_all(path) {
            Ok(()) => debug!(path = %path.display(), "workspace released"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "workspace already gone");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to release workspace");
            }
        }
    }

    /// Remove workspace directories that no live execution owns. Run at
    /// startup to reclaim directories orphaned by a previous crash, and only
    /// by the exclusive holder of the root (`owns_root`). Returns how many
    /// were removed.
    pub fn sweep_orphans<F>(&self, is_live: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "cannot scan workspace root");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_live(name) {
                continue;
            }
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "swept orphaned workspace");
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to sweep orphan");
                }
            }
        }
        removed
    }
}

/// Take an exclusive, non-blocking advisory lock on the root directory
/// itself. The lock rides on the opened directory handle and ends when that
/// handle drops or the process exits, so a crashed engine never leaves the
/// root locked.
#[cfg(unix)]
fn try_lock_root(root: &Path) -> Option<nix::fcntl::Flock<fs::File>> {
    use nix::fcntl::{Flock, FlockArg};

    let handle = match fs::File::open(root) {
        Ok(handle) => handle,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "cannot open workspace root for locking");
            return None;
        }
    };
    match Flock::lock(handle, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Some(lock),
        Err((_, errno)) => {
            debug!(root = %root.display(), error = %errno, "workspace root is held by another engine");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path().join("workspaces")).unwrap();
        (dir, manager)
    }

    #[test]
    fn allocate_creates_empty_directory_named_by_id() {
        let (_dir, manager) = manager();
        let id = ExecutionId::new();
        let path = manager.allocate(&id).unwrap();
        assert!(path.is_dir());
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), id.to_string());
        assert_eq!(fs::read_dir(&path).unwrap().count(), 0);
    }

    #[test]
    fn double_allocate_is_a_collision() {
        let (_dir, manager) = manager();
        let id = ExecutionId::new();
        manager.allocate(&id).unwrap();
        let err = manager.allocate(&id).unwrap_err();
        assert!(matches!(err, RunletError::WorkspaceCollision { .. }));
    }

    #[test]
    fn distinct_ids_get_distinct_directories() {
        let (_dir, manager) = manager();
        let a = manager.allocate(&ExecutionId::new()).unwrap();
        let b = manager.allocate(&ExecutionId::new()).unwrap();
        assert_ne!(a, b);
        fs::write(a.join("private.txt"), "secret").unwrap();
        assert_eq!(fs::read_dir(&b).unwrap().count(), 0);
    }

    #[test]
    fn release_removes_directory_and_is_idempotent() {
        let (_dir, manager) = manager();
        let id = ExecutionId::new();
        let path = manager.allocate(&id).unwrap();
        fs::write(path.join("out.txt"), "data").unwrap();
        manager.release(&path);
        assert!(!path.exists());
        // Second release of the same path must stay quiet.
        manager.release(&path);
    }

    #[test]
    fn release_refuses_paths_outside_root() {
        let (_dir, manager) = manager();
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("keep");
        fs::create_dir(&victim).unwrap();
        manager.release(&victim);
        assert!(victim.exists());
    }

    #[test]
    fn sweep_removes_only_orphans() {
        let (_dir, manager) = manager();
        let live = ExecutionId::new();
        let orphan = ExecutionId::new();
        let live_path = manager.allocate(&live).unwrap();
        let orphan_path = manager.allocate(&orphan).unwrap();

        let live_name = live.to_string();
        let removed = manager.sweep_orphans(|name| name == live_name);
        assert_eq!(removed, 1);
        assert!(live_path.exists());
        assert!(!orphan_path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn root_lock_is_exclusive_while_a_manager_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspaces");

        let first = WorkspaceManager::new(root.clone()).unwrap();
        assert!(first.owns_root());

        // flock is per open file description: a second manager in the same
        // process contends exactly like one in another process would.
        let second = WorkspaceManager::new(root.clone()).unwrap();
        assert!(!second.owns_root());

        drop(first);
        let third = WorkspaceManager::new(root).unwrap();
        assert!(third.owns_root());
    }
}
