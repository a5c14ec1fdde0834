//! File-based locking for the storage root.
//!
//! Cross-process (fs2) advisory locks:
//! - Global: `<root>/LOCK`, guards Registry mutations and the active pointer.
//! - Per session: `<root>/.locks/<id>`, held for the whole of a long operation
//!   (delete/convert/copy/resize/export) on that id.
//!
//! Locks are released on Drop.

use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::consts::{LOCK_FILE, SESSION_LOCKS_DIR};
use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
    mode: LockMode,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // unlock errors on drop are ignored; closing the fd releases the lock anyway.
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_at(path: PathBuf, mode: LockMode, block: bool) -> Result<LockGuard> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| SessionError::io("open lock file", &path, e))?;
    let res = match (mode, block) {
        (LockMode::Shared, true) => FileExt::lock_shared(&file),
        (LockMode::Exclusive, true) => FileExt::lock_exclusive(&file),
        (LockMode::Shared, false) => FileExt::try_lock_shared(&file),
        (LockMode::Exclusive, false) => FileExt::try_lock_exclusive(&file),
    };
    match res {
        Ok(()) => Ok(LockGuard { file, path, mode }),
        Err(e) if !block && e.kind() == fs2::lock_contended_error().kind() => {
            Err(SessionError::DeviceBusy { path })
        }
        Err(e) => Err(SessionError::io("lock", &path, e)),
    }
}

/// Acquire the global root lock. Blocks until acquired.
pub fn acquire_root_lock(root: &Path) -> Result<LockGuard> {
    lock_at(root.join(LOCK_FILE), LockMode::Exclusive, true)
}

/// Shared root lock for read-only views (list/status).
pub fn acquire_root_shared(root: &Path) -> Result<LockGuard> {
    lock_at(root.join(LOCK_FILE), LockMode::Shared, true)
}

/// Acquire the per-session lock without waiting; a concurrent holder yields DeviceBusy.
pub fn try_acquire_session_lock(root: &Path, id: &str) -> Result<LockGuard> {
    let dir = root.join(SESSION_LOCKS_DIR);
    std::fs::create_dir_all(&dir).map_err(|e| SessionError::io("create", &dir, e))?;
    lock_at(dir.join(id), LockMode::Exclusive, false)
}

/// True when another holder has the per-session lock of `id`.
///
/// Tries a shared lock on an existing lock file and never creates one, so
/// it is safe on a read-only root.
pub fn session_lock_held(root: &Path, id: &str) -> bool {
    let path = root.join(SESSION_LOCKS_DIR).join(id);
    let Ok(file) = std::fs::File::open(&path) else {
        return false;
    };
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            false
        }
        Err(e) => e.kind() == fs2::lock_contended_error().kind(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "sk-lock-{name}-{}-{}",
            std::process::id(),
            crate::util::now_unix_ms()
        ));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn session_lock_is_exclusive_until_dropped() {
        let root = scratch("sess");
        let g = try_acquire_session_lock(&root, "3").unwrap();
        assert_eq!(g.mode(), LockMode::Exclusive);
        assert!(g.path().ends_with(".locks/3"));

        // fs2 locks are per open file description, so a second open contends.
        let second = try_acquire_session_lock(&root, "3");
        assert!(matches!(second, Err(SessionError::DeviceBusy { .. })));

        drop(g);
        assert!(try_acquire_session_lock(&root, "3").is_ok());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn held_check_reports_current_holders() {
        let root = scratch("held");
        assert!(!session_lock_held(&root, "5"));
        let g = try_acquire_session_lock(&root, "5").unwrap();
        assert!(session_lock_held(&root, "5"));
        assert!(!session_lock_held(&root, "6"));
        drop(g);
        assert!(!session_lock_held(&root, "5"));
        // the check leaves the lock free for a real holder
        assert!(try_acquire_session_lock(&root, "5").is_ok());
        let _ = std::fs::remove_dir_all(&root);
    }
}
