//! backend: storage drivers behind a session.
//!
//! One driver per `SessionMode`, all with the same capability set:
//! materialize, mount, unmount, grow, usage, destroy. Drivers are stateless
//! over a `StorageHandle` and reach the OS only through `Host`.
//!
//! - native    → the storage directory *is* the session tree;
//! - dynfilefs → `changes.dat` (+ `changes.dat.N` parts) exposed as `virtual.dat`;
//! - raw       → fixed-size `changes.img` ext4 image.
//!
//! Errors are returned raw; the engine attaches the session id.

pub mod dynfilefs;
pub mod native;
pub mod raw;

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{Result, SessionError};
use crate::host::Host;
use crate::session::SessionMode;

pub use dynfilefs::DynfilefsBackend;
pub use native::NativeBackend;
pub use raw::RawBackend;

/// Materialized storage of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHandle {
    pub mode: SessionMode,
    pub dir: PathBuf,
    pub size_limit_mb: u64,
}

impl StorageHandle {
    pub fn new(mode: SessionMode, dir: impl Into<PathBuf>, size_limit_mb: u64) -> Self {
        Self {
            mode,
            dir: dir.into(),
            size_limit_mb,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub used_mb: u64,
    pub used_bytes: u64,
    pub capacity_mb: u64,
}

pub trait Backend: Send + Sync {
    fn mode(&self) -> SessionMode;

    /// Build empty storage in `storage_dir` (the directory may already exist, empty).
    fn materialize(&self, storage_dir: &Path, size_limit_mb: u64) -> Result<StorageHandle>;

    /// Make the session tree reachable at `target`; returns the effective mountpoint.
    fn mount(&self, handle: &StorageHandle, target: &Path) -> Result<PathBuf>;

    /// Like `mount`, for readers (export, copy source).
    fn mount_read_only(&self, handle: &StorageHandle, target: &Path) -> Result<PathBuf> {
        self.mount(handle, target)
    }

    fn unmount(&self, handle: &StorageHandle, mountpoint: &Path) -> Result<()>;

    /// Enlarge the storage. Only called while unmounted.
    fn grow(&self, handle: &StorageHandle, new_size_mb: u64) -> Result<()>;

    fn usage(&self, handle: &StorageHandle) -> Result<Usage>;

    /// Remove the storage entry entirely. Missing storage is not an error.
    fn destroy(&self, handle: &StorageHandle) -> Result<()> {
        remove_storage_dir(&handle.dir)
    }

    fn is_materialized(&self, dir: &Path) -> bool;

    /// Whether `mountpoint` currently exposes this storage.
    fn is_mounted(&self, handle: &StorageHandle, mountpoint: &Path) -> bool;
}

/// Driver for `mode`.
pub fn backend_for(mode: SessionMode, host: Arc<dyn Host>, cfg: &EngineConfig) -> Box<dyn Backend> {
    match mode {
        SessionMode::Native => Box::new(NativeBackend::new(host)),
        SessionMode::Dynfilefs => Box::new(DynfilefsBackend::new(
            host,
            cfg.dynfilefs_split_mb,
            cfg.work_dir.clone(),
        )),
        SessionMode::Raw => Box::new(RawBackend::new(host, cfg.preallocate_raw)),
    }
}

/// Free-space gate shared by the container drivers.
pub(crate) fn ensure_free_space(host: &dyn Host, dir: &Path, required_mb: u64) -> Result<()> {
    let probe = existing_ancestor(dir);
    let available_mb = host.free_space_mb(&probe)?;
    if available_mb < required_mb {
        return Err(SessionError::InsufficientSpace {
            required_mb,
            available_mb,
        });
    }
    Ok(())
}

fn existing_ancestor(p: &Path) -> PathBuf {
    let mut cur = p;
    loop {
        if cur.exists() {
            return cur.to_path_buf();
        }
        match cur.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => cur = parent,
            _ => return p.to_path_buf(),
        }
    }
}

pub(crate) fn remove_storage_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SessionError::io("remove", dir, e)),
    }
}

pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| SessionError::io("create", dir, e))
}
