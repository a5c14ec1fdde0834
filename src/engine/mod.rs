//! engine: high-level session API over the registry, backends and host.
//!
//! Split by submodule:
//! - mod.rs      : Engine struct, open, read-only views (list/status/info), mount helpers
//! - lifecycle.rs: create / activate / deactivate / delete / cleanup
//! - convert.rs  : copy / convert / resize (tree copy between backends)
//! - archive.rs  : export / import of `.tar.zst` archives
//!
//! Locking: every mutation takes the global root lock (`<root>/LOCK`) and
//! re-scans the registry under it; long operations on one session also hold its
//! per-session lock. Locks are never nested within one call.

pub mod archive;
pub mod convert;
pub mod lifecycle;

use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{backend_for, Backend, StorageHandle, Usage};
use crate::config::EngineConfig;
use crate::error::{Result, ResultExt, SessionError};
use crate::host::{Capabilities, FsInfo, Host};
use crate::lock::{acquire_root_lock, acquire_root_shared, LockGuard};
use crate::metrics::{self, MetricsSnapshot};
use crate::registry::{Orphan, Registry};
use crate::session::{Session, SessionMode};
use crate::util::format_size;

pub use archive::{ArchiveHeader, ExportReport, ImportOptions};
pub use lifecycle::CleanupReport;

/// Session plus its measured usage, as shown by `list`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    #[serde(flatten)]
    pub session: Session,
    pub used_bytes: u64,
    pub size_display: String,
}

/// Storage root health and catalog summary.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub root: PathBuf,
    pub found: bool,
    pub writable: bool,
    pub filesystem: Option<FsInfo>,
    pub active: Option<String>,
    pub active_mountpoint: Option<PathBuf>,
    pub sessions: usize,
    pub orphans: Vec<Orphan>,
    pub metrics: MetricsSnapshot,
}

/// A session tree reachable at `mountpoint`; `owned` mounts are undone by `release`.
#[derive(Debug)]
pub(crate) struct Mounted {
    pub handle: StorageHandle,
    pub mountpoint: PathBuf,
    pub owned: bool,
}

pub struct Engine {
    cfg: EngineConfig,
    host: Arc<dyn Host>,
    registry: Registry,
    root_existed: bool,
}

impl Engine {
    /// Open the storage root (created if missing) and scan it.
    pub fn open(cfg: EngineConfig, host: Arc<dyn Host>) -> Result<Self> {
        let root_existed = cfg.root.is_dir();
        if !root_existed {
            info!("engine: creating storage root {}", cfg.root.display());
            fs::create_dir_all(&cfg.root).map_err(|e| SessionError::io("create", &cfg.root, e))?;
        }
        fs::create_dir_all(&cfg.work_dir).map_err(|e| SessionError::io("create", &cfg.work_dir, e))?;

        let registry = {
            let _g = acquire_root_shared(&cfg.root)?;
            Registry::open(&cfg.root)?
        };
        for o in registry.orphans() {
            if o.in_progress {
                info!("engine: in progress kind={} path={}", o.kind, o.path.display());
            } else {
                warn!("engine: orphan kind={} path={}", o.kind, o.path.display());
            }
        }
        info!(
            "engine: opened root={} sessions={} active={}",
            cfg.root.display(),
            registry.list().len(),
            registry.active().map(|m| m.id.as_str()).unwrap_or("-")
        );
        Ok(Self {
            cfg,
            host,
            registry,
            root_existed,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn root(&self) -> &Path {
        &self.cfg.root
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub(crate) fn backend(&self, mode: SessionMode) -> Box<dyn Backend> {
        backend_for(mode, self.host.clone(), &self.cfg)
    }

    pub(crate) fn handle(s: &Session) -> StorageHandle {
        StorageHandle::new(s.mode, s.path.clone(), s.size_limit_mb)
    }

    /// Exclusive root lock plus a fresh scan.
    pub(crate) fn lock_root(&mut self) -> Result<LockGuard> {
        let g = acquire_root_lock(&self.cfg.root)?;
        self.registry.refresh()?;
        Ok(g)
    }

    fn refresh_shared(&mut self) -> Result<()> {
        let _g = acquire_root_shared(&self.cfg.root)?;
        self.registry.refresh()
    }

    /// Scratch mountpoint used when `s` is mounted outside activation.
    pub fn scratch_mountpoint(&self, s: &Session) -> PathBuf {
        self.scratch_path(&s.storage)
    }

    pub(crate) fn scratch_path(&self, storage: &str) -> PathBuf {
        self.cfg.work_dir.join(format!("{storage}.mnt"))
    }

    /// Mount `s` on its scratch mountpoint.
    pub(crate) fn mount_scratch(&self, s: &Session, read_only: bool) -> Result<Mounted> {
        let backend = self.backend(s.mode);
        let handle = Self::handle(s);
        if s.mode == SessionMode::Native {
            let mountpoint = backend.mount(&handle, &s.path)?;
            return Ok(Mounted {
                handle,
                mountpoint,
                owned: false,
            });
        }
        let target = self.scratch_mountpoint(s);
        if self.host.is_mounted(&target) {
            return Err(SessionError::DeviceBusy { path: target });
        }
        let mountpoint = if read_only {
            backend.mount_read_only(&handle, &target)?
        } else {
            backend.mount(&handle, &target)?
        };
        Ok(Mounted {
            handle,
            mountpoint,
            owned: true,
        })
    }

    /// Where the tree of `s` can be read: the active mountpoint for the active
    /// session, otherwise a read-only scratch mount.
    pub(crate) fn mount_source(&self, s: &Session) -> Result<Mounted> {
        if s.active {
            if let Some(m) = self.registry.active() {
                return Ok(Mounted {
                    handle: Self::handle(s),
                    mountpoint: m.mountpoint.clone(),
                    owned: false,
                });
            }
        }
        self.mount_scratch(s, true)
    }

    pub(crate) fn release(&self, m: Mounted) -> Result<()> {
        if !m.owned {
            return Ok(());
        }
        self.backend(m.handle.mode).unmount(&m.handle, &m.mountpoint)?;
        let _ = fs::remove_dir(&m.mountpoint);
        Ok(())
    }

    pub fn get(&mut self, id: &str) -> Result<Session> {
        self.refresh_shared()?;
        self.registry.get(id)
    }

    pub fn usage(&self, s: &Session) -> Result<Usage> {
        self.backend(s.mode).usage(&Self::handle(s)).in_session(&s.id)
    }

    /// Sessions with usage, ordered by creation time.
    pub fn list(&mut self) -> Result<Vec<SessionInfo>> {
        self.refresh_shared()?;
        let mut out = Vec::new();
        for s in self.registry.list() {
            let (used_bytes, size_display) = match self.usage(&s) {
                Ok(u) if s.mode == SessionMode::Dynfilefs => (
                    u.used_bytes,
                    format!(
                        "{}/{}",
                        format_size(u.used_bytes),
                        format_size(s.size_limit_mb * crate::consts::MB)
                    ),
                ),
                Ok(u) => (u.used_bytes, format_size(u.used_bytes)),
                Err(e) => {
                    warn!("engine: usage of session {} unavailable: {}", s.id, e);
                    (0, "?".to_string())
                }
            };
            out.push(SessionInfo {
                session: s,
                used_bytes,
                size_display,
            });
        }
        Ok(out)
    }

    /// The active session, if any.
    pub fn active(&mut self) -> Result<Option<Session>> {
        self.refresh_shared()?;
        Ok(match self.registry.active() {
            Some(m) => Some(self.registry.get(&m.id)?),
            None => None,
        })
    }

    /// Filesystem of the storage root and the modes it can hold.
    pub fn info(&self) -> Result<Capabilities> {
        self.host.capabilities(&self.cfg.root)
    }

    pub fn status(&mut self) -> Result<Status> {
        self.refresh_shared()?;
        let root = self.cfg.root.clone();
        let probe = root.join(format!(".sk-write-probe-{}", std::process::id()));
        let writable = match fs::write(&probe, b"") {
            Ok(()) => {
                let _ = fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        };
        let filesystem = match self.host.filesystem(&root) {
            Ok(fs) => Some(fs),
            Err(e) => {
                warn!("engine: filesystem of {} unknown: {}", root.display(), e);
                None
            }
        };
        Ok(Status {
            found: self.root_existed,
            writable,
            filesystem,
            active: self.registry.active().map(|m| m.id.clone()),
            active_mountpoint: self.registry.active().map(|m| m.mountpoint.clone()),
            sessions: self.registry.list().len(),
            orphans: self.registry.orphans().to_vec(),
            metrics: metrics::snapshot(),
            root,
        })
    }

    pub fn orphans(&mut self) -> Result<Vec<Orphan>> {
        self.refresh_shared()?;
        Ok(self.registry.orphans().to_vec())
    }

    /// Delete every orphan; `confirm` must be true.
    pub fn reclaim(&mut self, confirm: bool) -> Result<Vec<Orphan>> {
        let _g = self.lock_root()?;
        let removed = self.registry.reclaim_orphans(confirm)?;
        info!("engine: reclaimed {} orphan(s)", removed.len());
        Ok(removed)
    }
}
