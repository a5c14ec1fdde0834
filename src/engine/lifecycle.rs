//! engine/lifecycle: create / activate / deactivate / delete / cleanup.
//!
//! `activate` is the only operation that flips the active pointer and it does so
//! under the global lock: the previous session is unmounted and the marker
//! cleared before the target is mounted and the marker rewritten. A failure
//! between the two steps leaves no active session.

use log::{info, warn};
use serde::Serialize;
use std::fs;

use super::Engine;
use crate::error::{Result, ResultExt, SessionError};
use crate::host::SystemRelease;
use crate::lock::try_acquire_session_lock;
use crate::metrics;
use crate::registry::Reservation;
use crate::session::{validate_id, Session, SessionMode};
use crate::util::now_unix_ms;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Outcome of `cleanup`: processing continues past individual failures.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl Engine {
    /// Create an inactive session. `size_limit_mb` defaults to the configured size.
    pub fn create(&mut self, mode: SessionMode, size_limit_mb: Option<u64>, id: Option<&str>) -> Result<Session> {
        let size = size_limit_mb.unwrap_or(self.cfg.default_size_mb);
        if size == 0 {
            return Err(SessionError::Invalid("session size must be positive".into()));
        }
        if let Some(id) = id {
            validate_id(id)?;
        }
        self.host.capabilities(&self.cfg.root)?.check(mode, size)?;

        let _g = self.lock_root()?;
        let id = match id {
            Some(id) => {
                if self.registry.contains(id) {
                    return Err(SessionError::Invalid(format!("session {id} already exists")));
                }
                id.to_string()
            }
            None => self.registry.allocate_id(),
        };
        let reservation = self.registry.reserve(&id, 0)?;
        let _sl = try_acquire_session_lock(&self.cfg.root, &id)?;
        let system = self.host.system_release();
        let session = self
            .build_session(&reservation, mode, size, now_unix_ms(), system)
            .in_session(&id)?;
        metrics::record_session_created();
        info!("create: id={} mode={} size_mb={}", session.id, session.mode, session.size_limit_mb);
        Ok(session)
    }

    /// Materialize storage for a reservation and record its descriptor; the
    /// reservation is released on any failure.
    pub(crate) fn build_session(
        &mut self,
        reservation: &Reservation,
        mode: SessionMode,
        size_limit_mb: u64,
        created_unix_ms: u64,
        system: SystemRelease,
    ) -> Result<Session> {
        let backend = self.backend(mode);
        let res = backend.materialize(&reservation.dir, size_limit_mb).and_then(|handle| {
            let session = Session {
                id: reservation.id.clone(),
                mode,
                size_limit_mb: handle.size_limit_mb,
                created_unix_ms,
                active: false,
                storage: reservation.storage.clone(),
                path: handle.dir,
                system,
            };
            self.registry.record(&session)?;
            Ok(session)
        });
        if res.is_err() {
            if let Err(e) = self.registry.release(reservation) {
                warn!("create: releasing {} failed: {}", reservation.dir.display(), e);
            }
        }
        res
    }

    /// Make `id` the active session. Activating the active session is a no-op.
    pub fn activate(&mut self, id: &str) -> Result<Session> {
        let _g = self.lock_root()?;
        let target = self.registry.get(id)?;
        let _sl = try_acquire_session_lock(&self.cfg.root, id).in_session(id)?;
        let backend = self.backend(target.mode);
        if !backend.is_materialized(&target.path) {
            return Err(SessionError::io(
                "open storage",
                &target.path,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )
            .in_session(id));
        }

        if let Some(current) = self.registry.active().cloned() {
            if current.id == id {
                let handle = Self::handle(&target);
                if !backend.is_mounted(&handle, &current.mountpoint) {
                    // marker survived a reboot; bring the mount back
                    backend.mount(&handle, &current.mountpoint).in_session(id)?;
                }
                info!("activate: id={} already active", id);
                return Ok(target);
            }
            let prev = self.registry.get(&current.id)?;
            self.backend(prev.mode)
                .unmount(&Self::handle(&prev), &current.mountpoint)
                .in_session(&prev.id)?;
            self.registry.clear_active()?;
            info!("activate: deactivated id={}", prev.id);
        }

        let target_mp = self.cfg.active_mountpoint();
        let mountpoint = backend.mount(&Self::handle(&target), &target_mp).in_session(id)?;
        self.registry.set_active(id, &mountpoint)?;
        metrics::record_activation();
        info!("activate: id={} mountpoint={}", id, mountpoint.display());
        self.registry.get(id)
    }

    /// Unmount the active session and clear the marker. Returns its id.
    pub fn deactivate(&mut self) -> Result<Option<String>> {
        let _g = self.lock_root()?;
        let Some(current) = self.registry.active().cloned() else {
            info!("deactivate: no active session");
            return Ok(None);
        };
        let s = self.registry.get(&current.id)?;
        self.backend(s.mode)
            .unmount(&Self::handle(&s), &current.mountpoint)
            .in_session(&s.id)?;
        if s.mode != SessionMode::Native {
            let _ = fs::remove_dir(&current.mountpoint);
        }
        self.registry.clear_active()?;
        info!("deactivate: id={}", s.id);
        Ok(Some(s.id))
    }

    /// Delete an inactive session: unmount its scratch mount, destroy storage,
    /// remove the descriptor, in that order.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        let _g = self.lock_root()?;
        let s = self.registry.get(id)?;
        if s.active {
            return Err(SessionError::SessionActive { id: id.to_string() });
        }
        let _sl = try_acquire_session_lock(&self.cfg.root, id).in_session(id)?;

        let backend = self.backend(s.mode);
        let handle = Self::handle(&s);
        let scratch = self.scratch_mountpoint(&s);
        if s.mode != SessionMode::Native && self.host.is_mounted(&scratch) {
            backend.unmount(&handle, &scratch).in_session(id)?;
            let _ = fs::remove_dir(&scratch);
        }
        backend.destroy(&handle).in_session(id)?;
        self.registry.forget_storage(&s.storage);
        self.registry.remove(id)?;
        metrics::record_session_deleted();
        info!("delete: id={} mode={} storage={}", id, s.mode, s.storage);
        Ok(())
    }

    /// Delete every inactive session older than `older_than_days`.
    pub fn cleanup(&mut self, older_than_days: u64) -> Result<CleanupReport> {
        let cutoff = now_unix_ms().saturating_sub(older_than_days.saturating_mul(DAY_MS));
        self.cleanup_created_before(cutoff)
    }

    /// Delete every inactive session created before `cutoff_unix_ms`.
    pub fn cleanup_created_before(&mut self, cutoff_unix_ms: u64) -> Result<CleanupReport> {
        let candidates: Vec<String> = {
            let _g = self.lock_root()?;
            self.registry
                .list()
                .into_iter()
                .filter(|s| !s.active && s.created_unix_ms < cutoff_unix_ms)
                .map(|s| s.id)
                .collect()
        };

        let mut report = CleanupReport::default();
        for id in candidates {
            match self.delete(&id) {
                Ok(()) => report.removed.push(id),
                Err(e) => {
                    warn!("cleanup: id={} failed: {}", id, e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        info!(
            "cleanup: removed={} failed={}",
            report.removed.len(),
            report.failed.len()
        );
        Ok(report)
    }
}
