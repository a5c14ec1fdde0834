//! engine/convert: copy / convert / resize.
//!
//! Both copy and convert build a destination, mount source and destination on
//! scratch mountpoints, copy the tree and unmount. Convert then swaps the
//! descriptor (`<id>.session.tmp` → fsync → rename → fsync root) and only after
//! that destroys the old storage:
//! - crash before the rename: original intact, destination is UnreferencedStorage;
//! - crash after the rename: converted session in place, old storage is the orphan.
//!
//! The global lock is dropped during the data copy; the per-session lock is held
//! from start to finish.

use log::{info, warn};

use super::Engine;
use crate::consts::INFERRED_SIZE_HEADROOM_MB;
use crate::error::{Result, ResultExt, SessionError};
use crate::lock::try_acquire_session_lock;
use crate::metrics;
use crate::registry::Reservation;
use crate::session::{Session, SessionMode};
use crate::tree::{copy_tree, tree_size};
use crate::util::{bytes_to_mb_ceil, now_unix_ms};

impl Engine {
    /// Size for a destination built from `src` when the caller gives none.
    pub(crate) fn inferred_size_mb(&self, src: &Session) -> Result<u64> {
        if src.mode.has_size_ceiling() {
            return Ok(src.size_limit_mb);
        }
        let used_mb = bytes_to_mb_ceil(tree_size(&src.path)?);
        Ok((used_mb + INFERRED_SIZE_HEADROOM_MB).max(self.cfg.default_size_mb))
    }

    /// Under the re-taken root lock: the destination must still exist before its
    /// descriptor is written.
    pub(crate) fn ensure_built(&mut self, dst: &Session, reservation: &Reservation) -> Result<()> {
        if self.backend(dst.mode).is_materialized(&dst.path) {
            return Ok(());
        }
        if let Err(e) = self.registry.release(reservation) {
            warn!("engine: removing {} failed: {}", reservation.dir.display(), e);
        }
        Err(SessionError::io(
            "open storage",
            &dst.path,
            std::io::Error::from(std::io::ErrorKind::NotFound),
        )
        .in_session(&dst.id))
    }

    /// Materialize `reservation` as `mode`/`size` and fill it with the tree of `src`.
    /// The destination is not recorded; on failure its storage is removed.
    fn populate(
        &mut self,
        src: &Session,
        reservation: &Reservation,
        mode: SessionMode,
        size_limit_mb: u64,
        created_unix_ms: u64,
    ) -> Result<Session> {
        let res = self.populate_inner(src, reservation, mode, size_limit_mb, created_unix_ms);
        if res.is_err() {
            if let Err(e) = self.registry.release(reservation) {
                warn!("convert: removing {} failed: {}", reservation.dir.display(), e);
            }
        }
        res
    }

    fn populate_inner(
        &self,
        src: &Session,
        reservation: &Reservation,
        mode: SessionMode,
        size_limit_mb: u64,
        created_unix_ms: u64,
    ) -> Result<Session> {
        let src_mount = self.mount_source(src).in_session(&src.id)?;

        let used_bytes = match tree_size(&src_mount.mountpoint) {
            Ok(n) => n,
            Err(e) => {
                let _ = self.release(src_mount);
                return Err(e.in_session(&src.id));
            }
        };
        let used_mb = bytes_to_mb_ceil(used_bytes);
        if mode.has_size_ceiling() && used_mb > size_limit_mb {
            let _ = self.release(src_mount);
            return Err(SessionError::InsufficientSpace {
                required_mb: used_mb,
                available_mb: size_limit_mb,
            }
            .in_session(&reservation.id));
        }

        let built = self.backend(mode).materialize(&reservation.dir, size_limit_mb).map(|handle| Session {
            id: reservation.id.clone(),
            mode,
            size_limit_mb: handle.size_limit_mb,
            created_unix_ms,
            active: false,
            storage: reservation.storage.clone(),
            path: handle.dir,
            system: src.system.clone(),
        });
        let dst = match built {
            Ok(s) => s,
            Err(e) => {
                let _ = self.release(src_mount);
                return Err(e.in_session(&reservation.id));
            }
        };

        let dst_mount = match self.mount_scratch(&dst, false) {
            Ok(m) => m,
            Err(e) => {
                let _ = self.release(src_mount);
                return Err(e.in_session(&dst.id));
            }
        };

        let copied = copy_tree(&src_mount.mountpoint, &dst_mount.mountpoint);
        let dst_released = self.release(dst_mount);
        let src_released = self.release(src_mount);
        let stats = copied.in_session(&dst.id)?;
        dst_released.in_session(&dst.id)?;
        src_released.in_session(&src.id)?;

        metrics::record_tree_copy(stats.bytes);
        info!(
            "convert: copied id={} -> storage={} files={} bytes={}",
            src.id, dst.storage, stats.files, stats.bytes
        );
        Ok(dst)
    }

    /// Convert `id` to `target_mode` (optionally resizing) under the same id.
    pub fn convert(&mut self, id: &str, target_mode: SessionMode, size_limit_mb: Option<u64>) -> Result<Session> {
        let g = self.lock_root()?;
        let src = self.registry.get(id)?;
        if src.active {
            return Err(SessionError::SessionActive { id: id.to_string() });
        }
        let _sl = try_acquire_session_lock(&self.cfg.root, id).in_session(id)?;
        let size = match size_limit_mb {
            Some(0) => return Err(SessionError::Invalid("session size must be positive".into())),
            Some(n) => n,
            None => self.inferred_size_mb(&src).in_session(id)?,
        };
        self.host.capabilities(&self.cfg.root)?.check(target_mode, size)?;
        let generation = self.registry.next_generation(id);
        let reservation = self.registry.reserve(id, generation)?;
        drop(g);

        info!(
            "convert: id={} {} -> {} size_mb={} storage={}",
            id, src.mode, target_mode, size, reservation.storage
        );
        let dst = self.populate(&src, &reservation, target_mode, size, src.created_unix_ms)?;

        let _g = self.lock_root()?;
        self.ensure_built(&dst, &reservation)?;
        // the descriptor swap is the commit point
        self.registry.record(&dst)?;
        if let Err(e) = self.backend(src.mode).destroy(&Self::handle(&src)) {
            warn!(
                "convert: old storage {} left behind: {}",
                src.path.display(),
                e
            );
        } else {
            self.registry.forget_storage(&src.storage);
        }
        metrics::record_converted();
        info!("convert: id={} now mode={} storage={}", id, dst.mode, dst.storage);
        self.registry.get(id)
    }

    /// Copy `id` into a new session (new id), optionally in another mode/size.
    pub fn copy(
        &mut self,
        id: &str,
        target_mode: Option<SessionMode>,
        size_limit_mb: Option<u64>,
    ) -> Result<Session> {
        let g = self.lock_root()?;
        let src = self.registry.get(id)?;
        let _sl = try_acquire_session_lock(&self.cfg.root, id).in_session(id)?;
        let mode = target_mode.unwrap_or(src.mode);
        let size = match size_limit_mb {
            Some(0) => return Err(SessionError::Invalid("session size must be positive".into())),
            Some(n) => n,
            None => self.inferred_size_mb(&src).in_session(id)?,
        };
        self.host.capabilities(&self.cfg.root)?.check(mode, size)?;
        let new_id = self.registry.allocate_id();
        let reservation = self.registry.reserve(&new_id, 0)?;
        let _dl = try_acquire_session_lock(&self.cfg.root, &new_id)?;
        drop(g);

        info!("copy: id={} -> id={} mode={} size_mb={}", id, new_id, mode, size);
        let dst = self.populate(&src, &reservation, mode, size, now_unix_ms())?;

        let _g = self.lock_root()?;
        self.ensure_built(&dst, &reservation)?;
        self.registry.record(&dst)?;
        metrics::record_copied();
        metrics::record_session_created();
        Ok(dst)
    }

    /// Change the size limit of an inactive session.
    ///
    /// Growing keeps the backend and storage; shrinking a container converts the
    /// session onto itself with the smaller size. Native limits are advisory: grow
    /// records the new limit, shrink is a no-op.
    pub fn resize(&mut self, id: &str, new_size_mb: u64) -> Result<Session> {
        if new_size_mb == 0 {
            return Err(SessionError::Invalid("session size must be positive".into()));
        }
        let shrink = {
            let _g = self.lock_root()?;
            let mut s = self.registry.get(id)?;
            if s.active {
                return Err(SessionError::SessionActive { id: id.to_string() });
            }
            let _sl = try_acquire_session_lock(&self.cfg.root, id).in_session(id)?;

            if new_size_mb == s.size_limit_mb {
                info!("resize: id={} already {} MB", id, new_size_mb);
                return Ok(s);
            }
            if s.mode == SessionMode::Native {
                if new_size_mb < s.size_limit_mb {
                    warn!(
                        "resize: id={} native sessions cannot shrink; keeping {} MB",
                        id, s.size_limit_mb
                    );
                    return Ok(s);
                }
                s.size_limit_mb = new_size_mb;
                self.registry.record(&s)?;
                info!("resize: id={} native advisory limit now {} MB", id, new_size_mb);
                return self.registry.get(id);
            }
            if new_size_mb > s.size_limit_mb {
                self.host.capabilities(&self.cfg.root)?.check(s.mode, new_size_mb)?;
                let scratch = self.scratch_mountpoint(&s);
                if self.host.is_mounted(&scratch) {
                    return Err(SessionError::DeviceBusy { path: scratch }.in_session(id));
                }
                self.backend(s.mode)
                    .grow(&Self::handle(&s), new_size_mb)
                    .in_session(id)?;
                // recorded only after both steps of the grow succeeded
                s.size_limit_mb = new_size_mb;
                self.registry.record(&s)?;
                info!("resize: id={} grown to {} MB", id, new_size_mb);
                return self.registry.get(id);
            }
            s.mode
        };

        info!("resize: id={} shrinking to {} MB via conversion", id, new_size_mb);
        self.convert(id, shrink, Some(new_size_mb))
    }
}
