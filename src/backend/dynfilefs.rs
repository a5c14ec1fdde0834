//! backend/dynfilefs: sparse, logically expandable container.
//!
//! Layout: `<dir>/changes.dat` plus `changes.dat.N` split parts. dynfilefs exposes
//! the container as `<fuse_dir>/virtual.dat`, which carries an ext4 filesystem and
//! is loop-mounted on the session mountpoint. Mounts use `<mountpoint>.fuse` as the
//! FUSE directory; offline work (format, grow) uses a scratch one under the work dir.

use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{ensure_dir, ensure_free_space, Backend, StorageHandle, Usage};
use crate::consts::DYNFILEFS_CONTAINER;
use crate::error::{Result, SessionError};
use crate::host::Host;
use crate::session::SessionMode;
use crate::util::bytes_to_mb_ceil;

pub struct DynfilefsBackend {
    host: Arc<dyn Host>,
    split_mb: u64,
    work_dir: PathBuf,
}

impl DynfilefsBackend {
    pub fn new(host: Arc<dyn Host>, split_mb: u64, work_dir: PathBuf) -> Self {
        Self {
            host,
            split_mb,
            work_dir,
        }
    }

    fn container(dir: &Path) -> PathBuf {
        dir.join(DYNFILEFS_CONTAINER)
    }

    fn fuse_dir_for(mountpoint: &Path) -> PathBuf {
        let name = mountpoint
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        mountpoint.with_file_name(format!("{name}.fuse"))
    }

    fn offline_fuse_dir(&self, dir: &Path, purpose: &str) -> PathBuf {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.work_dir
            .join(format!("{name}.{purpose}.{}.fuse", std::process::id()))
    }

    /// Attach offline, run `f` on the exposed virtual file, always detach.
    fn with_attached<T>(
        &self,
        dir: &Path,
        size_mb: u64,
        purpose: &str,
        f: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<T> {
        let fuse_dir = self.offline_fuse_dir(dir, purpose);
        let virtual_file = self
            .host
            .dynfilefs_attach(&Self::container(dir), size_mb, self.split_mb, &fuse_dir)?;
        let res = f(&virtual_file);
        let detached = self.host.dynfilefs_detach(&fuse_dir);
        let _ = fs::remove_dir(&fuse_dir);
        let out = res?;
        detached?;
        Ok(out)
    }

    fn attach_and_mount(&self, handle: &StorageHandle, target: &Path, read_only: bool) -> Result<PathBuf> {
        let fuse_dir = Self::fuse_dir_for(target);
        let virtual_file = self.host.dynfilefs_attach(
            &Self::container(&handle.dir),
            handle.size_limit_mb,
            self.split_mb,
            &fuse_dir,
        )?;
        if let Err(e) = self.host.mount_image(&virtual_file, target, read_only) {
            if let Err(de) = self.host.dynfilefs_detach(&fuse_dir) {
                warn!("dynfilefs: detach after failed mount {}: {}", fuse_dir.display(), de);
            }
            return Err(e);
        }
        Ok(target.to_path_buf())
    }

    /// Total bytes of `changes.dat` and its split parts.
    pub fn container_bytes(dir: &Path) -> Result<u64> {
        let rd = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SessionError::io("read dir", dir, e)),
        };
        let mut total = 0u64;
        for entry in rd {
            let entry = entry.map_err(|e| SessionError::io("read dir", dir, e))?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(DYNFILEFS_CONTAINER) {
                continue;
            }
            if let Ok(md) = entry.metadata() {
                if md.is_file() {
                    total += md.len();
                }
            }
        }
        Ok(total)
    }
}

impl Backend for DynfilefsBackend {
    fn mode(&self) -> SessionMode {
        SessionMode::Dynfilefs
    }

    fn materialize(&self, storage_dir: &Path, size_limit_mb: u64) -> Result<StorageHandle> {
        ensure_free_space(self.host.as_ref(), storage_dir, size_limit_mb)?;
        ensure_dir(storage_dir)?;
        debug!(
            "dynfilefs: materialize dir={} size_mb={} split_mb={}",
            storage_dir.display(),
            size_limit_mb,
            self.split_mb
        );
        self.with_attached(storage_dir, size_limit_mb, "mkfs", |virtual_file| {
            self.host.make_filesystem(virtual_file)
        })?;
        Ok(StorageHandle::new(SessionMode::Dynfilefs, storage_dir, size_limit_mb))
    }

    fn mount(&self, handle: &StorageHandle, target: &Path) -> Result<PathBuf> {
        self.attach_and_mount(handle, target, false)
    }

    fn mount_read_only(&self, handle: &StorageHandle, target: &Path) -> Result<PathBuf> {
        self.attach_and_mount(handle, target, true)
    }

    fn unmount(&self, _handle: &StorageHandle, mountpoint: &Path) -> Result<()> {
        let fuse_dir = Self::fuse_dir_for(mountpoint);
        if self.host.is_mounted(mountpoint) {
            self.host.unmount(mountpoint)?;
        }
        // flushes dynfilefs buffers into changes.dat
        self.host.dynfilefs_detach(&fuse_dir)?;
        let _ = fs::remove_dir(&fuse_dir);
        Ok(())
    }

    fn grow(&self, handle: &StorageHandle, new_size_mb: u64) -> Result<()> {
        let extra = new_size_mb.saturating_sub(handle.size_limit_mb);
        ensure_free_space(self.host.as_ref(), &handle.dir, extra)?;
        self.with_attached(&handle.dir, new_size_mb, "grow", |virtual_file| {
            self.host.resize_filesystem(virtual_file)
        })
    }

    fn usage(&self, handle: &StorageHandle) -> Result<Usage> {
        let used_bytes = Self::container_bytes(&handle.dir)?;
        Ok(Usage {
            used_mb: bytes_to_mb_ceil(used_bytes),
            used_bytes,
            capacity_mb: handle.size_limit_mb,
        })
    }

    fn is_materialized(&self, dir: &Path) -> bool {
        Self::container(dir).is_file()
    }

    fn is_mounted(&self, _handle: &StorageHandle, mountpoint: &Path) -> bool {
        self.host.is_mounted(mountpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuse_dir_is_a_sibling_of_the_mountpoint() {
        assert_eq!(
            DynfilefsBackend::fuse_dir_for(Path::new("/run/sk/active")),
            PathBuf::from("/run/sk/active.fuse")
        );
    }

    #[test]
    fn container_bytes_sums_split_parts() {
        let dir = std::env::temp_dir().join(format!(
            "sk-dynfilefs-parts-{}-{}",
            std::process::id(),
            crate::util::now_unix_ms()
        ));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("changes.dat"), vec![0u8; 100]).unwrap();
        fs::write(dir.join("changes.dat.1"), vec![0u8; 50]).unwrap();
        fs::write(dir.join("unrelated"), vec![0u8; 999]).unwrap();
        assert_eq!(DynfilefsBackend::container_bytes(&dir).unwrap(), 150);
        assert_eq!(DynfilefsBackend::container_bytes(&dir.join("missing")).unwrap(), 0);
        let _ = fs::remove_dir_all(&dir);
    }
}
