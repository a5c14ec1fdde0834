//! backend/raw: fixed-size ext4 image `changes.img`, loop-mounted.

use fs2::FileExt;
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{ensure_dir, ensure_free_space, Backend, StorageHandle, Usage};
use crate::consts::{MB, RAW_IMAGE};
use crate::error::{Result, SessionError};
use crate::host::Host;
use crate::session::SessionMode;
use crate::util::bytes_to_mb_ceil;

pub struct RawBackend {
    host: Arc<dyn Host>,
    preallocate: bool,
}

impl RawBackend {
    pub fn new(host: Arc<dyn Host>, preallocate: bool) -> Self {
        Self { host, preallocate }
    }

    fn image(dir: &Path) -> PathBuf {
        dir.join(RAW_IMAGE)
    }

    // Extend (or create) the image to `size_mb`. Preallocation falls back to a
    // sparse extension when the filesystem refuses fallocate.
    fn size_image(&self, image: &Path, size_mb: u64) -> Result<()> {
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .open(image)
            .map_err(|e| SessionError::io("open", image, e))?;
        let len = size_mb * MB;
        let allocated = self.preallocate && {
            match FileExt::allocate(&f, len) {
                Ok(()) => true,
                Err(e) => {
                    warn!("raw: fallocate {} failed ({}), extending sparse", image.display(), e);
                    false
                }
            }
        };
        if !allocated {
            f.set_len(len).map_err(|e| SessionError::io("extend", image, e))?;
        }
        f.sync_all().map_err(|e| SessionError::io("fsync", image, e))
    }
}

impl Backend for RawBackend {
    fn mode(&self) -> SessionMode {
        SessionMode::Raw
    }

    fn materialize(&self, storage_dir: &Path, size_limit_mb: u64) -> Result<StorageHandle> {
        ensure_free_space(self.host.as_ref(), storage_dir, size_limit_mb)?;
        ensure_dir(storage_dir)?;
        let image = Self::image(storage_dir);
        debug!("raw: materialize image={} size_mb={}", image.display(), size_limit_mb);
        self.size_image(&image, size_limit_mb)?;
        self.host.make_filesystem(&image)?;
        Ok(StorageHandle::new(SessionMode::Raw, storage_dir, size_limit_mb))
    }

    fn mount(&self, handle: &StorageHandle, target: &Path) -> Result<PathBuf> {
        self.host.mount_image(&Self::image(&handle.dir), target, false)?;
        Ok(target.to_path_buf())
    }

    fn mount_read_only(&self, handle: &StorageHandle, target: &Path) -> Result<PathBuf> {
        self.host.mount_image(&Self::image(&handle.dir), target, true)?;
        Ok(target.to_path_buf())
    }

    fn unmount(&self, _handle: &StorageHandle, mountpoint: &Path) -> Result<()> {
        if !self.host.is_mounted(mountpoint) {
            return Ok(());
        }
        self.host.unmount(mountpoint)
    }

    fn grow(&self, handle: &StorageHandle, new_size_mb: u64) -> Result<()> {
        let image = Self::image(&handle.dir);
        let current = fs::metadata(&image)
            .map_err(|e| SessionError::io("stat", &image, e))?
            .len();
        if current < new_size_mb * MB {
            let extra = new_size_mb.saturating_sub(bytes_to_mb_ceil(current));
            ensure_free_space(self.host.as_ref(), &handle.dir, extra)?;
            self.size_image(&image, new_size_mb)?;
        }
        // a crash here leaves a larger image with the old filesystem, still mountable
        self.host.resize_filesystem(&image)
    }

    fn usage(&self, handle: &StorageHandle) -> Result<Usage> {
        let image = Self::image(&handle.dir);
        let used_bytes = match fs::metadata(&image) {
            Ok(md) => md.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(SessionError::io("stat", &image, e)),
        };
        Ok(Usage {
            used_mb: bytes_to_mb_ceil(used_bytes),
            used_bytes,
            capacity_mb: handle.size_limit_mb,
        })
    }

    fn is_materialized(&self, dir: &Path) -> bool {
        Self::image(dir).is_file()
    }

    fn is_mounted(&self, _handle: &StorageHandle, mountpoint: &Path) -> bool {
        self.host.is_mounted(mountpoint)
    }
}
