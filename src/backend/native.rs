//! backend/native: the session tree lives directly in the storage directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{ensure_dir, Backend, StorageHandle, Usage};
use crate::error::Result;
use crate::host::Host;
use crate::session::SessionMode;
use crate::tree::tree_size;
use crate::util::bytes_to_mb_ceil;

pub struct NativeBackend {
    host: Arc<dyn Host>,
}

impl NativeBackend {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self { host }
    }
}

impl Backend for NativeBackend {
    fn mode(&self) -> SessionMode {
        SessionMode::Native
    }

    fn materialize(&self, storage_dir: &Path, size_limit_mb: u64) -> Result<StorageHandle> {
        ensure_dir(storage_dir)?;
        Ok(StorageHandle::new(SessionMode::Native, storage_dir, size_limit_mb))
    }

    fn mount(&self, handle: &StorageHandle, _target: &Path) -> Result<PathBuf> {
        Ok(handle.dir.clone())
    }

    fn unmount(&self, _handle: &StorageHandle, _mountpoint: &Path) -> Result<()> {
        Ok(())
    }

    fn grow(&self, _handle: &StorageHandle, _new_size_mb: u64) -> Result<()> {
        Ok(())
    }

    fn usage(&self, handle: &StorageHandle) -> Result<Usage> {
        let used_bytes = tree_size(&handle.dir)?;
        let used_mb = bytes_to_mb_ceil(used_bytes);
        let free_mb = self.host.free_space_mb(&handle.dir)?;
        Ok(Usage {
            used_mb,
            used_bytes,
            capacity_mb: free_mb + used_mb,
        })
    }

    fn is_materialized(&self, dir: &Path) -> bool {
        dir.is_dir()
    }

    fn is_mounted(&self, handle: &StorageHandle, mountpoint: &Path) -> bool {
        mountpoint == handle.dir
    }
}
