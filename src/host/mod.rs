//! host: the single seam between the engine and the operating system.
//!
//! Backend drivers never spawn tools or touch mount tables directly; they go through
//! `Host`. `SystemHost` runs the real tooling (mke2fs, resize2fs, mount -o loop,
//! umount, dynfilefs, fusermount); tests plug in an in-process fake.
//!
//! Capability rules (which session modes a storage root can hold):
//! - read-only filesystem (or squashfs) → none;
//! - native  → POSIX filesystems only (ext2/3/4, btrfs, xfs, f2fs, reiserfs, tmpfs);
//! - dynfilefs → any writable filesystem, tool must be installed;
//! - raw → any writable filesystem; FAT-class roots cap a single file at 4 GiB.

pub mod system;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::consts::FAT_MAX_FILE_MB;
use crate::error::{Result, SessionError};
use crate::session::SessionMode;

pub use system::SystemHost;

const POSIX_FILESYSTEMS: &[&str] = &["ext2", "ext3", "ext4", "btrfs", "xfs", "f2fs", "reiserfs", "tmpfs"];
const FAT_FILESYSTEMS: &[&str] = &["vfat", "fat", "fat32", "msdos"];
const NON_POSIX_FILESYSTEMS: &[&str] = &["ntfs", "ntfs3", "ntfs-3g", "fuseblk", "exfat"];

/// Filesystem hosting a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsInfo {
    pub fs_type: String,
    pub device: String,
    pub mountpoint: PathBuf,
    pub read_only: bool,
}

impl FsInfo {
    pub fn is_posix(&self) -> bool {
        POSIX_FILESYSTEMS.contains(&self.fs_type.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Limitations {
    /// Largest single file the filesystem can hold.
    pub max_file_mb: Option<u64>,
    pub no_posix: bool,
    pub case_insensitive: bool,
}

/// Modes a storage root can hold, plus filesystem limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub filesystem: FsInfo,
    pub modes: Vec<SessionMode>,
    pub limitations: Limitations,
    pub dynfilefs_available: bool,
}

impl Capabilities {
    pub fn for_fs(fs: FsInfo, dynfilefs_available: bool) -> Self {
        let fs_type = fs.fs_type.as_str();
        let writable = !fs.read_only && fs_type != "squashfs";

        let mut modes = Vec::new();
        if writable {
            if fs.is_posix() {
                modes.push(SessionMode::Native);
            }
            if dynfilefs_available {
                modes.push(SessionMode::Dynfilefs);
            }
            modes.push(SessionMode::Raw);
        }

        let mut limitations = Limitations::default();
        if FAT_FILESYSTEMS.contains(&fs_type) {
            limitations.max_file_mb = Some(FAT_MAX_FILE_MB);
            limitations.no_posix = true;
            limitations.case_insensitive = true;
        } else if NON_POSIX_FILESYSTEMS.contains(&fs_type) {
            limitations.no_posix = true;
            limitations.case_insensitive = true;
        }

        Self {
            filesystem: fs,
            modes,
            limitations,
            dynfilefs_available,
        }
    }

    pub fn supports(&self, mode: SessionMode) -> bool {
        self.modes.contains(&mode)
    }

    /// Validate a (mode, size) request before anything is materialized.
    pub fn check(&self, mode: SessionMode, size_limit_mb: u64) -> Result<()> {
        let fs_type = self.filesystem.fs_type.clone();
        if !self.supports(mode) {
            let reason = if self.filesystem.read_only || fs_type == "squashfs" {
                "filesystem is read-only".to_string()
            } else {
                match mode {
                    SessionMode::Native => "native sessions need a POSIX filesystem; use dynfilefs or raw".to_string(),
                    SessionMode::Dynfilefs => "dynfilefs is not installed".to_string(),
                    SessionMode::Raw => "raw images are not supported".to_string(),
                }
            };
            return Err(SessionError::CapabilityUnsupported { mode, fs_type, reason });
        }
        if mode == SessionMode::Raw {
            if let Some(max) = self.limitations.max_file_mb {
                if size_limit_mb >= max {
                    return Err(SessionError::CapabilityUnsupported {
                        mode,
                        fs_type,
                        reason: format!(
                            "image of {size_limit_mb} MB exceeds the {max} MB file size limit; use dynfilefs or a smaller size"
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Release of the running system, recorded with each session and archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRelease {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,
    /// Union filesystem of the live root (`overlayfs`, `aufs`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub union: Option<String>,
}

impl SystemRelease {
    pub fn is_empty(&self) -> bool {
        self.version.is_none() && self.edition.is_none() && self.union.is_none()
    }

    /// Fields recorded in `self` that differ from `current`, as "field: old -> new".
    /// Fields never recorded are not compared.
    pub fn mismatches(&self, current: &SystemRelease) -> Vec<String> {
        let pairs = [
            ("version", &self.version, &current.version),
            ("edition", &self.edition, &current.edition),
            ("union", &self.union, &current.union),
        ];
        pairs
            .into_iter()
            .filter_map(|(field, recorded, now)| {
                let recorded = recorded.as_deref()?;
                let now = now.as_deref().unwrap_or("unknown");
                (recorded != now).then(|| format!("{field}: {recorded} -> {now}"))
            })
            .collect()
    }
}

/// Operating-system operations the backends are built from.
pub trait Host: Send + Sync {
    /// Filesystem that holds `path`.
    fn filesystem(&self, path: &Path) -> Result<FsInfo>;

    /// Free space available to unprivileged writers at `path`, in MB.
    fn free_space_mb(&self, path: &Path) -> Result<u64>;

    fn dynfilefs_available(&self) -> bool;

    /// Create an ext4 filesystem inside an image/virtual file.
    fn make_filesystem(&self, image: &Path) -> Result<()>;

    /// Offline resize of the filesystem inside `image` to fill the file.
    fn resize_filesystem(&self, image: &Path) -> Result<()>;

    /// Loop-mount `image` on `mountpoint` (created if missing).
    fn mount_image(&self, image: &Path, mountpoint: &Path, read_only: bool) -> Result<()>;

    /// Unmount; a busy target yields `DeviceBusy` and is never forced.
    fn unmount(&self, mountpoint: &Path) -> Result<()>;

    fn is_mounted(&self, mountpoint: &Path) -> bool;

    /// Attach dynfilefs on `container` with logical size `size_mb`, exposing it
    /// under `fuse_dir`. Returns the path of the exposed virtual block file.
    fn dynfilefs_attach(&self, container: &Path, size_mb: u64, split_mb: u64, fuse_dir: &Path) -> Result<PathBuf>;

    /// Detach dynfilefs from `fuse_dir`, flushing buffered writes.
    fn dynfilefs_detach(&self, fuse_dir: &Path) -> Result<()>;

    /// Release information of the running system; unknown fields stay `None`.
    fn system_release(&self) -> SystemRelease {
        SystemRelease::default()
    }

    /// Capabilities of the filesystem holding `root`.
    fn capabilities(&self, root: &Path) -> Result<Capabilities> {
        Ok(Capabilities::for_fs(self.filesystem(root)?, self.dynfilefs_available()))
    }
}
