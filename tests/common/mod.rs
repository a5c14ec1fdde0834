//! Shared helpers for integration tests: unique temp roots and an in-process Host.
//!
//! FakeHost keeps the "filesystem inside an image" as a shadow directory next to
//! the image (`<image>.fs`, or `<changes.dat>.fs` for dynfilefs). Mounting moves
//! the shadow onto the mountpoint, unmounting moves it back, so data written
//! through a mount survives exactly as long as the storage does.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use sessionkeep::{Engine, EngineConfig, FsInfo, Host, Result, SessionError, SystemRelease};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

pub fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("sktest-{prefix}-{pid}-{t}-{id}"))
}

pub struct FakeHost {
    fs_type: String,
    read_only: bool,
    free_mb: u64,
    dynfilefs: bool,
    /// mountpoint -> shadow directory currently moved onto it
    mounts: Mutex<HashMap<PathBuf, PathBuf>>,
    /// fuse dir -> container
    attached: Mutex<HashMap<PathBuf, PathBuf>>,
    busy: Mutex<HashSet<PathBuf>>,
    /// mountpoints that turn busy as soon as something is mounted on them
    busy_when_mounted: Mutex<HashSet<PathBuf>>,
    release: SystemRelease,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            fs_type: "ext4".to_string(),
            read_only: false,
            free_mb: 1_000_000,
            dynfilefs: true,
            mounts: Mutex::new(HashMap::new()),
            attached: Mutex::new(HashMap::new()),
            busy: Mutex::new(HashSet::new()),
            busy_when_mounted: Mutex::new(HashSet::new()),
            release: SystemRelease::default(),
        }
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fs(mut self, fs_type: &str) -> Self {
        self.fs_type = fs_type.to_string();
        self
    }

    pub fn with_free_mb(mut self, mb: u64) -> Self {
        self.free_mb = mb;
        self
    }

    pub fn without_dynfilefs(mut self) -> Self {
        self.dynfilefs = false;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Make `path` look like a mountpoint held open by another process.
    pub fn set_busy(&self, path: &Path) {
        self.busy.lock().unwrap().insert(path.to_path_buf());
    }

    pub fn clear_busy(&self, path: &Path) {
        self.busy.lock().unwrap().remove(path);
    }

    pub fn with_release(mut self, version: &str, edition: &str, union: &str) -> Self {
        self.release = SystemRelease {
            version: Some(version.to_string()),
            edition: Some(edition.to_string()),
            union: Some(union.to_string()),
        };
        self
    }

    pub fn busy_once_mounted(&self, path: &Path) {
        self.busy_when_mounted.lock().unwrap().insert(path.to_path_buf());
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.lock().unwrap().len()
    }

    fn shadow_of(&self, image: &Path) -> PathBuf {
        if let Some(fuse_dir) = image.parent() {
            if let Some(container) = self.attached.lock().unwrap().get(fuse_dir) {
                let name = container.file_name().unwrap().to_string_lossy().into_owned();
                return container.with_file_name(format!("{name}.fs"));
            }
        }
        let name = image.file_name().unwrap().to_string_lossy().into_owned();
        image.with_file_name(format!("{name}.fs"))
    }

    fn tool_err(program: &str, msg: String) -> SessionError {
        SessionError::Tool {
            program: program.to_string(),
            status: "exit status: 1".to_string(),
            stderr: msg,
        }
    }
}

fn io_err(op: &'static str, path: &Path, e: std::io::Error) -> SessionError {
    SessionError::io(op, path, e)
}

impl Host for FakeHost {
    fn filesystem(&self, path: &Path) -> Result<FsInfo> {
        Ok(FsInfo {
            fs_type: self.fs_type.clone(),
            device: "/dev/fake0".to_string(),
            mountpoint: path.to_path_buf(),
            read_only: self.read_only,
        })
    }

    fn free_space_mb(&self, _path: &Path) -> Result<u64> {
        Ok(self.free_mb)
    }

    fn dynfilefs_available(&self) -> bool {
        self.dynfilefs
    }

    fn system_release(&self) -> SystemRelease {
        self.release.clone()
    }

    fn make_filesystem(&self, image: &Path) -> Result<()> {
        if !image.is_file() {
            return Err(Self::tool_err("mke2fs", format!("{}: no such file", image.display())));
        }
        let shadow = self.shadow_of(image);
        if shadow.exists() {
            fs::remove_dir_all(&shadow).map_err(|e| io_err("remove", &shadow, e))?;
        }
        fs::create_dir_all(&shadow).map_err(|e| io_err("create", &shadow, e))
    }

    fn resize_filesystem(&self, image: &Path) -> Result<()> {
        let shadow = self.shadow_of(image);
        if shadow.is_dir() {
            Ok(())
        } else {
            Err(Self::tool_err("resize2fs", format!("{}: bad magic number", image.display())))
        }
    }

    fn mount_image(&self, image: &Path, mountpoint: &Path, _read_only: bool) -> Result<()> {
        let shadow = self.shadow_of(image);
        if !shadow.is_dir() {
            return Err(Self::tool_err("mount", format!("{}: wrong fs type", image.display())));
        }
        let mut mounts = self.mounts.lock().unwrap();
        if mounts.contains_key(mountpoint) {
            return Err(SessionError::DeviceBusy {
                path: mountpoint.to_path_buf(),
            });
        }
        if mountpoint.is_dir() {
            fs::remove_dir(mountpoint).map_err(|e| io_err("remove", mountpoint, e))?;
        } else if let Some(parent) = mountpoint.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("create", parent, e))?;
        }
        fs::rename(&shadow, mountpoint).map_err(|e| io_err("rename", &shadow, e))?;
        mounts.insert(mountpoint.to_path_buf(), shadow);
        drop(mounts);
        if self.busy_when_mounted.lock().unwrap().contains(mountpoint) {
            self.busy.lock().unwrap().insert(mountpoint.to_path_buf());
        }
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> Result<()> {
        if self.busy.lock().unwrap().contains(mountpoint) {
            return Err(SessionError::DeviceBusy {
                path: mountpoint.to_path_buf(),
            });
        }
        let mut mounts = self.mounts.lock().unwrap();
        let Some(shadow) = mounts.remove(mountpoint) else {
            return Err(Self::tool_err("umount", format!("{}: not mounted", mountpoint.display())));
        };
        fs::rename(mountpoint, &shadow).map_err(|e| io_err("rename", mountpoint, e))?;
        fs::create_dir_all(mountpoint).map_err(|e| io_err("create", mountpoint, e))
    }

    fn is_mounted(&self, mountpoint: &Path) -> bool {
        self.busy.lock().unwrap().contains(mountpoint) || self.mounts.lock().unwrap().contains_key(mountpoint)
    }

    fn dynfilefs_attach(&self, container: &Path, _size_mb: u64, _split_mb: u64, fuse_dir: &Path) -> Result<PathBuf> {
        if !self.dynfilefs {
            return Err(Self::tool_err("dynfilefs", "not installed".to_string()));
        }
        if !container.exists() {
            fs::write(container, b"").map_err(|e| io_err("create", container, e))?;
        }
        fs::create_dir_all(fuse_dir).map_err(|e| io_err("create", fuse_dir, e))?;
        let virtual_file = fuse_dir.join("virtual.dat");
        fs::write(&virtual_file, b"").map_err(|e| io_err("create", &virtual_file, e))?;
        self.attached
            .lock()
            .unwrap()
            .insert(fuse_dir.to_path_buf(), container.to_path_buf());
        Ok(virtual_file)
    }

    fn dynfilefs_detach(&self, fuse_dir: &Path) -> Result<()> {
        self.attached.lock().unwrap().remove(fuse_dir);
        let _ = fs::remove_file(fuse_dir.join("virtual.dat"));
        Ok(())
    }
}

/// Config rooted at `<base>/root` with scratch space under `<base>/work`.
pub fn test_config(base: &Path) -> EngineConfig {
    EngineConfig::default()
        .with_root(base.join("root"))
        .with_work_dir(base.join("work"))
        .with_default_size_mb(64)
        .with_preallocate_raw(false)
}

pub fn open_engine(base: &Path, host: Arc<FakeHost>) -> Result<Engine> {
    Engine::open(test_config(base), host)
}

/// Write `files` (relative path, contents) under `dir`.
pub fn write_tree(dir: &Path, files: &[(&str, &[u8])]) -> std::io::Result<()> {
    for (rel, data) in files {
        let p = dir.join(rel);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(p, data)?;
    }
    Ok(())
}

/// Sorted (relative path, contents) of every regular file under `dir`.
pub fn read_tree(dir: &Path) -> std::io::Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(dir).unwrap().to_string_lossy().into_owned();
            out.push((rel, fs::read(entry.path())?));
        }
    }
    Ok(out)
}
