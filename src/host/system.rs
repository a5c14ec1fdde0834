//! host/system: `Host` backed by the real system tools.
//!
//! - filesystem type / mount state: /proc/mounts (longest mountpoint prefix);
//! - free space: fs2::available_space;
//! - ext4 tooling: mke2fs, resize2fs;
//! - loop mounts: mount -o loop[,ro], umount (never lazy, never forced);
//! - dynfilefs: spawned per attach, detached with fusermount -u;
//! - release: VERSION/EDITION from the release file, union fs from /proc/cmdline.

use log::{debug, warn};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use super::{FsInfo, Host, SystemRelease};
use crate::consts::{DYNFILEFS_VIRTUAL_FILE, MB, RELEASE_FILES};
use crate::error::{Result, SessionError};

const PROC_MOUNTS: &str = "/proc/mounts";
const PROC_CMDLINE: &str = "/proc/cmdline";
const PROC_FILESYSTEMS: &str = "/proc/filesystems";
const UNION_FILESYSTEMS: &[&str] = &["aufs", "overlayfs"];
const POLL_MS: u64 = 50;

pub struct SystemHost {
    mount_timeout: Duration,
    // dynfilefs children keyed by their FUSE directory
    dynfilefs: Mutex<HashMap<PathBuf, Child>>,
}

impl SystemHost {
    pub fn new(mount_timeout_ms: u64) -> Self {
        Self {
            mount_timeout: Duration::from_millis(mount_timeout_ms),
            dynfilefs: Mutex::new(HashMap::new()),
        }
    }
}

#[derive(Debug, Clone)]
struct MountEntry {
    device: String,
    mountpoint: PathBuf,
    fs_type: String,
    options: String,
}

// /proc/mounts escapes space, tab, newline and backslash as octal.
fn unescape_mount_field(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(v) = s.get(i + 1..i + 4).and_then(|oct| u8::from_str_radix(oct, 8).ok()) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device = parts.next()?;
            let mountpoint = parts.next()?;
            let fs_type = parts.next()?;
            let options = parts.next().unwrap_or("");
            Some(MountEntry {
                device: unescape_mount_field(device),
                mountpoint: PathBuf::from(unescape_mount_field(mountpoint)),
                fs_type: fs_type.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

fn read_mounts() -> Result<Vec<MountEntry>> {
    let text = fs::read_to_string(PROC_MOUNTS).map_err(|e| SessionError::io("read", PROC_MOUNTS, e))?;
    Ok(parse_mounts(&text))
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn run_tool(program: &str, args: &[&OsStr], target: &Path) -> Result<()> {
    debug!("host: {} {:?}", program, args);
    let out = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| SessionError::io("spawn", program, e))?;
    if out.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("busy") {
        return Err(SessionError::DeviceBusy {
            path: target.to_path_buf(),
        });
    }
    Err(SessionError::Tool {
        program: program.to_string(),
        status: out.status.to_string(),
        stderr,
    })
}

/// Value of `KEY=...` in a shell-style release file, quotes stripped.
fn release_value(text: &str, key: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let v = line.trim().strip_prefix(key)?.strip_prefix('=')?;
        let v = v.trim().trim_matches(|c| c == '"' || c == '\'');
        (!v.is_empty()).then(|| v.to_string())
    })
}

/// `union=` on the kernel command line wins; otherwise aufs when the kernel
/// knows it, else overlayfs.
fn detect_union(cmdline: &str, filesystems: Option<&str>) -> Option<String> {
    let requested = cmdline
        .split_whitespace()
        .filter_map(|arg| arg.strip_prefix("union="))
        .find(|v| UNION_FILESYSTEMS.contains(v));
    if let Some(u) = requested {
        return Some(u.to_string());
    }
    let known = filesystems?;
    let aufs = known.lines().any(|l| l.split_whitespace().last() == Some("aufs"));
    Some(if aufs { "aufs" } else { "overlayfs" }.to_string())
}

fn in_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

impl Host for SystemHost {
    fn filesystem(&self, path: &Path) -> Result<FsInfo> {
        let target = canonical(path);
        let mounts = read_mounts()?;
        // later entries shadow earlier ones on the same mountpoint
        let best = mounts
            .iter()
            .filter(|m| target.starts_with(&m.mountpoint))
            .max_by_key(|m| m.mountpoint.as_os_str().len())
            .cloned()
            .ok_or_else(|| SessionError::Invalid(format!("no mount covers {}", target.display())))?;
        Ok(FsInfo {
            fs_type: best.fs_type.to_ascii_lowercase(),
            device: best.device,
            mountpoint: best.mountpoint,
            read_only: best.options.split(',').any(|o| o == "ro"),
        })
    }

    fn free_space_mb(&self, path: &Path) -> Result<u64> {
        let bytes = fs2::available_space(path).map_err(|e| SessionError::io("statvfs", path, e))?;
        Ok(bytes / MB)
    }

    fn dynfilefs_available(&self) -> bool {
        in_path("dynfilefs") || in_path("mount.dynfilefs")
    }

    fn system_release(&self) -> SystemRelease {
        let text = RELEASE_FILES.iter().find_map(|p| fs::read_to_string(p).ok());
        let union = match fs::read_to_string(PROC_CMDLINE) {
            Ok(cmdline) => detect_union(&cmdline, fs::read_to_string(PROC_FILESYSTEMS).ok().as_deref()),
            Err(e) => {
                debug!("host: {} unreadable: {}", PROC_CMDLINE, e);
                None
            }
        };
        SystemRelease {
            version: text.as_deref().and_then(|t| release_value(t, "VERSION")),
            edition: text.as_deref().and_then(|t| release_value(t, "EDITION")),
            union,
        }
    }

    fn make_filesystem(&self, image: &Path) -> Result<()> {
        run_tool(
            "mke2fs",
            &[OsStr::new("-F"), OsStr::new("-q"), OsStr::new("-t"), OsStr::new("ext4"), image.as_os_str()],
            image,
        )?;
        // flush the freshly written metadata (matters on FAT/NTFS roots)
        if let Ok(f) = fs::OpenOptions::new().write(true).open(image) {
            let _ = f.sync_all();
        }
        Ok(())
    }

    fn resize_filesystem(&self, image: &Path) -> Result<()> {
        run_tool("resize2fs", &[OsStr::new("-f"), image.as_os_str()], image)
    }

    fn mount_image(&self, image: &Path, mountpoint: &Path, read_only: bool) -> Result<()> {
        fs::create_dir_all(mountpoint).map_err(|e| SessionError::io("create", mountpoint, e))?;
        let opts = if read_only { "loop,ro" } else { "loop" };
        run_tool(
            "mount",
            &[OsStr::new("-o"), OsStr::new(opts), image.as_os_str(), mountpoint.as_os_str()],
            mountpoint,
        )
    }

    fn unmount(&self, mountpoint: &Path) -> Result<()> {
        run_tool("umount", &[mountpoint.as_os_str()], mountpoint)
    }

    fn is_mounted(&self, mountpoint: &Path) -> bool {
        let target = canonical(mountpoint);
        read_mounts()
            .map(|ms| ms.iter().any(|m| m.mountpoint == target))
            .unwrap_or(false)
    }

    fn dynfilefs_attach(&self, container: &Path, size_mb: u64, split_mb: u64, fuse_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(fuse_dir).map_err(|e| SessionError::io("create", fuse_dir, e))?;
        debug!(
            "host: dynfilefs -f {} -m {} -s {} -p {}",
            container.display(),
            fuse_dir.display(),
            size_mb,
            split_mb
        );
        let mut child = Command::new("dynfilefs")
            .arg("-f")
            .arg(container)
            .arg("-m")
            .arg(fuse_dir)
            .arg("-s")
            .arg(size_mb.to_string())
            .arg("-p")
            .arg(split_mb.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SessionError::io("spawn", "dynfilefs", e))?;

        let virtual_file = fuse_dir.join(DYNFILEFS_VIRTUAL_FILE);
        let deadline = Instant::now() + self.mount_timeout;
        // dynfilefs may daemonize: a clean exit means "keep waiting for the mount"
        let mut foreground = true;
        while !virtual_file.exists() {
            if foreground {
                if let Ok(Some(status)) = child.try_wait() {
                    if !status.success() {
                        return Err(SessionError::Tool {
                            program: "dynfilefs".into(),
                            status: status.to_string(),
                            stderr: format!("exited before exposing {}", virtual_file.display()),
                        });
                    }
                    foreground = false;
                }
            }
            if Instant::now() >= deadline {
                if foreground {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                return Err(SessionError::Tool {
                    program: "dynfilefs".into(),
                    status: "timeout".into(),
                    stderr: format!("{} did not appear", virtual_file.display()),
                });
            }
            thread::sleep(Duration::from_millis(POLL_MS));
        }

        if foreground {
            if let Ok(mut children) = self.dynfilefs.lock() {
                children.insert(fuse_dir.to_path_buf(), child);
            }
        }
        Ok(virtual_file)
    }

    fn dynfilefs_detach(&self, fuse_dir: &Path) -> Result<()> {
        run_tool("fusermount", &[OsStr::new("-u"), fuse_dir.as_os_str()], fuse_dir)?;
        let child = self
            .dynfilefs
            .lock()
            .ok()
            .and_then(|mut children| children.remove(fuse_dir));
        if let Some(mut child) = child {
            let deadline = Instant::now() + self.mount_timeout;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(POLL_MS)),
                    _ => {
                        warn!("host: dynfilefs for {} did not exit, killing", fuse_dir.display());
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
