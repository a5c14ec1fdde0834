//! tree: file tree copy and measurement between mounted session trees.
//!
//! `copy_tree` preserves permissions, ownership, mtimes, symlinks and special
//! files (overlay whiteouts are 0/0 character devices). Directory modes and
//! times are applied last, deepest first, so read-only directories do not block
//! their own population. Top-level `lost+found` of an ext4 mount is skipped.

use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Result, SessionError};

const LOST_AND_FOUND: &str = "lost+found";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub special: u64,
    pub bytes: u64,
}

fn walk_err(e: walkdir::Error) -> SessionError {
    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
    let source = e
        .into_io_error()
        .unwrap_or_else(|| io::Error::other("filesystem loop"));
    SessionError::io("walk", path, source)
}

fn skip_entry(entry: &walkdir::DirEntry) -> bool {
    entry.depth() == 1 && entry.file_type().is_dir() && entry.file_name() == LOST_AND_FOUND
}

/// Total size in bytes of the regular files under `root`. Missing root → 0.
pub fn tree_size(root: &Path) -> Result<u64> {
    if !root.exists() {
        return Ok(0);
    }
    let mut total = 0u64;
    for entry in WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| !skip_entry(e)) {
        let entry = entry.map_err(walk_err)?;
        if entry.file_type().is_file() {
            let md = entry.metadata().map_err(walk_err)?;
            total += md.len();
        }
    }
    Ok(total)
}

/// Copy the contents of `src` into the existing directory `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<CopyStats> {
    let mut stats = CopyStats::default();
    // (source metadata, destination) for directories, applied after the walk
    let mut dirs: Vec<(fs::Metadata, PathBuf)> = Vec::new();

    let walker = WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !skip_entry(e));

    for entry in walker {
        let entry = entry.map_err(walk_err)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| SessionError::Invalid(format!("{} escapes {}", entry.path().display(), src.display())))?;
        let target = dst.join(rel);
        let md = fs::symlink_metadata(entry.path()).map_err(|e| SessionError::io("stat", entry.path(), e))?;
        let ft = md.file_type();

        if ft.is_dir() {
            if entry.depth() > 0 {
                match fs::create_dir(&target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(SessionError::io("create dir", &target, e)),
                }
                stats.dirs += 1;
            }
            dirs.push((md, target));
        } else if ft.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| SessionError::io("read link", entry.path(), e))?;
            replace_existing(&target)?;
            symlink(&link, &target)?;
            apply_owner(&md, &target);
            apply_mtime(&md, &target);
            stats.symlinks += 1;
        } else if ft.is_file() {
            replace_existing(&target)?;
            let n = fs::copy(entry.path(), &target).map_err(|e| SessionError::io("copy", entry.path(), e))?;
            apply_owner(&md, &target);
            fs::set_permissions(&target, md.permissions()).map_err(|e| SessionError::io("chmod", &target, e))?;
            apply_mtime(&md, &target);
            stats.files += 1;
            stats.bytes += n;
        } else {
            replace_existing(&target)?;
            make_special(&md, &target)?;
            apply_owner(&md, &target);
            apply_mtime(&md, &target);
            stats.special += 1;
        }
    }

    for (md, target) in dirs.iter().rev() {
        apply_owner(md, target);
        fs::set_permissions(target, md.permissions()).map_err(|e| SessionError::io("chmod", target, e))?;
        apply_mtime(md, target);
    }

    debug!(
        "tree: copied {} -> {} files={} dirs={} symlinks={} special={} bytes={}",
        src.display(),
        dst.display(),
        stats.files,
        stats.dirs,
        stats.symlinks,
        stats.special,
        stats.bytes
    );
    Ok(stats)
}

/// Apply archived attributes to an already-populated directory.
#[cfg(unix)]
pub(crate) fn apply_dir_attrs(path: &Path, mode: u32, uid: u64, gid: u64, mtime_secs: u64, chown: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if chown {
        if let Err(e) = std::os::unix::fs::lchown(path, Some(uid as u32), Some(gid as u32)) {
            warn!("tree: chown {} failed: {}", path.display(), e);
        }
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| SessionError::io("chmod", path, e))?;
    let c = c_path(path)?;
    let ts = libc::timespec {
        tv_sec: mtime_secs as libc::time_t,
        tv_nsec: 0,
    };
    let times = [ts, ts];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), 0) };
    if rc != 0 {
        warn!("tree: set times {} failed: {}", path.display(), io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn apply_dir_attrs(_path: &Path, _mode: u32, _uid: u64, _gid: u64, _mtime_secs: u64, _chown: bool) -> Result<()> {
    Ok(())
}

fn replace_existing(target: &Path) -> Result<()> {
    match fs::symlink_metadata(target) {
        Ok(md) if md.is_dir() => fs::remove_dir_all(target).map_err(|e| SessionError::io("remove", target, e)),
        Ok(_) => fs::remove_file(target).map_err(|e| SessionError::io("remove", target, e)),
        Err(_) => Ok(()),
    }
}

#[cfg(unix)]
fn symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target).map_err(|e| SessionError::io("symlink", target, e))
}

#[cfg(not(unix))]
fn symlink(_link: &Path, target: &Path) -> Result<()> {
    Err(SessionError::Invalid(format!("symlinks unsupported here: {}", target.display())))
}

// Ownership is best-effort: unprivileged callers can only keep their own ids.
#[cfg(unix)]
fn apply_owner(md: &fs::Metadata, target: &Path) {
    use std::os::unix::fs::MetadataExt;
    if let Err(e) = std::os::unix::fs::lchown(target, Some(md.uid()), Some(md.gid())) {
        if e.kind() != io::ErrorKind::PermissionDenied {
            warn!("tree: chown {} failed: {}", target.display(), e);
        }
    }
}

#[cfg(not(unix))]
fn apply_owner(_md: &fs::Metadata, _target: &Path) {}

#[cfg(unix)]
fn c_path(p: &Path) -> Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(p.as_os_str().as_bytes())
        .map_err(|_| SessionError::Invalid(format!("path contains NUL: {}", p.display())))
}

/// Set atime/mtime without following symlinks.
#[cfg(unix)]
fn apply_mtime(md: &fs::Metadata, target: &Path) {
    use std::os::unix::fs::MetadataExt;
    let Ok(path) = c_path(target) else {
        return;
    };
    let times = [
        libc::timespec {
            tv_sec: md.atime() as libc::time_t,
            tv_nsec: md.atime_nsec() as _,
        },
        libc::timespec {
            tv_sec: md.mtime() as libc::time_t,
            tv_nsec: md.mtime_nsec() as _,
        },
    ];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW) };
    if rc != 0 {
        warn!(
            "tree: set times {} failed: {}",
            target.display(),
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn apply_mtime(md: &fs::Metadata, target: &Path) {
    if let (Ok(mtime), Ok(f)) = (md.modified(), fs::File::options().write(true).open(target)) {
        let _ = f.set_modified(mtime);
    }
}

#[cfg(unix)]
fn make_special(md: &fs::Metadata, target: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;
    let path = c_path(target)?;
    let rc = unsafe { libc::mknod(path.as_ptr(), md.mode() as libc::mode_t, md.rdev() as libc::dev_t) };
    if rc != 0 {
        return Err(SessionError::io("mknod", target, io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_special(_md: &fs::Metadata, target: &Path) -> Result<()> {
    Err(SessionError::Invalid(format!("special files unsupported here: {}", target.display())))
}
