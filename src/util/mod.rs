//! util: small shared helpers: clock, atomic file replacement, size formatting.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::consts::TMP_EXT;
use crate::error::{Result, SessionError};

/// Current Unix time in milliseconds.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// "<name>.tmp" next to `path`.
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{TMP_EXT}"))
}

/// Atomically replace `path` with `bytes`: tmp write, fsync, rename, fsync parent.
///
/// A crash before the rename leaves the old content plus a stray ".tmp" file;
/// after the rename the new content is in place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path_for(path);
    // best-effort: stale tmp from an earlier crash
    let _ = fs::remove_file(&tmp);

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|e| SessionError::io("create", &tmp, e))?;
    f.write_all(bytes)
        .map_err(|e| SessionError::io("write", &tmp, e))?;
    f.sync_all().map_err(|e| SessionError::io("fsync", &tmp, e))?;
    drop(f);

    fs::rename(&tmp, path).map_err(|e| SessionError::io("rename over", path, e))?;
    let _ = fsync_parent_dir(path);
    Ok(())
}

/// Remove a file written by `write_atomic`, fsyncing the directory afterwards.
pub fn remove_durable(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(SessionError::io("remove", path, e)),
    }
    let _ = fsync_parent_dir(path);
    Ok(())
}

// Best-effort fsync of the parent directory after rename/unlink (Unix only).
#[cfg(unix)]
pub fn fsync_parent_dir(p: &Path) -> std::io::Result<()> {
    if let Some(parent) = p.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
pub fn fsync_parent_dir(_p: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Human readable size: "512.0B", "12.3MB", "1.0GB".
pub fn format_size(bytes: u64) -> String {
    let mut v = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if v < 1024.0 {
            return format!("{v:.1}{unit}");
        }
        v /= 1024.0;
    }
    format!("{v:.1}TB")
}

/// Local time "YYYY-mm-dd HH:MM:SS" for a Unix-ms timestamp.
pub fn format_unix_ms(ms: u64) -> String {
    match chrono::DateTime::from_timestamp_millis(ms as i64) {
        Some(dt) => dt
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => ms.to_string(),
    }
}

/// Compact local timestamp for file names: "YYYYmmdd-HHMMSS".
pub fn file_stamp_now() -> String {
    chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Round a byte count up to whole megabytes.
#[inline]
pub fn bytes_to_mb_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(crate::consts::MB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_unix_ms_monotonic_nonzero() {
        let a = now_unix_ms();
        let b = now_unix_ms();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn format_size_units() {
        assert_eq!(format_size(0), "0.0B");
        assert_eq!(format_size(1536), "1.5KB");
        assert_eq!(format_size(1000 * 1024 * 1024), "1000.0MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0GB");
    }

    #[test]
    fn tmp_path_keeps_full_name() {
        let p = tmp_path_for(Path::new("/r/7.session"));
        assert_eq!(p, PathBuf::from("/r/7.session.tmp"));
    }

    #[test]
    fn mb_rounding() {
        assert_eq!(bytes_to_mb_ceil(0), 0);
        assert_eq!(bytes_to_mb_ceil(1), 1);
        assert_eq!(bytes_to_mb_ceil(crate::consts::MB), 1);
        assert_eq!(bytes_to_mb_ceil(crate::consts::MB + 1), 2);
    }
}
