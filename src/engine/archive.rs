//! engine/archive: export to / import from `.tar.zst`.
//!
//! Archive layout (tar stream through a streaming zstd encoder, checksummed):
//! - `session/metadata.json`: ArchiveHeader, always the first entry;
//! - `data/...`: the session tree (ownership, modes, mtimes, symlinks).
//!
//! Export writes `<dest>.tmp` and renames it into place; a failed export leaves
//! no archive. Import streams the tree into reserved, unrecorded storage and
//! writes the descriptor only after extraction and unmount succeed: an
//! interrupted import leaves an unreferenced storage entry, never a session.
//! Decode/extract failures yield ArchiveCorrupt.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use super::Engine;
use crate::consts::{
    ARCHIVE_DATA_DIR, ARCHIVE_EXT, ARCHIVE_FORMAT_VERSION, ARCHIVE_HEADER_ENTRY, INFERRED_SIZE_HEADROOM_MB,
};
use crate::error::{Result, ResultExt, SessionError};
use crate::host::{Capabilities, SystemRelease};
use crate::lock::try_acquire_session_lock;
use crate::metrics;
use crate::registry::Reservation;
use crate::session::{Session, SessionMode};
use crate::tree::{apply_dir_attrs, tree_size};
use crate::util::{bytes_to_mb_ceil, file_stamp_now, fsync_parent_dir, now_unix_ms, tmp_path_for};

/// `session/metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub format: u32,
    pub session_id: String,
    pub original_mode: SessionMode,
    pub original_size_limit_mb: u64,
    pub created_unix_ms: u64,
    pub exported_unix_ms: u64,
    pub used_bytes: u64,
    /// Release the session was created on.
    #[serde(flatten)]
    pub system: SystemRelease,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Use this mode regardless of the archived one.
    pub force_mode: Option<SessionMode>,
    /// Fall back to a container mode when the archived mode is unsupported here.
    pub auto_convert: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub path: PathBuf,
    pub archive_bytes: u64,
    pub verified: bool,
    pub header: ArchiveHeader,
}

fn corrupt(path: &Path, reason: impl std::fmt::Display) -> SessionError {
    SessionError::ArchiveCorrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Final archive path: a directory gets `session-<id>-<stamp>.tar.zst`,
/// a file name gets `.tar.zst` appended when missing.
pub fn export_path(dest: &Path, id: &str) -> PathBuf {
    if dest.is_dir() {
        return dest.join(format!("session-{id}-{}.{ARCHIVE_EXT}", file_stamp_now()));
    }
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.ends_with(&format!(".{ARCHIVE_EXT}")) {
        dest.to_path_buf()
    } else {
        dest.with_file_name(format!("{name}.{ARCHIVE_EXT}"))
    }
}

/// Mode an archive is imported as.
pub fn select_import_mode(header: &ArchiveHeader, caps: &Capabilities, opts: ImportOptions) -> Result<SessionMode> {
    if let Some(mode) = opts.force_mode {
        return Ok(mode);
    }
    if caps.supports(header.original_mode) {
        return Ok(header.original_mode);
    }
    if opts.auto_convert {
        for mode in [SessionMode::Raw, SessionMode::Dynfilefs] {
            if caps.supports(mode) {
                return Ok(mode);
            }
        }
    }
    Err(SessionError::ModeUnsupported {
        mode: header.original_mode,
    })
}

/// Size of the imported session: the original limit while it still holds the
/// data, otherwise used + headroom (at least `default_mb`).
pub fn import_size_mb(header: &ArchiveHeader, default_mb: u64) -> u64 {
    let used_mb = bytes_to_mb_ceil(header.used_bytes);
    if header.original_size_limit_mb > 0 && header.original_size_limit_mb >= used_mb {
        header.original_size_limit_mb
    } else {
        (used_mb + INFERRED_SIZE_HEADROOM_MB).max(default_mb)
    }
}

fn write_archive(src: &Path, tmp: &Path, header: &ArchiveHeader, level: i32) -> Result<u64> {
    let file = File::create(tmp).map_err(|e| SessionError::io("create", tmp, e))?;
    let mut enc = zstd::stream::write::Encoder::new(file, level).map_err(|e| SessionError::io("zstd init", tmp, e))?;
    enc.include_checksum(true)
        .map_err(|e| SessionError::io("zstd init", tmp, e))?;
    let mut tar = tar::Builder::new(enc);
    tar.follow_symlinks(false);

    let header_bytes =
        serde_json::to_vec_pretty(header).map_err(|e| SessionError::Invalid(format!("serialize header: {e}")))?;
    let mut th = tar::Header::new_gnu();
    th.set_size(header_bytes.len() as u64);
    th.set_mode(0o644);
    th.set_mtime(header.exported_unix_ms / 1000);
    th.set_entry_type(tar::EntryType::Regular);
    th.set_cksum();
    tar.append_data(&mut th, ARCHIVE_HEADER_ENTRY, header_bytes.as_slice())
        .map_err(|e| SessionError::io("write", tmp, e))?;

    let walker = WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_type().is_dir() && e.file_name() == "lost+found"));
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| src.to_path_buf());
            SessionError::io("walk", path, e.into_io_error().unwrap_or_else(|| io::Error::other("filesystem loop")))
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
        let name = Path::new(ARCHIVE_DATA_DIR).join(rel);
        tar.append_path_with_name(entry.path(), &name)
            .map_err(|e| SessionError::io("archive", entry.path(), e))?;
    }

    let enc = tar.into_inner().map_err(|e| SessionError::io("write", tmp, e))?;
    let file = enc.finish().map_err(|e| SessionError::io("zstd finish", tmp, e))?;
    file.sync_all().map_err(|e| SessionError::io("fsync", tmp, e))?;
    let len = file.metadata().map_err(|e| SessionError::io("stat", tmp, e))?.len();
    Ok(len)
}

fn open_archive(path: &Path) -> Result<tar::Archive<zstd::stream::read::Decoder<'static, io::BufReader<File>>>> {
    let file = File::open(path).map_err(|e| SessionError::io("open", path, e))?;
    let dec = zstd::stream::read::Decoder::new(file).map_err(|e| corrupt(path, e))?;
    Ok(tar::Archive::new(dec))
}

fn parse_header<R: Read>(path: &Path, entry: &mut tar::Entry<'_, R>) -> Result<ArchiveHeader> {
    let name = entry.path().map_err(|e| corrupt(path, e))?.into_owned();
    if name != Path::new(ARCHIVE_HEADER_ENTRY) {
        return Err(corrupt(path, format!("first entry is {}, not {ARCHIVE_HEADER_ENTRY}", name.display())));
    }
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).map_err(|e| corrupt(path, e))?;
    let header: ArchiveHeader = serde_json::from_slice(&buf).map_err(|e| corrupt(path, e))?;
    if header.format != ARCHIVE_FORMAT_VERSION {
        return Err(corrupt(path, format!("unsupported archive format {}", header.format)));
    }
    Ok(header)
}

/// Read the header entry only.
pub fn read_header(path: &Path) -> Result<ArchiveHeader> {
    let mut archive = open_archive(path)?;
    let mut entries = archive.entries().map_err(|e| corrupt(path, e))?;
    let mut first = entries
        .next()
        .ok_or_else(|| corrupt(path, "empty archive"))?
        .map_err(|e| corrupt(path, e))?;
    parse_header(path, &mut first)
}

/// Decode the whole archive end to end; returns the header.
pub fn verify_archive(path: &Path) -> Result<ArchiveHeader> {
    let mut archive = open_archive(path)?;
    let mut entries = archive.entries().map_err(|e| corrupt(path, e))?;
    let mut first = entries
        .next()
        .ok_or_else(|| corrupt(path, "empty archive"))?
        .map_err(|e| corrupt(path, e))?;
    let header = parse_header(path, &mut first)?;
    drop(first);
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(path, e))?;
        io::copy(&mut entry, &mut io::sink()).map_err(|e| corrupt(path, e))?;
    }
    Ok(header)
}

// "data/a/b" → "a/b"; anything escaping the data dir is rejected.
fn data_relative(path: &Path, name: &Path) -> Result<Option<PathBuf>> {
    let rel = name
        .strip_prefix(ARCHIVE_DATA_DIR)
        .map_err(|_| corrupt(path, format!("unexpected entry {}", name.display())))?;
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(corrupt(path, format!("unsafe entry {}", name.display())));
    }
    Ok(if rel.as_os_str().is_empty() {
        None
    } else {
        Some(rel.to_path_buf())
    })
}

fn unpack_data(path: &Path, dest: &Path) -> Result<u64> {
    #[cfg(unix)]
    let privileged = unsafe { libc::geteuid() } == 0;
    #[cfg(not(unix))]
    let privileged = false;

    let mut archive = open_archive(path)?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(privileged);
    archive.set_overwrite(true);

    let mut entries = archive.entries().map_err(|e| corrupt(path, e))?;
    let mut first = entries
        .next()
        .ok_or_else(|| corrupt(path, "empty archive"))?
        .map_err(|e| corrupt(path, e))?;
    parse_header(path, &mut first)?;
    drop(first);

    // (target, mode, uid, gid, mtime) applied after all content is in place
    let mut dirs: Vec<(PathBuf, u32, u64, u64, u64)> = Vec::new();
    let mut bytes = 0u64;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(path, e))?;
        let name = entry.path().map_err(|e| corrupt(path, e))?.into_owned();
        let Some(rel) = data_relative(path, &name)? else {
            continue;
        };
        let target = dest.join(&rel);
        let h = entry.header();
        if h.entry_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| SessionError::io("create dir", &target, e))?;
            dirs.push((
                target,
                h.mode().map_err(|e| corrupt(path, e))?,
                h.uid().unwrap_or(0),
                h.gid().unwrap_or(0),
                h.mtime().unwrap_or(0),
            ));
            continue;
        }
        if h.entry_type().is_hard_link() {
            return Err(corrupt(path, format!("hard link entry {}", name.display())));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| SessionError::io("create dir", parent, e))?;
        }
        bytes += entry.size();
        entry.unpack(&target).map_err(|e| corrupt(path, e))?;
    }
    for (target, mode, uid, gid, mtime) in dirs.iter().rev() {
        apply_dir_attrs(target, *mode, *uid, *gid, *mtime, privileged)?;
    }
    Ok(bytes)
}

impl Engine {
    /// Export `id` into `destination` (directory or file path).
    pub fn export(&mut self, id: &str, destination: &Path, verify: bool) -> Result<ExportReport> {
        let (s, _sl) = {
            let _g = self.lock_root()?;
            let s = self.registry.get(id)?;
            let sl = try_acquire_session_lock(&self.cfg.root, id).in_session(id)?;
            (s, sl)
        };
        let out = export_path(destination, id);
        let tmp = tmp_path_for(&out);
        info!("export: id={} mode={} -> {}", id, s.mode, out.display());

        let src = self.mount_source(&s).in_session(id)?;
        let written = tree_size(&src.mountpoint).and_then(|used_bytes| {
            let header = ArchiveHeader {
                format: ARCHIVE_FORMAT_VERSION,
                session_id: s.id.clone(),
                original_mode: s.mode,
                original_size_limit_mb: s.size_limit_mb,
                created_unix_ms: s.created_unix_ms,
                exported_unix_ms: now_unix_ms(),
                used_bytes,
                system: s.system.clone(),
            };
            write_archive(&src.mountpoint, &tmp, &header, self.cfg.zstd_level).map(|n| (header, n))
        });
        let released = self.release(src);
        let (header, archive_bytes) = match written.and_then(|w| released.map(|_| w)) {
            Ok(w) => w,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e.in_session(id));
            }
        };

        if verify {
            if let Err(e) = verify_archive(&tmp) {
                let _ = fs::remove_file(&tmp);
                return Err(e.in_session(id));
            }
        }
        fs::rename(&tmp, &out).map_err(|e| SessionError::io("rename over", &out, e))?;
        let _ = fsync_parent_dir(&out);

        metrics::record_export(archive_bytes);
        info!(
            "export: id={} archive={} bytes={} verified={}",
            id,
            out.display(),
            archive_bytes,
            verify
        );
        Ok(ExportReport {
            path: out,
            archive_bytes,
            verified: verify,
            header,
        })
    }

    /// Import an archive as a new session.
    pub fn import(&mut self, archive: &Path, opts: ImportOptions) -> Result<Session> {
        if !archive.is_file() {
            return Err(SessionError::io(
                "open",
                archive,
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        let header = read_header(archive)?;
        let caps = self.host.capabilities(&self.cfg.root)?;
        let mode = select_import_mode(&header, &caps, opts)?;
        let size = import_size_mb(&header, self.cfg.default_size_mb);
        info!(
            "import: {} original id={} mode={} -> mode={} size_mb={}",
            archive.display(),
            header.session_id,
            header.original_mode,
            mode,
            size
        );

        for issue in header.system.mismatches(&self.host.system_release()) {
            warn!("import: archive from another system ({})", issue);
        }
        caps.check(mode, size)?;

        let (reservation, _sl) = {
            let _g = self.lock_root()?;
            let id = self.registry.allocate_id();
            let reservation = self.registry.reserve(&id, 0)?;
            let sl = try_acquire_session_lock(&self.cfg.root, &id)?;
            (reservation, sl)
        };
        let id = reservation.id.clone();

        let (s, bytes) = match self.restore(archive, &reservation, mode, size, &header) {
            Ok(v) => v,
            Err(e) => {
                let scratch = self.scratch_path(&reservation.storage);
                if self.host.is_mounted(&scratch) {
                    warn!(
                        "import: {} still mounted; storage {} left for reclaim",
                        scratch.display(),
                        reservation.dir.display()
                    );
                } else if let Err(re) = self.registry.release(&reservation) {
                    warn!("import: removing {} failed: {}", reservation.dir.display(), re);
                }
                return Err(e.in_session(&id));
            }
        };

        let _g = self.lock_root()?;
        self.ensure_built(&s, &reservation)?;
        self.registry.record(&s)?;
        metrics::record_session_created();
        metrics::record_import(fs::metadata(archive).map(|m| m.len()).unwrap_or(0));
        info!("import: id={} mode={} restored bytes={}", id, s.mode, bytes);
        self.registry.get(&id)
    }

    /// Materialize `reservation` and unpack the archive tree into it. Nothing
    /// is recorded here.
    fn restore(
        &self,
        archive: &Path,
        reservation: &Reservation,
        mode: SessionMode,
        size_limit_mb: u64,
        header: &ArchiveHeader,
    ) -> Result<(Session, u64)> {
        let handle = self.backend(mode).materialize(&reservation.dir, size_limit_mb)?;
        let s = Session {
            id: reservation.id.clone(),
            mode,
            size_limit_mb: handle.size_limit_mb,
            created_unix_ms: now_unix_ms(),
            active: false,
            storage: reservation.storage.clone(),
            path: handle.dir,
            system: header.system.clone(),
        };
        let m = self.mount_scratch(&s, false)?;
        let unpacked = unpack_data(archive, &m.mountpoint);
        let released = self.release(m);
        let bytes = unpacked?;
        released?;
        Ok((s, bytes))
    }
}
