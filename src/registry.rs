//! registry: durable catalog of sessions under the storage root.
//!
//! Source of truth is the set of `<id>.session` descriptors; `session.json` is a
//! cache rebuilt on every scan. The only state the cache adds is `next_id`, the
//! id high-water mark that keeps deleted ids from being handed out again.
//!
//! Scan results:
//! - sessions: one per readable descriptor;
//! - active: the `active` marker, if it names a known session;
//! - orphans: leftovers of interrupted operations (warned about, never removed
//!   unless `reclaim_orphans(true)` is called). Entries whose per-session lock
//!   is held belong to a running copy/convert/import and are flagged
//!   `in_progress`; reclaim leaves them alone.
//!
//! Mutations are not locked here; callers hold the global root lock.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::consts::{ACTIVE_FILE, DESCRIPTOR_EXT, INDEX_FILE, LOCK_FILE, SESSION_LOCKS_DIR, TMP_EXT};
use crate::error::{Result, SessionError};
use crate::lock::{session_lock_held, try_acquire_session_lock};
use crate::session::{
    descriptor_file_name, parse_storage_name, storage_name, validate_id, Descriptor, Session, SessionMode,
};
use crate::util::{now_unix_ms, remove_durable, write_atomic};

const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrphanKind {
    UnreferencedStorage,
    TempFile,
    MissingStorage,
    StaleActive,
}

impl fmt::Display for OrphanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrphanKind::UnreferencedStorage => "unreferenced-storage",
            OrphanKind::TempFile => "temp-file",
            OrphanKind::MissingStorage => "missing-storage",
            OrphanKind::StaleActive => "stale-active",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Orphan {
    pub kind: OrphanKind,
    pub path: PathBuf,
    pub id: Option<String>,
    /// The session lock of `id` was held at scan time.
    pub in_progress: bool,
}

/// Contents of `<root>/active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveMarker {
    pub id: String,
    pub mountpoint: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    id: String,
    mode: SessionMode,
    size_limit_mb: u64,
    storage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexCache {
    version: u32,
    next_id: u64,
    #[serde(default)]
    active: Option<String>,
    #[serde(default)]
    sessions: Vec<IndexEntry>,
    #[serde(default)]
    updated_unix_ms: u64,
}

/// A claimed storage entry not yet backed by a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: String,
    pub storage: String,
    pub dir: PathBuf,
}

#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    sessions: BTreeMap<String, Descriptor>,
    active: Option<ActiveMarker>,
    orphans: Vec<Orphan>,
    /// Storage entry names present on disk (referenced or not).
    storage_entries: BTreeSet<String>,
    next_id: u64,
}

fn is_reserved_name(name: &str) -> bool {
    name == LOCK_FILE || name == SESSION_LOCKS_DIR || name == INDEX_FILE || name == ACTIVE_FILE
}

impl Registry {
    /// Scan `root` (must exist) and build the catalog.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(SessionError::io(
                "open storage root",
                root,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }
        let mut reg = Self {
            root: root.to_path_buf(),
            sessions: BTreeMap::new(),
            active: None,
            orphans: Vec::new(),
            storage_entries: BTreeSet::new(),
            next_id: 1,
        };
        reg.refresh()?;
        Ok(reg)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Re-scan the root and reconcile descriptors, storage entries and the marker.
    pub fn refresh(&mut self) -> Result<()> {
        let mut sessions = BTreeMap::new();
        let mut orphans = Vec::new();
        let mut storage_entries = BTreeSet::new();
        let mut max_seen: u64 = 0;

        let rd = fs::read_dir(&self.root).map_err(|e| SessionError::io("read dir", &self.root, e))?;
        for entry in rd {
            let entry = entry.map_err(|e| SessionError::io("read dir", &self.root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_reserved_name(&name) {
                continue;
            }
            let path = entry.path();

            if let Some(stem) = name.strip_suffix(&format!(".{TMP_EXT}")) {
                let id = stem
                    .strip_suffix(&format!(".{DESCRIPTOR_EXT}"))
                    .filter(|id| validate_id(id).is_ok())
                    .map(str::to_string);
                orphans.push(Orphan {
                    kind: OrphanKind::TempFile,
                    path,
                    id,
                    in_progress: false,
                });
                continue;
            }

            if let Some(id) = name.strip_suffix(&format!(".{DESCRIPTOR_EXT}")) {
                match read_descriptor(&path, id) {
                    Ok(d) => {
                        max_seen = max_seen.max(id.parse().unwrap_or(0));
                        sessions.insert(d.id.clone(), d);
                    }
                    Err(e) => warn!("registry: skipping descriptor {}: {}", path.display(), e),
                }
                continue;
            }

            if let Some((id, _)) = parse_storage_name(&name) {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    max_seen = max_seen.max(id.parse().unwrap_or(0));
                    storage_entries.insert(name);
                }
            }
        }

        let referenced: BTreeSet<&str> = sessions.values().map(|d| d.storage.as_str()).collect();
        for name in &storage_entries {
            if !referenced.contains(name.as_str()) {
                orphans.push(Orphan {
                    kind: OrphanKind::UnreferencedStorage,
                    path: self.root.join(name),
                    id: parse_storage_name(name).map(|(id, _)| id.to_string()),
                    in_progress: false,
                });
            }
        }
        for d in sessions.values() {
            if !storage_entries.contains(&d.storage) {
                orphans.push(Orphan {
                    kind: OrphanKind::MissingStorage,
                    path: self.root.join(descriptor_file_name(&d.id)),
                    id: Some(d.id.clone()),
                    in_progress: false,
                });
            }
        }

        let marker_path = self.root.join(ACTIVE_FILE);
        let mut active = None;
        match fs::read(&marker_path) {
            Ok(bytes) => match serde_json::from_slice::<ActiveMarker>(&bytes) {
                Ok(m) if sessions.contains_key(&m.id) => active = Some(m),
                Ok(m) => orphans.push(Orphan {
                    kind: OrphanKind::StaleActive,
                    path: marker_path,
                    id: Some(m.id),
                    in_progress: false,
                }),
                Err(e) => {
                    warn!("registry: unreadable active marker {}: {}", marker_path.display(), e);
                    orphans.push(Orphan {
                        kind: OrphanKind::StaleActive,
                        path: marker_path,
                        id: None,
                        in_progress: false,
                    });
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SessionError::io("read", &marker_path, e)),
        }

        let cached_next = self.read_index_next_id();
        orphans.sort_by(|a, b| a.path.cmp(&b.path));
        for o in orphans.iter_mut() {
            if o.kind != OrphanKind::StaleActive {
                if let Some(id) = &o.id {
                    o.in_progress = session_lock_held(&self.root, id);
                }
            }
            debug!(
                "registry: orphan kind={} path={} in_progress={}",
                o.kind,
                o.path.display(),
                o.in_progress
            );
        }

        self.sessions = sessions;
        self.storage_entries = storage_entries;
        self.active = active;
        self.orphans = orphans;
        self.next_id = cached_next.max(self.next_id).max(max_seen + 1);
        debug!(
            "registry: scanned root={} sessions={} orphans={} next_id={}",
            self.root.display(),
            self.sessions.len(),
            self.orphans.len(),
            self.next_id
        );
        // the cache is advisory; a read-only root still lists fine
        if let Err(e) = self.write_index() {
            debug!("registry: index cache not written: {}", e);
        }
        Ok(())
    }

    fn read_index_next_id(&self) -> u64 {
        let path = self.root.join(INDEX_FILE);
        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<IndexCache>(&bytes) {
                Ok(idx) => idx.next_id,
                Err(e) => {
                    warn!("registry: ignoring corrupt index cache {}: {}", path.display(), e);
                    1
                }
            },
            Err(_) => 1,
        }
    }

    fn write_index(&self) -> Result<()> {
        let idx = IndexCache {
            version: INDEX_VERSION,
            next_id: self.next_id,
            active: self.active.as_ref().map(|m| m.id.clone()),
            sessions: self
                .sessions
                .values()
                .map(|d| IndexEntry {
                    id: d.id.clone(),
                    mode: d.mode,
                    size_limit_mb: d.size_limit_mb,
                    storage: d.storage.clone(),
                })
                .collect(),
            updated_unix_ms: now_unix_ms(),
        };
        let bytes = serde_json::to_vec_pretty(&idx)
            .map_err(|e| SessionError::Invalid(format!("serialize index cache: {e}")))?;
        write_atomic(&self.root.join(INDEX_FILE), &bytes)
    }

    fn session_of(&self, d: &Descriptor) -> Session {
        let active = self.active.as_ref().map(|m| m.id == d.id).unwrap_or(false);
        Session::from_descriptor(&self.root, d.clone(), active)
    }

    /// All sessions, ordered by creation time (ties by numeric id).
    pub fn list(&self) -> Vec<Session> {
        let mut out: Vec<Session> = self.sessions.values().map(|d| self.session_of(d)).collect();
        out.sort_by_key(|s| (s.created_unix_ms, s.numeric_id()));
        out
    }

    pub fn get(&self, id: &str) -> Result<Session> {
        self.sessions
            .get(id)
            .map(|d| self.session_of(d))
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Next never-used id.
    pub fn allocate_id(&self) -> String {
        let mut n = self.next_id.max(1);
        loop {
            let id = n.to_string();
            let taken = self.sessions.contains_key(&id)
                || self
                    .storage_entries
                    .iter()
                    .any(|s| parse_storage_name(s).map(|(sid, _)| sid == id).unwrap_or(false));
            if !taken {
                return id;
            }
            n += 1;
        }
    }

    /// Next free storage generation for `id` (0 only for a brand new id).
    pub fn next_generation(&self, id: &str) -> u32 {
        let mut gen = 0u32;
        let mut any = false;
        for name in self.storage_entries.iter().map(String::as_str).chain(
            self.sessions
                .get(id)
                .map(|d| d.storage.as_str()),
        ) {
            if let Some((sid, g)) = parse_storage_name(name) {
                if sid == id {
                    any = true;
                    gen = gen.max(g);
                }
            }
        }
        if any {
            gen + 1
        } else {
            0
        }
    }

    /// Claim the storage entry `<id>` / `<id>.g<N>` by creating its directory.
    pub fn reserve(&mut self, id: &str, generation: u32) -> Result<Reservation> {
        validate_id(id)?;
        if generation == 0 && self.sessions.contains_key(id) {
            return Err(SessionError::Invalid(format!("session {id} already exists")));
        }
        let storage = storage_name(id, generation);
        let dir = self.root.join(&storage);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SessionError::Invalid(format!(
                    "storage {} is already taken",
                    dir.display()
                )))
            }
            Err(e) => return Err(SessionError::io("create", &dir, e)),
        }
        self.storage_entries.insert(storage.clone());
        if let Ok(n) = id.parse::<u64>() {
            self.next_id = self.next_id.max(n + 1);
        }
        debug!("registry: reserved id={} storage={}", id, storage);
        Ok(Reservation {
            id: id.to_string(),
            storage,
            dir,
        })
    }

    /// Drop a reservation that never got a descriptor.
    pub fn release(&mut self, reservation: &Reservation) -> Result<()> {
        self.storage_entries.remove(&reservation.storage);
        match fs::remove_dir_all(&reservation.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::io("remove", &reservation.dir, e)),
        }
    }

    /// Persist (create or replace) the descriptor of `session`.
    pub fn record(&mut self, session: &Session) -> Result<()> {
        let d = session.descriptor();
        let bytes =
            serde_json::to_vec_pretty(&d).map_err(|e| SessionError::Invalid(format!("serialize descriptor: {e}")))?;
        write_atomic(&self.root.join(descriptor_file_name(&d.id)), &bytes)?;
        if let Ok(n) = d.id.parse::<u64>() {
            self.next_id = self.next_id.max(n + 1);
        }
        self.storage_entries.insert(d.storage.clone());
        info!(
            "registry: recorded id={} mode={} size_mb={} storage={}",
            d.id, d.mode, d.size_limit_mb, d.storage
        );
        self.sessions.insert(d.id.clone(), d);
        self.write_index()
    }

    /// Remove the descriptor of `id` (its storage must already be gone).
    pub fn remove(&mut self, id: &str) -> Result<()> {
        let d = self
            .sessions
            .remove(id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        remove_durable(&self.root.join(descriptor_file_name(id)))?;
        self.storage_entries.remove(&d.storage);
        if self.active.as_ref().map(|m| m.id == id).unwrap_or(false) {
            self.clear_active()?;
        }
        self.write_index()
    }

    /// Forget a storage entry destroyed by the caller.
    pub fn forget_storage(&mut self, storage: &str) {
        self.storage_entries.remove(storage);
    }

    pub fn active(&self) -> Option<&ActiveMarker> {
        self.active.as_ref()
    }

    pub fn set_active(&mut self, id: &str, mountpoint: &Path) -> Result<()> {
        if !self.sessions.contains_key(id) {
            return Err(SessionError::NotFound { id: id.to_string() });
        }
        let marker = ActiveMarker {
            id: id.to_string(),
            mountpoint: mountpoint.to_path_buf(),
        };
        let bytes = serde_json::to_vec_pretty(&marker)
            .map_err(|e| SessionError::Invalid(format!("serialize active marker: {e}")))?;
        write_atomic(&self.root.join(ACTIVE_FILE), &bytes)?;
        self.active = Some(marker);
        self.write_index()
    }

    pub fn clear_active(&mut self) -> Result<()> {
        remove_durable(&self.root.join(ACTIVE_FILE))?;
        self.active = None;
        self.orphans.retain(|o| o.kind != OrphanKind::StaleActive);
        self.write_index()
    }

    pub fn orphans(&self) -> &[Orphan] {
        &self.orphans
    }

    /// Delete every orphan not owned by a running operation. Requires explicit
    /// confirmation.
    ///
    /// Storage, temp and descriptor leftovers are removed while holding the
    /// session lock of their id; a busy lock means the entry is in flight and it
    /// is skipped.
    pub fn reclaim_orphans(&mut self, confirm: bool) -> Result<Vec<Orphan>> {
        if !confirm {
            return Err(SessionError::Invalid(
                "refusing to delete orphans without confirmation".into(),
            ));
        }
        let mut removed = Vec::new();
        for o in self.orphans.clone() {
            let _sl = match (&o.id, o.kind) {
                (Some(id), kind) if kind != OrphanKind::StaleActive => {
                    match try_acquire_session_lock(&self.root, id) {
                        Ok(g) => Some(g),
                        Err(SessionError::DeviceBusy { .. }) => {
                            info!("registry: skipping in-progress kind={} path={}", o.kind, o.path.display());
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ => None,
            };
            let res = match o.kind {
                OrphanKind::UnreferencedStorage => fs::remove_dir_all(&o.path),
                OrphanKind::TempFile | OrphanKind::MissingStorage | OrphanKind::StaleActive => {
                    fs::remove_file(&o.path)
                }
            };
            match res {
                Ok(()) => {
                    info!("registry: reclaimed kind={} path={}", o.kind, o.path.display());
                    removed.push(o);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed.push(o),
                Err(e) => return Err(SessionError::io("remove", &o.path, e)),
            }
        }
        self.refresh()?;
        Ok(removed)
    }
}

fn read_descriptor(path: &Path, id: &str) -> Result<Descriptor> {
    validate_id(id)?;
    let bytes = fs::read(path).map_err(|e| SessionError::io("read", path, e))?;
    let d: Descriptor = serde_json::from_slice(&bytes)
        .map_err(|e| SessionError::Invalid(format!("descriptor {}: {e}", path.display())))?;
    if d.id != id {
        return Err(SessionError::Invalid(format!(
            "descriptor {} names id {}",
            path.display(),
            d.id
        )));
    }
    match parse_storage_name(&d.storage) {
        Some((sid, _)) if sid == id => Ok(d),
        _ => Err(SessionError::Invalid(format!(
            "descriptor {} names foreign storage {}",
            path.display(),
            d.storage
        ))),
    }
}
