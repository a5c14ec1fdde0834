//! Centralized configuration and builder for the session engine.
//!
//! All tunables live here instead of scattered env lookups:
//! - EngineConfig::from_env() reads the SK_* variables;
//! - fluent with_* setters override single fields;
//! - EngineBuilder starts from env (or clean defaults) and produces an EngineConfig.
//!
//! The CLI applies `--root` on top of whatever the environment says.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::consts::{DEFAULT_DYNFILEFS_SPLIT_MB, DEFAULT_ROOT_CANDIDATES, DEFAULT_SIZE_MB, DEFAULT_ZSTD_LEVEL};

const DEFAULT_MOUNT_TIMEOUT_MS: u64 = 5000;

/// Top-level configuration of an Engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Storage root holding descriptors and storage entries.
    /// Env: SK_ROOT (default: first existing of the live-system candidates)
    pub root: PathBuf,

    /// Scratch directory for mountpoints and offline FUSE dirs.
    /// Env: SK_WORK_DIR (default <tmp>/sessionkeep-<uid>)
    pub work_dir: PathBuf,

    /// Where `activate` mounts the active session. None → <work_dir>/active.
    /// Env: SK_ACTIVE_MOUNT
    pub active_mount: Option<PathBuf>,

    /// Size for new container sessions when none is given.
    /// Env: SK_DEFAULT_SIZE_MB (default 1000)
    pub default_size_mb: u64,

    /// dynfilefs split size for `changes.dat.N` parts.
    /// Env: SK_DYNFILEFS_SPLIT_MB (default 4000)
    pub dynfilefs_split_mb: u64,

    /// zstd level for exports.
    /// Env: SK_ZSTD_LEVEL (default 3)
    pub zstd_level: i32,

    /// Re-read archives after export.
    /// Env: SK_VERIFY_EXPORT = 0|1|true|false (default true)
    pub verify_export: bool,

    /// How long to wait for dynfilefs to expose its virtual file.
    /// Env: SK_MOUNT_TIMEOUT_MS (default 5000)
    pub mount_timeout_ms: u64,

    /// Preallocate raw images (fallocate) instead of extending them sparse.
    /// Env: SK_PREALLOCATE_RAW = 0|1 (default true)
    pub preallocate_raw: bool,
}

fn default_root() -> PathBuf {
    DEFAULT_ROOT_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_dir())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT_CANDIDATES[0]))
}

fn default_work_dir() -> PathBuf {
    #[cfg(unix)]
    let uid = unsafe { libc::getuid() };
    #[cfg(not(unix))]
    let uid = 0;
    std::env::temp_dir().join(format!("sessionkeep-{uid}"))
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "on" || s == "yes"
    })
}

fn env_num<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            work_dir: default_work_dir(),
            active_mount: None,
            default_size_mb: DEFAULT_SIZE_MB,
            dynfilefs_split_mb: DEFAULT_DYNFILEFS_SPLIT_MB,
            zstd_level: DEFAULT_ZSTD_LEVEL,
            verify_export: true,
            mount_timeout_ms: DEFAULT_MOUNT_TIMEOUT_MS,
            preallocate_raw: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from SK_* environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(p) = env_path("SK_ROOT") {
            cfg.root = p;
        }
        if let Some(p) = env_path("SK_WORK_DIR") {
            cfg.work_dir = p;
        }
        if let Some(p) = env_path("SK_ACTIVE_MOUNT") {
            cfg.active_mount = Some(p);
        }
        if let Some(n) = env_num::<u64>("SK_DEFAULT_SIZE_MB").filter(|n| *n > 0) {
            cfg.default_size_mb = n;
        }
        if let Some(n) = env_num::<u64>("SK_DYNFILEFS_SPLIT_MB").filter(|n| *n > 0) {
            cfg.dynfilefs_split_mb = n;
        }
        if let Some(n) = env_num::<i32>("SK_ZSTD_LEVEL") {
            cfg.zstd_level = n;
        }
        if let Some(on) = env_flag("SK_VERIFY_EXPORT") {
            cfg.verify_export = on;
        }
        if let Some(n) = env_num::<u64>("SK_MOUNT_TIMEOUT_MS") {
            cfg.mount_timeout_ms = n;
        }
        if let Some(on) = env_flag("SK_PREALLOCATE_RAW") {
            cfg.preallocate_raw = on;
        }

        cfg
    }

    /// Effective mountpoint of the active session.
    pub fn active_mountpoint(&self) -> PathBuf {
        self.active_mount
            .clone()
            .unwrap_or_else(|| self.work_dir.join("active"))
    }

    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        self.root = root.as_ref().to_path_buf();
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_active_mount<P: Into<PathBuf>>(mut self, p: Option<P>) -> Self {
        self.active_mount = p.map(Into::into);
        self
    }

    pub fn with_default_size_mb(mut self, mb: u64) -> Self {
        self.default_size_mb = mb;
        self
    }

    pub fn with_dynfilefs_split_mb(mut self, mb: u64) -> Self {
        self.dynfilefs_split_mb = mb;
        self
    }

    pub fn with_zstd_level(mut self, level: i32) -> Self {
        self.zstd_level = level;
        self
    }

    pub fn with_verify_export(mut self, on: bool) -> Self {
        self.verify_export = on;
        self
    }

    pub fn with_mount_timeout_ms(mut self, ms: u64) -> Self {
        self.mount_timeout_ms = ms;
        self
    }

    pub fn with_preallocate_raw(mut self, on: bool) -> Self {
        self.preallocate_raw = on;
        self
    }
}

impl fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EngineConfig {{ \
             root: {}, \
             work_dir: {}, \
             active_mount: {}, \
             default_size_mb: {}, \
             dynfilefs_split_mb: {}, \
             zstd_level: {}, \
             verify_export: {}, \
             mount_timeout_ms: {}, \
             preallocate_raw: {} \
             }}",
            self.root.display(),
            self.work_dir.display(),
            self.active_mountpoint().display(),
            self.default_size_mb,
            self.dynfilefs_split_mb,
            self.zstd_level,
            self.verify_export,
            self.mount_timeout_ms,
            self.preallocate_raw,
        )
    }
}

/// Builder that produces an EngineConfig.
#[derive(Clone, Debug)]
pub struct EngineBuilder {
    cfg: EngineConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            cfg: EngineConfig::from_env(),
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: EngineConfig::default(),
        }
    }

    pub fn root(mut self, root: impl AsRef<Path>) -> Self {
        self.cfg.root = root.as_ref().to_path_buf();
        self
    }

    pub fn work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cfg.work_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn active_mount(mut self, p: impl AsRef<Path>) -> Self {
        self.cfg.active_mount = Some(p.as_ref().to_path_buf());
        self
    }

    pub fn default_size_mb(mut self, mb: u64) -> Self {
        self.cfg.default_size_mb = mb;
        self
    }

    pub fn dynfilefs_split_mb(mut self, mb: u64) -> Self {
        self.cfg.dynfilefs_split_mb = mb;
        self
    }

    pub fn zstd_level(mut self, level: i32) -> Self {
        self.cfg.zstd_level = level;
        self
    }

    pub fn verify_export(mut self, on: bool) -> Self {
        self.cfg.verify_export = on;
        self
    }

    pub fn mount_timeout_ms(mut self, ms: u64) -> Self {
        self.cfg.mount_timeout_ms = ms;
        self
    }

    pub fn preallocate_raw(mut self, on: bool) -> Self {
        self.cfg.preallocate_raw = on;
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> EngineConfig {
        self.cfg
    }
}
