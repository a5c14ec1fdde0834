//! Shared on-disk names and defaults (storage root layout, backend files, archive layout).

// -------- Storage root --------
pub const LOCK_FILE: &str = "LOCK";
pub const SESSION_LOCKS_DIR: &str = ".locks";
pub const INDEX_FILE: &str = "session.json";
pub const ACTIVE_FILE: &str = "active";
pub const DESCRIPTOR_EXT: &str = "session";
pub const TMP_EXT: &str = "tmp";

/// Storage generations after conversion: "<id>.g<N>".
pub const GENERATION_SEP: &str = ".g";

// Default storage roots probed when neither --root nor SK_ROOT is set.
pub const DEFAULT_ROOT_CANDIDATES: &[&str] = &[
    "/run/initramfs/memory/data/minios/changes",
    "/lib/live/mount/data/minios/changes",
];

// -------- Backends --------
pub const DYNFILEFS_CONTAINER: &str = "changes.dat";
pub const DYNFILEFS_VIRTUAL_FILE: &str = "virtual.dat";
pub const RAW_IMAGE: &str = "changes.img";

pub const DEFAULT_SIZE_MB: u64 = 1000;
pub const DEFAULT_DYNFILEFS_SPLIT_MB: u64 = 4000;
/// Headroom added to the used size when a size has to be inferred (native source).
pub const INFERRED_SIZE_HEADROOM_MB: u64 = 100;

/// FAT-class filesystems cannot hold files of 4 GiB or more.
pub const FAT_MAX_FILE_MB: u64 = 4 * 1024;

pub const MB: u64 = 1024 * 1024;

// System release sources, first readable file wins
pub const RELEASE_FILES: &[&str] = &["/etc/minios-release", "/etc/os-release"];

// -------- Archive --------
pub const ARCHIVE_EXT: &str = "tar.zst";
pub const ARCHIVE_HEADER_ENTRY: &str = "session/metadata.json";
pub const ARCHIVE_DATA_DIR: &str = "data";
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;
