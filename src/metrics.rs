//! Lightweight global metrics for the session engine.
//!
//! Process-wide atomic counters:
//! - session lifecycle (created / deleted / activated)
//! - conversion (converted / copied, tree bytes copied)
//! - archives (bytes written on export, bytes read on import)

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Lifecycle -----
static SESSIONS_CREATED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_DELETED: AtomicU64 = AtomicU64::new(0);
static ACTIVATIONS: AtomicU64 = AtomicU64::new(0);

// ----- Conversion -----
static SESSIONS_CONVERTED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_COPIED: AtomicU64 = AtomicU64::new(0);
static TREE_BYTES_COPIED: AtomicU64 = AtomicU64::new(0);

// ----- Archives -----
static EXPORTS: AtomicU64 = AtomicU64::new(0);
static IMPORTS: AtomicU64 = AtomicU64::new(0);
static ARCHIVE_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static ARCHIVE_BYTES_READ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_created: u64,
    pub sessions_deleted: u64,
    pub activations: u64,

    pub sessions_converted: u64,
    pub sessions_copied: u64,
    pub tree_bytes_copied: u64,

    pub exports: u64,
    pub imports: u64,
    pub archive_bytes_written: u64,
    pub archive_bytes_read: u64,
}

impl MetricsSnapshot {
    /// Average compressed archive size per export.
    pub fn avg_export_bytes(&self) -> f64 {
        if self.exports == 0 {
            0.0
        } else {
            self.archive_bytes_written as f64 / self.exports as f64
        }
    }
}

pub fn record_session_created() {
    SESSIONS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_session_deleted() {
    SESSIONS_DELETED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_activation() {
    ACTIVATIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_converted() {
    SESSIONS_CONVERTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_copied() {
    SESSIONS_COPIED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_tree_copy(bytes: u64) {
    TREE_BYTES_COPIED.fetch_add(bytes, Ordering::Relaxed);
}

pub fn record_export(archive_bytes: u64) {
    EXPORTS.fetch_add(1, Ordering::Relaxed);
    ARCHIVE_BYTES_WRITTEN.fetch_add(archive_bytes, Ordering::Relaxed);
}

pub fn record_import(archive_bytes: u64) {
    IMPORTS.fetch_add(1, Ordering::Relaxed);
    ARCHIVE_BYTES_READ.fetch_add(archive_bytes, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        sessions_created: SESSIONS_CREATED.load(Ordering::Relaxed),
        sessions_deleted: SESSIONS_DELETED.load(Ordering::Relaxed),
        activations: ACTIVATIONS.load(Ordering::Relaxed),

        sessions_converted: SESSIONS_CONVERTED.load(Ordering::Relaxed),
        sessions_copied: SESSIONS_COPIED.load(Ordering::Relaxed),
        tree_bytes_copied: TREE_BYTES_COPIED.load(Ordering::Relaxed),

        exports: EXPORTS.load(Ordering::Relaxed),
        imports: IMPORTS.load(Ordering::Relaxed),
        archive_bytes_written: ARCHIVE_BYTES_WRITTEN.load(Ordering::Relaxed),
        archive_bytes_read: ARCHIVE_BYTES_READ.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    SESSIONS_CREATED.store(0, Ordering::Relaxed);
    SESSIONS_DELETED.store(0, Ordering::Relaxed);
    ACTIVATIONS.store(0, Ordering::Relaxed);

    SESSIONS_CONVERTED.store(0, Ordering::Relaxed);
    SESSIONS_COPIED.store(0, Ordering::Relaxed);
    TREE_BYTES_COPIED.store(0, Ordering::Relaxed);

    EXPORTS.store(0, Ordering::Relaxed);
    IMPORTS.store(0, Ordering::Relaxed);
    ARCHIVE_BYTES_WRITTEN.store(0, Ordering::Relaxed);
    ARCHIVE_BYTES_READ.store(0, Ordering::Relaxed);
}
