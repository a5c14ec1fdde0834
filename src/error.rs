//! Error taxonomy of the session engine.
//!
//! Drivers and the host layer return raw resource/IO errors; the engine wraps them
//! with the affected session id (`SessionError::InSession`). The CLI maps
//! `ErrorKind` to a process exit code without further interpretation.

use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionMode;

pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// Classification surfaced to the command surface (one exit code per kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    SessionActive,
    CapabilityUnsupported,
    InsufficientSpace,
    DeviceBusy,
    ArchiveCorrupt,
    ModeUnsupported,
    Invalid,
    IoFailure,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::IoFailure => 1,
            ErrorKind::NotFound => 2,
            ErrorKind::SessionActive => 3,
            ErrorKind::CapabilityUnsupported => 4,
            ErrorKind::InsufficientSpace => 5,
            ErrorKind::DeviceBusy => 6,
            ErrorKind::ArchiveCorrupt => 7,
            ErrorKind::ModeUnsupported => 8,
            ErrorKind::Invalid => 9,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::SessionActive => "SessionActive",
            ErrorKind::CapabilityUnsupported => "CapabilityUnsupported",
            ErrorKind::InsufficientSpace => "InsufficientSpace",
            ErrorKind::DeviceBusy => "DeviceBusy",
            ErrorKind::ArchiveCorrupt => "ArchiveCorrupt",
            ErrorKind::ModeUnsupported => "ModeUnsupported",
            ErrorKind::Invalid => "Invalid",
            ErrorKind::IoFailure => "IOFailure",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {id} not found")]
    NotFound { id: String },

    #[error("session {id} is active; activate another session first")]
    SessionActive { id: String },

    #[error("{mode} mode is not supported on {fs_type} filesystem: {reason}")]
    CapabilityUnsupported {
        mode: SessionMode,
        fs_type: String,
        reason: String,
    },

    #[error("insufficient space: {required_mb} MB required, {available_mb} MB available")]
    InsufficientSpace { required_mb: u64, available_mb: u64 },

    #[error("device busy: {path}")]
    DeviceBusy { path: PathBuf },

    #[error("archive {path} is corrupt: {reason}")]
    ArchiveCorrupt { path: PathBuf, reason: String },

    #[error("archived {mode} mode is not supported here (pass --auto-convert or --force-mode)")]
    ModeUnsupported { mode: SessionMode },

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("I/O error while {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed ({status}): {stderr}")]
    Tool {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("session {id}: {source}")]
    InSession {
        id: String,
        #[source]
        source: Box<SessionError>,
    },
}

impl SessionError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SessionError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound { .. } => ErrorKind::NotFound,
            SessionError::SessionActive { .. } => ErrorKind::SessionActive,
            SessionError::CapabilityUnsupported { .. } => ErrorKind::CapabilityUnsupported,
            SessionError::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            SessionError::DeviceBusy { .. } => ErrorKind::DeviceBusy,
            SessionError::ArchiveCorrupt { .. } => ErrorKind::ArchiveCorrupt,
            SessionError::ModeUnsupported { .. } => ErrorKind::ModeUnsupported,
            SessionError::Invalid(_) => ErrorKind::Invalid,
            SessionError::Io { .. } | SessionError::Tool { .. } => ErrorKind::IoFailure,
            SessionError::InSession { source, .. } => source.kind(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Attach the affected session id (idempotent for the same id).
    pub fn in_session(self, id: &str) -> Self {
        match self {
            SessionError::InSession { id: ref cur, .. } if cur == id => self,
            SessionError::NotFound { .. } | SessionError::SessionActive { .. } => self,
            other => SessionError::InSession {
                id: id.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Session id the error is about, if known.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionError::NotFound { id }
            | SessionError::SessionActive { id }
            | SessionError::InSession { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// `map_err` helper: attach a session id to any error of a result.
pub trait ResultExt<T> {
    fn in_session(self, id: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn in_session(self, id: &str) -> Result<T> {
        self.map_err(|e| e.in_session(id))
    }
}
