//! Session records and the on-disk descriptor.
//!
//! Descriptor `<root>/<id>.session` (JSON, pretty):
//! {
//!   "version": 1,
//!   "id": "7",
//!   "mode": "raw",
//!   "size_limit_mb": 1000,
//!   "created_unix_ms": 1760000000000,
//!   "storage": "7.g1",
//!   "system": { "version": "4.1", "edition": "XFCE", "union": "overlayfs" }
//! }
//!
//! `system` names the release the session was created on; it is optional and
//! each of its fields may be missing.
//!
//! The descriptor is the authoritative marker that a session exists; the storage
//! entry it names holds the data. Both are written by the Registry only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::consts::{DESCRIPTOR_EXT, GENERATION_SEP};
use crate::error::SessionError;
use crate::host::SystemRelease;

pub const DESCRIPTOR_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Native,
    Dynfilefs,
    Raw,
}

impl SessionMode {
    pub const ALL: [SessionMode; 3] = [SessionMode::Native, SessionMode::Dynfilefs, SessionMode::Raw];

    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Native => "native",
            SessionMode::Dynfilefs => "dynfilefs",
            SessionMode::Raw => "raw",
        }
    }

    /// Container-backed modes carry a hard size ceiling.
    pub fn has_size_ceiling(self) -> bool {
        !matches!(self, SessionMode::Native)
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(SessionMode::Native),
            "dynfilefs" => Ok(SessionMode::Dynfilefs),
            "raw" => Ok(SessionMode::Raw),
            other => Err(SessionError::Invalid(format!(
                "unknown session mode '{other}' (expected native, dynfilefs or raw)"
            ))),
        }
    }
}

/// Persisted descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub version: u32,
    pub id: String,
    pub mode: SessionMode,
    pub size_limit_mb: u64,
    pub created_unix_ms: u64,
    pub storage: String,
    #[serde(default, skip_serializing_if = "SystemRelease::is_empty")]
    pub system: SystemRelease,
}

/// A session as seen by callers: descriptor plus derived state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    pub size_limit_mb: u64,
    pub created_unix_ms: u64,
    pub active: bool,
    pub storage: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub system: SystemRelease,
}

impl Session {
    pub fn from_descriptor(root: &Path, d: Descriptor, active: bool) -> Self {
        Self {
            path: root.join(&d.storage),
            id: d.id,
            mode: d.mode,
            size_limit_mb: d.size_limit_mb,
            created_unix_ms: d.created_unix_ms,
            active,
            storage: d.storage,
            system: d.system,
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            version: DESCRIPTOR_VERSION,
            id: self.id.clone(),
            mode: self.mode,
            size_limit_mb: self.size_limit_mb,
            created_unix_ms: self.created_unix_ms,
            storage: self.storage.clone(),
            system: self.system.clone(),
        }
    }

    /// Numeric id for ordering; ids are validated as decimal on entry.
    pub fn numeric_id(&self) -> u64 {
        self.id.parse().unwrap_or(u64::MAX)
    }
}

/// Ids are positive decimal numbers without leading zeros.
pub fn validate_id(id: &str) -> Result<(), SessionError> {
    let ok = !id.is_empty()
        && id.len() <= 12
        && id.bytes().all(|b| b.is_ascii_digit())
        && !id.starts_with('0');
    if ok {
        Ok(())
    } else {
        Err(SessionError::Invalid(format!("bad session id '{id}'")))
    }
}

pub fn descriptor_file_name(id: &str) -> String {
    format!("{id}.{DESCRIPTOR_EXT}")
}

/// Storage entry name for a given generation (0 = initial "<id>").
pub fn storage_name(id: &str, generation: u32) -> String {
    if generation == 0 {
        id.to_string()
    } else {
        format!("{id}{GENERATION_SEP}{generation}")
    }
}

/// Parse "<id>" / "<id>.g<N>" into (id, generation).
pub fn parse_storage_name(name: &str) -> Option<(&str, u32)> {
    let (id, generation) = match name.split_once(GENERATION_SEP) {
        Some((id, g)) => (id, g.parse::<u32>().ok()?),
        None => (name, 0),
    };
    validate_id(id).ok()?;
    Some((id, generation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parse_and_display() {
        assert_eq!("RAW".parse::<SessionMode>().unwrap(), SessionMode::Raw);
        assert_eq!(SessionMode::Dynfilefs.to_string(), "dynfilefs");
        assert!("ntfs".parse::<SessionMode>().is_err());
    }

    #[test]
    fn ids_are_plain_decimals() {
        assert!(validate_id("1").is_ok());
        assert!(validate_id("42").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("07").is_err());
        assert!(validate_id("../x").is_err());
        assert!(validate_id("3.g1").is_err());
    }

    #[test]
    fn storage_names_roundtrip_generation() {
        assert_eq!(storage_name("5", 0), "5");
        assert_eq!(storage_name("5", 2), "5.g2");
        assert_eq!(parse_storage_name("5"), Some(("5", 0)));
        assert_eq!(parse_storage_name("5.g2"), Some(("5", 2)));
        assert_eq!(parse_storage_name("5.gx"), None);
        assert_eq!(parse_storage_name("lost+found"), None);
    }

    #[test]
    fn descriptor_json_uses_lowercase_mode() {
        let d = Descriptor {
            version: DESCRIPTOR_VERSION,
            id: "3".into(),
            mode: SessionMode::Dynfilefs,
            size_limit_mb: 2000,
            created_unix_ms: 1,
            storage: "3".into(),
            system: SystemRelease {
                version: Some("4.1".into()),
                edition: None,
                union: Some("overlayfs".into()),
            },
        };
        let s = serde_json::to_string(&d).unwrap();
        assert!(s.contains("\"mode\":\"dynfilefs\""));
        assert!(s.contains("\"system\":{\"version\":\"4.1\",\"union\":\"overlayfs\"}"));
        assert!(!s.contains("edition"));
        let back: Descriptor = serde_json::from_str(&s).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn descriptor_without_release_fields_still_reads() {
        let text = r#"{"version":1,"id":"4","mode":"raw","size_limit_mb":64,"created_unix_ms":5,"storage":"4.g1"}"#;
        let d: Descriptor = serde_json::from_str(text).unwrap();
        assert_eq!(d.storage, "4.g1");
        assert_eq!(d.system, SystemRelease::default());
    }
}
